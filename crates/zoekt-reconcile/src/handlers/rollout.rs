//! Subscription-driven onboarding for the hosted deployment.

use std::collections::HashSet;

use tracing::{debug, info};
use zoekt_state::NamespaceId;

use super::Reconciler;
use crate::error::ReconcileResult;
use crate::events::Event;
use crate::report::{BatchReport, Outcome, RecordRef};

impl Reconciler {
    /// Enable search for subscribed namespaces that are active or trialing,
    /// one buffer at a time.
    pub(crate) fn saas_rollout(&self) -> ReconcileResult<Outcome> {
        let mut report = BatchReport::new("saas_rollout");
        if !self.config.deployment.saas {
            debug!("rollout only runs on the hosted deployment");
            return Ok(Outcome::done(report));
        }

        let enabled: HashSet<NamespaceId> = self
            .state
            .list_enabled_namespaces()?
            .into_iter()
            .map(|ns| ns.root_namespace_id)
            .collect();
        let mut candidates = Vec::new();
        for root_namespace_id in self.directory.subscribed_root_namespaces()? {
            if enabled.contains(&root_namespace_id) {
                continue;
            }
            if self
                .directory
                .is_subscription_active_or_trialing(root_namespace_id)?
            {
                candidates.push(root_namespace_id);
            }
        }
        let total = candidates.len();
        let page = total.min(self.config.batching.rollout_buffer_size);

        for &root_namespace_id in candidates.iter().take(page) {
            report.record(
                RecordRef::Namespace(root_namespace_id),
                self.state.enable_namespace(root_namespace_id, None),
            );
        }
        if page > 0 {
            info!(
                enabled = report.processed,
                remaining = total - page,
                "namespaces rolled out"
            );
        }
        Ok(Outcome::done(report).reschedule_if(
            self.config.rescheduling.saas_rollout,
            total > page,
            Event::SaasRollout,
        ))
    }
}
