//! Read-only view of the product domain: tenants, subscriptions, projects.
//!
//! The control plane never owns this data. Handlers ask a
//! [`NamespaceDirectory`] whenever a decision depends on it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use zoekt_state::{NamespaceId, ProjectId};

/// Lookups into the system of record for namespaces and projects.
pub trait NamespaceDirectory: Send + Sync {
    /// Whether search is switched on for the root namespace.
    fn is_namespace_enabled(&self, root_namespace_id: NamespaceId) -> anyhow::Result<bool>;

    fn is_subscription_active_or_trialing(
        &self,
        root_namespace_id: NamespaceId,
    ) -> anyhow::Result<bool>;

    /// Root namespaces holding any subscription, in ascending id order.
    fn subscribed_root_namespaces(&self) -> anyhow::Result<Vec<NamespaceId>>;

    fn projects_for_namespace(&self, root_namespace_id: NamespaceId)
    -> anyhow::Result<Vec<ProjectId>>;

    /// Projects inside a group and all of its subgroups.
    fn projects_in_group(&self, group_id: NamespaceId) -> anyhow::Result<Vec<ProjectId>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    #[default]
    None,
    Active,
    Trialing,
    Expired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantRecord {
    pub search_enabled: bool,
    pub subscription: Subscription,
    pub projects: Vec<ProjectId>,
}

/// A directory loaded from a JSON document. Used by the daemon when no
/// live product database is wired in, and by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticDirectory {
    pub tenants: BTreeMap<NamespaceId, TenantRecord>,
    /// Group id to the projects under it.
    pub groups: BTreeMap<NamespaceId, Vec<ProjectId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_tenant(
        mut self,
        root_namespace_id: NamespaceId,
        subscription: Subscription,
        projects: &[ProjectId],
    ) -> Self {
        self.tenants.insert(
            root_namespace_id,
            TenantRecord {
                search_enabled: true,
                subscription,
                projects: projects.to_vec(),
            },
        );
        self
    }

    pub fn with_group(mut self, group_id: NamespaceId, projects: &[ProjectId]) -> Self {
        self.groups.insert(group_id, projects.to_vec());
        self
    }

    pub fn disable_search(mut self, root_namespace_id: NamespaceId) -> Self {
        if let Some(tenant) = self.tenants.get_mut(&root_namespace_id) {
            tenant.search_enabled = false;
        }
        self
    }
}

impl NamespaceDirectory for StaticDirectory {
    fn is_namespace_enabled(&self, root_namespace_id: NamespaceId) -> anyhow::Result<bool> {
        Ok(self
            .tenants
            .get(&root_namespace_id)
            .is_some_and(|t| t.search_enabled))
    }

    fn is_subscription_active_or_trialing(
        &self,
        root_namespace_id: NamespaceId,
    ) -> anyhow::Result<bool> {
        Ok(self.tenants.get(&root_namespace_id).is_some_and(|t| {
            matches!(t.subscription, Subscription::Active | Subscription::Trialing)
        }))
    }

    fn subscribed_root_namespaces(&self) -> anyhow::Result<Vec<NamespaceId>> {
        Ok(self
            .tenants
            .iter()
            .filter(|(_, t)| t.subscription != Subscription::None)
            .map(|(id, _)| *id)
            .collect())
    }

    fn projects_for_namespace(
        &self,
        root_namespace_id: NamespaceId,
    ) -> anyhow::Result<Vec<ProjectId>> {
        Ok(self
            .tenants
            .get(&root_namespace_id)
            .map(|t| t.projects.clone())
            .unwrap_or_default())
    }

    fn projects_in_group(&self, group_id: NamespaceId) -> anyhow::Result<Vec<ProjectId>> {
        let projects: BTreeSet<ProjectId> = self
            .groups
            .get(&group_id)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        Ok(projects.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions() {
        let dir = StaticDirectory::new()
            .with_tenant(1, Subscription::Active, &[])
            .with_tenant(2, Subscription::Trialing, &[])
            .with_tenant(3, Subscription::Expired, &[])
            .with_tenant(4, Subscription::None, &[]);
        assert_eq!(dir.subscribed_root_namespaces().unwrap(), vec![1, 2, 3]);
        assert!(dir.is_subscription_active_or_trialing(2).unwrap());
        assert!(!dir.is_subscription_active_or_trialing(3).unwrap());
        assert!(!dir.is_subscription_active_or_trialing(99).unwrap());
    }

    #[test]
    fn search_can_be_switched_off() {
        let dir = StaticDirectory::new()
            .with_tenant(1, Subscription::Active, &[10])
            .disable_search(1);
        assert!(!dir.is_namespace_enabled(1).unwrap());
        assert!(!dir.is_namespace_enabled(2).unwrap());
    }

    #[test]
    fn parses_json_document() {
        let dir = StaticDirectory::from_json(
            r#"{
                "tenants": {
                    "7": { "search_enabled": true, "subscription": "active", "projects": [70, 71] }
                },
                "groups": { "8": [71, 70, 71] }
            }"#,
        )
        .unwrap();
        assert_eq!(dir.projects_for_namespace(7).unwrap(), vec![70, 71]);
        assert_eq!(dir.projects_in_group(8).unwrap(), vec![70, 71]);
        assert!(dir.projects_in_group(9).unwrap().is_empty());
    }
}
