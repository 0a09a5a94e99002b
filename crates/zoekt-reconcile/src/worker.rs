//! Reconciliation worker.
//!
//! Drains the event bus through the [`Reconciler`], publishes follow-up
//! events, and on every tick schedules the periodic handlers and runs one
//! task dispatch round.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::events::{periodic_events, Event};
use crate::handlers::Reconciler;
use crate::report::Continuation;
use crate::tasks::TaskDispatcher;

pub struct Worker {
    reconciler: Arc<Reconciler>,
    bus: Arc<dyn EventBus>,
    dispatcher: Option<TaskDispatcher>,
}

impl Worker {
    pub fn new(reconciler: Arc<Reconciler>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            reconciler,
            bus,
            dispatcher: None,
        }
    }

    /// Dispatch node tasks on every tick.
    pub fn with_dispatcher(mut self, dispatcher: TaskDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Publish the periodic trigger set.
    pub fn schedule_periodic(&self) {
        for event in periodic_events() {
            self.bus.publish(event);
        }
    }

    /// Run up to `limit` queued events. Returns how many ran.
    pub fn drain(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            let Some(event) = self.bus.next() else {
                break;
            };
            self.process(&event);
            self.bus.complete(&event);
            ran += 1;
        }
        ran
    }

    fn process(&self, event: &Event) {
        let outcome = match self.reconciler.handle(event) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(event = event.name(), error = %e, "handler failed");
                return;
            }
        };
        if !outcome.report.is_clean() {
            warn!(
                event = event.name(),
                failures = outcome.report.failures.len(),
                "handler finished with record failures"
            );
        }
        for follow_up in outcome.emitted {
            self.bus.publish(follow_up);
        }
        if let Continuation::Reschedule(next) = outcome.continuation {
            self.bus.publish(next);
        }
    }

    /// One scheduling round: periodic triggers, task dispatch, then drain.
    pub async fn tick(&self) -> usize {
        self.schedule_periodic();
        if let Some(dispatcher) = &self.dispatcher {
            match dispatcher.dispatch_all().await {
                Ok(events) => {
                    for event in events {
                        self.bus.publish(event);
                    }
                }
                Err(e) => error!(error = %e, "task dispatch failed"),
            }
        }
        self.drain(self.reconciler.config().worker.drain_limit)
    }

    /// Run the worker loop until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "reconcile worker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let ran = self.tick().await;
                    if ran > 0 {
                        info!(events = ran, backlog = self.bus.len(), "worker tick");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconcile worker shutting down");
                    break;
                }
            }
        }
    }
}
