//! Event bus between handlers and the worker.
//!
//! [`InMemoryEventBus`] is a FIFO queue that honours each event's
//! [`Delivery`] contract. For `UntilExecuted` events a second publication
//! while one copy is queued merges into that copy, and publications while
//! the handler is running collapse into a single follow-up run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::events::{Delivery, Event};

/// Transport for reconciliation events.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);

    /// Take the next event to run, if any.
    fn next(&self) -> Option<Event>;

    /// Mark an event taken with [`next`](Self::next) as finished.
    fn complete(&self, event: &Event);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum Slot {
    Queued,
    Running { rerun: Option<Event> },
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Event>,
    /// Dedup slots of `UntilExecuted` events, keyed by event name.
    slots: HashMap<&'static str, Slot>,
}

#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    inner: Mutex<Inner>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: Event) {
        let mut guard = self.lock();
        let Inner { queue, slots } = &mut *guard;
        if event.delivery() == Delivery::AtLeastOnce {
            queue.push_back(event);
            return;
        }
        let name = event.name();
        match slots.get_mut(name) {
            None => {
                slots.insert(name, Slot::Queued);
                queue.push_back(event);
            }
            Some(Slot::Queued) => {
                trace!(event = name, "merged into queued copy");
                if let Some(queued) = queue.iter_mut().find(|e| e.name() == name) {
                    queued.absorb(event);
                }
            }
            Some(Slot::Running { rerun }) => {
                trace!(event = name, "deferred until current run completes");
                match rerun {
                    Some(pending) => pending.absorb(event),
                    None => *rerun = Some(event),
                }
            }
        }
    }

    fn next(&self) -> Option<Event> {
        let mut inner = self.lock();
        let event = inner.queue.pop_front()?;
        if event.delivery() == Delivery::UntilExecuted {
            inner
                .slots
                .insert(event.name(), Slot::Running { rerun: None });
        }
        Some(event)
    }

    fn complete(&self, event: &Event) {
        if event.delivery() == Delivery::AtLeastOnce {
            return;
        }
        let mut guard = self.lock();
        let Inner { queue, slots } = &mut *guard;
        let name = event.name();
        if let Some(Slot::Running { rerun }) = slots.get_mut(name) {
            match rerun.take() {
                Some(follow_up) => {
                    slots.insert(name, Slot::Queued);
                    queue.push_back(follow_up);
                }
                None => {
                    slots.remove(name);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evict(ids: &[u64]) -> Event {
        Event::IndexToEvict {
            index_ids: ids.to_vec(),
        }
    }

    #[test]
    fn fifo_for_regular_events() {
        let bus = InMemoryEventBus::new();
        bus.publish(Event::RepoToIndex);
        bus.publish(Event::RepoToIndex);
        bus.publish(Event::TooManyReplicas);
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.next(), Some(Event::RepoToIndex));
        assert_eq!(bus.next(), Some(Event::RepoToIndex));
        assert_eq!(bus.next(), Some(Event::TooManyReplicas));
        assert!(bus.next().is_none());
    }

    #[test]
    fn queued_duplicates_merge() {
        let bus = InMemoryEventBus::new();
        bus.publish(Event::AdjustReservedStorage);
        bus.publish(Event::AdjustReservedStorage);
        bus.publish(evict(&[1]));
        bus.publish(evict(&[2]));
        assert_eq!(bus.len(), 2);
        assert_eq!(bus.next(), Some(Event::AdjustReservedStorage));
        assert_eq!(bus.next(), Some(evict(&[1, 2])));
    }

    #[test]
    fn publications_while_running_collapse_into_one_rerun() {
        let bus = InMemoryEventBus::new();
        bus.publish(evict(&[1]));
        let running = bus.next().unwrap();

        bus.publish(evict(&[2]));
        bus.publish(evict(&[3]));
        assert!(bus.is_empty());

        bus.complete(&running);
        assert_eq!(bus.next(), Some(evict(&[2, 3])));
        assert!(bus.next().is_none());
    }

    #[test]
    fn completion_without_rerun_frees_the_slot() {
        let bus = InMemoryEventBus::new();
        bus.publish(Event::AdjustReservedStorage);
        let running = bus.next().unwrap();
        bus.complete(&running);

        bus.publish(Event::AdjustReservedStorage);
        assert_eq!(bus.len(), 1);
    }
}
