//! Queue-level status: snapshot watch plus the per-job event stream.

use queue_core::{JobEvent, JobNode, QueueId, QueueSnapshot};
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Rolls node states up into a [`QueueSnapshot`] and fans out [`JobEvent`]s.
///
/// Snapshot watchers are woken when a refresh changes the counts, or when the
/// caller reports a transition that left the counts unchanged.
pub struct StatusAggregator {
    queue_id: QueueId,
    events: broadcast::Sender<JobEvent>,
    snapshot: watch::Sender<QueueSnapshot>,
}

impl StatusAggregator {
    pub fn new(queue_id: QueueId, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (snapshot, _) = watch::channel(QueueSnapshot::default());
        Self {
            queue_id,
            events,
            snapshot,
        }
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// Broadcast an event. Having no subscribers is fine.
    pub fn publish(&self, event: JobEvent) {
        debug!(queue = %self.queue_id, "{}", event.description());
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.subscribe()
    }

    /// Last published snapshot.
    pub fn current(&self) -> QueueSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Recompute the snapshot from `nodes`; returns whether watchers were woken.
    pub fn refresh<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a JobNode>,
        transitioned: bool,
    ) -> bool {
        let next = QueueSnapshot::collect(nodes);
        if transitioned {
            self.snapshot.send_modify(|current| *current = next);
            return true;
        }
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }
}
