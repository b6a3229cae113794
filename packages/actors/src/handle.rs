//! Typed client for a running [`QueueActor`].

use drivers::JobDriver;
use queue_core::{JobEvent, JobId, JobNode, JobSpec, JobState, QueueId, QueueSnapshot};
use ractor::{Actor, ActorRef, RpcReplyPort};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::QueueError;
use crate::messages::QueueMessage;
use crate::queue::JobQueue;
use crate::queue_actor::QueueActor;

/// Spawn a queue actor that owns `queue` and starts ticking immediately.
pub async fn start_queue<D: JobDriver>(
    queue: JobQueue<D>,
) -> Result<(QueueHandle, JoinHandle<()>), QueueError> {
    let queue_id = queue.id();
    let (actor, handle) = Actor::spawn(
        Some(format!("queue-{queue_id}")),
        QueueActor::<D>::new(),
        queue,
    )
    .await
    .map_err(|e| QueueError::Actor(format!("Failed to spawn queue: {e}")))?;
    Ok((QueueHandle { actor, queue_id }, handle))
}

/// Cloneable handle to a queue actor.
#[derive(Clone)]
pub struct QueueHandle {
    actor: ActorRef<QueueMessage>,
    queue_id: QueueId,
}

impl QueueHandle {
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn actor(&self) -> &ActorRef<QueueMessage> {
        &self.actor
    }

    async fn call<T>(
        &self,
        message: impl FnOnce(RpcReplyPort<T>) -> QueueMessage,
    ) -> Result<T, QueueError>
    where
        T: Send + 'static,
    {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(message(tx.into()))
            .map_err(|e| QueueError::Actor(e.to_string()))?;
        rx.await
            .map_err(|_| QueueError::Actor("queue actor dropped the reply".into()))
    }

    pub async fn enqueue(&self, spec: JobSpec) -> Result<JobId, QueueError> {
        self.call(|reply| QueueMessage::Enqueue {
            spec: Box::new(spec),
            reply,
        })
        .await?
        .map_err(QueueError::Actor)
    }

    pub async fn cancel_all(&self) -> Result<usize, QueueError> {
        self.call(|reply| QueueMessage::CancelAll { reply }).await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, QueueError> {
        self.call(|reply| QueueMessage::CancelJob { job_id, reply })
            .await?
            .map_err(QueueError::Actor)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        self.call(|reply| QueueMessage::GetSnapshot { reply }).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<JobNode>, QueueError> {
        self.call(|reply| QueueMessage::GetJob { job_id, reply })
            .await
    }

    pub async fn list_jobs(
        &self,
        state_filter: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobNode>, QueueError> {
        self.call(|reply| QueueMessage::ListJobs {
            state_filter,
            limit,
            reply,
        })
        .await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<JobEvent>, QueueError> {
        self.call(|reply| QueueMessage::Subscribe { reply }).await
    }

    pub async fn watch_snapshot(&self) -> Result<watch::Receiver<QueueSnapshot>, QueueError> {
        self.call(|reply| QueueMessage::WatchSnapshot { reply })
            .await
    }

    /// Resolve once every enqueued job is terminal.
    pub async fn wait_until_done(&self) -> Result<QueueSnapshot, QueueError> {
        let mut watch = self.watch_snapshot().await?;
        loop {
            let snapshot = watch.borrow_and_update().clone();
            if snapshot.is_done() {
                return Ok(snapshot);
            }
            watch
                .changed()
                .await
                .map_err(|_| QueueError::Actor("queue actor stopped".into()))?;
        }
    }

    pub fn shutdown(&self) -> Result<(), QueueError> {
        self.actor
            .send_message(QueueMessage::Shutdown)
            .map_err(|e| QueueError::Actor(e.to_string()))
    }
}
