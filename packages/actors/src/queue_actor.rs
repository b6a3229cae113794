//! Queue actor owning one [`JobQueue`] and driving its tick loop.

use std::marker::PhantomData;
use std::time::Duration;

use drivers::{Driver, JobDriver};
use queue_core::JobNode;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::task::JoinHandle;

use crate::messages::QueueMessage;
use crate::queue::JobQueue;

/// State for the queue actor.
pub struct QueueActorState<D> {
    pub queue: JobQueue<D>,
    period: Duration,
    ticker: Option<JoinHandle<()>>,
}

/// Send one `Tick` after `period`; the next is scheduled once this one is handled.
fn schedule_tick(myself: ActorRef<QueueMessage>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(period).await;
        let _ = myself.send_message(QueueMessage::Tick);
    })
}

/// Queue actor: the single task that mutates a queue's nodes.
pub struct QueueActor<D = Driver>(PhantomData<fn() -> D>);

impl<D> QueueActor<D> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<D> Default for QueueActor<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: JobDriver> Actor for QueueActor<D> {
    type Msg = QueueMessage;
    type State = QueueActorState<D>;
    type Arguments = JobQueue<D>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        queue: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting queue actor: {} ({} driver)",
            queue.id(),
            queue.driver().kind()
        );

        let period = Duration::from_millis(queue.config().tick_interval_ms);
        let ticker = schedule_tick(myself, period);

        Ok(QueueActorState {
            queue,
            period,
            ticker: Some(ticker),
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        tracing::info!("Stopped queue actor: {}", state.queue.id());
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Enqueue { spec, reply } => {
                let spec = *spec;
                if spec.name.trim().is_empty() {
                    let _ = reply.send(Err("Job name must not be empty".into()));
                    return Ok(());
                }
                let _ = reply.send(Ok(state.queue.enqueue(spec)));
            }

            QueueMessage::CancelAll { reply } => {
                let _ = reply.send(state.queue.cancel_all());
            }

            QueueMessage::CancelJob { job_id, reply } => {
                let _ = reply.send(state.queue.cancel_job(job_id).map_err(|e| e.to_string()));
            }

            QueueMessage::GetSnapshot { reply } => {
                let _ = reply.send(state.queue.snapshot());
            }

            QueueMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.queue.job(job_id).cloned());
            }

            QueueMessage::ListJobs {
                state_filter,
                limit,
                reply,
            } => {
                let jobs: Vec<JobNode> = state
                    .queue
                    .jobs()
                    .iter()
                    .filter(|node| state_filter.is_none_or(|s| node.state() == s))
                    .take(limit)
                    .cloned()
                    .collect();
                let _ = reply.send(jobs);
            }

            QueueMessage::Subscribe { reply } => {
                let _ = reply.send(state.queue.subscribe());
            }

            QueueMessage::WatchSnapshot { reply } => {
                let _ = reply.send(state.queue.watch_snapshot());
            }

            QueueMessage::Tick => {
                state.queue.tick().await;
                let next = schedule_tick(myself, state.period);
                if let Some(previous) = state.ticker.replace(next) {
                    previous.abort();
                }
            }

            QueueMessage::Shutdown => {
                tracing::info!(
                    "Shutting down queue actor: {} ({} calls in flight)",
                    state.queue.id(),
                    state.queue.in_flight()
                );
                myself.stop(Some("shutdown".into()));
            }
        }
        Ok(())
    }
}
