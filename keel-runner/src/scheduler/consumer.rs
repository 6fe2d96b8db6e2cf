//! Queue consumer
//!
//! Takes deliveries from one family's queue, one at a time, and runs each job
//! to a terminal status before taking the next one.

use keel_core::domain::job::JobStatus;
use keel_core::dto::job::JobPayload;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::JobContext;
use crate::family::JobFamily;
use crate::queue::{Delivery, JobQueue, QueueError};
use crate::service::JobPipeline;

/// One consumer slot of a job family
pub struct Consumer<F: JobFamily> {
    id: usize,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<JobPipeline<F>>,
    poll_interval: Duration,
}

impl<F: JobFamily> Consumer<F> {
    pub fn new(
        id: usize,
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<JobPipeline<F>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            pipeline,
            poll_interval,
        }
    }

    /// Consumes until `shutdown` is cancelled
    ///
    /// A job already running when shutdown is requested is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        let queue_name = self.pipeline.family().queue_name();
        info!("Consumer {}/{} started", queue_name, self.id);

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => debug!("Queue {} is empty", queue_name),
                Err(e) => error!("Consumer {}/{}: {}", queue_name, self.id, e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Consumer {}/{} stopped", queue_name, self.id);
    }

    /// Takes and handles at most one delivery; returns whether one was taken
    pub async fn poll_once(&self) -> Result<bool, QueueError> {
        let queue_name = self.pipeline.family().queue_name();

        match self.queue.next(queue_name).await? {
            Some(delivery) => {
                self.dispatch(delivery).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dispatch(&self, delivery: Delivery) {
        let payload = match serde_json::from_str::<JobPayload<F::Options>>(&delivery.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.reject(&delivery, e).await;
                return;
            }
        };

        if let Err(e) = self.queue.ack(&delivery).await {
            warn!("Unable to ack job {}: {}", payload.job.id, e);
        }

        let job_id = payload.job.id;
        let mut ctx = JobContext::new(payload, CancellationToken::new());
        info!("Consumer {}/{} accepted job {}", delivery.queue, self.id, job_id);

        self.pipeline
            .state()
            .transition(&mut ctx.job, JobStatus::Pending)
            .await;

        // a panicking job must not take the consumer down
        let pipeline = Arc::clone(&self.pipeline);
        let handle = tokio::spawn(async move {
            pipeline.run(&mut ctx).await;
        });

        if let Err(e) = handle.await {
            error!("Job {} panicked: {}", job_id, e);
            self.pipeline
                .state()
                .abort(job_id, format!("Job run aborted: {}", e))
                .await;
        }
    }

    async fn reject(&self, delivery: &Delivery, cause: serde_json::Error) {
        error!("Rejecting undecodable payload on {}: {}", delivery.queue, cause);

        if let Err(e) = self.queue.reject(delivery).await {
            error!("Unable to reject delivery on {}: {}", delivery.queue, e);
        }

        match job_id_of(&delivery.payload) {
            Some(job_id) => {
                self.pipeline
                    .state()
                    .fail_undecodable(job_id, format!("Unable to decode job payload: {}", cause))
                    .await
            }
            None => warn!("Undecodable payload carries no job id"),
        }
    }
}

/// Job id of a payload that does not decode as a whole
fn job_id_of(payload: &str) -> Option<Uuid> {
    let value: JsonValue = serde_json::from_str(payload).ok()?;
    value.get("job")?.get("id")?.as_str()?.parse().ok()
}
