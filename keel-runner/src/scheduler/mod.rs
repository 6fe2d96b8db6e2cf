//! Scheduler layer for the runner
//!
//! Starts the queue consumers of each job family. Every consumer owns one
//! slot: it runs at most one job at a time and takes the next delivery only
//! after that job reached a terminal status.

pub mod consumer;

pub use consumer::Consumer;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::family::JobFamily;
use crate::queue::JobQueue;
use crate::service::JobPipeline;

/// Spawns `count` consumers sharing one pipeline
///
/// # Arguments
/// * `pipeline` - Pipeline of the family whose queue is consumed
/// * `queue` - Queue backend shared by all consumers
/// * `count` - Number of consumer slots
/// * `shutdown` - Stops the consumers once their current job finished
pub fn spawn_consumers<F: JobFamily>(
    pipeline: Arc<JobPipeline<F>>,
    queue: Arc<dyn JobQueue>,
    count: usize,
    poll_interval: std::time::Duration,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(
        "Starting {} consumer(s) on queue {}",
        count,
        pipeline.family().queue_name()
    );

    (0..count)
        .map(|id| {
            let consumer = Consumer::new(id, Arc::clone(&queue), Arc::clone(&pipeline), poll_interval);
            tokio::spawn(consumer.run(shutdown.clone()))
        })
        .collect()
}
