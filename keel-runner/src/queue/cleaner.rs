//! Queue cleaner
//!
//! Keeps this runner's heartbeat alive and returns deliveries held by dead
//! runners to their queues.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::JobQueue;

pub struct QueueCleaner {
    queue: Arc<dyn JobQueue>,
    queues: Vec<&'static str>,
    interval: Duration,
}

impl QueueCleaner {
    pub fn new(queue: Arc<dyn JobQueue>, queues: Vec<&'static str>, interval: Duration) -> Self {
        Self {
            queue,
            queues,
            interval,
        }
    }

    /// Runs until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting queue cleaner (interval: {:?})", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.clean_once().await;
        }

        info!("Queue cleaner stopped");
    }

    /// One heartbeat and reclaim pass; returns the number of reclaimed payloads
    pub async fn clean_once(&self) -> usize {
        if let Err(e) = self.queue.heartbeat().await {
            error!("Queue heartbeat failed: {}", e);
        }

        match self.queue.reclaim(&self.queues).await {
            Ok(0) => {
                debug!("No abandoned deliveries");
                0
            }
            Ok(moved) => {
                info!("Returned {} abandoned deliveries to their queues", moved);
                moved
            }
            Err(e) => {
                error!("Queue cleaning failed: {}", e);
                0
            }
        }
    }
}
