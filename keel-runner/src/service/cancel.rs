//! Cancel watcher
//!
//! Cancellation is requested by setting `cancel_flag` on the job document.
//! While a job waits or runs, the watcher re-reads that flag and cancels the
//! job's token once it is set, which stops the dependency wait or kills the
//! running process group.

use keel_core::domain::collection::Collection;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::repository::DocumentStore;

/// Background task polling the cancel flag of one job
///
/// The task stops when the flag is seen or the watcher is dropped.
pub struct CancelWatcher {
    handle: JoinHandle<()>,
}

impl CancelWatcher {
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        collection: Collection,
        job_id: Uuid,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick fires immediately, the dispatcher just read the flag
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match store.find_by_id(collection, job_id).await {
                    Ok(Some(document)) => {
                        if document.get("cancel_flag").and_then(JsonValue::as_bool) == Some(true) {
                            info!("Cancel requested for job {}", job_id);
                            cancel.cancel();
                            return;
                        }
                    }
                    Ok(None) => debug!("Job {} not found while checking cancel flag", job_id),
                    Err(e) => debug!("Unable to read cancel flag of job {}: {}", job_id, e),
                }
            }
        });

        Self { handle }
    }
}

impl Drop for CancelWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
