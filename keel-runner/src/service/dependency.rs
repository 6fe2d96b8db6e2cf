//! Dependency wait
//!
//! A job launched with a previous job (usually the project update that
//! refreshes its checkout) may only start once that job succeeded. The waiter
//! polls the sibling's persisted status until it resolves, the deadline
//! passes or the job is cancelled.

use keel_core::domain::collection::Collection;
use keel_core::domain::job::JobStatus;
use keel_core::dto::job::PreviousJob;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repository::DocumentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyOutcome {
    /// The previous job succeeded
    Ready,
    /// The previous job failed; carries the job explanation
    Failed(String),
    /// The deadline passed first; carries the job explanation
    TimedOut(String),
    Cancelled,
}

pub struct DependencyWaiter {
    store: Arc<dyn DocumentStore>,
    poll_interval: Duration,
    timeout: Duration,
}

impl DependencyWaiter {
    pub fn new(store: Arc<dyn DocumentStore>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            store,
            poll_interval,
            timeout,
        }
    }

    /// Polls `previous` until it resolves
    ///
    /// Previous jobs are always read from the playbook jobs collection, where
    /// project updates live. Read failures and missing documents are retried
    /// on the next tick.
    pub async fn wait(&self, previous: &PreviousJob, cancel: &CancellationToken) -> DependencyOutcome {
        let deadline = Instant::now() + self.timeout;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Waiting for previous job {} ({})",
            previous.job_id, previous.job_type
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return DependencyOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Gave up waiting for previous job {}", previous.job_id);
                    return DependencyOutcome::TimedOut(explanation("Previous Task Timed Out", previous));
                }
                _ = interval.tick() => {}
            }

            match self.read_status(previous).await {
                Some(JobStatus::Successful) => {
                    debug!("Previous job {} succeeded", previous.job_id);
                    return DependencyOutcome::Ready;
                }
                Some(JobStatus::Failed) | Some(JobStatus::Error) => {
                    return DependencyOutcome::Failed(explanation("Previous Task Failed", previous));
                }
                Some(status) => debug!("Previous job {} is {}", previous.job_id, status),
                None => {}
            }
        }
    }

    async fn read_status(&self, previous: &PreviousJob) -> Option<JobStatus> {
        let document = match self.store.find_by_id(Collection::Jobs, previous.job_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                warn!("Previous job {} not found, retrying", previous.job_id);
                return None;
            }
            Err(e) => {
                warn!("Unable to read previous job {}: {}, retrying", previous.job_id, e);
                return None;
            }
        };

        let status = document.get("status").cloned().unwrap_or(JsonValue::Null);
        match serde_json::from_value::<JobStatus>(status) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Previous job {} has an unreadable status: {}", previous.job_id, e);
                None
            }
        }
    }
}

/// `<prefix>: {"job_type": …, "job_name": …, "job_id": …}`
fn explanation(prefix: &str, previous: &PreviousJob) -> String {
    format!(
        "{}: {{\"job_type\": {}, \"job_name\": {}, \"job_id\": {}}}",
        prefix,
        json!(previous.job_type),
        json!(previous.name),
        json!(previous.job_id.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryDocumentStore, StoreError};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Answers reads from a fixed script, repeating the last entry
    struct ScriptedStore {
        statuses: Mutex<Vec<Result<Option<&'static str>, ()>>>,
        reads: Mutex<usize>,
    }

    impl ScriptedStore {
        fn new(statuses: Vec<Result<Option<&'static str>, ()>>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                reads: Mutex::new(0),
            }
        }

        fn reads(&self) -> usize {
            *self.reads.lock().unwrap()
        }
    }

    #[async_trait]
    impl DocumentStore for ScriptedStore {
        async fn find_by_id(
            &self,
            collection: Collection,
            id: Uuid,
        ) -> Result<Option<JsonValue>, StoreError> {
            assert_eq!(collection, Collection::Jobs);
            *self.reads.lock().unwrap() += 1;

            let mut statuses = self.statuses.lock().unwrap();
            let next = if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            };

            match next {
                Ok(Some(status)) => Ok(Some(json!({"id": id, "status": status}))),
                Ok(None) => Ok(None),
                Err(()) => Err(StoreError::NotFound { collection, id }),
            }
        }

        async fn update_by_id(
            &self,
            _collection: Collection,
            _id: Uuid,
            _fields: Map<String, JsonValue>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn insert(&self, _collection: Collection, _document: JsonValue) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn previous() -> PreviousJob {
        PreviousJob {
            job_id: Uuid::new_v4(),
            name: "update infra".to_string(),
            job_type: "project_update".to_string(),
        }
    }

    fn waiter(store: Arc<dyn DocumentStore>) -> DependencyWaiter {
        DependencyWaiter::new(store, Duration::from_millis(10), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_ready_after_two_running_ticks() {
        let store = Arc::new(ScriptedStore::new(vec![
            Ok(Some("running")),
            Ok(Some("running")),
            Ok(Some("successful")),
        ]));

        let outcome = waiter(store.clone())
            .wait(&previous(), &CancellationToken::new())
            .await;

        assert_eq!(outcome, DependencyOutcome::Ready);
        assert_eq!(store.reads(), 3);
    }

    #[tokio::test]
    async fn test_failed_sibling_names_the_job() {
        let store = Arc::new(ScriptedStore::new(vec![Ok(Some("failed"))]));
        let previous = previous();

        let outcome = waiter(store).wait(&previous, &CancellationToken::new()).await;

        let DependencyOutcome::Failed(explanation) = outcome.clone() else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert!(explanation.starts_with("Previous Task Failed: {"));
        assert!(explanation.contains("\"job_type\": \"project_update\""));
        assert!(explanation.contains("\"job_name\": \"update infra\""));
        assert!(explanation.contains(&previous.job_id.to_string()));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(ScriptedStore::new(vec![
            Err(()),
            Ok(None),
            Ok(Some("error")),
        ]));

        let outcome = waiter(store.clone())
            .wait(&previous(), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, DependencyOutcome::Failed(_)));
        assert_eq!(store.reads(), 3);
    }

    #[tokio::test]
    async fn test_deadline() {
        let store = Arc::new(ScriptedStore::new(vec![Ok(Some("running"))]));
        let waiter = DependencyWaiter::new(store, Duration::from_millis(10), Duration::from_millis(100));

        let outcome = waiter.wait(&previous(), &CancellationToken::new()).await;

        let DependencyOutcome::TimedOut(explanation) = outcome.clone() else {
            panic!("expected timeout, got {:?}", outcome);
        };
        assert!(explanation.starts_with("Previous Task Timed Out: {"));
    }

    #[tokio::test]
    async fn test_cancel_stops_the_wait() {
        let store = Arc::new(MemoryDocumentStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = waiter(store).wait(&previous(), &cancel).await;
        assert_eq!(outcome, DependencyOutcome::Cancelled);
    }
}
