//! Job state machine
//!
//! Owns every status write of a job:
//! - `pending`, `waiting` and `running` transitions
//! - terminal transitions with their bookkeeping fields
//! - roll-up of the outcome to the template and the project
//! - the activity records bracketing the run
//!
//! Writes are best-effort. A failed write is logged and the in-memory job
//! keeps moving, so the pipeline outcome never depends on the store.

use chrono::Utc;
use keel_core::domain::activity::Activity;
use keel_core::domain::collection::Collection;
use keel_core::domain::job::{Job, JobStatus, STDOUT_MISSING};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::repository::DocumentStore;

pub const CANCEL_EXPLANATION: &str = "Job Cancelled";

pub struct JobStateMachine {
    store: Arc<dyn DocumentStore>,
    family: &'static str,
    jobs: Collection,
    templates: Collection,
}

impl JobStateMachine {
    /// Creates a state machine writing to the given collections
    ///
    /// # Arguments
    /// * `family` - Job family name, used as the activity type
    /// * `jobs` - Collection holding the job documents
    /// * `templates` - Collection holding the template documents
    pub fn new(
        store: Arc<dyn DocumentStore>,
        family: &'static str,
        jobs: Collection,
        templates: Collection,
    ) -> Self {
        Self {
            store,
            family,
            jobs,
            templates,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn jobs_collection(&self) -> Collection {
        self.jobs
    }

    /// Moves a job to `pending`, `waiting` or `running`
    ///
    /// Returns false when the transition is not allowed from the current
    /// status; nothing is written in that case.
    pub async fn transition<S>(&self, job: &mut Job<S>, next: JobStatus) -> bool {
        if next.is_terminal() {
            warn!("Terminal status {} requested through transition, use finish", next);
            return false;
        }
        if !job.status.can_transition_to(next) {
            warn!("Job {}: ignoring transition {} -> {}", job.id, job.status, next);
            return false;
        }

        job.status = next;
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(next));

        if next == JobStatus::Running {
            let started = Utc::now();
            job.started = Some(started);
            job.failed = false;
            fields.insert("failed".to_string(), json!(false));
            fields.insert("started".to_string(), json!(started));
        }

        debug!("Job {} -> {}", job.id, next);
        self.write(self.jobs, job.id, fields).await;

        if next == JobStatus::Running {
            self.activity(job, format!("Job {} started", job.id)).await;
        }
        true
    }

    pub async fn succeed<S>(&self, job: &mut Job<S>) {
        self.finish(job, JobStatus::Successful).await;
    }

    /// Ends the job as `failed`
    pub async fn fail<S>(&self, job: &mut Job<S>, explanation: impl Into<String>) {
        job.job_explanation = explanation.into();
        self.finish(job, JobStatus::Failed).await;
    }

    /// Ends the job as `error`; nothing was run so no output exists
    pub async fn error<S>(&self, job: &mut Job<S>, explanation: impl Into<String>) {
        job.job_explanation = explanation.into();
        job.result_stdout = STDOUT_MISSING.to_string();
        self.finish(job, JobStatus::Error).await;
    }

    pub async fn cancel<S>(&self, job: &mut Job<S>) {
        job.cancel_flag = true;
        job.job_explanation = CANCEL_EXPLANATION.to_string();
        if job.result_stdout.is_empty() {
            job.result_stdout = STDOUT_MISSING.to_string();
        }
        self.finish(job, JobStatus::Canceled).await;
    }

    /// Records a terminal status
    ///
    /// Output, explanation and the audit fields are taken from `job` as they
    /// are; callers fill them in before finishing.
    pub async fn finish<S>(&self, job: &mut Job<S>, status: JobStatus) {
        if !status.is_terminal() || !job.status.can_transition_to(status) {
            warn!("Job {}: ignoring terminal transition {} -> {}", job.id, job.status, status);
            return;
        }

        job.status = status;
        job.failed = status.is_failure();
        job.mark_finished(Utc::now());

        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(status));
        fields.insert("failed".to_string(), json!(job.failed));
        fields.insert("started".to_string(), json!(job.started));
        fields.insert("finished".to_string(), json!(job.finished));
        fields.insert("elapsed".to_string(), json!(job.elapsed));
        fields.insert("result_stdout".to_string(), json!(job.result_stdout));
        fields.insert("job_explanation".to_string(), json!(job.job_explanation));
        fields.insert("job_args".to_string(), json!(job.job_args));
        fields.insert("job_env".to_string(), json!(job.job_env));
        fields.insert("job_cwd".to_string(), json!(job.job_cwd));
        if status == JobStatus::Canceled {
            fields.insert("cancel_flag".to_string(), json!(true));
        }

        info!(
            "Job {} finished: {} ({:.2} min){}",
            job.id,
            status,
            job.elapsed,
            if job.job_explanation.is_empty() {
                String::new()
            } else {
                format!(": {}", job.job_explanation)
            }
        );
        self.write(self.jobs, job.id, fields).await;

        let rollup = |job: &Job<S>| {
            let mut fields = Map::new();
            fields.insert("last_job_run".to_string(), json!(job.started));
            fields.insert("last_job_failed".to_string(), json!(job.failed));
            fields.insert("status".to_string(), json!(job.status));
            fields
        };
        self.write(Collection::Projects, job.project_id, rollup(job)).await;
        self.write(self.templates, job.job_template_id, rollup(job)).await;

        self.activity(job, format!("Job {} finished with status {}", job.id, status))
            .await;
    }

    /// Marks a job failed when its queue payload could not be decoded
    ///
    /// Only the job id is known, so no roll-up or activity is written.
    pub async fn fail_undecodable(&self, job_id: Uuid, explanation: impl Into<String>) {
        warn!("Job {} has an undecodable payload, marking it failed", job_id);
        self.end_by_id(job_id, JobStatus::Failed, explanation.into()).await;
    }

    /// Ends a job whose run was lost, such as after a panic
    ///
    /// The in-memory record went down with the run, so only the id is known.
    pub async fn abort(&self, job_id: Uuid, explanation: impl Into<String>) {
        warn!("Job {} was aborted, marking it as errored", job_id);
        self.end_by_id(job_id, JobStatus::Error, explanation.into()).await;
    }

    async fn end_by_id(&self, job_id: Uuid, status: JobStatus, explanation: String) {
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(status));
        fields.insert("failed".to_string(), json!(true));
        fields.insert("finished".to_string(), json!(Utc::now()));
        fields.insert("job_explanation".to_string(), json!(explanation));
        fields.insert("result_stdout".to_string(), json!(STDOUT_MISSING));

        self.write(self.jobs, job_id, fields).await;
    }

    async fn write(&self, collection: Collection, id: Uuid, fields: Map<String, JsonValue>) {
        if let Err(e) = self.store.update_by_id(collection, id, fields).await {
            error!("Failed to update {} {}: {}", collection, id, e);
        }
    }

    async fn activity<S>(&self, job: &Job<S>, description: String) {
        let activity = Activity::new(job.created_by_id, job.id, self.family, description);

        let document = match serde_json::to_value(&activity) {
            Ok(document) => document,
            Err(e) => {
                error!("Failed to encode activity for job {}: {}", job.id, e);
                return;
            }
        };

        if let Err(e) = self.store.insert(Collection::ActivityStream, document).await {
            error!("Failed to add activity for job {}: {}", job.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::tests_support::job;
    use crate::repository::MemoryDocumentStore;

    fn setup() -> (Arc<MemoryDocumentStore>, JobStateMachine, Job<()>) {
        let store = Arc::new(MemoryDocumentStore::new());
        let machine = JobStateMachine::new(
            store.clone(),
            "ansible",
            Collection::Jobs,
            Collection::JobTemplates,
        );

        let job = job(());
        store.put(Collection::Jobs, job.id, json!({"id": job.id, "status": "new"}));
        store.put(
            Collection::JobTemplates,
            job.job_template_id,
            json!({"id": job.job_template_id}),
        );
        store.put(Collection::Projects, job.project_id, json!({"id": job.project_id}));

        (store, machine, job)
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (store, machine, mut job) = setup();

        assert!(machine.transition(&mut job, JobStatus::Pending).await);
        assert!(machine.transition(&mut job, JobStatus::Running).await);
        assert!(job.started.is_some());
        assert!(job.finished.is_none());

        job.result_stdout = "ok".to_string();
        machine.succeed(&mut job).await;

        let document = store.get(Collection::Jobs, job.id).unwrap();
        assert_eq!(document["status"], "successful");
        assert_eq!(document["failed"], false);
        assert_eq!(document["result_stdout"], "ok");
        assert!(document["finished"].is_string());
        assert!(document["elapsed"].as_f64().unwrap() >= 0.0);

        let template = store.get(Collection::JobTemplates, job.job_template_id).unwrap();
        assert_eq!(template["status"], "successful");
        assert_eq!(template["last_job_failed"], false);
        assert_eq!(template["last_job_run"], document["started"]);

        let project = store.get(Collection::Projects, job.project_id).unwrap();
        assert_eq!(project["status"], "successful");

        let activities = store.inserted(Collection::ActivityStream);
        assert_eq!(activities.len(), 2);
        assert_eq!(activities[0]["type"], "ansible");
        assert!(activities[0]["description"].as_str().unwrap().ends_with("started"));
        assert!(activities[1]["description"].as_str().unwrap().contains("successful"));
    }

    #[tokio::test]
    async fn test_terminal_status_is_a_sink() {
        let (store, machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Pending).await;
        machine.fail(&mut job, "exit status 2").await;

        assert!(!machine.transition(&mut job, JobStatus::Running).await);
        machine.succeed(&mut job).await;

        assert_eq!(job.status, JobStatus::Failed);
        let document = store.get(Collection::Jobs, job.id).unwrap();
        assert_eq!(document["status"], "failed");
        assert_eq!(document["job_explanation"], "exit status 2");
    }

    #[tokio::test]
    async fn test_error_before_running_has_zero_elapsed() {
        let (store, machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Pending).await;
        machine.transition(&mut job, JobStatus::Waiting).await;
        machine.error(&mut job, "Previous Task Failed").await;

        assert_eq!(job.started, job.finished);
        assert_eq!(job.elapsed, 0.0);
        assert!(job.failed);

        let document = store.get(Collection::Jobs, job.id).unwrap();
        assert_eq!(document["status"], "error");
        assert_eq!(document["result_stdout"], STDOUT_MISSING);
    }

    #[tokio::test]
    async fn test_cancel_is_not_a_failure() {
        let (store, machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Pending).await;
        machine.transition(&mut job, JobStatus::Running).await;
        machine.cancel(&mut job).await;

        let document = store.get(Collection::Jobs, job.id).unwrap();
        assert_eq!(document["status"], "canceled");
        assert_eq!(document["failed"], false);
        assert_eq!(document["cancel_flag"], true);
        assert_eq!(document["job_explanation"], CANCEL_EXPLANATION);
    }

    #[tokio::test]
    async fn test_abort_marks_job_errored() {
        let (store, machine, mut job) = setup();
        machine.transition(&mut job, JobStatus::Pending).await;
        machine.transition(&mut job, JobStatus::Running).await;
        machine.abort(job.id, "Job run panicked").await;

        let document = store.get(Collection::Jobs, job.id).unwrap();
        assert_eq!(document["status"], "error");
        assert_eq!(document["failed"], true);
        assert_eq!(document["job_explanation"], "Job run panicked");
        assert!(document["finished"].is_string());
    }

    #[tokio::test]
    async fn test_undecodable_payload_marks_job_failed() {
        let (store, machine, job) = setup();
        machine.fail_undecodable(job.id, "invalid type: integer").await;

        let document = store.get(Collection::Jobs, job.id).unwrap();
        assert_eq!(document["status"], "failed");
        assert_eq!(document["failed"], true);
        assert_eq!(document["job_explanation"], "invalid type: integer");
        assert!(store.inserted(Collection::ActivityStream).is_empty());
    }

    #[tokio::test]
    async fn test_store_failures_do_not_stop_the_job() {
        let store = Arc::new(MemoryDocumentStore::new());
        let machine =
            JobStateMachine::new(store, "terraform", Collection::TerraformJobs, Collection::TerraformJobTemplates);
        let mut job = job(());

        // no documents exist, every write fails
        assert!(machine.transition(&mut job, JobStatus::Pending).await);
        assert!(machine.transition(&mut job, JobStatus::Running).await);
        machine.succeed(&mut job).await;
        assert_eq!(job.status, JobStatus::Successful);
    }
}
