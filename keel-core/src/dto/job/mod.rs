//! Job queue payloads

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ansible::PlaybookOptions;
use crate::domain::credential::Credential;
use crate::domain::job::Job;
use crate::domain::project::{Inventory, Project};
use crate::domain::template::JobTemplate;
use crate::domain::terraform::TerraformOptions;
use crate::domain::user::User;

/// Everything the runner needs to execute one job
///
/// Credentials are resolved by the publisher; their secret fields are still
/// encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload<S> {
    pub job: Job<S>,
    pub template: JobTemplate,
    #[serde(default)]
    pub machine: Option<Credential>,
    #[serde(default)]
    pub network: Option<Credential>,
    #[serde(default)]
    pub scm: Option<Credential>,
    #[serde(default)]
    pub cloud: Option<Credential>,
    #[serde(default)]
    pub inventory: Option<Inventory>,
    pub project: Project,
    #[serde(default)]
    pub user: User,
    /// Job that must succeed before this one may start
    #[serde(default)]
    pub previous_job: Option<PreviousJob>,
    /// Callback token handed to the invoked tool
    #[serde(default)]
    pub token: String,
}

/// Payload consumed from the ansible queue
pub type PlaybookPayload = JobPayload<PlaybookOptions>;

/// Payload consumed from the terraform queue
pub type TerraformPayload = JobPayload<TerraformOptions>;

/// Reference to the job a payload depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousJob {
    pub job_id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_previous_job_type")]
    pub job_type: String,
}

fn default_previous_job_type() -> String {
    "project_update".to_string()
}
