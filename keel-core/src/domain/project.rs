//! Project and inventory domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobStatus;

/// Project whose checkout the job runs in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub scm_type: String,
    pub scm_url: String,
    pub scm_branch: String,
    pub scm_clean: bool,
    pub scm_delete_on_update: bool,
    pub scm_credential_id: Option<Uuid>,
    pub last_job_run: Option<DateTime<Utc>>,
    pub last_job_failed: bool,
    pub status: Option<JobStatus>,
}

/// Inventory a playbook runs against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub id: Uuid,
    pub name: String,
}
