//! Job template domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobStatus;

/// Reusable configuration a job was launched from
///
/// Only the fields the engine reads or rolls up are modelled here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub project_id: Option<Uuid>,
    pub last_job_run: Option<DateTime<Utc>>,
    pub last_job_failed: bool,
    pub status: Option<JobStatus>,
}
