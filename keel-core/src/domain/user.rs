//! User domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User who launched the job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}
