//! Terraform job options

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Terraform operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerraformJobType {
    #[default]
    Apply,
    Plan,
    Destroy,
    DestroyPlan,
}

/// Options of a terraform job, flattened into [`crate::domain::job::Job`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerraformOptions {
    pub job_type: TerraformJobType,
    pub vars: Map<String, JsonValue>,
    pub parallelism: u32,
    pub update_on_launch: bool,
    pub target: String,
    /// Module directory relative to the project checkout
    pub directory: String,
}
