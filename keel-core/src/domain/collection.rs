//! Document store collections the engine touches

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Jobs,
    TerraformJobs,
    JobTemplates,
    TerraformJobTemplates,
    Projects,
    ActivityStream,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Jobs => "jobs",
            Collection::TerraformJobs => "terraform_jobs",
            Collection::JobTemplates => "job_templates",
            Collection::TerraformJobTemplates => "terraform_job_templates",
            Collection::Projects => "projects",
            Collection::ActivityStream => "activity_stream",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
