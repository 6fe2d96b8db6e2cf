//! Ansible playbook job options

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Highest `-v` multiplicity passed to ansible-playbook
pub const MAX_VERBOSITY: u8 = 4;

/// Kind of playbook run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookJobType {
    #[default]
    #[serde(alias = "ansible_job")]
    Run,
    /// Dry run (`--check`)
    Check,
    /// Project checkout refresh
    UpdateJob,
}

/// Options of a playbook job, flattened into [`crate::domain::job::Job`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookOptions {
    pub job_type: PlaybookJobType,
    pub playbook: String,
    pub forks: u32,
    pub limit: String,
    pub verbosity: u8,
    pub extra_vars: Map<String, JsonValue>,
    pub job_tags: String,
    pub skip_tags: String,
    pub force_handlers: bool,
    pub start_at_task: String,
    pub become_enabled: bool,
    pub inventory_id: Option<Uuid>,
}

impl PlaybookOptions {
    /// `-v` flag for the configured verbosity, if any
    pub fn verbosity_flag(&self) -> Option<String> {
        match self.verbosity.min(MAX_VERBOSITY) {
            0 => None,
            n => Some(format!("-{}", "v".repeat(n as usize))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_flag_is_capped() {
        let mut options = PlaybookOptions::default();
        assert_eq!(options.verbosity_flag(), None);

        options.verbosity = 2;
        assert_eq!(options.verbosity_flag().as_deref(), Some("-vv"));

        options.verbosity = 9;
        assert_eq!(options.verbosity_flag().as_deref(), Some("-vvvv"));
    }

    #[test]
    fn test_job_type_accepts_legacy_name() {
        let job_type: PlaybookJobType = serde_json::from_str("\"ansible_job\"").unwrap();
        assert_eq!(job_type, PlaybookJobType::Run);

        let job_type: PlaybookJobType = serde_json::from_str("\"update_job\"").unwrap();
        assert_eq!(job_type, PlaybookJobType::UpdateJob);
    }
}
