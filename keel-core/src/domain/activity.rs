//! Activity stream records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only fact about a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub object_id: Uuid,
    /// Job family that emitted the record (`ansible`, `terraform`)
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub created: DateTime<Utc>,
}

impl Activity {
    pub fn new(
        actor_id: Option<Uuid>,
        object_id: Uuid,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor_id,
            object_id,
            kind: kind.into(),
            description: description.into(),
            created: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_as_type() {
        let activity = Activity::new(None, Uuid::new_v4(), "ansible", "Job started");
        let value = serde_json::to_value(&activity).unwrap();

        assert_eq!(value["type"], "ansible");
        assert_eq!(value["description"], "Job started");
        assert!(value.get("kind").is_none());
    }
}
