//! Document store errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The store could not be reached or the connection broke
    #[error("store unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// The store answered with a non-2xx status
    #[error("store rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unreadable store record: {0}")]
    Decode(String),

    /// A partial update without fields
    #[error("update of {0} carries no fields")]
    EmptyUpdate(String),
}

impl ClientError {
    /// The record does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected { status: 404, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_404_means_missing() {
        let missing = ClientError::Rejected {
            status: 404,
            body: String::new(),
        };
        let broken = ClientError::Rejected {
            status: 500,
            body: "boom".to_string(),
        };

        assert!(missing.is_not_found());
        assert!(!broken.is_not_found());
        assert!(!ClientError::Decode("eof".to_string()).is_not_found());
        assert_eq!(broken.to_string(), "store rejected the request (500): boom");
    }
}
