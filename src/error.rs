// ⚠️ Error taxonomy for detection, merge and ignore operations

use crate::customer::CustomerId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DedupError {
    /// Unknown field type tag handed to the normalizer
    #[error("Invalid field kind: {0}")]
    InvalidFieldKind(String),

    #[error("Customer not found: {0}")]
    NotFound(CustomerId),

    /// Caller is working from stale state and must refresh
    #[error("Customer {duplicate} was already merged into {primary}")]
    AlreadyMerged {
        duplicate: CustomerId,
        primary: CustomerId,
    },

    /// Another merge holds one of the records; retry or inform the operator
    #[error("Customer {0} is locked by a concurrent merge")]
    ConcurrentMergeConflict(CustomerId),

    /// A child row could not be moved; the whole merge was rolled back
    #[error("Merge failed while reassigning {detail}: {source}")]
    ChildReassignmentFailure {
        detail: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Invalid merge: {0}")]
    InvalidMerge(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DedupError {
    /// True for errors the operator can recover from by refreshing or retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DedupError::AlreadyMerged { .. } | DedupError::ConcurrentMergeConflict(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DedupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        let stale = DedupError::AlreadyMerged {
            duplicate: CustomerId(31),
            primary: CustomerId(30),
        };
        assert!(stale.is_recoverable());
        assert!(DedupError::ConcurrentMergeConflict(CustomerId(30)).is_recoverable());
        assert!(!DedupError::InvalidFieldKind("fax".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = DedupError::AlreadyMerged {
            duplicate: CustomerId(31),
            primary: CustomerId(30),
        };
        assert_eq!(err.to_string(), "Customer 31 was already merged into 30");
    }
}
