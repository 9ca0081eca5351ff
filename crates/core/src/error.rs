use crate::types::{DbId, Version};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The caller's version no longer matches the stored one. Re-read and retry.
    #[error("Concurrent modification of {entity} {id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        entity: &'static str,
        id: DbId,
        expected: Version,
        actual: Version,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether a fresh read followed by the same write may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_version_conflicts_are_retryable() {
        let conflict = CoreError::ConcurrentModification {
            entity: "server_node",
            id: 7,
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_retryable());
        assert!(!CoreError::Conflict("owner taken".into()).is_retryable());
        assert!(!CoreError::NotFound {
            entity: "server_node",
            id: 7
        }
        .is_retryable());
    }

    #[test]
    fn display_concurrent_modification() {
        let err = CoreError::ConcurrentModification {
            entity: "server_node",
            id: 3,
            expected: 4,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "Concurrent modification of server_node 3: expected version 4, found 5"
        );
    }
}
