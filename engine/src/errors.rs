// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors of the reconciliation engine

use concurrency::{LockError, Retryable};
use model::ModelError;
use store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} does not exist yet")]
    Dependency(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Datastore failure: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    LockTimeout(#[from] LockError),
    #[error("Invalid input: {0}")]
    Validation(#[from] ModelError),
    #[error("All {0} items of the batch failed")]
    BatchFailed(usize),
    #[error("{service} failure: {reason}")]
    Collaborator {
        service: &'static str,
        reason: String,
    },
}

impl EngineError {
    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        EngineError::NotFound(what.to_string())
    }
    pub(crate) fn conflict(what: impl Into<String>) -> Self {
        EngineError::Conflict(what.into())
    }
    pub(crate) fn collaborator(service: &'static str, reason: impl std::fmt::Display) -> Self {
        EngineError::Collaborator {
            service,
            reason: reason.to_string(),
        }
    }
}

impl Retryable for EngineError {
    /// Transient datastore failures and lock contention may resolve by themselves, as may
    /// dependencies on resources whose events were not processed yet.
    fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::LockTimeout(_) | EngineError::Dependency(_) => true,
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::EngineError;
    use concurrency::{LockError, Retryable};
    use std::time::Duration;
    use store::StoreError;

    #[test]
    fn retry_classification() {
        let timeout = LockError::Timeout {
            key: "subnet:x".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(EngineError::from(timeout).is_retryable());
        assert!(EngineError::from(StoreError::Unavailable("down".to_string())).is_retryable());
        assert!(!EngineError::conflict("router bound elsewhere").is_retryable());
        assert!(!EngineError::not_found("subnet").is_retryable());
    }
}
