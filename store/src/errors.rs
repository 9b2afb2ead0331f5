// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::DataPath;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Datastore unavailable: {0}")]
    Unavailable(String),
    #[error("Conflicting modification of {0}")]
    Conflict(DataPath),
    #[error("Record at {0} does not have the requested type")]
    TypeMismatch(DataPath),
}

impl StoreError {
    /// Tell if retrying the failed operation may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
