// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::{DataPath, Record, Value};
use std::sync::Arc;

#[derive(Clone)]
pub enum TxOp {
    Put { path: DataPath, value: Value },
    Delete { path: DataPath },
}

impl TxOp {
    #[must_use]
    pub fn path(&self) -> &DataPath {
        match self {
            TxOp::Put { path, .. } | TxOp::Delete { path } => path,
        }
    }
}

impl std::fmt::Debug for TxOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxOp::Put { path, .. } => write!(f, "put {path}"),
            TxOp::Delete { path } => write!(f, "delete {path}"),
        }
    }
}

/// A batch of writes. Later operations on a path supersede earlier ones.
#[derive(Debug, Default, Clone)]
pub struct Transaction {
    ops: Vec<TxOp>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<R: Record>(&mut self, record: R) -> &mut Self {
        let path = record.path();
        self.ops.push(TxOp::Put {
            path,
            value: Arc::new(record),
        });
        self
    }

    pub fn delete<R: Record>(&mut self, key: &R::Key) -> &mut Self {
        self.ops.push(TxOp::Delete {
            path: R::path_of(key),
        });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn into_ops(self) -> Vec<TxOp> {
        self.ops
    }
}
