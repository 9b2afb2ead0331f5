// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The datastore contract and typed accessors on top of it.

use crate::{DataPath, LogicalStore, StoreError, StoreResult, Transaction, TxOp};
use async_trait::async_trait;
use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::Arc;

/// A stored value. The store is agnostic of record types.
pub type Value = Arc<dyn Any + Send + Sync>;

/// A type that can be stored. Each type lives in its own tree of a single logical store.
pub trait Record: Any + Clone + Send + Sync + Debug {
    const STORE: LogicalStore;
    const TREE: &'static str;
    type Key: Display + Send + Sync;

    fn key(&self) -> Self::Key;

    fn path_of(key: &Self::Key) -> DataPath {
        DataPath::new(Self::STORE, Self::TREE, key.to_string())
    }
    fn path(&self) -> DataPath {
        Self::path_of(&self.key())
    }
}

/// Storage backend. Implementations must apply the operations of a commit atomically.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, path: &DataPath) -> StoreResult<Option<Value>>;
    async fn list(&self, store: LogicalStore, tree: &'static str) -> StoreResult<Vec<Value>>;
    async fn commit(&self, ops: Vec<TxOp>) -> StoreResult<()>;
}

fn downcast<R: Record>(path: &DataPath, value: &Value) -> StoreResult<R> {
    value
        .downcast_ref::<R>()
        .cloned()
        .ok_or_else(|| StoreError::TypeMismatch(path.clone()))
}

impl dyn Datastore + '_ {
    pub async fn read<R: Record>(&self, key: &R::Key) -> StoreResult<Option<R>> {
        let path = R::path_of(key);
        match self.get(&path).await? {
            Some(value) => downcast(&path, &value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn exists<R: Record>(&self, key: &R::Key) -> StoreResult<bool> {
        Ok(self.get(&R::path_of(key)).await?.is_some())
    }

    pub async fn read_all<R: Record>(&self) -> StoreResult<Vec<R>> {
        self.list(R::STORE, R::TREE)
            .await?
            .iter()
            .map(|value| {
                value
                    .downcast_ref::<R>()
                    .cloned()
                    .ok_or_else(|| StoreError::TypeMismatch(DataPath::new(R::STORE, R::TREE, "*")))
            })
            .collect()
    }

    pub async fn put<R: Record>(&self, record: R) -> StoreResult<()> {
        let mut tx = Transaction::new();
        tx.put(record);
        self.submit(tx).await
    }

    pub async fn delete<R: Record>(&self, key: &R::Key) -> StoreResult<()> {
        let mut tx = Transaction::new();
        tx.delete::<R>(key);
        self.submit(tx).await
    }

    /// Apply all operations of a transaction. Empty transactions are not submitted.
    pub async fn submit(&self, tx: Transaction) -> StoreResult<()> {
        if tx.is_empty() {
            return Ok(());
        }
        self.commit(tx.into_ops()).await
    }
}
