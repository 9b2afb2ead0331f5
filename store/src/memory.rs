// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory datastore.

use crate::{DataPath, Datastore, LogicalStore, StoreError, StoreResult, TxOp, Value};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Datastore keeping records in ordered maps. Commits take a write lock over the whole map,
/// which makes them atomic. It can be told to fail commits, to exercise error paths.
#[derive(Default)]
pub struct MemDatastore {
    data: RwLock<BTreeMap<DataPath, Value>>,
    passing_commits: AtomicU32,
    failing_commits: AtomicU32,
    writes: Mutex<HashMap<&'static str, usize>>,
}

impl MemDatastore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StoreError::Unavailable`]
    pub fn fail_next_commits(&self, count: u32) {
        self.fail_commits_after(0, count);
    }

    /// Let `skip` commits through, then fail the next `count` ones
    pub fn fail_commits_after(&self, skip: u32, count: u32) {
        self.passing_commits.store(skip, Ordering::SeqCst);
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Number of put or delete operations committed to `tree`
    #[must_use]
    pub fn writes(&self, tree: &str) -> usize {
        self.writes.lock().get(tree).copied().unwrap_or(0)
    }

    /// Number of put or delete operations committed, all trees included
    #[must_use]
    pub fn total_writes(&self) -> usize {
        self.writes.lock().values().sum()
    }

    /// Number of records in a tree
    #[must_use]
    pub fn count(&self, store: LogicalStore, tree: &str) -> usize {
        self.data
            .read()
            .keys()
            .filter(|p| p.store == store && p.tree == tree)
            .count()
    }

    fn take_failure(&self) -> bool {
        if self
            .passing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn get(&self, path: &DataPath) -> StoreResult<Option<Value>> {
        Ok(self.data.read().get(path).cloned())
    }

    async fn list(&self, store: LogicalStore, tree: &'static str) -> StoreResult<Vec<Value>> {
        Ok(self
            .data
            .read()
            .iter()
            .filter(|(p, _)| p.store == store && p.tree == tree)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn commit(&self, ops: Vec<TxOp>) -> StoreResult<()> {
        if self.take_failure() {
            warn!("Rejecting commit of {} operations", ops.len());
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        let mut data = self.data.write();
        let mut writes = self.writes.lock();
        for op in ops {
            debug!("{op:?}");
            *writes.entry(op.path().tree).or_default() += 1;
            match op {
                TxOp::Put { path, value } => {
                    data.insert(path, value);
                }
                TxOp::Delete { path } => {
                    data.remove(&path);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Datastore, LogicalStore, MemDatastore, Record, StoreError, Transaction};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Widget {
        name: String,
        size: u32,
    }
    impl Record for Widget {
        const STORE: LogicalStore = LogicalStore::Configuration;
        const TREE: &'static str = "widgets";
        type Key = String;
        fn key(&self) -> String {
            self.name.clone()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Gadget(u32);
    impl Record for Gadget {
        const STORE: LogicalStore = LogicalStore::Configuration;
        const TREE: &'static str = "widgets";
        type Key = u32;
        fn key(&self) -> u32 {
            self.0
        }
    }

    fn widget(name: &str, size: u32) -> Widget {
        Widget {
            name: name.to_string(),
            size,
        }
    }

    #[tokio::test]
    async fn put_read_delete() {
        let store: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        store.put(widget("a", 1)).await.expect("Should succeed");
        store.put(widget("a", 2)).await.expect("Should succeed");
        store.put(widget("b", 3)).await.expect("Should succeed");

        let a = store.read::<Widget>(&"a".to_string()).await.expect("Should succeed");
        assert_eq!(a, Some(widget("a", 2)));
        assert_eq!(store.read_all::<Widget>().await.expect("Should succeed").len(), 2);

        store.delete::<Widget>(&"a".to_string()).await.expect("Should succeed");
        assert!(!store.exists::<Widget>(&"a".to_string()).await.expect("Should succeed"));
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let mem = Arc::new(MemDatastore::new());
        let store: Arc<dyn Datastore> = mem.clone();
        let mut tx = Transaction::new();
        tx.put(widget("a", 1)).put(widget("b", 2));

        mem.fail_next_commits(1);
        let err = store.submit(tx.clone()).await.expect_err("Should fail");
        assert!(err.is_transient());
        assert_eq!(mem.count(LogicalStore::Configuration, "widgets"), 0);

        store.submit(tx).await.expect("Should succeed");
        assert_eq!(mem.count(LogicalStore::Configuration, "widgets"), 2);
        assert_eq!(mem.writes("widgets"), 2);
    }

    #[tokio::test]
    async fn failures_can_start_mid_sequence() {
        let mem = Arc::new(MemDatastore::new());
        let store: Arc<dyn Datastore> = mem.clone();
        mem.fail_commits_after(1, 1);
        store.put(widget("a", 1)).await.expect("Should succeed");
        store.put(widget("b", 2)).await.expect_err("Should fail");
        store.put(widget("c", 3)).await.expect("Should succeed");
        assert_eq!(mem.count(LogicalStore::Configuration, "widgets"), 2);
    }

    #[tokio::test]
    async fn reading_with_the_wrong_type_fails() {
        let store: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        store.put(widget("7", 1)).await.expect("Should succeed");
        let res = store.read::<Gadget>(&7).await;
        assert!(matches!(res, Err(StoreError::TypeMismatch(_))));
    }
}
