// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-process [`IdAllocator`] over roaring bitmaps

use super::IdAllocator;
use crate::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug)]
struct Pool {
    low: u32,
    high: u32,
    used: RoaringBitmap,
    by_key: HashMap<String, u32>,
}

impl Pool {
    fn first_free(&self) -> Option<u32> {
        (self.low..=self.high).find(|id| !self.used.contains(*id))
    }
}

#[derive(Debug, Default)]
pub struct PoolAllocator {
    pools: Mutex<HashMap<String, Pool>>,
}

impl PoolAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids allocated from `pool`
    #[must_use]
    pub fn allocated(&self, pool: &str) -> u64 {
        self.pools.lock().get(pool).map_or(0, |p| p.used.len())
    }
}

fn no_pool(pool: &str) -> EngineError {
    EngineError::collaborator("allocator", format!("no pool '{pool}'"))
}

#[async_trait]
impl IdAllocator for PoolAllocator {
    async fn create_pool(&self, pool: &str, low: u32, high: u32) -> EngineResult<()> {
        if low > high {
            return Err(EngineError::collaborator(
                "allocator",
                format!("empty range [{low}, {high}] for pool '{pool}'"),
            ));
        }
        let mut pools = self.pools.lock();
        if pools.contains_key(pool) {
            debug!("Pool '{pool}' already exists");
            return Ok(());
        }
        pools.insert(
            pool.to_owned(),
            Pool {
                low,
                high,
                used: RoaringBitmap::new(),
                by_key: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> EngineResult<()> {
        if self.pools.lock().remove(pool).is_none() {
            warn!("Pool '{pool}' does not exist");
        }
        Ok(())
    }

    async fn allocate_id(&self, pool: &str, key: &str) -> EngineResult<u32> {
        let mut pools = self.pools.lock();
        let p = pools.get_mut(pool).ok_or_else(|| no_pool(pool))?;
        if let Some(id) = p.by_key.get(key) {
            return Ok(*id);
        }
        let id = p
            .first_free()
            .ok_or_else(|| EngineError::collaborator("allocator", format!("pool '{pool}' exhausted")))?;
        p.used.insert(id);
        p.by_key.insert(key.to_owned(), id);
        debug!("Allocated {id} from '{pool}' for {key}");
        Ok(id)
    }

    async fn release_id(&self, pool: &str, key: &str) -> EngineResult<()> {
        let mut pools = self.pools.lock();
        let p = pools.get_mut(pool).ok_or_else(|| no_pool(pool))?;
        if let Some(id) = p.by_key.remove(key) {
            p.used.remove(id);
            debug!("Released {id} to '{pool}'");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::PoolAllocator;
    use crate::collab::IdAllocator;

    #[tokio::test]
    async fn allocation_is_idempotent_per_key() {
        let alloc = PoolAllocator::new();
        alloc.create_pool("p", 10, 11).await.expect("Should succeed");
        let a = alloc.allocate_id("p", "a").await.expect("Should succeed");
        assert_eq!(a, 10);
        assert_eq!(alloc.allocate_id("p", "a").await.expect("Should succeed"), a);
        assert_eq!(alloc.allocate_id("p", "b").await.expect("Should succeed"), 11);
        assert!(alloc.allocate_id("p", "c").await.is_err());

        alloc.release_id("p", "a").await.expect("Should succeed");
        assert_eq!(alloc.allocate_id("p", "c").await.expect("Should succeed"), 10);
        assert_eq!(alloc.allocated("p"), 2);
        assert!(alloc.allocate_id("nope", "a").await.is_err());
    }
}
