// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! State shared by the managers of an engine

use crate::collab::Collaborators;
use crate::{EngineConfig, EngineResult, LockKey, NeutronCache, PendingAssociationCache};
use concurrency::{JobQueue, JobTicket, KeyedGuard, KeyedLock};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use store::Datastore;

pub(crate) struct Shared {
    pub(crate) store: Arc<dyn Datastore>,
    pub(crate) locks: KeyedLock<LockKey>,
    pub(crate) jobs: JobQueue<crate::EngineError>,
    pub(crate) config: EngineConfig,
    pub(crate) cache: NeutronCache,
    pub(crate) pending: PendingAssociationCache,
    pub(crate) collab: Collaborators,
}

impl Shared {
    pub(crate) fn new(
        store: Arc<dyn Datastore>,
        collab: Collaborators,
        cache: NeutronCache,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            locks: KeyedLock::new(),
            jobs: JobQueue::new(config.retry_policy()),
            pending: PendingAssociationCache::new(),
            cache,
            collab,
            config,
        }
    }

    /// Bounded lock acquisition. A timeout is an error for the caller to propagate.
    pub(crate) async fn lock(&self, key: LockKey) -> EngineResult<KeyedGuard<LockKey>> {
        Ok(self.locks.try_lock_for(key, self.config.lock_timeout).await?)
    }

    /// Blocking lock acquisition, for critical sections that never nest another lock
    pub(crate) async fn lock_blocking(&self, key: LockKey) -> KeyedGuard<LockKey> {
        self.locks.lock(key).await
    }

    /// Queue `work` under `key`. `ctx` is cloned into every attempt of the job.
    pub(crate) fn submit<C, F, Fut>(&self, key: String, name: &str, ctx: C, work: F) -> JobTicket
    where
        C: Clone + Send + Sync + 'static,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<()>> + Send + 'static,
    {
        self.jobs
            .enqueue(key, name, move || work(ctx.clone()).boxed())
    }
}
