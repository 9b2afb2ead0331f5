// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Event adapters: translation of Neutron change notifications into engine operations.
//!
//! Each resource type has its own [`ResourceStream`], drained by a single task, so that two
//! changes of the same type are never handled concurrently. Listeners refresh the Neutron cache
//! inline and queue the actual work as jobs keyed by the resource they act on.

mod floatingip;
mod network;
mod port;
mod router;
mod subnet;

pub(crate) use floatingip::FloatingIpListener;
pub(crate) use network::NetworkListener;
pub(crate) use port::PortListener;
pub(crate) use router::RouterListener;
pub(crate) use subnet::SubnetListener;

use crate::{EngineResult, Resource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};
use tracectl::trace_target;
use tracing::{debug, error};

trace_target!("listener", LevelFilter::INFO, &["vpnsync"]);

/// A change notification of a Neutron resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change<T> {
    Added(T),
    Updated { old: T, new: T },
    Removed(T),
}

#[async_trait]
pub trait ChangeListener<T>: Send + Sync + 'static {
    async fn added(&self, new: T) -> EngineResult<()>;
    async fn updated(&self, old: T, new: T) -> EngineResult<()>;
    async fn removed(&self, old: T) -> EngineResult<()>;
}

struct StreamState {
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Serial stream of changes of one resource type
pub struct ResourceStream<T> {
    tx: mpsc::UnboundedSender<Change<T>>,
    state: Arc<StreamState>,
}

impl<T: Resource> ResourceStream<T> {
    /// Spawn the task delivering changes to `listener`
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(listener: Arc<dyn ChangeListener<T>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Change<T>>();
        let state = Arc::new(StreamState {
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let task_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let result = match change {
                    Change::Added(new) => {
                        debug!("{} {} added", T::KIND, new.id());
                        listener.added(new).await
                    }
                    Change::Updated { old, new } => {
                        debug!("{} {} updated", T::KIND, new.id());
                        listener.updated(old, new).await
                    }
                    Change::Removed(old) => {
                        debug!("{} {} removed", T::KIND, old.id());
                        listener.removed(old).await
                    }
                };
                if let Err(e) = result {
                    error!("Failed to handle {} change: {e}", T::KIND);
                }
                if task_state.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                    task_state.idle.notify_waiters();
                }
            }
            debug!("{} stream closed", T::KIND);
        });
        Self { tx, state }
    }

    /// Deliver a change. Returns false if the stream is closed.
    pub fn send(&self, change: Change<T>) -> bool {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(change).is_err() {
            self.state.outstanding.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn added(&self, new: T) -> bool {
        self.send(Change::Added(new))
    }

    pub fn updated(&self, old: T, new: T) -> bool {
        self.send(Change::Updated { old, new })
    }

    pub fn removed(&self, old: T) -> bool {
        self.send(Change::Removed(old))
    }

    /// Changes delivered and not yet handled
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every delivered change has been handled
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}
