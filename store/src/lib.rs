// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Transactional key-value datastore holding the synchronizer's aggregates.
//!
//! Records live in one of two logical stores: [`LogicalStore::Configuration`] for intended
//! state and [`LogicalStore::Operational`] for learnt or derived state. Within a store,
//! records are grouped in trees (one per record type) and addressed by a string key.
//! Writes are batched in a [`Transaction`] that is applied atomically or not at all.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

mod datastore;
mod errors;
mod memory;
mod path;
mod transaction;

pub use datastore::{Datastore, Record, Value};
pub use errors::{StoreError, StoreResult};
pub use memory::MemDatastore;
pub use path::{DataPath, LogicalStore};
pub use transaction::{Transaction, TxOp};

use tracectl::trace_target;
trace_target!("store", LevelFilter::INFO, &["store", "vpnsync"]);
