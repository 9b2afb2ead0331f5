// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Reconciliation engine keeping VPN and NAT aggregates consistent with the Neutron model.
//!
//! The engine is organized in layers:
//!
//!  - managers, each owning one family of aggregates and applying the pure transitions of
//!    the `model` crate under a per-key lock: [`SubnetAssociationManager`],
//!    [`VpnLifecycleManager`], [`VpnInterfaceSynchronizer`] and [`FloatingIpSynchronizer`].
//!  - the [`RouterAssociationOrchestrator`], which sequences manager calls for flows spanning
//!    several aggregates (router/VPN association, subnet moves, internet VPN fallback). It never
//!    holds a lock across manager calls.
//!  - event adapters ([`listener`]), one serial stream per Neutron resource type, which
//!    translate changes into jobs on the per-key [`concurrency::JobQueue`].
//!  - the RPC-shaped [`L3vpnService`].
//!
//! Lock ordering: a router or network lock may be held while taking a VPN lock. No other
//! nesting exists.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

mod cache;
pub mod collab;
mod config;
mod context;
mod engine;
mod errors;
mod external;
mod floatingip;
mod interface;
mod keys;
pub mod listener;
mod pending;
mod router;
mod rpc;
mod subnetmap;
mod vpn;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{NeutronCache, NeutronSource, Resource, ResourceCache};
pub use config::{EngineConfig, EngineConfigBuilder, EngineConfigBuilderError};
pub use engine::{Engine, ResyncReport, Snapshot};
pub use errors::{EngineError, EngineResult};
pub use floatingip::FloatingIpSynchronizer;
pub use interface::{ComputedInterface, VpnInterfaceSynchronizer};
pub use keys::LockKey;
pub use pending::PendingAssociationCache;
pub use router::RouterAssociationOrchestrator;
pub use rpc::{BatchReport, L3vpnService, L3vpnView};
pub use subnetmap::SubnetAssociationManager;
pub use vpn::{Dissociator, VpnLifecycleManager, VpnParams, VpnParamsBuilder};
