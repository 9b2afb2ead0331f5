// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Data model of the VPN synchronizer.
//!
//! [`neutron`] holds the externally-owned resources the synchronizer derives its state from.
//! [`aggregates`] holds the derived state it produces, together with the pure state transitions
//! the engine applies to it under lock.

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

pub mod aggregates;
pub mod errors;
pub mod family;
pub mod neutron;

pub use errors::{ModelError, ModelResult};
pub use family::{AddressFamily, IpFamily};

use tracectl::trace_target;
trace_target!("model", LevelFilter::INFO, &["vpnsync"]);
