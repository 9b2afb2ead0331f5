// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Concurrency substrate of the synchronizer.
//!
//! Two primitives serialize all mutations of the derived aggregates:
//!
//!  - [`KeyedLock`]: mutual exclusion per key (subnet, VPN, interface, router ...), with a blocking
//!    acquire and a bounded one. A bounded acquire that times out is an error, never a license to
//!    proceed unprotected.
//!  - [`JobQueue`]: per-key FIFO queues of retryable async jobs. At most one job per key runs at
//!    any time; jobs failing with a retryable error are re-run a bounded number of times and
//!    dropped afterwards.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

pub mod job_queue;
pub mod keyed_lock;

pub use job_queue::{JobOutcome, JobQueue, JobTicket, Retryable, RetryPolicy};
pub use keyed_lock::{KeyedGuard, KeyedLock, LockError};

use tracectl::trace_target;
trace_target!("jobs", LevelFilter::INFO, &["jobs", "vpnsync"]);
