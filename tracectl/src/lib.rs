// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of tracing. Crates declare their targets with [`trace_target!`] and tag
//! them; levels can then be changed per tag with strings like `subnet=debug,jobs=warn`.

pub mod control;
pub mod targets;

pub use control::{TraceCtlError, TracingControl, get_trace_ctl};
pub use tracing_subscriber::filter::LevelFilter;
