// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Validation failures of the data model

use crate::neutron::{Subnet, Vpn};
use id::Id;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Subnet {0} is IPv4 and cannot be bound to an internet VPN")]
    InternetVpnOnIpv4(Id<Subnet>),
    #[error("Invalid route distinguisher '{0}'")]
    InvalidRouteDistinguisher(String),
    #[error("Invalid route target '{0}'")]
    InvalidRouteTarget(String),
    #[error("VPN {0} has no route distinguisher")]
    MissingRouteDistinguisher(Id<Vpn>),
    #[error("Invalid L3 VNI {0}")]
    InvalidL3Vni(u32),
}

pub type ModelResult<T> = Result<T, ModelError>;
