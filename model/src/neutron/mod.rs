// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Neutron resources, as delivered by change notifications.

mod floatingip;
mod l3vpn;
mod network;
mod port;
mod router;
mod subnet;

pub use floatingip::FloatingIp;
pub use l3vpn::L3vpnRequest;
pub use network::{Network, NetworkType};
pub use port::{FixedIp, Port, VnicType, device_owner};
pub use router::{ExternalGateway, Route, Router};
pub use subnet::Subnet;

/// Tag type for VPN identifiers
#[derive(Debug)]
pub enum Vpn {}

/// Tag type for tenant identifiers
#[derive(Debug)]
pub enum Tenant {}
