// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Derived state. Every aggregate is a [`store::Record`] and can be rebuilt from the
//! Neutron resources it derives from.

pub mod nat;
pub mod pending;
pub mod portip;
pub mod routerif;
pub mod subnetmap;
pub mod vpninstance;
pub mod vpninterface;
pub mod vpnmap;

pub use nat::{
    ExternalIp, ExternalNetwork, ExternalSubnet, FixedPortMappings, FloatingIpPortInfo,
    InternalToExternal, NatRouter, RouterPorts,
};
pub use pending::{PendingKey, PendingPortAssociation};
pub use portip::{LearntVip, PortIpMapping, VpnIpKey};
pub use routerif::RouterInterfacesMap;
pub use subnetmap::{RouterInterfaceInfo, SubnetMap, Unbind, VpnBinding};
pub use vpninstance::{BgpvpnType, RtType, VpnInstance};
pub use vpninterface::{Adjacency, AdjacencyType, AssociatedSubnetType, VpnInterface, Withdrawal};
pub use vpnmap::VpnMap;
