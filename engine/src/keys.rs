// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use id::Id;
use model::neutron::{FloatingIp, Network, Port, Router, Subnet, Vpn};
use std::fmt::Display;

/// Keys of the engine's locks: one per aggregate family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    Subnet(Id<Subnet>),
    Vpn(Id<Vpn>),
    Interface(Id<Port>),
    Router(Id<Router>),
    RouterPorts(Id<Router>),
    Network(Id<Network>),
    FloatingIp(Id<FloatingIp>),
}

impl Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Subnet(id) => write!(f, "subnet:{id}"),
            LockKey::Vpn(id) => write!(f, "vpn:{id}"),
            LockKey::Interface(id) => write!(f, "interface:{id}"),
            LockKey::Router(id) => write!(f, "router:{id}"),
            LockKey::RouterPorts(id) => write!(f, "router-ports:{id}"),
            LockKey::Network(id) => write!(f, "network:{id}"),
            LockKey::FloatingIp(id) => write!(f, "floating-ip:{id}"),
        }
    }
}

/// Job queue keys. Jobs touching a port are serialized with the port's own events.
pub(crate) mod job_key {
    use id::Id;
    use model::neutron::{FloatingIp, Network, Port, Router, Subnet, Vpn};

    pub(crate) fn port(id: Id<Port>) -> String {
        format!("port:{id}")
    }
    pub(crate) fn subnet(id: Id<Subnet>) -> String {
        format!("subnet:{id}")
    }
    pub(crate) fn network(id: Id<Network>) -> String {
        format!("network:{id}")
    }
    pub(crate) fn router(id: Id<Router>) -> String {
        format!("router:{id}")
    }
    pub(crate) fn vpn(id: Id<Vpn>) -> String {
        format!("vpn:{id}")
    }
    pub(crate) fn floating_ip(id: Id<FloatingIp>) -> String {
        format!("floating-ip:{id}")
    }
}
