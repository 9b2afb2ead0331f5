// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NAT-side aggregates: floating IP mappings and router external gateways

use crate::neutron::{FloatingIp, Network, Port, Router, Subnet, Vpn};
use id::Id;
use mac_address::MacAddress;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use store::{LogicalStore, Record};

/// The Neutron port backing a floating IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FloatingIpPortInfo {
    pub floating_ip_id: Id<FloatingIp>,
    pub floating_port_id: Id<Port>,
    pub floating_subnet_id: Option<Id<Subnet>>,
    pub floating_mac: MacAddress,
    pub deleted: bool, /* floating IP removed, NAT removal pending */
}

impl Record for FloatingIpPortInfo {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "floating-ip-port-info";
    type Key = Id<FloatingIp>;
    fn key(&self) -> Id<FloatingIp> {
        self.floating_ip_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InternalToExternal {
    pub internal_ip: IpAddr,
    pub external_ip: IpAddr,
    pub floating_ip_id: Id<FloatingIp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixedPortMappings {
    pub port_id: Id<Port>,
    pub mappings: BTreeMap<IpAddr, InternalToExternal>, /* keyed by internal IP */
}

/// Floating IP translations of a router, per fixed port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterPorts {
    pub router_id: Id<Router>,
    pub external_network_id: Option<Id<Network>>,
    pub ports: BTreeMap<Id<Port>, FixedPortMappings>,
}

impl RouterPorts {
    #[must_use]
    pub fn new(router_id: Id<Router>, external_network_id: Option<Id<Network>>) -> Self {
        Self {
            router_id,
            external_network_id,
            ports: BTreeMap::new(),
        }
    }

    /// Map `internal` to `external` on a fixed port. Returns whether something changed.
    pub fn upsert_mapping(&mut self, port_id: Id<Port>, mapping: InternalToExternal) -> bool {
        let port = self.ports.entry(port_id).or_insert_with(|| FixedPortMappings {
            port_id,
            mappings: BTreeMap::new(),
        });
        port.mappings.insert(mapping.internal_ip, mapping) != Some(mapping)
    }

    /// Remove the mapping of `internal` on a fixed port, and the port if it has no mapping left
    pub fn remove_mapping(
        &mut self,
        port_id: Id<Port>,
        internal: IpAddr,
    ) -> Option<InternalToExternal> {
        let port = self.ports.get_mut(&port_id)?;
        let removed = port.mappings.remove(&internal);
        if port.mappings.is_empty() {
            self.ports.remove(&port_id);
        }
        removed
    }

    #[must_use]
    pub fn mapping(&self, port_id: Id<Port>, internal: IpAddr) -> Option<&InternalToExternal> {
        self.ports.get(&port_id)?.mappings.get(&internal)
    }

    /// A router with no fixed port left is removed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

impl Record for RouterPorts {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "router-ports";
    type Key = Id<Router>;
    fn key(&self) -> Id<Router> {
        self.router_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExternalIp {
    pub ip: IpAddr,
    pub subnet_id: Id<Subnet>,
}

/// External gateway of a router, as seen by NAT
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NatRouter {
    pub router_id: Id<Router>,
    pub network_id: Id<Network>,
    pub enable_snat: bool,
    pub external_ips: Vec<ExternalIp>,
    pub subnet_ids: BTreeSet<Id<Subnet>>, /* internal subnets of the router */
    pub ext_gw_mac: Option<MacAddress>,
}

impl Record for NatRouter {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "nat-routers";
    type Key = Id<Router>;
    fn key(&self) -> Id<Router> {
        self.router_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalNetwork {
    pub network_id: Id<Network>,
    pub vpn_id: Option<Id<Vpn>>,
    pub router_ids: BTreeSet<Id<Router>>,
}

impl Record for ExternalNetwork {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "external-networks";
    type Key = Id<Network>;
    fn key(&self) -> Id<Network> {
        self.network_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalSubnet {
    pub subnet_id: Id<Subnet>,
    pub network_id: Id<Network>,
    pub vpn_id: Option<Id<Vpn>>,
    pub router_ids: BTreeSet<Id<Router>>,
}

impl Record for ExternalSubnet {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "external-subnets";
    type Key = Id<Subnet>;
    fn key(&self) -> Id<Subnet> {
        self.subnet_id
    }
}

#[cfg(test)]
mod tests {
    use super::{InternalToExternal, RouterPorts};
    use id::Id;
    use std::net::IpAddr;

    fn mapping(internal: &str, external: &str) -> InternalToExternal {
        InternalToExternal {
            internal_ip: internal.parse::<IpAddr>().expect("Should parse"),
            external_ip: external.parse::<IpAddr>().expect("Should parse"),
            floating_ip_id: Id::new(),
        }
    }

    #[test]
    fn empty_containers_are_collected() {
        let mut rp = RouterPorts::new(Id::new(), None);
        let (p1, p2) = (Id::new(), Id::new());
        let m1 = mapping("10.0.0.5", "172.24.4.5");
        let m2 = mapping("10.0.0.6", "172.24.4.6");
        assert!(rp.upsert_mapping(p1, m1));
        assert!(!rp.upsert_mapping(p1, m1));
        assert!(rp.upsert_mapping(p1, m2));
        let m3 = mapping("10.0.1.7", "172.24.4.7");
        assert!(rp.upsert_mapping(p2, m3));

        assert_eq!(rp.remove_mapping(p1, m1.internal_ip), Some(m1));
        assert!(rp.ports.contains_key(&p1));
        assert_eq!(rp.remove_mapping(p1, m2.internal_ip), Some(m2));
        assert!(!rp.ports.contains_key(&p1));
        assert_eq!(rp.remove_mapping(p1, m2.internal_ip), None);
        assert!(!rp.is_empty());
        rp.remove_mapping(p2, m3.internal_ip);
        assert!(rp.is_empty());
    }
}
