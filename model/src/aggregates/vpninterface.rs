// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-port VPN membership and the prefixes reachable through the port

use crate::IpFamily;
use crate::neutron::{Network, Port, Subnet, Vpn};
use id::Id;
use ipnet::IpNet;
use mac_address::MacAddress;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use store::{LogicalStore, Record};

/// The families of subnets through which a port belongs to a VPN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum AssociatedSubnetType {
    V4Subnet,
    V6Subnet,
    V4AndV6Subnet,
}

impl AssociatedSubnetType {
    #[must_use]
    pub fn of(family: IpFamily) -> Self {
        match family {
            IpFamily::V4 => Self::V4Subnet,
            IpFamily::V6 => Self::V6Subnet,
        }
    }

    #[must_use]
    pub fn has(self, family: IpFamily) -> bool {
        matches!(
            (self, family),
            (Self::V4AndV6Subnet, _) | (Self::V4Subnet, IpFamily::V4) | (Self::V6Subnet, IpFamily::V6)
        )
    }

    #[must_use]
    pub fn with(self, family: IpFamily) -> Self {
        if self.has(family) { self } else { Self::V4AndV6Subnet }
    }

    /// Remove a family. `None` if no family is left.
    #[must_use]
    pub fn without(self, family: IpFamily) -> Option<Self> {
        match (self, family) {
            (Self::V4AndV6Subnet, IpFamily::V4) => Some(Self::V6Subnet),
            (Self::V4AndV6Subnet, IpFamily::V6) => Some(Self::V4Subnet),
            (t, f) if t.has(f) => None,
            (t, _) => Some(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum AdjacencyType {
    Primary,
    ExtraRoute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adjacency {
    pub ip_prefix: IpNet,
    pub mac: Option<MacAddress>,
    pub adjacency_type: AdjacencyType,
    pub next_hops: BTreeSet<IpAddr>,
    pub subnet_id: Option<Id<Subnet>>,
}

impl Adjacency {
    /// Host route to a fixed IP of the port
    #[must_use]
    pub fn primary(ip: IpAddr, mac: MacAddress, subnet_id: Id<Subnet>) -> Self {
        Self {
            ip_prefix: IpNet::from(ip),
            mac: Some(mac),
            adjacency_type: AdjacencyType::Primary,
            next_hops: BTreeSet::from([ip]),
            subnet_id: Some(subnet_id),
        }
    }

    /// Static route to `destination` via fixed IPs of the port
    #[must_use]
    pub fn extra_route(destination: IpNet, next_hops: BTreeSet<IpAddr>) -> Self {
        Self {
            ip_prefix: destination,
            mac: None,
            adjacency_type: AdjacencyType::ExtraRoute,
            next_hops,
            subnet_id: None,
        }
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.adjacency_type == AdjacencyType::Primary
    }

    #[must_use]
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.ip_prefix.addr())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpnInterface {
    pub port_id: Id<Port>,
    pub network_id: Id<Network>,
    pub is_router_interface: bool,
    pub memberships: BTreeMap<Id<Vpn>, AssociatedSubnetType>,
    pub adjacencies: BTreeMap<IpNet, Adjacency>, /* keyed by prefix: prefixes are unique */
}

/// Result of withdrawing a subnet from an interface
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Withdrawal {
    pub removed: Vec<Adjacency>,
    pub orphaned: bool, /* the interface should be deleted */
}

impl VpnInterface {
    #[must_use]
    pub fn new(port_id: Id<Port>, network_id: Id<Network>, is_router_interface: bool) -> Self {
        Self {
            port_id,
            network_id,
            is_router_interface,
            memberships: BTreeMap::new(),
            adjacencies: BTreeMap::new(),
        }
    }

    /// Add VPN memberships, widening the subnet type of existing ones.
    /// Memberships not listed are kept.
    pub fn merge_memberships(
        &mut self,
        vpns: impl IntoIterator<Item = (Id<Vpn>, AssociatedSubnetType)>,
    ) -> bool {
        let mut changed = false;
        for (vpn, stype) in vpns {
            let merged = match self.memberships.get(&vpn) {
                Some(current) => match stype {
                    AssociatedSubnetType::V4AndV6Subnet => stype,
                    AssociatedSubnetType::V4Subnet => current.with(IpFamily::V4),
                    AssociatedSubnetType::V6Subnet => current.with(IpFamily::V6),
                },
                None => stype,
            };
            changed |= self.memberships.insert(vpn, merged) != Some(merged);
        }
        changed
    }

    /// Drop the membership to `vpn`. Returns whether it was present.
    pub fn remove_membership(&mut self, vpn: Id<Vpn>) -> bool {
        self.memberships.remove(&vpn).is_some()
    }

    #[must_use]
    pub fn is_member_of(&self, vpn: Id<Vpn>) -> bool {
        self.memberships.contains_key(&vpn)
    }

    /// Add adjacencies. An extra route to a known prefix gains the new next hops,
    /// any other adjacency replaces the one with the same prefix.
    pub fn merge_adjacencies(&mut self, adjacencies: impl IntoIterator<Item = Adjacency>) -> bool {
        let mut changed = false;
        for adj in adjacencies {
            match self.adjacencies.get_mut(&adj.ip_prefix) {
                Some(existing)
                    if existing.adjacency_type == AdjacencyType::ExtraRoute
                        && adj.adjacency_type == AdjacencyType::ExtraRoute =>
                {
                    for nh in adj.next_hops {
                        changed |= existing.next_hops.insert(nh);
                    }
                }
                Some(existing) if *existing == adj => {}
                _ => {
                    self.adjacencies.insert(adj.ip_prefix, adj);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Remove next hops from the extra route to `destination`. The route is removed with its
    /// last next hop. Returns whether something changed.
    pub fn remove_extra_route_hops(&mut self, destination: IpNet, next_hops: &[IpAddr]) -> bool {
        let Some(adj) = self.adjacencies.get_mut(&destination) else {
            return false;
        };
        if adj.adjacency_type != AdjacencyType::ExtraRoute {
            return false;
        }
        let mut changed = false;
        for nh in next_hops {
            changed |= adj.next_hops.remove(nh);
        }
        if adj.next_hops.is_empty() {
            self.adjacencies.remove(&destination);
        }
        changed
    }

    pub fn primary_adjacencies(&self) -> impl Iterator<Item = &Adjacency> {
        self.adjacencies.values().filter(|a| a.is_primary())
    }

    /// Subnets of the primary adjacencies
    #[must_use]
    pub fn subnets(&self) -> BTreeSet<Id<Subnet>> {
        self.primary_adjacencies()
            .filter_map(|a| a.subnet_id)
            .collect()
    }

    /// Remove the adjacencies owned by `subnet` and the extra-route next hops that pointed at
    /// them, then narrow each membership in `vpns` unless an adjacency of the subnet's family
    /// is left in that VPN. `bound` gives the VPNs the other subnets of the port are bound to.
    /// The interface is orphaned when it is left with no membership or with no primary
    /// adjacency.
    pub fn withdraw_subnet(
        &mut self,
        subnet: Id<Subnet>,
        family: IpFamily,
        vpns: &[Id<Vpn>],
        bound: &BTreeMap<Id<Subnet>, BTreeSet<Id<Vpn>>>,
    ) -> Withdrawal {
        let prefixes: Vec<IpNet> = self
            .primary_adjacencies()
            .filter(|a| a.subnet_id == Some(subnet))
            .map(|a| a.ip_prefix)
            .collect();
        let mut removed: Vec<Adjacency> = prefixes
            .iter()
            .filter_map(|p| self.adjacencies.remove(p))
            .collect();
        let gone: BTreeSet<IpAddr> = removed.iter().map(|a| a.ip_prefix.addr()).collect();

        let mut emptied = vec![];
        for adj in self.adjacencies.values_mut() {
            if adj.adjacency_type == AdjacencyType::ExtraRoute {
                adj.next_hops.retain(|nh| !gone.contains(nh));
                if adj.next_hops.is_empty() {
                    emptied.push(adj.ip_prefix);
                }
            }
        }
        removed.extend(emptied.iter().filter_map(|p| self.adjacencies.remove(p)));

        for vpn in vpns {
            let family_left = self.primary_adjacencies().any(|a| {
                a.family() == family
                    && a.subnet_id
                        .and_then(|s| bound.get(&s))
                        .is_some_and(|v| v.contains(vpn))
            });
            if family_left {
                continue;
            }
            if let Some(stype) = self.memberships.get(vpn).copied() {
                match stype.without(family) {
                    Some(narrowed) => {
                        self.memberships.insert(*vpn, narrowed);
                    }
                    None => {
                        self.memberships.remove(vpn);
                    }
                }
            }
        }
        let orphaned = self.memberships.is_empty() || self.primary_adjacencies().next().is_none();
        Withdrawal { removed, orphaned }
    }
}

impl Record for VpnInterface {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "vpn-interfaces";
    type Key = Id<Port>;
    fn key(&self) -> Id<Port> {
        self.port_id
    }
}
