// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control-plane attributes of a VPN

use crate::neutron::{Router, Subnet, Vpn};
use crate::{AddressFamily, IpFamily};
use id::Id;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use store::{LogicalStore, Record};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display)]
pub enum BgpvpnType {
    #[default]
    Internal,
    Bgpvpn,
    InternetBgpvpn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum RtType {
    Import,
    Export,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpnInstance {
    pub vpn_id: Id<Vpn>,
    pub name: String,
    pub route_distinguishers: Vec<String>,
    pub route_targets: BTreeMap<String, RtType>,
    pub bgpvpn_type: BgpvpnType,
    pub is_l2: bool,
    pub l3vni: Option<u32>,
    pub vpn_tag: Option<u32>,             /* allocated id */
    pub requested_family: AddressFamily,  /* creation hint, not authoritative */
    family_refs: BTreeMap<IpFamily, BTreeSet<Id<Subnet>>>,
}

/// Collapse import and export targets into one set, a target in both lists being `Both`
fn merge_route_targets(import: &[String], export: &[String]) -> BTreeMap<String, RtType> {
    let mut targets = BTreeMap::new();
    for rt in import {
        targets.insert(rt.clone(), RtType::Import);
    }
    for rt in export {
        targets
            .entry(rt.clone())
            .and_modify(|t| {
                if *t == RtType::Import {
                    *t = RtType::Both;
                }
            })
            .or_insert(RtType::Export);
    }
    targets
}

impl VpnInstance {
    #[must_use]
    pub fn new(vpn_id: Id<Vpn>, name: &str) -> Self {
        Self {
            vpn_id,
            name: name.to_owned(),
            route_distinguishers: vec![],
            route_targets: BTreeMap::new(),
            bgpvpn_type: BgpvpnType::Internal,
            is_l2: false,
            l3vni: None,
            vpn_tag: None,
            requested_family: AddressFamily::empty(),
            family_refs: BTreeMap::new(),
        }
    }

    /// The VPN internal to a router
    #[must_use]
    pub fn internal(router: &Router) -> Self {
        Self::new(router.id.retag(), &router.name)
    }

    /// Set route distinguishers and targets. The VPN is a BGP VPN iff it has some RD.
    /// An internet VPN stays so as long as it has RDs.
    pub fn configure(&mut self, rds: &[String], import: &[String], export: &[String]) {
        self.route_distinguishers = rds.to_vec();
        self.route_targets = merge_route_targets(import, export);
        self.bgpvpn_type = match (rds.is_empty(), self.bgpvpn_type) {
            (true, _) => BgpvpnType::Internal,
            (false, BgpvpnType::InternetBgpvpn) => BgpvpnType::InternetBgpvpn,
            (false, _) => BgpvpnType::Bgpvpn,
        };
    }

    pub fn import_rts(&self) -> impl Iterator<Item = &str> {
        self.route_targets
            .iter()
            .filter(|(_, t)| **t != RtType::Export)
            .map(|(rt, _)| rt.as_str())
    }

    pub fn export_rts(&self) -> impl Iterator<Item = &str> {
        self.route_targets
            .iter()
            .filter(|(_, t)| **t != RtType::Import)
            .map(|(rt, _)| rt.as_str())
    }

    #[must_use]
    pub fn is_internet(&self) -> bool {
        self.bgpvpn_type == BgpvpnType::InternetBgpvpn
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.bgpvpn_type == BgpvpnType::Internal
    }

    /// Turn a BGP VPN into an internet VPN or back. Internal VPNs are never internet VPNs.
    pub fn set_internet(&mut self, internet: bool) -> bool {
        let new = match (self.bgpvpn_type, internet) {
            (BgpvpnType::Internal, _) => BgpvpnType::Internal,
            (_, true) => BgpvpnType::InternetBgpvpn,
            (_, false) => BgpvpnType::Bgpvpn,
        };
        let changed = new != self.bgpvpn_type;
        self.bgpvpn_type = new;
        changed
    }

    /// Address families of the subnets currently bound to the VPN
    #[must_use]
    pub fn address_family(&self) -> AddressFamily {
        self.family_refs
            .iter()
            .filter(|(_, subnets)| !subnets.is_empty())
            .fold(AddressFamily::empty(), |acc, (family, _)| {
                acc | AddressFamily::from(*family)
            })
    }

    /// Count `subnet` as contributing `family`. Returns whether the VPN gained the family.
    pub fn add_family_ref(&mut self, family: IpFamily, subnet: Id<Subnet>) -> bool {
        let refs = self.family_refs.entry(family).or_default();
        let gained = refs.is_empty();
        refs.insert(subnet) && gained
    }

    /// Stop counting `subnet` for `family`. Returns whether the VPN lost the family.
    pub fn remove_family_ref(&mut self, family: IpFamily, subnet: Id<Subnet>) -> bool {
        let Some(refs) = self.family_refs.get_mut(&family) else {
            return false;
        };
        let lost = refs.remove(&subnet) && refs.is_empty();
        if refs.is_empty() {
            self.family_refs.remove(&family);
        }
        lost
    }

    /// Replace the contributing subnets. Returns whether anything changed.
    pub fn set_family_refs(
        &mut self,
        refs: impl IntoIterator<Item = (IpFamily, Id<Subnet>)>,
    ) -> bool {
        let mut recounted: BTreeMap<IpFamily, BTreeSet<Id<Subnet>>> = BTreeMap::new();
        for (family, subnet) in refs {
            recounted.entry(family).or_default().insert(subnet);
        }
        let changed = recounted != self.family_refs;
        self.family_refs = recounted;
        changed
    }

    /// Number of subnets contributing `family`
    #[must_use]
    pub fn family_refs(&self, family: IpFamily) -> usize {
        self.family_refs.get(&family).map_or(0, BTreeSet::len)
    }
}

impl Record for VpnInstance {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "vpn-instances";
    type Key = Id<Vpn>;
    fn key(&self) -> Id<Vpn> {
        self.vpn_id
    }
}

#[cfg(test)]
mod tests {
    use super::{BgpvpnType, RtType, VpnInstance};
    use crate::{AddressFamily, IpFamily};
    use id::Id;
    use pretty_assertions::assert_eq;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn route_targets_collapse_to_both() {
        let mut vpn = VpnInstance::new(Id::new(), "vpn");
        vpn.configure(
            &strings(&["100:1"]),
            &strings(&["100:1", "100:2"]),
            &strings(&["100:2", "100:3", "100:3"]),
        );
        assert_eq!(vpn.route_targets.len(), 3);
        assert_eq!(vpn.route_targets["100:1"], RtType::Import);
        assert_eq!(vpn.route_targets["100:2"], RtType::Both);
        assert_eq!(vpn.route_targets["100:3"], RtType::Export);
        assert_eq!(vpn.import_rts().collect::<Vec<_>>(), vec!["100:1", "100:2"]);
        assert_eq!(vpn.bgpvpn_type, BgpvpnType::Bgpvpn);

        vpn.configure(&[], &[], &[]);
        assert_eq!(vpn.bgpvpn_type, BgpvpnType::Internal);
    }

    #[test]
    fn internet_type_transitions() {
        let mut vpn = VpnInstance::new(Id::new(), "vpn");
        assert!(!vpn.set_internet(true));
        vpn.configure(&strings(&["1:1"]), &[], &[]);
        assert!(vpn.set_internet(true));
        vpn.configure(&strings(&["1:2"]), &[], &[]);
        assert!(vpn.is_internet());
        assert!(vpn.set_internet(false));
        assert_eq!(vpn.bgpvpn_type, BgpvpnType::Bgpvpn);
    }

    #[test]
    fn family_is_reference_counted() {
        let mut vpn = VpnInstance::new(Id::new(), "vpn");
        let (s1, s2, s3) = (Id::new(), Id::new(), Id::new());
        assert_eq!(vpn.address_family(), AddressFamily::empty());

        assert!(vpn.add_family_ref(IpFamily::V6, s1));
        assert!(!vpn.add_family_ref(IpFamily::V6, s2));
        assert!(!vpn.add_family_ref(IpFamily::V6, s2));
        assert!(vpn.add_family_ref(IpFamily::V4, s3));
        assert_eq!(vpn.address_family(), AddressFamily::BOTH);

        assert!(!vpn.remove_family_ref(IpFamily::V6, s1));
        assert_eq!(vpn.address_family(), AddressFamily::BOTH);
        assert!(vpn.remove_family_ref(IpFamily::V6, s2));
        assert_eq!(vpn.address_family(), AddressFamily::V4);
        assert!(!vpn.remove_family_ref(IpFamily::V6, s2));
        assert!(vpn.remove_family_ref(IpFamily::V4, s3));
        assert_eq!(vpn.address_family().to_string(), "NONE");
    }

    #[test]
    fn family_refs_are_recounted() {
        let mut vpn = VpnInstance::new(Id::new(), "vpn");
        let (s1, s2) = (Id::new(), Id::new());
        vpn.add_family_ref(IpFamily::V4, s1);
        assert!(vpn.set_family_refs([(IpFamily::V6, s2), (IpFamily::V6, s2)]));
        assert_eq!(vpn.address_family(), AddressFamily::V6);
        assert_eq!(vpn.family_refs(IpFamily::V6), 1);
        assert!(!vpn.set_family_refs([(IpFamily::V6, s2)]));
    }
}
