// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Request to create an L3 VPN

use super::{Network, Router, Tenant, Vpn};
use crate::{ModelError, ModelResult};
use id::Id;
use serde::{Deserialize, Serialize};

const MAX_VNI: u32 = (1 << 24) - 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L3vpnRequest {
    pub id: Id<Vpn>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<Id<Tenant>>,
    #[serde(default)]
    pub route_distinguishers: Vec<String>,
    #[serde(default)]
    pub import_rts: Vec<String>,
    #[serde(default)]
    pub export_rts: Vec<String>,
    #[serde(default)]
    pub router_ids: Vec<Id<Router>>,
    #[serde(default)]
    pub network_ids: Vec<Id<Network>>,
    #[serde(default)]
    pub l3vni: Option<u32>,
}

/// Route distinguishers and targets are `<admin>:<assigned>`, the admin part being an AS
/// number or an IPv4 address and the assigned part a number.
fn valid_community(value: &str) -> bool {
    let Some((admin, assigned)) = value.split_once(':') else {
        return false;
    };
    let admin_ok = admin.parse::<u32>().is_ok() || admin.parse::<std::net::Ipv4Addr>().is_ok();
    admin_ok && assigned.parse::<u32>().is_ok()
}

impl L3vpnRequest {
    /// Check the syntax of the request. Conflicts with existing VPNs are checked by the engine.
    pub fn validate(&self) -> ModelResult<()> {
        if self.route_distinguishers.is_empty() {
            return Err(ModelError::MissingRouteDistinguisher(self.id));
        }
        if let Some(rd) = self
            .route_distinguishers
            .iter()
            .find(|rd| !valid_community(rd))
        {
            return Err(ModelError::InvalidRouteDistinguisher(rd.clone()));
        }
        if let Some(rt) = self
            .import_rts
            .iter()
            .chain(&self.export_rts)
            .find(|rt| !valid_community(rt))
        {
            return Err(ModelError::InvalidRouteTarget(rt.clone()));
        }
        if let Some(vni) = self.l3vni
            && (vni == 0 || vni > MAX_VNI)
        {
            return Err(ModelError::InvalidL3Vni(vni));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::L3vpnRequest;
    use crate::ModelError;
    use id::Id;

    fn request(rds: &[&str], rts: &[&str]) -> L3vpnRequest {
        L3vpnRequest {
            id: Id::new(),
            name: "vpn1".to_string(),
            tenant_id: None,
            route_distinguishers: rds.iter().map(ToString::to_string).collect(),
            import_rts: rts.iter().map(ToString::to_string).collect(),
            export_rts: vec![],
            router_ids: vec![],
            network_ids: vec![],
            l3vni: None,
        }
    }

    #[test]
    fn validation() {
        assert!(request(&["100:1"], &["100:1", "10.0.0.1:7"]).validate().is_ok());
        let req = request(&[], &[]);
        assert_eq!(req.validate(), Err(ModelError::MissingRouteDistinguisher(req.id)));
        assert_eq!(
            request(&["100"], &[]).validate(),
            Err(ModelError::InvalidRouteDistinguisher("100".to_string()))
        );
        assert_eq!(
            request(&["100:1"], &["x:1"]).validate(),
            Err(ModelError::InvalidRouteTarget("x:1".to_string()))
        );
        let mut req = request(&["100:1"], &[]);
        req.l3vni = Some(1 << 24);
        assert_eq!(req.validate(), Err(ModelError::InvalidL3Vni(1 << 24)));
    }
}
