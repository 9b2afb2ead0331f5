// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! L3VPN operations as exposed to API clients. Operations on several items report per item:
//! a failed item does not prevent the others from being applied, and the call as a whole only
//! fails if every item failed.

use crate::{
    EngineError, EngineResult, RouterAssociationOrchestrator, VpnLifecycleManager, VpnParams,
};
use id::Id;
use model::aggregates::{VpnInstance, VpnMap};
use model::neutron::{L3vpnRequest, Network, Router, Vpn};
use std::fmt::Display;
use tracing::{info, warn};

/// Outcome of a batch operation, per item
#[derive(Debug, Default, PartialEq)]
pub struct BatchReport {
    pub successes: Vec<String>,
    pub failures: Vec<(String, EngineError)>,
}

impl BatchReport {
    fn record(&mut self, item: impl Display, result: EngineResult<()>) {
        match result {
            Ok(()) => self.successes.push(item.to_string()),
            Err(e) => {
                warn!("Operation on {item} failed: {e}");
                self.failures.push((item.to_string(), e));
            }
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fail if every item failed
    pub fn finish(self) -> EngineResult<Self> {
        if self.successes.is_empty() && !self.failures.is_empty() {
            return Err(EngineError::BatchFailed(self.failures.len()));
        }
        Ok(self)
    }
}

/// A VPN as reported to API clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3vpnView {
    pub instance: VpnInstance,
    pub map: VpnMap,
}

#[derive(Clone)]
pub struct L3vpnService {
    vpns: VpnLifecycleManager,
    orchestrator: RouterAssociationOrchestrator,
}

impl L3vpnService {
    pub(crate) fn new(vpns: VpnLifecycleManager, orchestrator: RouterAssociationOrchestrator) -> Self {
        Self { vpns, orchestrator }
    }

    pub async fn create_l3vpn(&self, requests: Vec<L3vpnRequest>) -> EngineResult<BatchReport> {
        let mut report = BatchReport::default();
        for request in &requests {
            let result = self.create_one(request).await;
            report.record(request.id, result);
        }
        report.finish()
    }

    async fn create_one(&self, request: &L3vpnRequest) -> EngineResult<()> {
        request.validate()?;
        if self.vpns.get_instance(request.id).await?.is_some() {
            return Err(EngineError::conflict(format!(
                "VPN {} already configured",
                request.id
            )));
        }
        for instance in self.vpns.instances().await? {
            if let Some(rd) = instance
                .route_distinguishers
                .iter()
                .find(|rd| request.route_distinguishers.contains(rd))
            {
                return Err(EngineError::conflict(format!(
                    "route distinguisher {rd} already configured for VPN {}",
                    instance.vpn_id
                )));
            }
        }
        for router_id in &request.router_ids {
            self.orchestrator.router(*router_id)?;
            if let Some(other) = self.vpns.external_vpn_of_router(*router_id).await? {
                return Err(EngineError::conflict(format!(
                    "router {router_id} is already associated to VPN {other}"
                )));
            }
        }
        for network_id in &request.network_ids {
            if let Some(other) = self.vpns.vpn_of_network(*network_id).await? {
                return Err(EngineError::conflict(format!(
                    "network {network_id} is already associated to VPN {other}"
                )));
            }
        }

        self.vpns
            .create_or_update_vpn_instance(&VpnParams::from(request))
            .await?;
        for router_id in &request.router_ids {
            self.orchestrator
                .associate_router_to_vpn(request.id, *router_id)
                .await?;
        }
        for network_id in &request.network_ids {
            self.orchestrator
                .associate_network_to_vpn(request.id, *network_id)
                .await?;
        }
        info!("Created L3VPN {} '{}'", request.id, request.name);
        Ok(())
    }

    /// One VPN, or all the VPNs that are not internal to a router
    pub async fn get_l3vpn(&self, vpn_id: Option<Id<Vpn>>) -> EngineResult<Vec<L3vpnView>> {
        if let Some(vpn_id) = vpn_id {
            let instance = self
                .vpns
                .get_instance(vpn_id)
                .await?
                .ok_or_else(|| EngineError::not_found(format!("VPN {vpn_id}")))?;
            let map = self
                .vpns
                .get_map(vpn_id)
                .await?
                .ok_or_else(|| EngineError::not_found(format!("VPN map {vpn_id}")))?;
            return Ok(vec![L3vpnView { instance, map }]);
        }
        let mut views = vec![];
        for map in self.vpns.maps().await? {
            if let Some(instance) = self.vpns.get_instance(map.vpn_id).await?
                && !instance.is_internal()
            {
                views.push(L3vpnView { instance, map });
            }
        }
        Ok(views)
    }

    async fn external_vpn(&self, vpn_id: Id<Vpn>) -> EngineResult<VpnMap> {
        match self.vpns.get_instance(vpn_id).await? {
            None => Err(EngineError::not_found(format!("VPN {vpn_id}"))),
            Some(instance) if instance.is_internal() => Err(EngineError::conflict(format!(
                "VPN {vpn_id} is internal to a router"
            ))),
            Some(_) => self
                .vpns
                .get_map(vpn_id)
                .await?
                .ok_or_else(|| EngineError::not_found(format!("VPN map {vpn_id}"))),
        }
    }

    pub async fn delete_l3vpn(&self, vpn_ids: Vec<Id<Vpn>>) -> EngineResult<BatchReport> {
        let mut report = BatchReport::default();
        for vpn_id in vpn_ids {
            let result = match self.external_vpn(vpn_id).await {
                Ok(_) => self.vpns.delete_vpn(vpn_id, &self.orchestrator).await,
                Err(e) => Err(e),
            };
            report.record(vpn_id, result);
        }
        report.finish()
    }

    pub async fn associate_router(&self, vpn_id: Id<Vpn>, router_ids: Vec<Id<Router>>) -> EngineResult<BatchReport> {
        self.external_vpn(vpn_id).await?;
        let mut report = BatchReport::default();
        for router_id in router_ids {
            let result = self
                .orchestrator
                .associate_router_to_vpn(vpn_id, router_id)
                .await;
            report.record(router_id, result);
        }
        report.finish()
    }

    pub async fn dissociate_router(&self, vpn_id: Id<Vpn>, router_ids: Vec<Id<Router>>) -> EngineResult<BatchReport> {
        let map = self.external_vpn(vpn_id).await?;
        let mut report = BatchReport::default();
        for router_id in router_ids {
            let result = if map.router_ids.contains(&router_id) {
                self.orchestrator
                    .dissociate_router_from_vpn(vpn_id, router_id)
                    .await
            } else {
                Err(EngineError::not_found(format!(
                    "router {router_id} in VPN {vpn_id}"
                )))
            };
            report.record(router_id, result);
        }
        report.finish()
    }

    pub async fn associate_networks(
        &self,
        vpn_id: Id<Vpn>,
        network_ids: Vec<Id<Network>>,
    ) -> EngineResult<BatchReport> {
        self.external_vpn(vpn_id).await?;
        let mut report = BatchReport::default();
        for network_id in network_ids {
            let result = self
                .orchestrator
                .associate_network_to_vpn(vpn_id, network_id)
                .await;
            report.record(network_id, result);
        }
        report.finish()
    }

    pub async fn dissociate_networks(
        &self,
        vpn_id: Id<Vpn>,
        network_ids: Vec<Id<Network>>,
    ) -> EngineResult<BatchReport> {
        let map = self.external_vpn(vpn_id).await?;
        let mut report = BatchReport::default();
        for network_id in network_ids {
            let result = if map.network_ids.contains(&network_id) {
                self.orchestrator
                    .dissociate_network_from_vpn(vpn_id, network_id)
                    .await
            } else {
                Err(EngineError::not_found(format!(
                    "network {network_id} in VPN {vpn_id}"
                )))
            };
            report.record(network_id, result);
        }
        report.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::BatchReport;
    use crate::EngineError;

    #[test]
    fn batch_fails_only_when_every_item_failed() {
        let mut report = BatchReport::default();
        report.record("a", Err(EngineError::conflict("taken")));
        report.record("b", Ok(()));
        let report = report.finish().expect("Should succeed");
        assert!(!report.is_success());
        assert_eq!(report.failures.len(), 1);

        let mut report = BatchReport::default();
        report.record("a", Err(EngineError::conflict("taken")));
        report.record("b", Err(EngineError::not_found("router")));
        assert_eq!(report.finish(), Err(EngineError::BatchFailed(2)));
    }
}
