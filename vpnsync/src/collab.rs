// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Stand-ins for the fabric and FIB services when replaying offline: calls are logged and
//! counted, nothing is programmed.

use async_trait::async_trait;
use engine::EngineResult;
use engine::collab::{
    Collaborators, FabricService, FibProgrammer, GatewayMacResolver, PoolAllocator,
};
use id::Id;
use mac_address::MacAddress;
use model::neutron::{Network, Port, Router};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracectl::trace_target;
use tracing::info;

trace_target!("dry-run", LevelFilter::INFO, &["vpnsync"]);

/// What the engine asked the outer services to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallCounters {
    pub elans_created: usize,
    pub elans_deleted: usize,
    pub elan_interfaces_added: usize,
    pub elan_interfaces_removed: usize,
    pub fallback_flows_added: usize,
    pub fallback_flows_removed: usize,
}

pub struct DryRunFabric {
    counters: Arc<Mutex<CallCounters>>,
}

#[async_trait]
impl FabricService for DryRunFabric {
    async fn create_elan(
        &self,
        network: Id<Network>,
        elan_tag: u32,
        segmentation_id: Option<u32>,
    ) -> EngineResult<()> {
        info!("Would create ELAN {elan_tag} for network {network} (segment {segmentation_id:?})");
        self.counters.lock().elans_created += 1;
        Ok(())
    }

    async fn delete_elan(&self, network: Id<Network>) -> EngineResult<()> {
        info!("Would delete ELAN of network {network}");
        self.counters.lock().elans_deleted += 1;
        Ok(())
    }

    async fn add_elan_interface(
        &self,
        network: Id<Network>,
        port: Id<Port>,
        mac: MacAddress,
    ) -> EngineResult<()> {
        info!("Would add port {port} ({mac}) to ELAN of network {network}");
        self.counters.lock().elan_interfaces_added += 1;
        Ok(())
    }

    async fn remove_elan_interface(
        &self,
        network: Id<Network>,
        port: Id<Port>,
    ) -> EngineResult<()> {
        info!("Would remove port {port} from ELAN of network {network}");
        self.counters.lock().elan_interfaces_removed += 1;
        Ok(())
    }
}

/// Resolves every gateway to the same MAC, if one is configured
pub struct FixedGatewayMac(pub Option<MacAddress>);

#[async_trait]
impl GatewayMacResolver for FixedGatewayMac {
    async fn resolve(&self, _router: Id<Router>, _gateway_ip: IpAddr) -> EngineResult<Option<MacAddress>> {
        Ok(self.0)
    }
}

/// Every router spans the same dataplane nodes
pub struct DryRunFib {
    dpns: Vec<u64>,
    counters: Arc<Mutex<CallCounters>>,
}

#[async_trait]
impl FibProgrammer for DryRunFib {
    async fn router_dpns(&self, _router: Id<Router>) -> EngineResult<Vec<u64>> {
        Ok(self.dpns.clone())
    }

    async fn program_v6_internet_fallback(
        &self,
        dpn: u64,
        router: Id<Router>,
        internet_vpn_tag: u32,
        add: bool,
    ) -> EngineResult<()> {
        let mut counters = self.counters.lock();
        if add {
            info!("Would add IPv6 fallback to VPN tag {internet_vpn_tag} for router {router} on dpn {dpn}");
            counters.fallback_flows_added += 1;
        } else {
            info!("Would remove IPv6 fallback to VPN tag {internet_vpn_tag} for router {router} on dpn {dpn}");
            counters.fallback_flows_removed += 1;
        }
        Ok(())
    }
}

/// Collaborators for an offline replay, with the counters they share
pub fn dry_run(dpns: Vec<u64>, gateway_mac: Option<MacAddress>) -> (Collaborators, Arc<Mutex<CallCounters>>) {
    let counters = Arc::new(Mutex::new(CallCounters::default()));
    let collab = Collaborators {
        allocator: Arc::new(PoolAllocator::new()),
        fabric: Arc::new(DryRunFabric {
            counters: counters.clone(),
        }),
        gw_mac: Arc::new(FixedGatewayMac(gateway_mac)),
        fib: Arc::new(DryRunFib {
            dpns,
            counters: counters.clone(),
        }),
    };
    (collab, counters)
}
