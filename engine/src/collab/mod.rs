// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Contracts of the services the engine calls into. Only the calls matter here; the
//! services themselves live elsewhere.

mod allocator;

pub use allocator::PoolAllocator;

use crate::EngineResult;
use async_trait::async_trait;
use id::Id;
use mac_address::MacAddress;
use model::neutron::{Network, Port, Router};
use std::net::IpAddr;
use std::sync::Arc;

/// Pool of VPN tags
pub const VPN_TAG_POOL: &str = "vpnservices.tags";
/// Pool of ELAN tags
pub const ELAN_TAG_POOL: &str = "elan.tags";

/// Pool-based integer allocation. Allocating twice with the same key yields the same id.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    async fn create_pool(&self, pool: &str, low: u32, high: u32) -> EngineResult<()>;
    async fn delete_pool(&self, pool: &str) -> EngineResult<()>;
    async fn allocate_id(&self, pool: &str, key: &str) -> EngineResult<u32>;
    async fn release_id(&self, pool: &str, key: &str) -> EngineResult<()>;
}

/// The L2 fabric: one ELAN instance per network
#[async_trait]
pub trait FabricService: Send + Sync {
    async fn create_elan(
        &self,
        network: Id<Network>,
        elan_tag: u32,
        segmentation_id: Option<u32>,
    ) -> EngineResult<()>;
    async fn delete_elan(&self, network: Id<Network>) -> EngineResult<()>;
    async fn add_elan_interface(
        &self,
        network: Id<Network>,
        port: Id<Port>,
        mac: MacAddress,
    ) -> EngineResult<()>;
    async fn remove_elan_interface(&self, network: Id<Network>, port: Id<Port>)
    -> EngineResult<()>;
}

/// Resolves the MAC of the external gateway of a router
#[async_trait]
pub trait GatewayMacResolver: Send + Sync {
    async fn resolve(&self, router: Id<Router>, gateway_ip: IpAddr)
    -> EngineResult<Option<MacAddress>>;
}

/// Dataplane programming needed by the internet VPN fallback
#[async_trait]
pub trait FibProgrammer: Send + Sync {
    /// Dataplane nodes the router spans
    async fn router_dpns(&self, router: Id<Router>) -> EngineResult<Vec<u64>>;
    async fn program_v6_internet_fallback(
        &self,
        dpn: u64,
        router: Id<Router>,
        internet_vpn_tag: u32,
        add: bool,
    ) -> EngineResult<()>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub allocator: Arc<dyn IdAllocator>,
    pub fabric: Arc<dyn FabricService>,
    pub gw_mac: Arc<dyn GatewayMacResolver>,
    pub fib: Arc<dyn FibProgrammer>,
}
