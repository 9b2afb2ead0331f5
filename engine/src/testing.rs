// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-process collaborators and fixtures, to drive an [`Engine`] without external services.

#![allow(clippy::expect_used, clippy::missing_panics_doc)] // valid in test code

use crate::collab::{
    Collaborators, FabricService, FibProgrammer, GatewayMacResolver, PoolAllocator,
};
use crate::{Engine, EngineConfig, EngineResult, NeutronCache};
use async_trait::async_trait;
use id::Id;
use mac_address::MacAddress;
use model::neutron::{Network, Port, Router};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use store::{Datastore, MemDatastore};

/// A call received by [`RecordingFabric`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FabricCall {
    CreateElan {
        network: Id<Network>,
        elan_tag: u32,
        segmentation_id: Option<u32>,
    },
    DeleteElan(Id<Network>),
    AddInterface {
        network: Id<Network>,
        port: Id<Port>,
    },
    RemoveInterface {
        network: Id<Network>,
        port: Id<Port>,
    },
}

/// Fabric that only records what it is asked to do
#[derive(Debug, Default)]
pub struct RecordingFabric {
    calls: Mutex<Vec<FabricCall>>,
}

impl RecordingFabric {
    #[must_use]
    pub fn calls(&self) -> Vec<FabricCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl FabricService for RecordingFabric {
    async fn create_elan(
        &self,
        network: Id<Network>,
        elan_tag: u32,
        segmentation_id: Option<u32>,
    ) -> EngineResult<()> {
        self.calls.lock().push(FabricCall::CreateElan {
            network,
            elan_tag,
            segmentation_id,
        });
        Ok(())
    }
    async fn delete_elan(&self, network: Id<Network>) -> EngineResult<()> {
        self.calls.lock().push(FabricCall::DeleteElan(network));
        Ok(())
    }
    async fn add_elan_interface(
        &self,
        network: Id<Network>,
        port: Id<Port>,
        _mac: MacAddress,
    ) -> EngineResult<()> {
        self.calls
            .lock()
            .push(FabricCall::AddInterface { network, port });
        Ok(())
    }
    async fn remove_elan_interface(&self, network: Id<Network>, port: Id<Port>) -> EngineResult<()> {
        self.calls
            .lock()
            .push(FabricCall::RemoveInterface { network, port });
        Ok(())
    }
}

/// Resolves every gateway to the same MAC, or to none
#[derive(Debug, Default)]
pub struct StaticGwMac(pub Option<MacAddress>);

#[async_trait]
impl GatewayMacResolver for StaticGwMac {
    async fn resolve(&self, _router: Id<Router>, _gateway_ip: IpAddr) -> EngineResult<Option<MacAddress>> {
        Ok(self.0)
    }
}

/// An IPv6 internet fallback flow programmed through [`RecordingFib`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackFlow {
    pub dpn: u64,
    pub router: Id<Router>,
    pub internet_vpn_tag: u32,
    pub add: bool,
}

/// FIB spanning every router over the same dataplane nodes
#[derive(Debug)]
pub struct RecordingFib {
    dpns: Vec<u64>,
    flows: Mutex<Vec<FallbackFlow>>,
}

impl RecordingFib {
    #[must_use]
    pub fn new(dpns: &[u64]) -> Self {
        Self {
            dpns: dpns.to_vec(),
            flows: Mutex::new(vec![]),
        }
    }
    #[must_use]
    pub fn flows(&self) -> Vec<FallbackFlow> {
        self.flows.lock().clone()
    }
}

#[async_trait]
impl FibProgrammer for RecordingFib {
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
        self.flows.lock().push(FallbackFlow {
            dpn,
            router,
            internet_vpn_tag,
            add,
        });
        Ok(())
    }
}

/// An engine over an in-memory datastore, with handles on its collaborators
pub struct TestBed {
    pub engine: Engine,
    pub store: Arc<MemDatastore>,
    pub allocator: Arc<PoolAllocator>,
    pub fabric: Arc<RecordingFabric>,
    pub fib: Arc<RecordingFib>,
}

/// Dataplane nodes of [`RecordingFib`] in test beds
pub const TEST_DPNS: [u64; 2] = [1, 2];

/// MAC of the external gateway in test beds
#[must_use]
pub fn gw_mac() -> MacAddress {
    MacAddress::new([0x02, 0, 0, 0, 0, 0xfe])
}

impl TestBed {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        Self::over(Arc::new(MemDatastore::new()), NeutronCache::default(), config).await
    }

    /// A new engine over the datastore of `self`, as after a restart. Only the Neutron
    /// resources in `cache` are known to it.
    pub async fn restart(&self, cache: NeutronCache, config: EngineConfig) -> Self {
        Self::over(self.store.clone(), cache, config).await
    }

    async fn over(store: Arc<MemDatastore>, cache: NeutronCache, config: EngineConfig) -> Self {
        let allocator = Arc::new(PoolAllocator::new());
        let fabric = Arc::new(RecordingFabric::default());
        let fib = Arc::new(RecordingFib::new(&TEST_DPNS));
        let collab = Collaborators {
            allocator: allocator.clone(),
            fabric: fabric.clone(),
            gw_mac: Arc::new(StaticGwMac(Some(gw_mac()))),
            fib: fib.clone(),
        };
        let datastore: Arc<dyn Datastore> = store.clone();
        let engine = Engine::with_cache(datastore, collab, cache, config)
            .await
            .expect("Should succeed");
        Self {
            engine,
            store,
            allocator,
            fabric,
            fib,
        }
    }

    /// Deliver a batch of changes and wait for the engine to converge
    pub async fn settle(&self) {
        self.engine.settle().await;
    }
}

/// Builders of Neutron resources. Addresses are parsed from strings and panic if malformed.
pub mod fixtures {
    use id::Id;
    use ipnet::IpNet;
    use mac_address::MacAddress;
    use model::neutron::{
        ExternalGateway, FixedIp, FloatingIp, L3vpnRequest, Network, NetworkType, Port, Route,
        Router, Subnet, Tenant, VnicType, device_owner,
    };
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU8, Ordering};

    static NEXT_MAC: AtomicU8 = AtomicU8::new(1);

    /// Tenant of every fixture
    #[must_use]
    pub fn tenant() -> Id<Tenant> {
        Id::from_name("tenant")
    }

    #[must_use]
    pub fn ip(addr: &str) -> IpAddr {
        addr.parse().expect("Should be an IP address")
    }

    #[must_use]
    pub fn prefix(cidr: &str) -> IpNet {
        cidr.parse().expect("Should be a prefix")
    }

    fn next_mac() -> MacAddress {
        MacAddress::new([0x02, 0, 0, 0, 0x10, NEXT_MAC.fetch_add(1, Ordering::Relaxed)])
    }

    #[must_use]
    pub fn network(name: &str) -> Network {
        Network {
            id: Id::from_name(name),
            name: name.to_string(),
            tenant_id: tenant(),
            network_type: NetworkType::Vxlan,
            segmentation_id: Some(1000),
            external: false,
        }
    }

    #[must_use]
    pub fn external_network(name: &str) -> Network {
        Network {
            network_type: NetworkType::Flat,
            segmentation_id: None,
            external: true,
            ..network(name)
        }
    }

    #[must_use]
    pub fn subnet(network: &Network, name: &str, cidr: &str) -> Subnet {
        let cidr = prefix(cidr);
        Subnet {
            id: Id::from_name(name),
            name: name.to_string(),
            network_id: network.id,
            tenant_id: tenant(),
            gateway_ip: cidr.hosts().find(|a| *a != cidr.network()),
            cidr,
        }
    }

    /// A VM port with one fixed IP per `(subnet, ip)`
    #[must_use]
    pub fn port(name: &str, network: &Network, ips: &[(&Subnet, &str)]) -> Port {
        Port {
            id: Id::from_name(name),
            name: name.to_string(),
            network_id: network.id,
            tenant_id: tenant(),
            mac: next_mac(),
            fixed_ips: ips
                .iter()
                .map(|(subnet, addr)| FixedIp {
                    subnet_id: subnet.id,
                    ip: ip(addr),
                })
                .collect(),
            device_owner: "compute:nova".to_string(),
            device_id: Id::<Port>::from_name(format!("vm-{name}")).to_string(),
            vnic_type: VnicType::Normal,
        }
    }

    #[must_use]
    pub fn direct_port(name: &str, network: &Network, ips: &[(&Subnet, &str)]) -> Port {
        Port {
            vnic_type: VnicType::Direct,
            ..port(name, network, ips)
        }
    }

    /// The port of `router` on `subnet`, using the subnet's gateway address
    #[must_use]
    pub fn router_port(router: &Router, network: &Network, subnet: &Subnet) -> Port {
        let name = format!("{}-{}", router.name, subnet.name);
        let gateway = subnet.gateway_ip.expect("Subnet should have a gateway");
        Port {
            fixed_ips: vec![FixedIp {
                subnet_id: subnet.id,
                ip: gateway,
            }],
            device_owner: device_owner::ROUTER_INTERFACE.to_string(),
            device_id: router.id.to_string(),
            ..port(&name, network, &[])
        }
    }

    /// The port backing a floating IP, not yet bound to it
    #[must_use]
    pub fn floating_port(name: &str, external: &Network, subnet: &Subnet, addr: &str) -> Port {
        Port {
            device_owner: device_owner::FLOATING_IP.to_string(),
            device_id: device_owner::PENDING_DEVICE_ID.to_string(),
            ..port(name, external, &[(subnet, addr)])
        }
    }

    #[must_use]
    pub fn router(name: &str) -> Router {
        Router {
            id: Id::from_name(name),
            name: name.to_string(),
            tenant_id: tenant(),
            routes: vec![],
            gateway: None,
        }
    }

    #[must_use]
    pub fn with_gateway(router: &Router, external: &Network, fixed_ips: &[(&Subnet, &str)]) -> Router {
        Router {
            gateway: Some(ExternalGateway {
                network_id: external.id,
                external_fixed_ips: fixed_ips
                    .iter()
                    .map(|(subnet, addr)| FixedIp {
                        subnet_id: subnet.id,
                        ip: ip(addr),
                    })
                    .collect(),
                enable_snat: true,
            }),
            ..router.clone()
        }
    }

    #[must_use]
    pub fn with_routes(router: &Router, routes: &[(&str, &str)]) -> Router {
        Router {
            routes: routes
                .iter()
                .map(|(destination, nexthop)| Route {
                    destination: prefix(destination),
                    nexthop: ip(nexthop),
                })
                .collect(),
            ..router.clone()
        }
    }

    #[must_use]
    pub fn floating_ip(name: &str, external: &Network, addr: &str) -> FloatingIp {
        FloatingIp {
            id: Id::from_name(name),
            tenant_id: tenant(),
            floating_network_id: external.id,
            floating_ip_address: ip(addr),
            port_id: None,
            fixed_ip_address: None,
            router_id: None,
        }
    }

    /// `fip` associated to the fixed IP `addr` of `port`, behind `router`
    #[must_use]
    pub fn associated(fip: &FloatingIp, router: &Router, port: &Port, addr: &str) -> FloatingIp {
        FloatingIp {
            port_id: Some(port.id),
            fixed_ip_address: Some(ip(addr)),
            router_id: Some(router.id),
            ..fip.clone()
        }
    }

    /// Request for a VPN with a single route distinguisher and no association
    #[must_use]
    pub fn l3vpn(name: &str, rd: &str) -> L3vpnRequest {
        L3vpnRequest {
            id: Id::from_name(name),
            name: name.to_string(),
            tenant_id: Some(tenant()),
            route_distinguishers: vec![rd.to_string()],
            import_rts: vec![rd.to_string()],
            export_rts: vec![rd.to_string()],
            router_ids: vec![],
            network_ids: vec![],
            l3vni: None,
        }
    }
}
