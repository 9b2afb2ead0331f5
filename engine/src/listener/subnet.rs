// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::engine::Managers;
use crate::keys::job_key;
use crate::listener::ChangeListener;
use crate::listener::port::router_port_ready;
use crate::{EngineError, EngineResult};
use async_trait::async_trait;
use model::neutron::{Port, Subnet};
use tracing::debug;

pub(crate) struct SubnetListener(Managers);

impl SubnetListener {
    pub(crate) fn new(managers: Managers) -> Self {
        Self(managers)
    }
}

async fn subnet_added(m: Managers, subnet: Subnet) -> EngineResult<()> {
    let network = m
        .shared
        .cache
        .networks
        .get(subnet.network_id)
        .ok_or_else(|| EngineError::Dependency(format!("network {}", subnet.network_id)))?;
    m.subnets.create_subnet_aggregate(&subnet, &network).await?;
    if network.external {
        return m.orchestrator.create_external_subnet(&subnet).await;
    }
    m.orchestrator
        .bind_subnet_to_network_vpn(subnet.id, network.id)
        .await?;
    let Some(subnetmap) = m.subnets.get(subnet.id).await? else {
        return Ok(());
    };
    // router interfaces that waited for the subnet and are not recorded yet
    let recorded = subnetmap.router_interface.map(|ri| ri.port_id);
    for port in subnetmap
        .port_list
        .iter()
        .filter(|p| Some(**p) != recorded)
        .filter_map(|p| m.shared.cache.ports.get(*p))
        .filter(Port::is_router_interface)
    {
        m.shared.submit(
            job_key::port(port.id),
            "router-port-ready",
            (m.clone(), (port.id, subnet.id)),
            |(m, ids): (Managers, _)| router_port_ready(m, ids),
        );
    }
    Ok(())
}

async fn subnet_removed(m: Managers, subnet: Subnet) -> EngineResult<()> {
    m.orchestrator.remove_subnet(subnet.id).await
}

#[async_trait]
impl ChangeListener<Subnet> for SubnetListener {
    async fn added(&self, new: Subnet) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.subnets.upsert(&new);
        m.shared.submit(
            job_key::subnet(new.id),
            "subnet-added",
            (m.clone(), new),
            |(m, s): (Managers, Subnet)| subnet_added(m, s),
        );
        Ok(())
    }

    async fn updated(&self, _old: Subnet, new: Subnet) -> EngineResult<()> {
        debug!("Subnet {} updated", new.id);
        self.0.shared.cache.subnets.upsert(&new);
        Ok(())
    }

    async fn removed(&self, old: Subnet) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.subnets.invalidate(old.id);
        m.shared.submit(
            job_key::subnet(old.id),
            "subnet-removed",
            (m.clone(), old),
            |(m, s): (Managers, Subnet)| subnet_removed(m, s),
        );
        Ok(())
    }
}
