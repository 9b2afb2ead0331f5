// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::collab::ELAN_TAG_POOL;
use crate::engine::Managers;
use crate::keys::job_key;
use crate::listener::ChangeListener;
use crate::EngineResult;
use async_trait::async_trait;
use model::neutron::Network;
use tracing::{info, warn};

pub(crate) struct NetworkListener(Managers);

impl NetworkListener {
    pub(crate) fn new(managers: Managers) -> Self {
        Self(managers)
    }
}

async fn network_added(m: Managers, network: Network) -> EngineResult<()> {
    let collab = &m.shared.collab;
    let tag = collab
        .allocator
        .allocate_id(ELAN_TAG_POOL, &network.id.to_string())
        .await?;
    collab
        .fabric
        .create_elan(network.id, tag, network.segmentation_id)
        .await?;
    info!("Network {} has ELAN tag {tag}", network.id);
    m.orchestrator.create_external_network(&network).await
}

async fn network_updated(m: Managers, (old, new): (Network, Network)) -> EngineResult<()> {
    let attributes = |n: &Network| (n.network_type, n.segmentation_id, n.external);
    if attributes(&old) == attributes(&new) {
        return Ok(());
    }
    for subnetmap in m.subnets.subnets_of_network(new.id).await? {
        m.subnets
            .update_network_attributes(subnetmap.subnet_id, &new)
            .await?;
    }
    if new.external && !old.external {
        m.orchestrator.create_external_network(&new).await?;
    }
    if old.external && !new.external {
        m.orchestrator.delete_external_network(new.id).await?;
    }
    Ok(())
}

async fn network_removed(m: Managers, network: Network) -> EngineResult<()> {
    if let Some(vpn_id) = m.vpns.vpn_of_network(network.id).await? {
        m.orchestrator
            .dissociate_network_from_vpn(vpn_id, network.id)
            .await?;
    }
    m.orchestrator.delete_external_network(network.id).await?;
    let collab = &m.shared.collab;
    collab.fabric.delete_elan(network.id).await?;
    if let Err(e) = collab
        .allocator
        .release_id(ELAN_TAG_POOL, &network.id.to_string())
        .await
    {
        warn!("Failed to release ELAN tag of network {}: {e}", network.id);
    }
    info!("Network {} removed", network.id);
    Ok(())
}

#[async_trait]
impl ChangeListener<Network> for NetworkListener {
    async fn added(&self, new: Network) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.networks.upsert(&new);
        m.shared.submit(
            job_key::network(new.id),
            "network-added",
            (m.clone(), new),
            |(m, n): (Managers, Network)| network_added(m, n),
        );
        Ok(())
    }

    async fn updated(&self, old: Network, new: Network) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.networks.upsert(&new);
        m.shared.submit(
            job_key::network(new.id),
            "network-updated",
            (m.clone(), (old, new)),
            |(m, change): (Managers, (Network, Network))| network_updated(m, change),
        );
        Ok(())
    }

    async fn removed(&self, old: Network) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.networks.invalidate(old.id);
        m.shared.submit(
            job_key::network(old.id),
            "network-removed",
            (m.clone(), old),
            |(m, n): (Managers, Network)| network_removed(m, n),
        );
        Ok(())
    }
}
