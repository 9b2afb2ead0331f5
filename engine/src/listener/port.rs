// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::engine::Managers;
use crate::keys::job_key;
use crate::listener::ChangeListener;
use crate::{EngineError, EngineResult};
use async_trait::async_trait;
use id::Id;
use model::neutron::{Port, Router, Subnet};
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub(crate) struct PortListener(Managers);

impl PortListener {
    pub(crate) fn new(managers: Managers) -> Self {
        Self(managers)
    }
}

/// The router of a router interface port. The router must be known before its ports.
fn router_of(m: &Managers, port: &Port) -> EngineResult<Option<Router>> {
    let Some(router_id) = port.device::<Router>() else {
        warn!("Router interface {} has no router id: '{}'", port.id, port.device_id);
        return Ok(None);
    };
    m.shared
        .cache
        .routers
        .get(router_id)
        .map(Some)
        .ok_or_else(|| EngineError::Dependency(format!("router {router_id}")))
}

/// Attach a port to a subnet. Returns false if the port waits for the subnet.
async fn attach(m: &Managers, port: &Port, subnet_id: Id<Subnet>) -> EngineResult<bool> {
    let (regular, direct) = if port.is_direct() {
        (None, Some(port.id))
    } else {
        (Some(port.id), None)
    };
    Ok(m.subnets
        .attach_port(subnet_id, regular, direct)
        .await?
        .is_some())
}

/// The subnet a router interface port waited for now exists: the router routes it
pub(crate) async fn router_port_ready(
    m: Managers,
    (port_id, subnet_id): (Id<Port>, Id<Subnet>),
) -> EngineResult<()> {
    let Some(port) = m.shared.cache.ports.get(port_id) else {
        debug!("Router interface {port_id} is gone");
        return Ok(());
    };
    let Some(router) = router_of(&m, &port)? else {
        return Ok(());
    };
    m.orchestrator
        .add_subnet_to_router(&router, &port, subnet_id)
        .await?;
    m.interfaces.sync_port(&port).await?;
    Ok(())
}

async fn port_added(m: Managers, port: Port) -> EngineResult<()> {
    if port.is_floating_ip() {
        m.floating_ips.on_floating_port(&port).await?;
        return Ok(());
    }
    if port.is_router_interface() {
        let Some(router) = router_of(&m, &port)? else {
            return Ok(());
        };
        for subnet_id in port.subnets() {
            if attach(&m, &port, subnet_id).await? {
                m.orchestrator
                    .add_subnet_to_router(&router, &port, subnet_id)
                    .await?;
            } else {
                debug!("Router interface {} waits for subnet {subnet_id}", port.id);
            }
        }
        m.interfaces.sync_port(&port).await?;
        return Ok(());
    }
    for subnet_id in port.subnets() {
        attach(&m, &port, subnet_id).await?;
    }
    m.shared
        .collab
        .fabric
        .add_elan_interface(port.network_id, port.id, port.mac)
        .await?;
    if !port.is_direct() {
        m.interfaces.sync_port(&port).await?;
    }
    Ok(())
}

async fn port_updated(m: Managers, (old, new): (Port, Port)) -> EngineResult<()> {
    if new.is_floating_ip() {
        if old.device_id != new.device_id {
            m.floating_ips.on_floating_port(&new).await?;
        }
        return Ok(());
    }
    let old_subnets: BTreeSet<Id<Subnet>> = old.subnets().collect();
    let new_subnets: BTreeSet<Id<Subnet>> = new.subnets().collect();

    // Subnets where the port lost or changed a fixed IP
    let changed: BTreeSet<Id<Subnet>> = old
        .fixed_ips
        .iter()
        .filter(|f| !new.fixed_ips.contains(f))
        .map(|f| f.subnet_id)
        .collect();
    for subnet_id in &changed {
        let Some(subnetmap) = m.subnets.get(*subnet_id).await? else {
            continue;
        };
        if let Some(vpn_id) = subnetmap.vpn_id {
            m.interfaces
                .withdraw_subnet_from_interface(vpn_id, subnetmap.internet_vpn_id, old.id, &subnetmap)
                .await?;
        }
    }

    let router = if new.is_router_interface() {
        router_of(&m, &new)?
    } else {
        None
    };
    for subnet_id in old_subnets.difference(&new_subnets) {
        if let Some(router) = &router {
            m.orchestrator
                .remove_subnet_from_router(router.id, *subnet_id)
                .await?;
        }
        m.subnets.detach_port(*subnet_id, old.id).await?;
    }
    for subnet_id in new_subnets.difference(&old_subnets) {
        let attached = attach(&m, &new, *subnet_id).await?;
        if let Some(router) = router.as_ref().filter(|_| attached) {
            m.orchestrator
                .add_subnet_to_router(router, &new, *subnet_id)
                .await?;
        }
    }
    if !new.is_direct() {
        m.interfaces.sync_port(&new).await?;
    }
    Ok(())
}

async fn port_removed(m: Managers, port: Port) -> EngineResult<()> {
    if port.is_floating_ip() {
        return m.floating_ips.on_floating_port_removed(&port).await;
    }
    if port.is_router_interface()
        && let Some(router_id) = port.device::<Router>()
    {
        for subnet_id in port.subnets() {
            m.orchestrator
                .remove_subnet_from_router(router_id, subnet_id)
                .await?;
        }
    }
    m.interfaces.delete_vpn_interface(port.id, None).await?;
    for subnet_id in port.subnets() {
        m.subnets.detach_port(subnet_id, port.id).await?;
    }
    if !port.is_router_interface() {
        m.shared
            .collab
            .fabric
            .remove_elan_interface(port.network_id, port.id)
            .await?;
    }
    debug!("Port {} removed", port.id);
    Ok(())
}

#[async_trait]
impl ChangeListener<Port> for PortListener {
    async fn added(&self, new: Port) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.ports.upsert(&new);
        if new.is_router_gateway() {
            return Ok(());
        }
        m.shared.submit(
            job_key::port(new.id),
            "port-added",
            (m.clone(), new),
            |(m, p): (Managers, Port)| port_added(m, p),
        );
        Ok(())
    }

    async fn updated(&self, old: Port, new: Port) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.ports.upsert(&new);
        if new.is_router_gateway() || old == new {
            return Ok(());
        }
        m.shared.submit(
            job_key::port(new.id),
            "port-updated",
            (m.clone(), (old, new)),
            |(m, change): (Managers, (Port, Port))| port_updated(m, change),
        );
        Ok(())
    }

    async fn removed(&self, old: Port) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.ports.invalidate(old.id);
        if old.is_router_gateway() {
            return Ok(());
        }
        m.shared.submit(
            job_key::port(old.id),
            "port-removed",
            (m.clone(), old),
            |(m, p): (Managers, Port)| port_removed(m, p),
        );
        Ok(())
    }
}
