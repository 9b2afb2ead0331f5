// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Owner of the floating IP aggregates: which Neutron port backs a floating IP
//! ([`FloatingIpPortInfo`]) and the per-router translations of fixed IPs ([`RouterPorts`]).

use crate::context::Shared;
use crate::{EngineError, EngineResult, LockKey};
use id::Id;
use model::aggregates::{FloatingIpPortInfo, InternalToExternal, RouterPorts};
use model::neutron::{FloatingIp, Port, Router};
use std::net::IpAddr;
use std::sync::Arc;
use store::Datastore;
use tracectl::trace_target;
use tracing::{debug, info};

trace_target!("floating-ip", LevelFilter::INFO, &["nat", "vpnsync"]);

#[derive(Clone)]
pub struct FloatingIpSynchronizer {
    shared: Arc<Shared>,
}

impl FloatingIpSynchronizer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn store(&self) -> &dyn Datastore {
        self.shared.store.as_ref()
    }

    pub async fn port_info(&self, floating_ip_id: Id<FloatingIp>) -> EngineResult<Option<FloatingIpPortInfo>> {
        Ok(self.store().read::<FloatingIpPortInfo>(&floating_ip_id).await?)
    }

    pub async fn router_ports(&self, router_id: Id<Router>) -> EngineResult<Option<RouterPorts>> {
        Ok(self.store().read::<RouterPorts>(&router_id).await?)
    }

    /// Record `port` as the port backing a floating IP. Nothing is written while the port's
    /// device is still pending: the update setting the real device will do it.
    pub async fn associate(
        &self,
        floating_ip_id: Id<FloatingIp>,
        port: &Port,
    ) -> EngineResult<Option<FloatingIpPortInfo>> {
        if port.has_pending_device() {
            debug!("Port {} of floating IP {floating_ip_id} has a pending device", port.id);
            return Ok(None);
        }
        let info = FloatingIpPortInfo {
            floating_ip_id,
            floating_port_id: port.id,
            floating_subnet_id: port.fixed_ips.first().map(|f| f.subnet_id),
            floating_mac: port.mac,
            deleted: false,
        };
        let _guard = self.shared.lock(LockKey::FloatingIp(floating_ip_id)).await?;
        let existing = self.port_info(floating_ip_id).await?;
        if existing.as_ref() != Some(&info) {
            self.store().put(info.clone()).await?;
            info!("Floating IP {floating_ip_id} is backed by port {}", port.id);
        }
        Ok(Some(info))
    }

    /// A floating IP port was added or updated
    pub async fn on_floating_port(&self, port: &Port) -> EngineResult<Option<FloatingIpPortInfo>> {
        if port.has_pending_device() {
            debug!("Ignoring floating IP port {} until its device is set", port.id);
            return Ok(None);
        }
        let Some(floating_ip_id) = port.device::<FloatingIp>() else {
            debug!("Floating IP port {} has device '{}'", port.id, port.device_id);
            return Ok(None);
        };
        self.associate(floating_ip_id, port).await
    }

    /// A floating IP port was removed. Its mapping is deleted, unless the floating IP removal
    /// left it to the NAT removal path.
    pub async fn on_floating_port_removed(&self, port: &Port) -> EngineResult<()> {
        let Some(floating_ip_id) = port.device::<FloatingIp>() else {
            return Ok(());
        };
        let _guard = self.shared.lock(LockKey::FloatingIp(floating_ip_id)).await?;
        match self.port_info(floating_ip_id).await? {
            Some(info) if info.deleted => {
                debug!("Port info of floating IP {floating_ip_id} awaits NAT removal");
            }
            Some(info) if info.floating_port_id == port.id => {
                self.store()
                    .delete::<FloatingIpPortInfo>(&floating_ip_id)
                    .await?;
                info!("Deleted port info of floating IP {floating_ip_id}");
            }
            _ => {}
        }
        Ok(())
    }

    /// Translations of a floating IP added, moved or removed
    pub async fn sync_floating_ip(&self, old: Option<&FloatingIp>, new: &FloatingIp) -> EngineResult<()> {
        let before = old.and_then(FloatingIp::association);
        let after = new.association();
        if before == after {
            return Ok(());
        }
        if let Some((router_id, port_id, fixed_ip)) = before {
            self.clear_router_ports_for_fixed_ip(router_id, port_id, fixed_ip)
                .await?;
        }
        if let Some((router_id, port_id, fixed_ip)) = after {
            self.update_router_ports_for_fixed_ip(
                router_id,
                port_id,
                fixed_ip,
                new.floating_ip_address,
                new.id,
            )
            .await?;
        }
        Ok(())
    }

    /// A floating IP was removed. If it still had a fixed IP, its port info is tombstoned and
    /// the NAT removal path deletes it; otherwise it is deleted right away.
    pub async fn remove(&self, floating_ip: &FloatingIp) -> EngineResult<()> {
        if let Some((router_id, port_id, fixed_ip)) = floating_ip.association() {
            self.clear_router_ports_for_fixed_ip(router_id, port_id, fixed_ip)
                .await?;
        }
        let _guard = self
            .shared
            .lock(LockKey::FloatingIp(floating_ip.id))
            .await?;
        let Some(mut info) = self.port_info(floating_ip.id).await? else {
            return Ok(());
        };
        if floating_ip.fixed_ip_address.is_some() {
            if !info.deleted {
                info.deleted = true;
                self.store().put(info).await?;
                info!("Floating IP {} removed, NAT removal pending", floating_ip.id);
            }
        } else {
            self.store()
                .delete::<FloatingIpPortInfo>(&floating_ip.id)
                .await?;
            info!("Deleted port info of floating IP {}", floating_ip.id);
        }
        Ok(())
    }

    /// The NAT side is done with a removed floating IP. Returns whether its tombstone was deleted.
    pub async fn complete_nat_removal(&self, floating_ip_id: Id<FloatingIp>) -> EngineResult<bool> {
        let _guard = self.shared.lock(LockKey::FloatingIp(floating_ip_id)).await?;
        match self.port_info(floating_ip_id).await? {
            Some(info) if info.deleted => {
                self.store()
                    .delete::<FloatingIpPortInfo>(&floating_ip_id)
                    .await?;
                info!("NAT removal of floating IP {floating_ip_id} complete");
                Ok(true)
            }
            Some(_) => Err(EngineError::conflict(format!(
                "floating IP {floating_ip_id} is not being removed"
            ))),
            None => Ok(false),
        }
    }

    /// Translate `fixed_ip` of `port_id` to `floating_ip` on the router
    pub async fn update_router_ports_for_fixed_ip(
        &self,
        router_id: Id<Router>,
        port_id: Id<Port>,
        fixed_ip: IpAddr,
        floating_ip: IpAddr,
        floating_ip_id: Id<FloatingIp>,
    ) -> EngineResult<RouterPorts> {
        let external_network_id = self
            .shared
            .cache
            .routers
            .get(router_id)
            .and_then(|r| r.external_network());
        let _guard = self.shared.lock(LockKey::RouterPorts(router_id)).await?;
        let mut router_ports = self
            .router_ports(router_id)
            .await?
            .unwrap_or_else(|| RouterPorts::new(router_id, external_network_id));
        let mapping = InternalToExternal {
            internal_ip: fixed_ip,
            external_ip: floating_ip,
            floating_ip_id,
        };
        if router_ports.upsert_mapping(port_id, mapping) {
            self.store().put(router_ports.clone()).await?;
            debug!("Router {router_id} translates {fixed_ip} of port {port_id} to {floating_ip}");
        }
        Ok(router_ports)
    }

    /// Remove the translation of `fixed_ip` of `port_id`. The port entry goes with its last
    /// translation, and the router entry with its last port.
    pub async fn clear_router_ports_for_fixed_ip(
        &self,
        router_id: Id<Router>,
        port_id: Id<Port>,
        fixed_ip: IpAddr,
    ) -> EngineResult<Option<InternalToExternal>> {
        let _guard = self.shared.lock(LockKey::RouterPorts(router_id)).await?;
        let Some(mut router_ports) = self.router_ports(router_id).await? else {
            return Ok(None);
        };
        let Some(removed) = router_ports.remove_mapping(port_id, fixed_ip) else {
            return Ok(None);
        };
        if router_ports.is_empty() {
            self.store().delete::<RouterPorts>(&router_id).await?;
            debug!("Router {router_id} has no floating IP translation left");
        } else {
            self.store().put(router_ports).await?;
        }
        Ok(Some(removed))
    }
}
