// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::engine::Managers;
use crate::keys::job_key;
use crate::listener::ChangeListener;
use crate::EngineResult;
use async_trait::async_trait;
use model::neutron::{Route, Router};

pub(crate) struct RouterListener(Managers);

impl RouterListener {
    pub(crate) fn new(managers: Managers) -> Self {
        Self(managers)
    }
}

async fn router_added(m: Managers, router: Router) -> EngineResult<()> {
    m.orchestrator
        .associate_router_to_internal_vpn(&router)
        .await?;
    m.orchestrator.add_external_network_to_router(&router).await?;
    if !router.routes.is_empty()
        && let Some(vpn_id) = m.vpns.vpn_of_router(router.id).await?
    {
        m.interfaces
            .update_extra_routes(vpn_id, &router.routes, true)
            .await?;
    }
    Ok(())
}

async fn router_updated(m: Managers, (old, new): (Router, Router)) -> EngineResult<()> {
    if old.gateway != new.gateway {
        if let Some(network_id) = old.external_network()
            && old.external_network() != new.external_network()
        {
            m.orchestrator
                .remove_external_network_from_router(new.id, network_id)
                .await?;
        }
        m.orchestrator.add_external_network_to_router(&new).await?;
    }

    let removed: Vec<Route> = old
        .routes
        .iter()
        .filter(|r| !new.routes.contains(r))
        .copied()
        .collect();
    let added: Vec<Route> = new
        .routes
        .iter()
        .filter(|r| !old.routes.contains(r))
        .copied()
        .collect();
    if removed.is_empty() && added.is_empty() {
        return Ok(());
    }
    let Some(vpn_id) = m.vpns.vpn_of_router(new.id).await? else {
        return Ok(());
    };
    if !removed.is_empty() {
        m.interfaces
            .update_extra_routes(vpn_id, &removed, false)
            .await?;
    }
    if !added.is_empty() {
        m.interfaces.update_extra_routes(vpn_id, &added, true).await?;
    }
    Ok(())
}

async fn router_removed(m: Managers, router: Router) -> EngineResult<()> {
    if !router.routes.is_empty()
        && let Some(vpn_id) = m.vpns.vpn_of_router(router.id).await?
    {
        m.interfaces
            .update_extra_routes(vpn_id, &router.routes, false)
            .await?;
    }
    m.orchestrator.remove_router(&router).await
}

#[async_trait]
impl ChangeListener<Router> for RouterListener {
    async fn added(&self, new: Router) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.routers.upsert(&new);
        m.shared.submit(
            job_key::router(new.id),
            "router-added",
            (m.clone(), new),
            |(m, r): (Managers, Router)| router_added(m, r),
        );
        Ok(())
    }

    async fn updated(&self, old: Router, new: Router) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.routers.upsert(&new);
        m.shared.submit(
            job_key::router(new.id),
            "router-updated",
            (m.clone(), (old, new)),
            |(m, change): (Managers, (Router, Router))| router_updated(m, change),
        );
        Ok(())
    }

    async fn removed(&self, old: Router) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.routers.invalidate(old.id);
        m.shared.submit(
            job_key::router(old.id),
            "router-removed",
            (m.clone(), old),
            |(m, r): (Managers, Router)| router_removed(m, r),
        );
        Ok(())
    }
}
