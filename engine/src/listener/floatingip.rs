// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::engine::Managers;
use crate::keys::job_key;
use crate::listener::ChangeListener;
use crate::EngineResult;
use async_trait::async_trait;
use model::neutron::FloatingIp;

pub(crate) struct FloatingIpListener(Managers);

impl FloatingIpListener {
    pub(crate) fn new(managers: Managers) -> Self {
        Self(managers)
    }
}

#[async_trait]
impl ChangeListener<FloatingIp> for FloatingIpListener {
    async fn added(&self, new: FloatingIp) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.floating_ips.upsert(&new);
        m.shared.submit(
            job_key::floating_ip(new.id),
            "floating-ip-added",
            (m.clone(), new),
            |(m, f): (Managers, FloatingIp)| async move {
                m.floating_ips.sync_floating_ip(None, &f).await
            },
        );
        Ok(())
    }

    async fn updated(&self, old: FloatingIp, new: FloatingIp) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.floating_ips.upsert(&new);
        m.shared.submit(
            job_key::floating_ip(new.id),
            "floating-ip-updated",
            (m.clone(), old, new),
            |(m, old, new): (Managers, FloatingIp, FloatingIp)| async move {
                m.floating_ips.sync_floating_ip(Some(&old), &new).await
            },
        );
        Ok(())
    }

    async fn removed(&self, old: FloatingIp) -> EngineResult<()> {
        let m = &self.0;
        m.shared.cache.floating_ips.invalidate(old.id);
        m.shared.submit(
            job_key::floating_ip(old.id),
            "floating-ip-removed",
            (m.clone(), old),
            |(m, f): (Managers, FloatingIp)| async move { m.floating_ips.remove(&f).await },
        );
        Ok(())
    }
}
