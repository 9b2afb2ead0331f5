// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Replay scripts: an ordered list of Neutron changes and L3VPN requests, in YAML.
//!
//! ```yaml
//! dpns: [1, 2]
//! steps:
//!   - network:
//!       added: { id: 7f2c..., tenant_id: 11b0..., external: false }
//!   - create-l3vpn:
//!       - { id: 0a9d..., route_distinguishers: ["100:1"], network_ids: [7f2c...] }
//!   - resync
//! ```
//!
//! The engine settles after every step, so each step sees the effect of the previous ones.

use color_eyre::eyre::{Result, WrapErr};
use engine::listener::Change;
use engine::{BatchReport, Engine, EngineResult};
use id::Id;
use mac_address::MacAddress;
use model::neutron::{FloatingIp, L3vpnRequest, Network, Port, Router, Subnet, Vpn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracectl::trace_target;
use tracing::{debug, info, warn};

trace_target!("script", LevelFilter::INFO, &["vpnsync"]);

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Dataplane nodes every router spans
    #[serde(default)]
    pub dpns: Vec<u64>,
    /// MAC the external gateways resolve to
    #[serde(default)]
    pub gateway_mac: Option<MacAddress>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Network(Change<Network>),
    Subnet(Change<Subnet>),
    Port(Change<Port>),
    Router(Change<Router>),
    FloatingIp(Change<FloatingIp>),
    CreateL3vpn(Vec<L3vpnRequest>),
    DeleteL3vpn(Vec<Id<Vpn>>),
    AssociateRouter { vpn: Id<Vpn>, routers: Vec<Id<Router>> },
    DissociateRouter { vpn: Id<Vpn>, routers: Vec<Id<Router>> },
    AssociateNetworks { vpn: Id<Vpn>, networks: Vec<Id<Network>> },
    DissociateNetworks { vpn: Id<Vpn>, networks: Vec<Id<Network>> },
    Resync,
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Network(_) => "network",
            Step::Subnet(_) => "subnet",
            Step::Port(_) => "port",
            Step::Router(_) => "router",
            Step::FloatingIp(_) => "floating-ip",
            Step::CreateL3vpn(_) => "create-l3vpn",
            Step::DeleteL3vpn(_) => "delete-l3vpn",
            Step::AssociateRouter { .. } => "associate-router",
            Step::DissociateRouter { .. } => "dissociate-router",
            Step::AssociateNetworks { .. } => "associate-networks",
            Step::DissociateNetworks { .. } => "dissociate-networks",
            Step::Resync => "resync",
        }
    }
}

/// Outcome of a replay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub steps: usize,
    /// Requests refused in full or in part
    pub refused: Vec<String>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("Failed to open script {}", path.display()))?;
        serde_yaml_ng::from_reader(file)
            .wrap_err_with(|| format!("Failed to parse script {}", path.display()))
    }

    pub fn from_stdin() -> Result<Self> {
        serde_yaml_ng::from_reader(std::io::stdin().lock()).wrap_err("Failed to parse script")
    }

    /// Feed the steps to `engine`, in order. Refused requests are reported, not fatal.
    pub async fn replay(self, engine: &Engine) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        for (index, step) in self.steps.into_iter().enumerate() {
            let name = step.name();
            debug!("Step {index}: {name}");
            for refusal in apply(engine, step).await? {
                warn!("Step {index} ({name}): {refusal}");
                report.refused.push(format!("step {index} ({name}): {refusal}"));
            }
            engine.settle().await;
            report.steps += 1;
        }
        info!("Replayed {} steps, {} refused", report.steps, report.refused.len());
        Ok(report)
    }
}

/// Items of a batch that failed
fn refusals(report: EngineResult<BatchReport>) -> Vec<String> {
    match report {
        Ok(report) => report
            .failures
            .into_iter()
            .map(|(item, e)| format!("{item}: {e}"))
            .collect(),
        Err(e) => vec![e.to_string()],
    }
}

/// Apply one step. Refused requests are returned; only a failed resync is an error.
async fn apply(engine: &Engine, step: Step) -> Result<Vec<String>> {
    let l3vpn = engine.l3vpn();
    let refused = match step {
        Step::Network(change) => delivered(engine.network_events().send(change)),
        Step::Subnet(change) => delivered(engine.subnet_events().send(change)),
        Step::Port(change) => delivered(engine.port_events().send(change)),
        Step::Router(change) => delivered(engine.router_events().send(change)),
        Step::FloatingIp(change) => delivered(engine.floating_ip_events().send(change)),
        Step::CreateL3vpn(requests) => refusals(l3vpn.create_l3vpn(requests).await),
        Step::DeleteL3vpn(ids) => refusals(l3vpn.delete_l3vpn(ids).await),
        Step::AssociateRouter { vpn, routers } => {
            refusals(l3vpn.associate_router(vpn, routers).await)
        }
        Step::DissociateRouter { vpn, routers } => {
            refusals(l3vpn.dissociate_router(vpn, routers).await)
        }
        Step::AssociateNetworks { vpn, networks } => {
            refusals(l3vpn.associate_networks(vpn, networks).await)
        }
        Step::DissociateNetworks { vpn, networks } => {
            refusals(l3vpn.dissociate_networks(vpn, networks).await)
        }
        Step::Resync => {
            let resync = engine.resync().await.wrap_err("Resync failed")?;
            info!("{resync:?}");
            vec![]
        }
    };
    Ok(refused)
}

fn delivered(sent: bool) -> Vec<String> {
    if sent {
        vec![]
    } else {
        vec!["event stream is closed".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::{Script, Step};
    use crate::collab::dry_run;
    use engine::{Engine, EngineConfig};
    use id::Id;
    use model::neutron::{Subnet, Vpn};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use store::{Datastore, MemDatastore};

    const SCRIPT: &str = r#"
dpns: [1, 2]
steps:
  - network:
      added:
        id: 6d1f6a3e-0000-4000-8000-000000000001
        tenant_id: 6d1f6a3e-0000-4000-8000-0000000000aa
  - subnet:
      added:
        id: 6d1f6a3e-0000-4000-8000-000000000002
        network_id: 6d1f6a3e-0000-4000-8000-000000000001
        tenant_id: 6d1f6a3e-0000-4000-8000-0000000000aa
        cidr: 10.0.0.0/24
  - create-l3vpn:
      - id: 6d1f6a3e-0000-4000-8000-000000000003
        route_distinguishers: ["100:1"]
        network_ids: [6d1f6a3e-0000-4000-8000-000000000001]
  - create-l3vpn:
      - id: 6d1f6a3e-0000-4000-8000-000000000004
        route_distinguishers: ["100:1"]
  - port:
      added:
        id: 6d1f6a3e-0000-4000-8000-000000000005
        network_id: 6d1f6a3e-0000-4000-8000-000000000001
        tenant_id: 6d1f6a3e-0000-4000-8000-0000000000aa
        mac: "02:00:00:00:00:05"
        fixed_ips:
          - subnet_id: 6d1f6a3e-0000-4000-8000-000000000002
            ip: 10.0.0.5
  - resync
"#;

    #[test]
    fn script_is_parsed() {
        let script: Script = serde_yaml_ng::from_str(SCRIPT).expect("Should parse");
        assert_eq!(script.dpns, vec![1, 2]);
        assert_eq!(script.steps.len(), 6);
        assert!(matches!(script.steps[0], Step::Network(_)));
        assert_eq!(script.steps[5], Step::Resync);
    }

    #[test]
    fn unknown_steps_are_rejected() {
        let res = serde_yaml_ng::from_str::<Script>("steps:\n  - frobnicate: []\n");
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn replayed_script_reaches_the_datastore() {
        let script: Script = serde_yaml_ng::from_str(SCRIPT).expect("Should parse");
        let (collab, counters) = dry_run(script.dpns.clone(), script.gateway_mac);
        let store: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
        let engine = Engine::new(store, collab, EngineConfig::default())
            .await
            .expect("Should succeed");

        let report = script.replay(&engine).await.expect("Should succeed");
        assert_eq!(report.steps, 6);
        // the second VPN reuses the route distinguisher of the first
        assert_eq!(report.refused.len(), 1);

        let snapshot = engine.snapshot().await.expect("Should succeed");
        assert_eq!(snapshot.vpn_instances.len(), 1);
        assert_eq!(snapshot.vpn_interfaces.len(), 1);
        let subnet: Id<Subnet> = "6d1f6a3e-0000-4000-8000-000000000002"
            .parse()
            .expect("Should parse");
        let subnetmap = snapshot
            .subnetmaps
            .iter()
            .find(|sm| sm.subnet_id == subnet)
            .expect("Subnet aggregate should exist");
        let vpn: Id<Vpn> = "6d1f6a3e-0000-4000-8000-000000000003"
            .parse()
            .expect("Should parse");
        assert_eq!(subnetmap.vpn_id, Some(vpn));
        assert_eq!(counters.lock().elans_created, 1);
    }
}
