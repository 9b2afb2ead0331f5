// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::Tenant;
use id::Id;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Flat,
    Vlan,
    #[default]
    Vxlan,
    Gre,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: Id<Network>,
    #[serde(default)]
    pub name: String,
    pub tenant_id: Id<Tenant>,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default)]
    pub segmentation_id: Option<u32>,
    #[serde(default)]
    pub external: bool,
}
