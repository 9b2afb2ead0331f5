// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::neutron::{Port, Subnet};
use id::Id;
use serde::Serialize;
use std::fmt::Display;
use store::{LogicalStore, Record};

/// A port that referenced a subnet before the subnet's aggregate existed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PendingPortAssociation {
    pub subnet_id: Id<Subnet>,
    pub port_id: Id<Port>,
    pub direct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingKey(pub Id<Subnet>, pub Id<Port>);

impl Display for PendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}

impl Record for PendingPortAssociation {
    const STORE: LogicalStore = LogicalStore::Operational;
    const TREE: &'static str = "pending-ports";
    type Key = PendingKey;
    fn key(&self) -> PendingKey {
        PendingKey(self.subnet_id, self.port_id)
    }
}
