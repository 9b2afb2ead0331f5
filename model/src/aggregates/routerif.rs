// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crate::neutron::{Port, Router};
use id::Id;
use serde::Serialize;
use std::collections::BTreeSet;
use store::{LogicalStore, Record};

/// VPN interfaces to revisit when the VPN binding of a router changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterInterfacesMap {
    pub router_id: Id<Router>,
    pub interfaces: BTreeSet<Id<Port>>,
}

impl RouterInterfacesMap {
    #[must_use]
    pub fn new(router_id: Id<Router>) -> Self {
        Self {
            router_id,
            interfaces: BTreeSet::new(),
        }
    }
}

impl Record for RouterInterfacesMap {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "router-interfaces";
    type Key = Id<Router>;
    fn key(&self) -> Id<Router> {
        self.router_id
    }
}
