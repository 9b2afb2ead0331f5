// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum LogicalStore {
    #[strum(serialize = "config")]
    Configuration,
    #[strum(serialize = "oper")]
    Operational,
}

/// Location of a record in the datastore
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataPath {
    pub store: LogicalStore,
    pub tree: &'static str,
    pub key: String,
}

impl DataPath {
    pub fn new(store: LogicalStore, tree: &'static str, key: impl Into<String>) -> Self {
        Self {
            store,
            tree,
            key: key.into(),
        }
    }
}

impl Display for DataPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.store, self.tree, self.key)
    }
}
