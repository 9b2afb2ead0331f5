// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Ports whose subnet aggregate did not exist when they were attached.
//!
//! Entries are deposited and drained under the lock of their subnet, so a port cannot be
//! deposited after the subnet it waits for has drained its entries.

use dashmap::DashMap;
use id::Id;
use model::aggregates::PendingPortAssociation;
use model::neutron::{Port, Subnet};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Default)]
pub struct PendingAssociationCache {
    entries: DashMap<Id<Subnet>, BTreeSet<PendingPortAssociation>>,
}

impl PendingAssociationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `port` waits for `subnet`. Returns the entry, for persistence.
    pub fn deposit(&self, subnet_id: Id<Subnet>, port_id: Id<Port>, direct: bool) -> PendingPortAssociation {
        let entry = PendingPortAssociation {
            subnet_id,
            port_id,
            direct,
        };
        debug!("Port {port_id} waits for subnet {subnet_id}");
        self.entries.entry(subnet_id).or_default().insert(entry);
        entry
    }

    /// Remove and return all entries waiting for `subnet`
    pub fn drain(&self, subnet_id: Id<Subnet>) -> Vec<PendingPortAssociation> {
        self.entries
            .remove(&subnet_id)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Put back entries, e.g. after a failed commit or when reloading persisted ones
    pub fn restore(&self, entries: impl IntoIterator<Item = PendingPortAssociation>) {
        for e in entries {
            self.entries.entry(e.subnet_id).or_default().insert(e);
        }
    }

    /// Forget a port waiting for `subnet`. Returns the removed entries.
    pub fn forget(&self, subnet_id: Id<Subnet>, port_id: Id<Port>) -> Vec<PendingPortAssociation> {
        let mut removed = vec![];
        self.entries.remove_if_mut(&subnet_id, |_, set| {
            set.retain(|e| {
                let keep = e.port_id != port_id;
                if !keep {
                    removed.push(*e);
                }
                keep
            });
            set.is_empty()
        });
        removed
    }

    #[must_use]
    pub fn is_pending(&self, subnet_id: Id<Subnet>, port_id: Id<Port>) -> bool {
        self.entries
            .get(&subnet_id)
            .is_some_and(|set| set.iter().any(|e| e.port_id == port_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
