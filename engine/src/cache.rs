// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Read-through cache of Neutron resources.
//!
//! Entries are inserted by the event adapters on add and update and invalidated on removal.
//! A miss is resolved through the optional [`NeutronSource`] of the resource type.

use dashmap::DashMap;
use id::Id;
use model::neutron::{FloatingIp, Network, Port, Router, Subnet};
use std::sync::Arc;
use tracing::trace;

/// A Neutron resource type
pub trait Resource: Clone + Send + Sync + 'static {
    const KIND: &'static str;
    fn id(&self) -> Id<Self>;
}

macro_rules! resource {
    ($t:ty, $kind:literal) => {
        impl Resource for $t {
            const KIND: &'static str = $kind;
            fn id(&self) -> Id<Self> {
                self.id
            }
        }
    };
}
resource!(Network, "network");
resource!(Subnet, "subnet");
resource!(Port, "port");
resource!(Router, "router");
resource!(FloatingIp, "floating-ip");

/// Authoritative lookup of resources missing from the cache
pub trait NeutronSource<T: Resource>: Send + Sync {
    fn fetch(&self, id: Id<T>) -> Option<T>;
}

pub struct ResourceCache<T: Resource> {
    entries: DashMap<Id<T>, T>,
    source: Option<Arc<dyn NeutronSource<T>>>,
}

impl<T: Resource> Default for ResourceCache<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            source: None,
        }
    }
}

impl<T: Resource> ResourceCache<T> {
    #[must_use]
    pub fn with_source(source: Arc<dyn NeutronSource<T>>) -> Self {
        Self {
            entries: DashMap::new(),
            source: Some(source),
        }
    }

    #[must_use]
    pub fn get(&self, id: Id<T>) -> Option<T> {
        if let Some(hit) = self.entries.get(&id) {
            return Some(hit.value().clone());
        }
        let fetched = self.source.as_ref()?.fetch(id)?;
        trace!("Loaded {} {id} into cache", T::KIND);
        self.entries.insert(id, fetched.clone());
        Some(fetched)
    }

    pub fn upsert(&self, resource: &T) {
        self.entries.insert(resource.id(), resource.clone());
    }

    pub fn invalidate(&self, id: Id<T>) {
        self.entries.remove(&id);
    }

    /// Cached entries matching `pred`. The source is not consulted.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.entries
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One cache per resource type, owned by the engine
#[derive(Default)]
pub struct NeutronCache {
    pub networks: ResourceCache<Network>,
    pub subnets: ResourceCache<Subnet>,
    pub ports: ResourceCache<Port>,
    pub routers: ResourceCache<Router>,
    pub floating_ips: ResourceCache<FloatingIp>,
}

#[cfg(test)]
mod tests {
    use super::{NeutronSource, ResourceCache};
    use id::Id;
    use model::neutron::{Network, NetworkType};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource(Network, AtomicUsize);
    impl NeutronSource<Network> for CountingSource {
        fn fetch(&self, id: Id<Network>) -> Option<Network> {
            self.1.fetch_add(1, Ordering::SeqCst);
            (id == self.0.id).then(|| self.0.clone())
        }
    }

    #[test]
    fn read_through_and_invalidate() {
        let net = Network {
            id: Id::new(),
            name: "n".to_string(),
            tenant_id: Id::new(),
            network_type: NetworkType::Vlan,
            segmentation_id: Some(10),
            external: false,
        };
        let source = Arc::new(CountingSource(net.clone(), AtomicUsize::new(0)));
        let cache = ResourceCache::with_source(source.clone());
        assert_eq!(cache.get(net.id), Some(net.clone()));
        assert_eq!(cache.get(net.id), Some(net.clone()));
        assert_eq!(source.1.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(Id::new()), None);

        cache.invalidate(net.id);
        assert!(cache.is_empty());
        assert!(cache.get(net.id).is_some());
        assert_eq!(source.1.load(Ordering::SeqCst), 3);
    }
}
