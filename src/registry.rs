//! In-memory service registry.
//!
//! Maps service name to its instances (instance key -> address). The registry is
//! owned by the reconciler; callers outside the loop only ever see `&Registry`.

use std::collections::BTreeMap;

use crate::key::ServiceKey;
use crate::store::ChangeKind;

pub type Instances = BTreeMap<String, String>;
pub type Services = BTreeMap<String, Instances>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    services: Services,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `instance -> value` under `service`.
    ///
    /// Returns true if the registry changed.
    pub fn upsert(&mut self, service: &str, instance: &str, value: &str) -> bool {
        let instances = self.services.entry(service.to_string()).or_default();
        match instances.get(instance) {
            Some(current) if current == value => false,
            _ => {
                instances.insert(instance.to_string(), value.to_string());
                true
            }
        }
    }

    /// Remove `instance` from `service`. Unknown service or instance is a no-op.
    ///
    /// The service entry is kept even when its last instance goes away.
    pub fn remove(&mut self, service: &str, instance: &str) -> bool {
        self.services
            .get_mut(service)
            .map_or(false, |instances| instances.remove(instance).is_some())
    }

    /// Route a decoded change to `upsert` or `remove`.
    pub fn apply(&mut self, kind: ChangeKind, key: &ServiceKey, value: &str) -> bool {
        match kind {
            ChangeKind::Put => self.upsert(&key.service, &key.instance, value),
            ChangeKind::Delete => self.remove(&key.service, &key.instance),
        }
    }

    pub fn snapshot(&self) -> &Services {
        &self.services
    }

    pub fn instances(&self, service: &str) -> Option<&Instances> {
        self.services.get(service)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn instance_count(&self) -> usize {
        self.services.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
