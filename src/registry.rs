//! Server registry for a balancer instance.

use crate::backend::{BackendServer, BackendSnapshot, LoadUpdate};
use crate::config::BackendConfig;
use crate::error::{BalancerError, BalancerResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Insertion-ordered collection of backends keyed by unique id.
///
/// The one piece of mutable state shared between the selection path,
/// the health monitor, and outcome reporting. Reads take snapshots so
/// selection logic never runs under the lock; writes are single-record.
#[derive(Debug)]
pub struct ServerRegistry {
    /// Balancer name, used in error messages.
    name: String,
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Backends in insertion order.
    servers: Vec<Arc<BackendServer>>,
    /// Id to position index.
    index: HashMap<String, usize>,
}

impl ServerRegistry {
    /// Create an empty registry for the named balancer.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Add a backend.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if the id is already registered. Removed
    /// ids may be reused; the registry keeps no tombstones.
    pub fn add(&self, config: &BackendConfig) -> BalancerResult<Arc<BackendServer>> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.index.contains_key(&config.id) {
            return Err(BalancerError::DuplicateId(config.id.clone()));
        }

        let server = Arc::new(BackendServer::new(config));
        let position = inner.servers.len();
        inner.servers.push(Arc::clone(&server));
        inner.index.insert(config.id.clone(), position);
        Ok(server)
    }

    /// Remove a backend by id.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` if the id is absent.
    pub fn remove(&self, id: &str) -> BalancerResult<Arc<BackendServer>> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(position) = inner.index.remove(id) else {
            return Err(BalancerError::BackendNotFound(
                id.to_string(),
                self.name.clone(),
            ));
        };

        let removed = inner.servers.remove(position);
        // Positions after the removed entry shifted down by one.
        for pos in inner.index.values_mut() {
            if *pos > position {
                *pos -= 1;
            }
        }
        Ok(removed)
    }

    /// Get a backend by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<BackendServer>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .index
            .get(id)
            .and_then(|&pos| inner.servers.get(pos).cloned())
    }

    /// Apply a partial load update to a backend.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` if the id is absent.
    pub fn update(&self, id: &str, update: &LoadUpdate) -> BalancerResult<()> {
        let server = self.get(id).ok_or_else(|| {
            BalancerError::BackendNotFound(id.to_string(), self.name.clone())
        })?;
        server.update_load(update);
        Ok(())
    }

    /// Set a backend's administrator-enabled flag.
    ///
    /// # Errors
    ///
    /// Returns `BackendNotFound` if the id is absent.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> BalancerResult<()> {
        let server = self.get(id).ok_or_else(|| {
            BalancerError::BackendNotFound(id.to_string(), self.name.clone())
        })?;
        server.set_enabled(enabled);
        Ok(())
    }

    /// All live backend handles, in insertion order.
    #[must_use]
    pub fn servers(&self) -> Vec<Arc<BackendServer>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .servers
            .clone()
    }

    /// Immutable snapshots of every backend, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.servers().iter().map(|s| s.snapshot()).collect()
    }

    /// Snapshots of available backends with spare capacity, ordered by
    /// id for deterministic strategy evaluation.
    #[must_use]
    pub fn available_snapshot(&self) -> Vec<BackendSnapshot> {
        let mut candidates: Vec<BackendSnapshot> = self
            .servers()
            .iter()
            .map(|s| s.snapshot())
            .filter(|s| s.available && s.has_capacity())
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Total backend count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .servers
            .len()
    }

    /// Whether the registry holds no backends.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of backends currently available for selection.
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.servers().iter().filter(|s| s.is_available()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(id: &str, port: u16) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            address: "10.0.0.1".to_string(),
            port,
            weight: 1.0,
            max_connections: 1000,
            enabled: true,
        }
    }

    #[test]
    fn test_add_and_get() {
        let registry = ServerRegistry::new("audio");
        registry.add(&test_config("s1", 8000)).unwrap();
        registry.add(&test_config("s2", 8001)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("s1").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_add_duplicate_fails() {
        let registry = ServerRegistry::new("audio");
        registry.add(&test_config("s1", 8000)).unwrap();

        let result = registry.add(&test_config("s1", 8001));
        assert!(matches!(result, Err(BalancerError::DuplicateId(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_reuse_id() {
        let registry = ServerRegistry::new("audio");
        registry.add(&test_config("s1", 8000)).unwrap();
        registry.add(&test_config("s2", 8001)).unwrap();

        registry.remove("s1").unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("s1").is_none());
        // s2 still resolvable after index shift
        assert_eq!(registry.get("s2").unwrap().id(), "s2");

        // Id reuse after removal is legal
        registry.add(&test_config("s1", 8002)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_missing_fails() {
        let registry = ServerRegistry::new("audio");
        let result = registry.remove("s1");
        assert!(matches!(result, Err(BalancerError::BackendNotFound(_, _))));
    }

    #[test]
    fn test_available_snapshot_is_ordered_and_filtered() {
        let registry = ServerRegistry::new("audio");
        // Insert out of id order
        registry.add(&test_config("s3", 8002)).unwrap();
        registry.add(&test_config("s1", 8000)).unwrap();
        registry.add(&test_config("s2", 8001)).unwrap();
        registry.set_enabled("s2", false).unwrap();

        let candidates = registry.available_snapshot();
        let ids: Vec<&str> = candidates.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
        assert_eq!(registry.available_count(), 2);
    }

    #[test]
    fn test_update_load() {
        let registry = ServerRegistry::new("audio");
        registry.add(&test_config("s1", 8000)).unwrap();

        registry
            .update(
                "s1",
                &LoadUpdate {
                    cpu_usage: Some(55.0),
                    ..LoadUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(registry.get("s1").unwrap().snapshot().cpu_usage, 55.0);

        let result = registry.update("missing", &LoadUpdate::default());
        assert!(matches!(result, Err(BalancerError::BackendNotFound(_, _))));
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let registry = ServerRegistry::new("audio");
        registry.add(&test_config("s2", 8001)).unwrap();
        registry.add(&test_config("s1", 8000)).unwrap();

        let snaps = registry.snapshot();
        assert_eq!(snaps[0].id, "s2");
        assert_eq!(snaps[1].id, "s1");
    }
}
