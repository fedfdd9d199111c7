//! Sticky session table binding clients to backends.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct Binding {
    backend_id: String,
    expires_at: Instant,
}

/// Client-to-backend bindings with a bounded lifetime.
///
/// Entries expire lazily on lookup and are swept periodically by the
/// instance scheduler. A binding to a backend that became unavailable
/// is removed on lookup so the caller re-selects.
#[derive(Debug, Default)]
pub struct StickySessionTable {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl StickySessionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client to a backend for `ttl`.
    pub fn bind(&self, client_id: &str, backend_id: &str, ttl: Duration) {
        let mut bindings = self.bindings.write().expect("sticky lock poisoned");
        bindings.insert(
            client_id.to_string(),
            Binding {
                backend_id: backend_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Look up the bound backend for a client.
    ///
    /// Refreshes the expiry on a hit (`ttl` extended from now). Expired
    /// entries are removed and reported as a miss.
    #[must_use]
    pub fn lookup(&self, client_id: &str, ttl: Duration) -> Option<String> {
        let mut bindings = self.bindings.write().expect("sticky lock poisoned");
        let now = Instant::now();

        match bindings.get_mut(client_id) {
            Some(binding) if binding.expires_at > now => {
                binding.expires_at = now + ttl;
                Some(binding.backend_id.clone())
            },
            Some(_) => {
                bindings.remove(client_id);
                None
            },
            None => None,
        }
    }

    /// Remove a single client's binding.
    pub fn remove(&self, client_id: &str) {
        self.bindings
            .write()
            .expect("sticky lock poisoned")
            .remove(client_id);
    }

    /// Drop every binding to the given backend.
    ///
    /// Called when a backend is removed or becomes unavailable so its
    /// clients re-select on their next connection.
    pub fn invalidate_backend(&self, backend_id: &str) {
        let mut bindings = self.bindings.write().expect("sticky lock poisoned");
        let before = bindings.len();
        bindings.retain(|_, b| b.backend_id != backend_id);
        let dropped = before - bindings.len();
        if dropped > 0 {
            debug!(backend = backend_id, dropped, "Invalidated sticky bindings");
        }
    }

    /// Remove expired entries. The caller's scheduler drives this.
    pub fn sweep(&self) {
        let mut bindings = self.bindings.write().expect("sticky lock poisoned");
        let now = Instant::now();
        bindings.retain(|_, b| b.expires_at > now);
    }

    /// Number of live bindings (including not-yet-swept expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.read().expect("sticky lock poisoned").len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all bindings.
    pub fn clear(&self) {
        self.bindings
            .write()
            .expect("sticky lock poisoned")
            .clear();
    }
}
