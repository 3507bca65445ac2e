//! Server and client configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for an `UnderworldsServer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Deadline for one invalidation delivery before the session is evicted
    /// (default: 1000 ms)
    pub delivery_timeout_ms: u64,

    /// Undelivered records a subscriber may accumulate before it is evicted,
    /// also the per-link buffer depth of local links (default: 1024)
    pub subscriber_capacity: usize,

    /// Directory of the persistent mesh store. In-memory when unset.
    pub mesh_store_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: 1000,
            subscriber_capacity: 1024,
            mesh_store_path: None,
        }
    }
}

impl ServerConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn with_mesh_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mesh_store_path = Some(path.into());
        self
    }
}

/// Configuration for a client `Context` and its world proxies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Logical client name reported in the topology
    pub name: String,

    /// Deadline for ordinary calls (default: 1000 ms)
    pub rpc_timeout_ms: u64,

    /// Deadline for mesh transfers (default: 20000 ms)
    pub mesh_timeout_ms: u64,

    /// How long a proxy waits for an expected notification before raising
    /// an inconsistency (default: 50 ms)
    pub propagation_window_ms: u64,

    /// How long a new world proxy waits for its subscription to be confirmed
    /// (default: 1000 ms)
    pub readiness_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "underworlds-client".to_string(),
            rpc_timeout_ms: 1000,
            mesh_timeout_ms: 20_000,
            propagation_window_ms: 50,
            readiness_timeout_ms: 1000,
        }
    }
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn mesh_timeout(&self) -> Duration {
        Duration::from_millis(self.mesh_timeout_ms)
    }

    pub fn propagation_window(&self) -> Duration {
        Duration::from_millis(self.propagation_window_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_propagation_window(mut self, window: Duration) -> Self {
        self.propagation_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
