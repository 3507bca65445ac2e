//! Underworlds Core - Distributed Scene-Graph Replication
//!
//! Independent processes share and incrementally update named "worlds":
//! scene graphs plus timelines describing a robot's environment.
//! 1. **Authoritative stores**: per-world scene and timeline tables that keep
//!    the hierarchy consistent under concurrent mutation
//! 2. **Invalidation bus**: per-world fan-out of change records with bounded
//!    delivery and eviction of unresponsive sessions
//! 3. **Lazy replicas**: index-stable client caches that fetch on demand and
//!    never miss a change published after they are ready

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod mesh;
pub mod metrics;
pub mod scene;
pub mod server;
pub mod timeline;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use api::{Subscription, UnderworldsApi};
pub use client::{Context, NodesProxy, SceneProxy, TimelineProxy, WorldMonitor, WorldProxy};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ErrorCode, Result, UwdsError};
pub use mesh::{Blake3MeshHasher, InMemoryMeshStore, MeshHasher, MeshStore, SledMeshStore};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::UnderworldsServer;
pub use types::{
    Mesh, MeshId, Node, NodeId, NodeProperties, NodeType, Role, Situation, SituationId, Topology,
};
