//! The RPC surface between clients and the server.
//!
//! Every call except `handshake` and the mesh calls is issued on behalf of
//! a session and fails with `UnknownClient` once that session has been
//! closed or evicted.

use crate::error::Result;
use crate::metrics::MetricsSnapshot;
use crate::types::{Mesh, MeshId, Node, NodeId, Role, Situation, SituationId, Topology};
use async_trait::async_trait;
use std::time::Duration;
use underworlds_env::{ClientId, InvalidationStream, Timestamp};

/// An open invalidation subscription on one world.
#[derive(Debug)]
pub struct Subscription {
    pub world: String,
    /// First record is always a NOP
    pub stream: InvalidationStream,
}

#[async_trait]
pub trait UnderworldsApi: Send + Sync {
    /// Opens a session. Names are not deduplicated.
    async fn handshake(&self, name: &str) -> Result<ClientId>;

    /// Closes a session, draining its pending notifications first.
    async fn goodbye(&self, client: ClientId) -> Result<()>;

    /// Number of nodes plus situations.
    async fn world_size(&self, client: ClientId, world: &str) -> Result<usize>;

    /// Node ids, root first.
    async fn world_node_ids(&self, client: ClientId, world: &str) -> Result<Vec<NodeId>>;

    async fn root_id(&self, client: ClientId, world: &str) -> Result<NodeId>;

    async fn get_node(&self, client: ClientId, world: &str, id: &NodeId) -> Result<Node>;

    /// Upserts nodes one by one; each commit is broadcast before the next.
    async fn put_nodes(&self, client: ClientId, world: &str, nodes: Vec<Node>) -> Result<()>;

    async fn delete_nodes(&self, client: ClientId, world: &str, ids: Vec<NodeId>) -> Result<()>;

    async fn get_situation(
        &self,
        client: ClientId,
        world: &str,
        id: &SituationId,
    ) -> Result<Situation>;

    async fn situation_ids(&self, client: ClientId, world: &str) -> Result<Vec<SituationId>>;

    async fn put_situations(
        &self,
        client: ClientId,
        world: &str,
        situations: Vec<Situation>,
    ) -> Result<()>;

    /// Ends an active situation at the server's current time.
    async fn end_situation(&self, client: ClientId, world: &str, id: &SituationId) -> Result<()>;

    async fn delete_situations(
        &self,
        client: ClientId,
        world: &str,
        ids: Vec<SituationId>,
    ) -> Result<()>;

    async fn timeline_origin(&self, client: ClientId, world: &str) -> Result<Timestamp>;

    async fn has_mesh(&self, id: &MeshId) -> Result<bool>;

    async fn get_mesh(&self, id: &MeshId) -> Result<Mesh>;

    async fn put_mesh(&self, id: MeshId, mesh: Mesh) -> Result<()>;

    async fn topology(&self, client: ClientId) -> Result<Topology>;

    /// Destroys every world. Breaks every other connected client's replicas.
    async fn reset(&self, client: ClientId) -> Result<()>;

    async fn uptime(&self, client: ClientId) -> Result<Duration>;

    /// Subscribes to a world's change records.
    async fn subscribe(&self, client: ClientId, world: &str, role: Role) -> Result<Subscription>;

    /// Closes a subscription once its pending records are delivered.
    async fn unsubscribe(&self, client: ClientId, world: &str) -> Result<()>;

    /// Replaces `target`'s content with a copy of `source`'s.
    async fn copy_world(&self, client: ClientId, source: &str, target: &str) -> Result<()>;

    async fn stats(&self) -> Result<MetricsSnapshot>;
}
