//! The Underworlds server: worlds, sessions, meshes and the invalidation bus.
//!
//! Generic over the context and network implementations, allowing the same
//! server code to run in production (tokio) or simulation (virtual clock,
//! fault-injecting links).

pub mod bus;
pub mod registry;
pub mod world;

use crate::api::{Subscription, UnderworldsApi};
use crate::config::ServerConfig;
use crate::error::{Result, UwdsError};
use crate::mesh::{InMemoryMeshStore, MeshStore, SledMeshStore};
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::types::{Mesh, MeshId, Node, NodeId, Role, Situation, SituationId, Topology};
use async_trait::async_trait;
use bus::InvalidationBus;
use parking_lot::RwLock;
use registry::SessionRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use underworlds_env::{
    ChannelNetwork, ClientId, InvalidationNetwork, Timestamp, TokioContext, UnderworldsContext,
};
use world::World;

/// In-process server implementing `UnderworldsApi`.
pub struct UnderworldsServer<Ctx, Net> {
    context: Arc<Ctx>,
    config: ServerConfig,
    /// World table; each world has its own writer lock
    worlds: RwLock<BTreeMap<String, Arc<RwLock<World>>>>,
    registry: Arc<SessionRegistry>,
    bus: InvalidationBus<Ctx, Net>,
    meshes: Arc<dyn MeshStore>,
    metrics: Arc<ServerMetrics>,
    started_at: Duration,
}

impl<Ctx, Net> UnderworldsServer<Ctx, Net>
where
    Ctx: UnderworldsContext,
    Net: InvalidationNetwork,
{
    /// Creates a server with an in-memory mesh store.
    pub fn new(context: Arc<Ctx>, network: Arc<Net>, config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        let bus = InvalidationBus::new(
            context.clone(),
            network,
            registry.clone(),
            metrics.clone(),
            config.delivery_timeout(),
            config.subscriber_capacity,
        );
        let started_at = context.now();

        info!("Starting the server (seed {})", context.seed());
        Self {
            context,
            config,
            worlds: RwLock::new(BTreeMap::new()),
            registry,
            bus,
            meshes: Arc::new(InMemoryMeshStore::new()),
            metrics,
            started_at,
        }
    }

    /// Creates a server whose mesh store follows `config.mesh_store_path`.
    pub fn open(context: Arc<Ctx>, network: Arc<Net>, config: ServerConfig) -> Result<Self> {
        let store: Option<Arc<dyn MeshStore>> = match &config.mesh_store_path {
            Some(path) => Some(Arc::new(SledMeshStore::open(path)?)),
            None => None,
        };
        let server = Self::new(context, network, config);
        Ok(match store {
            Some(store) => server.with_mesh_store(store),
            None => server,
        })
    }

    pub fn with_mesh_store(mut self, store: Arc<dyn MeshStore>) -> Self {
        self.meshes = store;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &InvalidationBus<Ctx, Net> {
        &self.bus
    }

    pub fn world_names(&self) -> Vec<String> {
        self.worlds.read().keys().cloned().collect()
    }

    /// Closes every subscription, waiting for pending deliveries.
    pub async fn shutdown(&self) {
        info!("Closing the server.");
        self.bus.shutdown().await;
    }

    /// Returns the named world, creating it on first reference.
    fn world(&self, name: &str) -> Arc<RwLock<World>> {
        if let Some(world) = self.worlds.read().get(name) {
            return world.clone();
        }

        let mut worlds = self.worlds.write();
        worlds
            .entry(name.to_string())
            .or_insert_with(|| {
                let root = NodeId::from(self.context.generate_id());
                info!("Created a new world {} (root {})", name, root);
                Arc::new(RwLock::new(World::new(name, root, self.context.timestamp())))
            })
            .clone()
    }

    /// Validates the session and world name, records the access and returns
    /// the world.
    fn access(&self, client: ClientId, world: &str, role: Role) -> Result<Arc<RwLock<World>>> {
        if world.is_empty() {
            return Err(UwdsError::invalid("world name must not be empty"));
        }
        self.registry
            .record_access(client, world, role, self.context.timestamp())?;
        Ok(self.world(world))
    }

    fn apply_nodes(&self, client: ClientId, world: &str, nodes: Vec<Node>) -> Result<()> {
        if nodes.iter().any(|n| n.id.is_empty()) {
            return Err(UwdsError::invalid("node id must not be empty"));
        }
        let world = self.access(client, world, Role::Provider)?;

        let mut w = world.write();
        for node in nodes {
            let id = node.id.clone();
            let (outcome, changes) = w.scene.upsert(node, self.context.timestamp())?;
            self.metrics.record_mutation();
            debug!("{} {:?} node {} in world {}", client, outcome, id, w.name);
            for change in changes {
                self.bus.publish(w.invalidation(change));
            }
        }
        Ok(())
    }

    fn remove_nodes(&self, client: ClientId, world: &str, ids: Vec<NodeId>) -> Result<()> {
        if ids.iter().any(|id| id.is_empty()) {
            return Err(UwdsError::invalid("node id must not be empty"));
        }
        let world = self.access(client, world, Role::Provider)?;

        let mut w = world.write();
        for id in ids {
            let changes = w.scene.delete(&id, self.context.timestamp())?;
            self.metrics.record_mutation();
            info!("{} deleted node {} in world {}", client, id, w.name);
            for change in changes {
                self.bus.publish(w.invalidation(change));
            }
        }
        Ok(())
    }

    fn apply_situations(
        &self,
        client: ClientId,
        world: &str,
        situations: Vec<Situation>,
    ) -> Result<()> {
        if situations.iter().any(|s| s.id.is_empty()) {
            return Err(UwdsError::invalid("situation id must not be empty"));
        }
        let world = self.access(client, world, Role::Provider)?;

        let mut w = world.write();
        for situation in situations {
            let change = w.timeline.start_or_event(situation, self.context.timestamp())?;
            self.metrics.record_mutation();
            self.bus.publish(w.invalidation(change));
        }
        Ok(())
    }

    fn finish_situation(&self, client: ClientId, world: &str, id: &SituationId) -> Result<()> {
        let world = self.access(client, world, Role::Provider)?;

        let mut w = world.write();
        let now = self.context.timestamp();
        let change = w.timeline.end(id, now, now)?;
        self.metrics.record_mutation();
        self.bus.publish(w.invalidation(change));
        Ok(())
    }

    fn remove_situations(&self, client: ClientId, world: &str, ids: Vec<SituationId>) -> Result<()> {
        let world = self.access(client, world, Role::Provider)?;

        let mut w = world.write();
        for id in ids {
            let change = w.timeline.delete(&id)?;
            self.metrics.record_mutation();
            self.bus.publish(w.invalidation(change));
        }
        Ok(())
    }

    fn copy(&self, client: ClientId, source: &str, target: &str) -> Result<()> {
        if source == target {
            return Err(UwdsError::invalid(format!("cannot copy world {} onto itself", source)));
        }
        let snapshot = self.access(client, source, Role::Reader)?.read().clone();
        let target_world = self.access(client, target, Role::Provider)?;

        let mut w = target_world.write();
        let changes = w.copy_from(&snapshot, self.context.timestamp());
        for change in changes {
            self.bus.publish(w.invalidation(change));
        }
        info!(
            "<{}> made a deep copy of world {} into {}",
            self.registry.name_of(client).unwrap_or_default(),
            source,
            target
        );
        Ok(())
    }

    fn open_subscription(&self, client: ClientId, world: &str, role: Role) -> Result<Subscription> {
        self.access(client, world, role)?;
        let stream = self.bus.subscribe(client, world);
        debug!("{} subscribed to world {} as {}", client, world, role);
        Ok(Subscription {
            world: world.to_string(),
            stream,
        })
    }
}

impl UnderworldsServer<TokioContext, ChannelNetwork> {
    /// In-process server on the tokio runtime, with links buffering
    /// `subscriber_capacity` records.
    pub fn local(config: ServerConfig) -> Result<Self> {
        let network = Arc::new(ChannelNetwork::new(config.subscriber_capacity));
        Self::open(TokioContext::shared(), network, config)
    }
}

#[async_trait]
impl<Ctx, Net> UnderworldsApi for UnderworldsServer<Ctx, Net>
where
    Ctx: UnderworldsContext,
    Net: InvalidationNetwork,
{
    async fn handshake(&self, name: &str) -> Result<ClientId> {
        let client = ClientId::from_uuid(self.context.generate_id());
        self.registry.register(client, name);
        self.metrics.record_handshake();
        info!("New client <{}> has connected ({})", name, client);
        Ok(client)
    }

    async fn goodbye(&self, client: ClientId) -> Result<()> {
        if !self.registry.deactivate(client) {
            return Err(UwdsError::UnknownClient(client));
        }
        self.bus.close_client(client).await;
        let name = self.registry.name_of(client).unwrap_or_default();
        self.registry.remove(client);
        info!("Client <{}> has disconnected ({})", name, client);
        Ok(())
    }

    async fn world_size(&self, client: ClientId, world: &str) -> Result<usize> {
        let world = self.access(client, world, Role::Reader)?;
        let size = world.read().size();
        Ok(size)
    }

    async fn world_node_ids(&self, client: ClientId, world: &str) -> Result<Vec<NodeId>> {
        let world = self.access(client, world, Role::Reader)?;
        let ids = world.read().scene.ids();
        Ok(ids)
    }

    async fn root_id(&self, client: ClientId, world: &str) -> Result<NodeId> {
        let world = self.access(client, world, Role::Reader)?;
        let root = world.read().scene.root_id().clone();
        Ok(root)
    }

    async fn get_node(&self, client: ClientId, world: &str, id: &NodeId) -> Result<Node> {
        if id.is_empty() {
            return Err(UwdsError::invalid("node id must not be empty"));
        }
        let world = self.access(client, world, Role::Reader)?;
        let node = world.read().scene.get(id).cloned();
        if node.is_err() {
            warn!("{} has required a non-existent node {}", client, id);
        }
        node
    }

    async fn put_nodes(&self, client: ClientId, world: &str, nodes: Vec<Node>) -> Result<()> {
        self.apply_nodes(client, world, nodes)
    }

    async fn delete_nodes(&self, client: ClientId, world: &str, ids: Vec<NodeId>) -> Result<()> {
        self.remove_nodes(client, world, ids)
    }

    async fn get_situation(
        &self,
        client: ClientId,
        world: &str,
        id: &SituationId,
    ) -> Result<Situation> {
        if id.is_empty() {
            return Err(UwdsError::invalid("situation id must not be empty"));
        }
        let world = self.access(client, world, Role::Reader)?;
        let situation = world.read().timeline.get(id).cloned();
        situation
    }

    async fn situation_ids(&self, client: ClientId, world: &str) -> Result<Vec<SituationId>> {
        let world = self.access(client, world, Role::Reader)?;
        let ids = world.read().timeline.ids();
        Ok(ids)
    }

    async fn put_situations(
        &self,
        client: ClientId,
        world: &str,
        situations: Vec<Situation>,
    ) -> Result<()> {
        self.apply_situations(client, world, situations)
    }

    async fn end_situation(&self, client: ClientId, world: &str, id: &SituationId) -> Result<()> {
        self.finish_situation(client, world, id)
    }

    async fn delete_situations(
        &self,
        client: ClientId,
        world: &str,
        ids: Vec<SituationId>,
    ) -> Result<()> {
        self.remove_situations(client, world, ids)
    }

    async fn timeline_origin(&self, client: ClientId, world: &str) -> Result<Timestamp> {
        let world = self.access(client, world, Role::Reader)?;
        let origin = world.read().timeline.origin();
        Ok(origin)
    }

    async fn has_mesh(&self, id: &MeshId) -> Result<bool> {
        Ok(self.meshes.has(id))
    }

    async fn get_mesh(&self, id: &MeshId) -> Result<Mesh> {
        self.meshes.get(id)
    }

    async fn put_mesh(&self, id: MeshId, mesh: Mesh) -> Result<()> {
        let faces = mesh.faces.len();
        if self.meshes.put(id.clone(), mesh)? {
            info!("Added a new mesh {} ({} faces)", id, faces);
        } else {
            debug!("Mesh {} already stored", id);
        }
        Ok(())
    }

    async fn topology(&self, client: ClientId) -> Result<Topology> {
        self.registry.ensure_active(client)?;
        Ok(Topology {
            worlds: self.world_names(),
            clients: self.registry.clients(),
        })
    }

    async fn reset(&self, client: ClientId) -> Result<()> {
        self.registry.ensure_active(client)?;
        let name = self.registry.name_of(client).unwrap_or_default();
        warn!(
            "<{}> requested a server reset: every world is destroyed and connected clients will be inconsistent",
            name
        );
        self.worlds.write().clear();
        Ok(())
    }

    async fn uptime(&self, client: ClientId) -> Result<Duration> {
        self.registry.ensure_active(client)?;
        Ok(self.context.now().saturating_sub(self.started_at))
    }

    async fn subscribe(&self, client: ClientId, world: &str, role: Role) -> Result<Subscription> {
        self.open_subscription(client, world, role)
    }

    async fn unsubscribe(&self, client: ClientId, world: &str) -> Result<()> {
        self.registry.ensure_active(client)?;
        if self.bus.unsubscribe(client, world).await {
            Ok(())
        } else {
            Err(UwdsError::not_found(format!("subscription of {} to {}", client, world)))
        }
    }

    async fn copy_world(&self, client: ClientId, source: &str, target: &str) -> Result<()> {
        self.copy(client, source, target)
    }

    async fn stats(&self) -> Result<MetricsSnapshot> {
        Ok(self.metrics.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Blake3MeshHasher, MeshHasher};
    use crate::testing::StalledNetwork;
    use crate::types::Material;
    use underworlds_env::{ChannelNetwork, Invalidation, InvalidationKind, TokioContext};

    fn server() -> UnderworldsServer<TokioContext, ChannelNetwork> {
        UnderworldsServer::new(
            TokioContext::shared(),
            Arc::new(ChannelNetwork::default()),
            ServerConfig::default(),
        )
    }

    async fn next_change(sub: &mut Subscription) -> Invalidation {
        loop {
            let rec = tokio::time::timeout(Duration::from_secs(1), sub.stream.recv())
                .await
                .unwrap()
                .unwrap();
            if !rec.is_nop() {
                return rec;
            }
        }
    }

    #[tokio::test]
    async fn test_single_root_per_world() {
        let server = server();
        let c = server.handshake("test").await.unwrap();

        let root = server.root_id(c, "base").await.unwrap();
        assert_eq!(server.root_id(c, "base").await.unwrap(), root);
        assert_ne!(server.root_id(c, "other").await.unwrap(), root);

        let node = server.get_node(c, "base", &root).await.unwrap();
        assert_eq!(node.name, "root");
        assert_eq!(server.world_size(c, "base").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_node_errors() {
        let server = server();
        let c = server.handshake("test").await.unwrap();

        assert!(matches!(
            server.get_node(c, "base", &NodeId::new("")).await,
            Err(UwdsError::InvalidArgument(_))
        ));
        assert!(matches!(
            server.get_node(c, "base", &NodeId::new("missing")).await,
            Err(UwdsError::NotFound(_))
        ));
        assert!(matches!(
            server.get_node(ClientId::from_seed(9), "base", &NodeId::new("x")).await,
            Err(UwdsError::UnknownClient(_))
        ));
        assert!(matches!(
            server.root_id(c, "").await,
            Err(UwdsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_then_delete_records_in_order() {
        let server = server();
        let writer = server.handshake("writer").await.unwrap();
        let reader = server.handshake("reader").await.unwrap();
        let mut sub = server.subscribe(reader, "base", Role::Reader).await.unwrap();
        let root = server.root_id(writer, "base").await.unwrap();

        let node = Node::entity("test");
        let id = node.id.clone();
        server.put_nodes(writer, "base", vec![node]).await.unwrap();

        let rec = next_change(&mut sub).await;
        assert_eq!((rec.kind, rec.ids.clone()), (InvalidationKind::New, vec![id.0.clone()]));
        let rec = next_change(&mut sub).await;
        assert_eq!((rec.kind, rec.ids.clone()), (InvalidationKind::Update, vec![root.0.clone()]));

        server.delete_nodes(writer, "base", vec![id.clone()]).await.unwrap();
        let rec = next_change(&mut sub).await;
        assert_eq!((rec.kind, rec.ids.clone()), (InvalidationKind::Update, vec![root.0.clone()]));
        let rec = next_change(&mut sub).await;
        assert_eq!((rec.kind, rec.ids.clone()), (InvalidationKind::Delete, vec![id.0.clone()]));
    }

    #[tokio::test]
    async fn test_batch_rejects_empty_ids_before_commit() {
        let server = server();
        let c = server.handshake("test").await.unwrap();
        let good = Node::entity("good");
        let bad = Node::with_id(NodeId::new(""), "bad", Default::default());

        assert!(server.put_nodes(c, "base", vec![good, bad]).await.is_err());
        assert_eq!(server.world_size(c, "base").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_roles_in_topology() {
        let server = server();
        let c = server.handshake("test").await.unwrap();

        server.world_size(c, "base").await.unwrap();
        let topo = server.topology(c).await.unwrap();
        assert_eq!(topo.role_of(&c, "base"), Some(Role::Reader));
        assert_eq!(topo.worlds, vec!["base".to_string()]);

        server.put_nodes(c, "base", vec![Node::entity("a")]).await.unwrap();
        server.world_size(c, "base").await.unwrap();
        let topo = server.topology(c).await.unwrap();
        assert_eq!(topo.role_of(&c, "base"), Some(Role::Provider));
        assert_eq!(topo.clients[&c].name, "test");
    }

    #[tokio::test]
    async fn test_session_eviction_visible_in_topology() {
        let server = UnderworldsServer::new(
            TokioContext::shared(),
            Arc::new(StalledNetwork),
            ServerConfig::default().with_delivery_timeout(Duration::from_millis(50)),
        );
        let writer = server.handshake("writer").await.unwrap();
        let slow = server.handshake("slow").await.unwrap();
        let _sub = server.subscribe(slow, "base", Role::Reader).await.unwrap();

        server.put_nodes(writer, "base", vec![Node::entity("a")]).await.unwrap();
        server.put_nodes(writer, "base", vec![Node::entity("b")]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let topo = server.topology(writer).await.unwrap();
        assert!(!topo.contains_client(&slow));
        assert!(topo.contains_client(&writer));
        assert!(matches!(
            server.world_size(slow, "base").await,
            Err(UwdsError::UnknownClient(_))
        ));
        assert_eq!(server.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_goodbye_drains_and_removes() {
        let server = server();
        let writer = server.handshake("writer").await.unwrap();
        let reader = server.handshake("reader").await.unwrap();
        let mut sub = server.subscribe(reader, "base", Role::Reader).await.unwrap();

        server.put_nodes(writer, "base", vec![Node::entity("a")]).await.unwrap();
        server.goodbye(reader).await.unwrap();

        let mut kinds = Vec::new();
        while let Some(rec) = sub.stream.recv().await {
            kinds.push(rec.kind);
        }
        assert_eq!(
            kinds,
            vec![InvalidationKind::Nop, InvalidationKind::New, InvalidationKind::Update]
        );
        assert!(!server.topology(writer).await.unwrap().contains_client(&reader));
        assert!(server.goodbye(reader).await.is_err());
    }

    #[tokio::test]
    async fn test_mesh_dedup() {
        let server = server();
        let mesh = Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            faces: vec![[0, 1, 2]],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            material: Material::default(),
        };
        let id = Blake3MeshHasher.hash(&mesh);

        assert!(!server.has_mesh(&id).await.unwrap());
        server.put_mesh(id.clone(), mesh.clone()).await.unwrap();
        assert!(server.has_mesh(&id).await.unwrap());
        server.put_mesh(id.clone(), mesh.clone()).await.unwrap();

        assert_eq!(server.meshes.len(), 1);
        assert_eq!(server.get_mesh(&id).await.unwrap(), mesh);
    }

    #[tokio::test]
    async fn test_timeline_operations() {
        let server = server();
        let c = server.handshake("test").await.unwrap();
        let origin = server.timeline_origin(c, "base").await.unwrap();

        let situation = Situation::new("holding", origin);
        let id = situation.id.clone();
        server.put_situations(c, "base", vec![situation]).await.unwrap();
        assert_eq!(server.situation_ids(c, "base").await.unwrap(), vec![id.clone()]);
        assert_eq!(server.world_size(c, "base").await.unwrap(), 2);

        server.end_situation(c, "base", &id).await.unwrap();
        let ended = server.get_situation(c, "base", &id).await.unwrap();
        assert!(!ended.is_active());
        assert!(server.end_situation(c, "base", &id).await.is_err());

        server.delete_situations(c, "base", vec![id.clone()]).await.unwrap();
        assert!(matches!(
            server.get_situation(c, "base", &id).await,
            Err(UwdsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_destroys_worlds() {
        let server = server();
        let c = server.handshake("test").await.unwrap();
        let root = server.root_id(c, "base").await.unwrap();
        server.put_nodes(c, "base", vec![Node::entity("a")]).await.unwrap();

        server.reset(c).await.unwrap();
        assert!(server.world_names().is_empty());
        assert_ne!(server.root_id(c, "base").await.unwrap(), root);
        assert_eq!(server.world_size(c, "base").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_copy_world() {
        let server = server();
        let c = server.handshake("test").await.unwrap();
        let reader = server.handshake("reader").await.unwrap();
        server.put_nodes(c, "base", vec![Node::entity("a")]).await.unwrap();
        let mut sub = server.subscribe(reader, "copy", Role::Reader).await.unwrap();

        server.copy_world(c, "base", "copy").await.unwrap();

        assert_eq!(server.world_size(c, "copy").await.unwrap(), 2);
        let rec = next_change(&mut sub).await;
        assert_eq!(rec.kind, InvalidationKind::New);
        let topo = server.topology(c).await.unwrap();
        assert_eq!(topo.role_of(&c, "base"), Some(Role::Provider));
        assert_eq!(topo.role_of(&c, "copy"), Some(Role::Provider));
        assert!(server.copy_world(c, "base", "base").await.is_err());
    }

    #[tokio::test]
    async fn test_local_server_serves_handshakes() {
        let server = UnderworldsServer::local(ServerConfig::default().with_subscriber_capacity(8))
            .unwrap();
        assert_eq!(server.config().subscriber_capacity, 8);
        let client = server.handshake("local").await.unwrap();
        let topology = server.topology(client).await.unwrap();
        assert!(topology.contains_client(&client));
    }

    #[tokio::test]
    async fn test_uptime_and_unsubscribe() {
        let server = server();
        let c = server.handshake("test").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(server.uptime(c).await.unwrap() >= Duration::from_millis(5));

        let _sub = server.subscribe(c, "base", Role::Monitor).await.unwrap();
        server.unsubscribe(c, "base").await.unwrap();
        assert!(matches!(
            server.unsubscribe(c, "base").await,
            Err(UwdsError::NotFound(_))
        ));
    }
}
