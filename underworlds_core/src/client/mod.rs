//! Client side of the protocol: a session context, per-world replicas and
//! a raw monitor stream.
//!
//! A `Context` owns one server session. Worlds are opened lazily and cached
//! by name; each `WorldProxy` keeps a background listener that feeds its
//! scene and timeline replicas from the invalidation stream.

pub mod nodes;
pub mod timeline;
pub mod world;

pub use nodes::NodesProxy;
pub use timeline::TimelineProxy;
pub use world::{SceneProxy, WorldProxy};

use crate::api::UnderworldsApi;
use crate::config::ClientConfig;
use crate::error::{Result, UwdsError};
use crate::mesh::{Blake3MeshHasher, MeshHasher};
use crate::types::{Mesh, MeshId, Role, Topology};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use underworlds_env::{ClientId, Invalidation, InvalidationStream};

/// Bounds an RPC by `timeout`; an elapsed call means the server is unreachable.
pub(crate) async fn call<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(UwdsError::Unreachable(format!(
            "no reply from the server within {:?}",
            timeout
        ))),
    }
}

/// A client session with an Underworlds server.
pub struct Context {
    api: Arc<dyn UnderworldsApi>,
    client: ClientId,
    config: ClientConfig,
    hasher: Arc<dyn MeshHasher>,
    worlds: Mutex<HashMap<String, Arc<WorldProxy>>>,
    closed: AtomicBool,
}

impl Context {
    /// Opens a session under `config.name`.
    pub async fn connect(api: Arc<dyn UnderworldsApi>, config: ClientConfig) -> Result<Self> {
        let client = call(config.rpc_timeout(), api.handshake(&config.name)).await?;
        info!("<{}> connected to the server as {}", config.name, client);
        Ok(Self {
            api,
            client,
            config,
            hasher: Arc::new(Blake3MeshHasher),
            worlds: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Replaces the mesh hash strategy used by `push_mesh`.
    pub fn with_hasher(mut self, hasher: Arc<dyn MeshHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn id(&self) -> ClientId {
        self.client
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the replica of `name`, opening it on first use.
    pub async fn world(&self, name: &str) -> Result<Arc<WorldProxy>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UwdsError::UnknownClient(self.client));
        }

        let mut worlds = self.worlds.lock().await;
        if let Some(world) = worlds.get(name) {
            return Ok(world.clone());
        }

        let world = Arc::new(
            WorldProxy::open(self.api.clone(), self.client, name, self.config.clone()).await?,
        );
        worlds.insert(name.to_string(), world.clone());
        Ok(world)
    }

    /// Names of the worlds currently known to the server.
    pub async fn worlds(&self) -> Result<Vec<String>> {
        Ok(self.topology().await?.worlds)
    }

    pub async fn topology(&self) -> Result<Topology> {
        call(self.config.rpc_timeout(), self.api.topology(self.client)).await
    }

    pub async fn uptime(&self) -> Result<Duration> {
        call(self.config.rpc_timeout(), self.api.uptime(self.client)).await
    }

    /// Destroys every world on the server.
    pub async fn reset(&self) -> Result<()> {
        warn!("<{}> resetting the server", self.config.name);
        call(self.config.rpc_timeout(), self.api.reset(self.client)).await
    }

    pub async fn copy_world(&self, source: &str, target: &str) -> Result<()> {
        call(
            self.config.rpc_timeout(),
            self.api.copy_world(self.client, source, target),
        )
        .await
    }

    pub async fn has_mesh(&self, id: &MeshId) -> Result<bool> {
        call(self.config.rpc_timeout(), self.api.has_mesh(id)).await
    }

    pub async fn mesh(&self, id: &MeshId) -> Result<Mesh> {
        call(self.config.mesh_timeout(), self.api.get_mesh(id)).await
    }

    /// Uploads `mesh` unless the server already holds the same content.
    /// Returns the content hash to reference from nodes.
    pub async fn push_mesh(&self, mesh: Mesh) -> Result<MeshId> {
        let id = self.hasher.hash(&mesh);
        if self.has_mesh(&id).await? {
            debug!("Mesh {} already on the server", id);
            return Ok(id);
        }
        call(self.config.mesh_timeout(), self.api.put_mesh(id.clone(), mesh)).await?;
        Ok(id)
    }

    /// Subscribes to the raw change stream of `world` as a monitor.
    pub async fn monitor(&self, world: &str) -> Result<WorldMonitor> {
        let sub = call(
            self.config.rpc_timeout(),
            self.api.subscribe(self.client, world, Role::Monitor),
        )
        .await?;
        Ok(WorldMonitor {
            api: self.api.clone(),
            client: self.client,
            world: sub.world,
            stream: sub.stream,
            rpc_timeout: self.config.rpc_timeout(),
        })
    }

    /// Closes every world replica, then ends the session.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let worlds: Vec<Arc<WorldProxy>> = {
            let mut worlds = self.worlds.lock().await;
            worlds.drain().map(|(_, w)| w).collect()
        };
        for world in worlds {
            world.close().await;
        }

        call(self.config.rpc_timeout(), self.api.goodbye(self.client)).await?;
        info!("<{}> closed its session {}", self.config.name, self.client);
        Ok(())
    }
}

/// Raw change records of one world, without any replica behind them.
pub struct WorldMonitor {
    api: Arc<dyn UnderworldsApi>,
    client: ClientId,
    world: String,
    stream: InvalidationStream,
    rpc_timeout: Duration,
}

impl WorldMonitor {
    pub fn world(&self) -> &str {
        &self.world
    }

    /// Next non-NOP record, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Invalidation> {
        while let Some(record) = self.stream.recv().await {
            if !record.is_nop() {
                return Some(record);
            }
        }
        None
    }

    /// Like `next`, giving up after `timeout`.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<Invalidation> {
        tokio::time::timeout(timeout, self.next()).await.ok().flatten()
    }

    pub async fn close(self) -> Result<()> {
        call(self.rpc_timeout, self.api.unsubscribe(self.client, &self.world)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::UnderworldsServer;
    use crate::types::{Material, Node};
    use underworlds_env::{ChannelNetwork, InvalidationKind, TokioContext};

    fn server() -> Arc<dyn UnderworldsApi> {
        Arc::new(UnderworldsServer::new(
            TokioContext::shared(),
            Arc::new(ChannelNetwork::default()),
            ServerConfig::default(),
        ))
    }

    fn cube() -> Mesh {
        Mesh {
            vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            faces: vec![[0, 1, 2]],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            material: Material::default(),
        }
    }

    #[tokio::test]
    async fn test_call_times_out_as_unreachable() {
        let err = call(Duration::from_millis(10), async {
            std::future::pending::<()>().await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, UwdsError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_worlds_are_cached_by_name() {
        let ctx = Context::connect(server(), ClientConfig::new("cache")).await.unwrap();
        let a = ctx.world("base").await.unwrap();
        let b = ctx.world("base").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ctx.worlds().await.unwrap(), vec!["base".to_string()]);
        ctx.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_mesh_checks_before_upload() {
        let api = server();
        let ctx = Context::connect(api.clone(), ClientConfig::new("meshes")).await.unwrap();

        let id = ctx.push_mesh(cube()).await.unwrap();
        assert!(ctx.has_mesh(&id).await.unwrap());
        assert_eq!(ctx.push_mesh(cube()).await.unwrap(), id);
        assert_eq!(ctx.mesh(&id).await.unwrap(), cube());
    }

    #[tokio::test]
    async fn test_monitor_sees_raw_records() {
        let api = server();
        let ctx = Context::connect(api.clone(), ClientConfig::new("monitor")).await.unwrap();
        let mut monitor = ctx.monitor("base").await.unwrap();

        let writer = api.handshake("writer").await.unwrap();
        let node = Node::entity("n");
        api.put_nodes(writer, "base", vec![node.clone()]).await.unwrap();

        let first = monitor.next_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.kind, InvalidationKind::New);
        assert_eq!(first.ids, vec![node.id.0.clone()]);

        let topology = ctx.topology().await.unwrap();
        assert_eq!(topology.role_of(&ctx.id(), "base"), Some(Role::Monitor));
        monitor.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let api = server();
        let ctx = Context::connect(api.clone(), ClientConfig::new("bye")).await.unwrap();
        ctx.world("base").await.unwrap();
        ctx.close().await.unwrap();

        assert!(ctx.world("base").await.is_err());
        let observer = api.handshake("observer").await.unwrap();
        assert!(!api.topology(observer).await.unwrap().contains_client(&ctx.id()));
    }
}
