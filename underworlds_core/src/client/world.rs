//! Replica of one world: scene and timeline proxies fed by a listener task.
//!
//! Opening a world follows a fixed sequence so that no change published
//! after the proxy is ready can be missed:
//! 1. subscribe as READER
//! 2. wait for the listener to receive the subscription's NOP
//! 3. merge the scene and timeline snapshots
//!
//! Any failure along the way, and dropping an open replica, gives the
//! subscription back so the session itself stays healthy.

use crate::api::UnderworldsApi;
use crate::client::nodes::NodesProxy;
use crate::client::timeline::TimelineProxy;
use crate::client::call;
use crate::config::ClientConfig;
use crate::error::{Result, UwdsError};
use crate::types::{Node, NodeId, Role};
use nalgebra::Matrix4;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use underworlds_env::{ClientId, InvalidationStream, InvalidationTarget};

/// Scene half of a world replica.
pub struct SceneProxy {
    nodes: Arc<NodesProxy>,
}

impl SceneProxy {
    pub fn nodes(&self) -> &NodesProxy {
        &self.nodes
    }

    pub async fn root(&self) -> Result<Node> {
        let root = self
            .nodes
            .root_id()
            .ok_or_else(|| UwdsError::not_found("root of an unopened scene"))?;
        self.nodes.get_by_id(&root).await
    }

    /// Every node currently named `name`. Resolves the whole scene.
    pub async fn nodes_by_name(&self, name: &str) -> Result<Vec<Node>> {
        Ok(self
            .nodes
            .all()
            .await?
            .into_iter()
            .filter(|n| n.name == name)
            .collect())
    }

    /// Transform of `id` relative to the root.
    pub async fn world_transform(&self, id: &NodeId) -> Result<Matrix4<f64>> {
        let mut node = self.nodes.get_by_id(id).await?;
        let mut transform = node.transform;
        while let Some(parent) = node.parent.clone() {
            node = self.nodes.get_by_id(&parent).await?;
            transform = node.transform * transform;
        }
        Ok(transform)
    }

    /// Waits for the next scene change. Returns false on timeout.
    pub async fn wait_for_changes(&self, timeout: Duration) -> bool {
        self.nodes.wait_for_changes(timeout).await
    }
}

impl std::ops::Deref for SceneProxy {
    type Target = NodesProxy;

    fn deref(&self) -> &NodesProxy {
        &self.nodes
    }
}

pub struct WorldProxy {
    name: String,
    api: Arc<dyn UnderworldsApi>,
    client: ClientId,
    rpc_timeout: Duration,
    scene: SceneProxy,
    timeline: Arc<TimelineProxy>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WorldProxy {
    pub(crate) async fn open(
        api: Arc<dyn UnderworldsApi>,
        client: ClientId,
        name: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let nodes = Arc::new(NodesProxy::new(api.clone(), client, name, config.clone()));
        let timeline = Arc::new(TimelineProxy::new(api.clone(), client, name, config.clone()));

        let sub = call(
            config.rpc_timeout(),
            api.subscribe(client, name, Role::Reader),
        )
        .await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let listener = tokio::spawn(listen(
            name.to_string(),
            sub.stream,
            nodes.clone(),
            timeline.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(config.readiness_timeout(), ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                listener.abort();
                if let Err(e) = call(config.rpc_timeout(), api.unsubscribe(client, name)).await {
                    debug!("Releasing unconfirmed subscription to {}: {}", name, e);
                }
                return Err(UwdsError::Unreachable(format!(
                    "subscription to world {} was not confirmed within {:?}",
                    name,
                    config.readiness_timeout()
                )));
            }
        }

        let world = Self {
            name: name.to_string(),
            api,
            client,
            rpc_timeout: config.rpc_timeout(),
            scene: SceneProxy { nodes },
            timeline,
            listener: Mutex::new(Some(listener)),
        };
        if let Err(e) = world.bootstrap().await {
            world.abandon().await;
            return Err(e);
        }

        info!(
            "Opened world {} ({} nodes, {} situations)",
            name,
            world.scene.len(),
            world.timeline.len()
        );
        Ok(world)
    }

    async fn bootstrap(&self) -> Result<()> {
        self.scene.nodes.bootstrap().await?;
        self.timeline.bootstrap().await
    }

    /// Stops listening and unsubscribes without applying the backlog.
    async fn abandon(&self) {
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            handle.abort();
        }
        if let Err(e) = call(self.rpc_timeout, self.api.unsubscribe(self.client, &self.name)).await
        {
            debug!("Unsubscribing from world {}: {}", self.name, e);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scene(&self) -> &SceneProxy {
        &self.scene
    }

    pub fn timeline(&self) -> &TimelineProxy {
        &self.timeline
    }

    /// Server-side node and situation count.
    pub async fn remote_size(&self) -> Result<usize> {
        call(self.rpc_timeout, self.api.world_size(self.client, &self.name)).await
    }

    /// True while the listener is receiving this world's changes.
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Unsubscribes and waits for the listener to apply the remaining records.
    pub async fn close(&self) {
        if let Err(e) = call(self.rpc_timeout, self.api.unsubscribe(self.client, &self.name)).await
        {
            debug!("Unsubscribing from world {}: {}", self.name, e);
        }
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            let _ = handle.await;
        }
    }
}

impl Drop for WorldProxy {
    fn drop(&mut self) {
        let Some(handle) = self.listener.lock().take() else {
            return;
        };
        handle.abort();

        // Still subscribed: release it in the background when a runtime is around.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let api = self.api.clone();
            let client = self.client;
            let name = self.name.clone();
            let timeout = self.rpc_timeout;
            runtime.spawn(async move {
                if let Err(e) = call(timeout, api.unsubscribe(client, &name)).await {
                    debug!("Unsubscribing dropped world {}: {}", name, e);
                }
            });
        }
    }
}

async fn listen(
    world: String,
    mut stream: InvalidationStream,
    nodes: Arc<NodesProxy>,
    timeline: Arc<TimelineProxy>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    while let Some(record) = stream.recv().await {
        if record.is_nop() {
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
            continue;
        }
        match record.target {
            InvalidationTarget::Scene => nodes.on_invalidation(&record),
            InvalidationTarget::Timeline => timeline.on_invalidation(&record).await,
        }
    }
    debug!("Invalidation stream of world {} closed", world);
}
