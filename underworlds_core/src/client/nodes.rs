//! The Lazy Node Proxy - a client's ordered, lazily fetched view of a
//! world's nodes.
//!
//! Two-level structure:
//! - `ids`: resolved index → id sequence, appended in notification arrival
//!   order and only shrunk by purging deleted ids
//! - `pending`: FIFO of announced but unresolved ids
//!
//! `len()` is the authoritative remote count (NEW increments, DELETE
//! decrements), so it may exceed the number of resolved entries. Local
//! state only changes in response to invalidations; `update` and `remove`
//! never touch the cache.

use crate::api::UnderworldsApi;
use crate::client::call;
use crate::config::ClientConfig;
use crate::error::{Result, UwdsError};
use crate::types::{Node, NodeId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error};
use underworlds_env::{ClientId, Invalidation, InvalidationKind};

#[derive(Debug, Default)]
struct NodesState {
    /// Resolved index → id
    ids: Vec<NodeId>,
    cache: HashMap<NodeId, Node>,
    /// Announced, not yet resolved, in arrival order
    pending: VecDeque<NodeId>,
    /// Resolved ids whose cached copy is stale
    dirty: HashSet<NodeId>,
    /// Deleted ids still to purge from `ids`
    deleted: VecDeque<NodeId>,
    /// Ids counted in `len`
    known: HashSet<NodeId>,
    /// Deletions seen before the snapshot merge (startup race)
    graveyard: HashSet<NodeId>,
    /// Set once the startup snapshot has been merged
    merged: bool,
    len: usize,
    root: Option<NodeId>,
}

impl NodesState {
    fn announce(&mut self, id: NodeId) {
        self.graveyard.remove(&id);
        if self.known.insert(id.clone()) {
            self.len += 1;
            self.pending.push_back(id);
        }
    }

    fn forget(&mut self, id: NodeId) {
        if !self.merged {
            self.graveyard.insert(id.clone());
        }
        if self.known.remove(&id) {
            self.len -= 1;
            self.pending.retain(|p| *p != id);
            self.dirty.remove(&id);
            self.deleted.push_back(id);
        }
    }

    /// Folds the startup id list in, skipping ids deleted in the meantime.
    fn merge(&mut self, snapshot: Vec<NodeId>, root: &NodeId) {
        for id in snapshot {
            if !self.graveyard.contains(&id) {
                self.announce(id);
            }
        }
        self.pending.retain(|p| p != root);
        self.root = Some(root.clone());
        self.graveyard.clear();
        self.merged = true;
    }

    fn purge_deleted(&mut self) {
        while let Some(id) = self.deleted.pop_front() {
            if let Some(pos) = self.ids.iter().position(|x| *x == id) {
                self.ids.remove(pos);
            }
            if !self.known.contains(&id) {
                self.cache.remove(&id);
            }
        }
    }

    fn store(&mut self, node: Node) {
        if !self.ids.contains(&node.id) {
            self.ids.push(node.id.clone());
        }
        self.cache.insert(node.id.clone(), node);
    }
}

enum Step<'a> {
    Refresh(NodeId),
    Resolve(NodeId),
    Wait(Notified<'a>),
}

/// Lazily populated, index-stable view over one world's nodes.
pub struct NodesProxy {
    api: Arc<dyn UnderworldsApi>,
    client: ClientId,
    world: String,
    config: ClientConfig,
    state: Mutex<NodesState>,
    changed: Notify,
}

impl NodesProxy {
    pub(crate) fn new(
        api: Arc<dyn UnderworldsApi>,
        client: ClientId,
        world: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        Self {
            api,
            client,
            world: world.into(),
            config,
            state: Mutex::new(NodesState::default()),
            changed: Notify::new(),
        }
    }

    /// Merges the server's id list and resolves the root at index 0.
    ///
    /// Must run after the subscription is confirmed, so that any change
    /// racing with the snapshot is also seen as an invalidation.
    pub(crate) async fn bootstrap(&self) -> Result<()> {
        let rpc = self.config.rpc_timeout();
        let snapshot = call(rpc, self.api.world_node_ids(self.client, &self.world)).await?;
        let root = call(rpc, self.api.root_id(self.client, &self.world)).await?;

        self.state.lock().merge(snapshot, &root);

        let node = self.fetch(&root).await?;
        let mut st = self.state.lock();
        st.ids.insert(0, root.clone());
        st.cache.insert(root, node);
        Ok(())
    }

    /// Applies a scene invalidation. Called by the world's listener task.
    pub(crate) fn on_invalidation(&self, record: &Invalidation) {
        {
            let mut st = self.state.lock();
            for raw in &record.ids {
                let id = NodeId::new(raw.as_str());
                match record.kind {
                    InvalidationKind::New => st.announce(id),
                    InvalidationKind::Update => {
                        if st.cache.contains_key(&id) {
                            st.dirty.insert(id);
                        }
                    }
                    InvalidationKind::Delete => st.forget(id),
                    InvalidationKind::Nop => {}
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// Authoritative node count, including unresolved nodes.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of locally resolved entries.
    pub fn resolved_len(&self) -> usize {
        self.state.lock().ids.len()
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.state.lock().root.clone()
    }

    /// Current index of a resolved id.
    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        let mut st = self.state.lock();
        st.purge_deleted();
        st.ids.iter().position(|x| x == id)
    }

    /// Returns the node at `index`, resolving announced ids in arrival order.
    ///
    /// # Errors
    /// * `IndexOutOfRange` if `index >= len()`
    /// * `Inconsistency` if the expected notifications do not arrive within
    ///   the propagation window
    pub async fn get(&self, index: usize) -> Result<Node> {
        loop {
            let step = {
                let mut st = self.state.lock();
                st.purge_deleted();
                if index >= st.len {
                    return Err(UwdsError::IndexOutOfRange { index, len: st.len });
                }

                if index < st.ids.len() {
                    let id = st.ids[index].clone();
                    let stale = st.dirty.remove(&id);
                    match st.cache.get(&id) {
                        Some(node) if !stale => return Ok(node.clone()),
                        _ => Step::Refresh(id),
                    }
                } else if let Some(id) = st.pending.pop_front() {
                    Step::Resolve(id)
                } else {
                    Step::Wait(self.changed.notified())
                }
            };

            match step {
                Step::Refresh(id) => match self.fetch(&id).await {
                    Ok(node) => {
                        let mut st = self.state.lock();
                        if st.known.contains(&id) {
                            st.cache.insert(id, node.clone());
                        }
                        return Ok(node);
                    }
                    Err(UwdsError::NotFound(_)) => {
                        // Deleted upstream; the DELETE record is still in flight.
                        let notified = self.changed.notified();
                        self.state.lock().dirty.insert(id);
                        self.wait(notified, index).await?;
                    }
                    Err(e) => {
                        self.state.lock().dirty.insert(id);
                        return Err(e);
                    }
                },
                Step::Resolve(id) => match self.fetch(&id).await {
                    Ok(node) => {
                        let mut st = self.state.lock();
                        if st.known.contains(&id) {
                            st.store(node);
                        }
                    }
                    Err(UwdsError::NotFound(_)) => {
                        debug!("Announced node {} vanished before it was fetched", id);
                    }
                    Err(e) => {
                        self.state.lock().pending.push_front(id);
                        return Err(e);
                    }
                },
                Step::Wait(notified) => self.wait(notified, index).await?,
            }
        }
    }

    /// Returns a node by id.
    ///
    /// # Errors
    /// `NotFound` if the id was never announced to this proxy or has been
    /// deleted.
    pub async fn get_by_id(&self, id: &NodeId) -> Result<Node> {
        let resolve = {
            let mut st = self.state.lock();
            st.purge_deleted();
            if !st.known.contains(id) {
                return Err(UwdsError::not_found(format!("node {} in world {}", id, self.world)));
            }
            if let Some(pos) = st.pending.iter().position(|p| p == id) {
                st.pending.remove(pos);
                true
            } else {
                let stale = st.dirty.remove(id);
                match st.cache.get(id) {
                    Some(node) if !stale => return Ok(node.clone()),
                    _ => false,
                }
            }
        };

        match self.fetch(id).await {
            Ok(node) => {
                let mut st = self.state.lock();
                if st.known.contains(id) {
                    if resolve {
                        st.store(node.clone());
                    } else {
                        st.cache.insert(id.clone(), node.clone());
                    }
                }
                Ok(node)
            }
            Err(e) => {
                let mut st = self.state.lock();
                if resolve {
                    st.pending.push_front(id.clone());
                } else {
                    st.dirty.insert(id.clone());
                }
                Err(e)
            }
        }
    }

    /// Resolves and returns every node, in index order.
    pub async fn all(&self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut index = 0;
        while index < self.len() {
            nodes.push(self.get(index).await?);
            index += 1;
        }
        Ok(nodes)
    }

    /// Sends a node to the server. The local view changes only when the
    /// resulting invalidation arrives.
    pub async fn update(&self, node: Node) -> Result<()> {
        self.update_all(vec![node]).await
    }

    pub async fn update_all(&self, nodes: Vec<Node>) -> Result<()> {
        call(
            self.config.rpc_timeout(),
            self.api.put_nodes(self.client, &self.world, nodes),
        )
        .await
    }

    /// Asks the server to delete a node. Same acknowledgement semantics as
    /// `update`.
    pub async fn remove(&self, id: &NodeId) -> Result<()> {
        call(
            self.config.rpc_timeout(),
            self.api.delete_nodes(self.client, &self.world, vec![id.clone()]),
        )
        .await
    }

    /// Waits for the next scene change. Returns false on timeout.
    pub async fn wait_for_changes(&self, timeout: std::time::Duration) -> bool {
        tokio::time::timeout(timeout, self.changed.notified())
            .await
            .is_ok()
    }

    async fn fetch(&self, id: &NodeId) -> Result<Node> {
        call(
            self.config.rpc_timeout(),
            self.api.get_node(self.client, &self.world, id),
        )
        .await
    }

    async fn wait(&self, notified: Notified<'_>, index: usize) -> Result<()> {
        let window = self.config.propagation_window();
        if tokio::time::timeout(window, notified).await.is_err() {
            let (len, resolved) = {
                let st = self.state.lock();
                (st.len, st.ids.len())
            };
            error!(
                "World {}: node {} of {} still unannounced after {:?} ({} resolved)",
                self.world, index, len, window, resolved
            );
            return Err(UwdsError::Inconsistency(format!(
                "the server failed to notify pending changes on world {} within {:?}",
                self.world, window
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::UnderworldsServer;
    use crate::types::Role;
    use std::time::Duration;
    use underworlds_env::{ChannelNetwork, InvalidationTarget, TokioContext};

    async fn setup() -> (Arc<dyn UnderworldsApi>, ClientId, NodesProxy) {
        let server: Arc<dyn UnderworldsApi> = Arc::new(UnderworldsServer::new(
            TokioContext::shared(),
            Arc::new(ChannelNetwork::default()),
            ServerConfig::default(),
        ));
        let client = server.handshake("test").await.unwrap();
        let proxy = NodesProxy::new(server.clone(), client, "base", ClientConfig::default());
        proxy.bootstrap().await.unwrap();
        (server, client, proxy)
    }

    fn record(kind: InvalidationKind, ids: &[&NodeId]) -> Invalidation {
        Invalidation::new(
            "base",
            InvalidationTarget::Scene,
            kind,
            ids.iter().map(|id| id.0.clone()).collect(),
        )
    }

    #[tokio::test]
    async fn test_root_resolved_at_index_zero() {
        let (_, _, proxy) = setup().await;
        assert_eq!(proxy.len(), 1);
        assert_eq!(proxy.resolved_len(), 1);
        let root = proxy.get(0).await.unwrap();
        assert_eq!(Some(root.id), proxy.root_id());
        assert!(matches!(
            proxy.get(1).await,
            Err(UwdsError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[tokio::test]
    async fn test_resolution_follows_arrival_order() {
        let (api, client, proxy) = setup().await;
        let a = Node::entity("a");
        let b = Node::entity("b");
        api.put_nodes(client, "base", vec![a.clone(), b.clone()]).await.unwrap();

        // Announced b first, then a.
        proxy.on_invalidation(&record(InvalidationKind::New, &[&b.id]));
        proxy.on_invalidation(&record(InvalidationKind::New, &[&a.id]));
        assert_eq!(proxy.len(), 3);
        assert_eq!(proxy.resolved_len(), 1);

        assert_eq!(proxy.get(2).await.unwrap().id, a.id);
        assert_eq!(proxy.index_of(&b.id), Some(1));
        assert_eq!(proxy.index_of(&a.id), Some(2));
    }

    #[tokio::test]
    async fn test_index_stability_on_removal() {
        let (api, client, proxy) = setup().await;
        let nodes: Vec<Node> = ["a", "b", "c"].iter().map(|n| Node::entity(*n)).collect();
        api.put_nodes(client, "base", nodes.clone()).await.unwrap();
        for n in &nodes {
            proxy.on_invalidation(&record(InvalidationKind::New, &[&n.id]));
        }
        proxy.all().await.unwrap();
        assert_eq!(proxy.index_of(&nodes[0].id), Some(1));

        proxy.on_invalidation(&record(InvalidationKind::Delete, &[&nodes[1].id]));

        assert_eq!(proxy.len(), 3);
        assert_eq!(proxy.get(1).await.unwrap().id, nodes[0].id);
        assert_eq!(proxy.get(2).await.unwrap().id, nodes[2].id);
        assert!(proxy.get_by_id(&nodes[1].id).await.is_err());
    }

    #[tokio::test]
    async fn test_update_marks_dirty_and_refetches() {
        let (api, client, proxy) = setup().await;
        let mut a = Node::entity("a");
        api.put_nodes(client, "base", vec![a.clone()]).await.unwrap();
        proxy.on_invalidation(&record(InvalidationKind::New, &[&a.id]));
        assert_eq!(proxy.get_by_id(&a.id).await.unwrap().name, "a");

        a.name = "renamed".to_string();
        api.put_nodes(client, "base", vec![a.clone()]).await.unwrap();
        // Not yet notified: the cached copy is served.
        assert_eq!(proxy.get_by_id(&a.id).await.unwrap().name, "a");

        proxy.on_invalidation(&record(InvalidationKind::Update, &[&a.id]));
        assert_eq!(proxy.get(1).await.unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn test_unannounced_id_is_not_found() {
        let (api, client, proxy) = setup().await;
        let a = Node::entity("a");
        api.put_nodes(client, "base", vec![a.clone()]).await.unwrap();
        assert!(matches!(
            proxy.get_by_id(&a.id).await,
            Err(UwdsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_notification_raises_inconsistency() {
        let (_, _, proxy) = setup().await;
        let ghost = NodeId::new("never-created");
        proxy.on_invalidation(&record(InvalidationKind::New, &[&ghost]));

        let err = proxy.get(1).await.unwrap_err();
        assert!(matches!(err, UwdsError::Inconsistency(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_before_snapshot_merge_is_remembered() {
        let server: Arc<dyn UnderworldsApi> = Arc::new(UnderworldsServer::new(
            TokioContext::shared(),
            Arc::new(ChannelNetwork::default()),
            ServerConfig::default(),
        ));
        let client = server.handshake("test").await.unwrap();
        let a = Node::entity("a");
        server.put_nodes(client, "base", vec![a.clone()]).await.unwrap();

        let proxy = NodesProxy::new(server.clone(), client, "base", ClientConfig::default());
        // The deletion is observed before the snapshot (which still lists a) is merged.
        proxy.on_invalidation(&record(InvalidationKind::Delete, &[&a.id]));
        proxy.bootstrap().await.unwrap();

        assert_eq!(proxy.len(), 1);
    }

    #[test]
    fn test_deleted_id_in_stale_snapshot_is_not_recounted() {
        let root = NodeId::new("root");
        let a = NodeId::new("a");
        let mut st = NodesState::default();

        // NEW then DELETE both arrive before a snapshot taken earlier.
        st.announce(a.clone());
        st.forget(a.clone());
        st.merge(vec![root.clone(), a.clone()], &root);

        assert_eq!(st.len, 1);
        assert!(st.known.contains(&root));
        assert!(!st.known.contains(&a));
        assert!(st.pending.is_empty());
        assert!(st.graveyard.is_empty());
    }

    #[test]
    fn test_graveyard_unused_after_merge() {
        let root = NodeId::new("root");
        let mut st = NodesState::default();
        st.merge(vec![root.clone()], &root);

        for i in 0..10 {
            let id = NodeId::new(format!("n{}", i));
            st.announce(id.clone());
            st.forget(id);
        }
        st.forget(NodeId::new("never-announced"));

        assert!(st.graveyard.is_empty());
        assert_eq!(st.len, 1);
        assert_eq!(st.deleted.len(), 10);
    }

    #[tokio::test]
    async fn test_remove_applies_on_notification() {
        let (api, client, proxy) = setup().await;
        let mut sub = api.subscribe(client, "base", Role::Reader).await.unwrap();
        let a = Node::entity("a");
        proxy.update(a.clone()).await.unwrap();
        assert_eq!(proxy.len(), 1);

        proxy.remove(&a.id).await.unwrap();
        while let Ok(Some(rec)) =
            tokio::time::timeout(Duration::from_millis(100), sub.stream.recv()).await
        {
            proxy.on_invalidation(&rec);
        }
        assert_eq!(proxy.len(), 1);
        assert_eq!(proxy.all().await.unwrap().len(), 1);
    }
}
