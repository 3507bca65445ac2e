//! Scenario runner - executes chaos engineering test scenarios.
//!
//! Every scenario runs on a fresh `SimWorld` inside a current-thread tokio
//! runtime with paused time: timers (delivery timeouts, link latency,
//! propagation windows) fire in virtual time, so a run is reproducible from
//! its seed.

use crate::network::LinkStats;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use underworlds_core::types::Material;
use underworlds_core::{Mesh, MeshStore, Node, NodeId, UwdsError};
use underworlds_env::{InvalidationKind, NetworkController, UnderworldsContext};

/// Why a scenario failed.
#[derive(Debug, Error)]
pub enum ScenarioFailure {
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("client error: {0}")]
    Client(#[from] UwdsError),
}

type Outcome = Result<(), ScenarioFailure>;

macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(ScenarioFailure::Assertion(format!($($arg)+)));
        }
    };
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Change records published by the server
    pub records_published: u64,

    /// Successful deliveries seen by the bus
    pub deliveries: u64,

    /// Deliveries that failed or timed out
    pub delivery_failures: u64,

    /// Sessions evicted
    pub evictions: u64,

    /// Link-level counters
    pub links: LinkStats,
}

/// Runs chaos scenarios.
pub struct ScenarioRunner {
    config: SimConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_clients: usize) -> Self {
        Self {
            config: SimConfig {
                seed,
                num_clients,
                ..SimConfig::default()
            },
        }
    }

    pub fn from_config(config: SimConfig) -> Self {
        Self { config }
    }

    /// Sets the number of nodes each writer creates.
    pub fn with_nodes(mut self, nodes_per_client: usize) -> Self {
        self.config.nodes_per_client = nodes_per_client;
        self
    }

    /// Sets the server's delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout_ms: u64) -> Self {
        self.config.delivery_timeout_ms = timeout_ms;
        self
    }

    /// Sets the client propagation window.
    pub fn with_propagation_window(mut self, window_ms: u64) -> Self {
        self.config.propagation_window_ms = window_ms;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);

        if scenario.is_degraded() {
            warn!("Degraded links in this scenario");
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.execute(scenario)),
            Err(e) => ScenarioResult {
                scenario,
                seed: self.config.seed,
                passed: false,
                final_time_secs: 0.0,
                failure_reason: Some(format!("could not start the runtime: {}", e)),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    async fn execute(&self, scenario: ScenarioId) -> ScenarioResult {
        let world = SimWorld::new(self.config.clone());

        let outcome = match scenario {
            ScenarioId::CreateObserve => self.run_create_observe(&world).await,
            ScenarioId::DeleteOrdering => self.run_delete_ordering(&world).await,
            ScenarioId::Reparenting => self.run_reparenting(&world).await,
            ScenarioId::IndexStability => self.run_index_stability(&world).await,
            ScenarioId::MeshDedup => self.run_mesh_dedup(&world).await,
            ScenarioId::SessionEviction => self.run_session_eviction(&world).await,
            ScenarioId::ConcurrentWriters => self.run_concurrent_writers(&world).await,
            ScenarioId::SlowLink => self.run_slow_link(&world).await,
            ScenarioId::LossyLink => self.run_lossy_link(&world).await,
        };

        world.shutdown().await;
        let stats = world.stats().await;
        let metrics = ScenarioMetrics {
            records_published: stats.records_published,
            deliveries: stats.deliveries,
            delivery_failures: stats.delivery_failures,
            evictions: stats.evictions,
            links: world.network_controller.stats(),
        };
        debug!("{} metrics: {:?}", scenario.name(), metrics);

        ScenarioResult {
            scenario,
            seed: self.config.seed,
            passed: outcome.is_ok(),
            final_time_secs: world.context.now().as_secs_f64(),
            failure_reason: outcome.err().map(|e| e.to_string()),
            metrics,
        }
    }

    fn node_count(&self) -> usize {
        self.config.nodes_per_client.max(3)
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.delivery_timeout_ms)
    }

    /// DST-001: CreateObserve.
    ///
    /// **Assertion**: every other replica reports len + N and the node names.
    async fn run_create_observe(&self, world: &SimWorld) -> Outcome {
        info!("DST-001: CreateObserve - one writer, many readers");

        let clients = world.connect_all().await?;
        let mut replicas = Vec::new();
        for client in &clients {
            replicas.push(client.world("base").await?);
        }
        let before: Vec<usize> = replicas.iter().map(|r| r.scene().len()).collect();

        let writer = &replicas[0];
        let root = writer.scene().root().await?.id;
        let nodes: Vec<Node> = (0..self.node_count())
            .map(|i| world.entity(format!("test-{}", i)).with_parent(root.clone()))
            .collect();
        writer.scene().update_all(nodes.clone()).await?;

        for (i, replica) in replicas.iter().enumerate().skip(1) {
            let expected = before[i] + nodes.len();
            check!(
                world.settle(|| replica.scene().len() == expected).await,
                "client-{} reports {} nodes, expected {}",
                i,
                replica.scene().len(),
                expected
            );
            for node in &nodes {
                let seen = replica.scene().get_by_id(&node.id).await?;
                check!(seen.name == node.name, "client-{} sees {} as {}", i, node.id, seen.name);
                check!(
                    seen.parent.as_ref() == Some(&root),
                    "client-{} sees {} outside root",
                    i,
                    node.id
                );
            }
        }
        Ok(())
    }

    /// DST-002: DeleteOrdering.
    ///
    /// **Assertion**: a monitor drains exactly UPDATE(root), DELETE(node).
    async fn run_delete_ordering(&self, world: &SimWorld) -> Outcome {
        info!("DST-002: DeleteOrdering - two records, in order");

        let writer = world.connect("writer").await?;
        let observer = world.connect("observer").await?;
        let replica = writer.world("base").await?;
        let root = replica.scene().root().await?.id;

        let node = world.entity("doomed");
        replica.scene().update(node.clone()).await?;

        let mut monitor = observer.monitor("base").await?;
        replica.scene().remove(&node.id).await?;

        let first = monitor.next_timeout(self.window()).await;
        let second = monitor.next_timeout(self.window()).await;
        let extra = monitor.next_timeout(self.window()).await;

        let first = first.ok_or_else(|| assertion("no record after delete"))?;
        let second = second.ok_or_else(|| assertion("only one record after delete"))?;
        check!(
            first.kind == InvalidationKind::Update && first.ids == vec![root.0.clone()],
            "first record was {:?} {:?}",
            first.kind,
            first.ids
        );
        check!(
            second.kind == InvalidationKind::Delete && second.ids == vec![node.id.0.clone()],
            "second record was {:?} {:?}",
            second.kind,
            second.ids
        );
        check!(extra.is_none(), "unexpected third record {:?}", extra);

        monitor.close().await?;
        Ok(())
    }

    /// DST-003: Reparenting.
    ///
    /// **Assertion**: children of a deleted node end under root, each
    /// reparenting is its own record and replicas converge.
    async fn run_reparenting(&self, world: &SimWorld) -> Outcome {
        info!("DST-003: Reparenting - orphans move to root");

        let writer = world.connect("writer").await?;
        let reader = world.connect("reader").await?;
        let w = writer.world("base").await?;
        let r = reader.world("base").await?;
        let root = w.scene().root().await?.id;

        let parent = world.entity("parent");
        let children = vec![
            world.entity("child-1").with_parent(parent.id.clone()),
            world.entity("child-2").with_parent(parent.id.clone()),
        ];
        let mut batch = vec![parent.clone()];
        batch.extend(children.iter().cloned());
        w.scene().update_all(batch).await?;
        check!(
            world.settle(|| r.scene().len() == 4).await,
            "reader saw {} nodes after creation",
            r.scene().len()
        );

        let mut monitor = observer_of(world, "monitor").await?;
        w.scene().remove(&parent.id).await?;

        let mut updated = BTreeSet::new();
        let mut deleted = None;
        while let Some(record) = monitor.next_timeout(self.window()).await {
            match record.kind {
                InvalidationKind::Update => updated.extend(record.ids),
                InvalidationKind::Delete => {
                    deleted = record.ids.first().cloned();
                    break;
                }
                other => return Err(assertion(format!("unexpected {:?} record", other))),
            }
        }
        let expected: BTreeSet<String> = children
            .iter()
            .map(|c| c.id.0.clone())
            .chain(std::iter::once(root.0.clone()))
            .collect();
        check!(updated == expected, "updated {:?}, expected {:?}", updated, expected);
        check!(deleted == Some(parent.id.0.clone()), "deleted {:?}", deleted);

        check!(
            world.settle(|| r.scene().len() == 3).await,
            "reader saw {} nodes after deletion",
            r.scene().len()
        );
        for child in &children {
            let seen = r.scene().get_by_id(&child.id).await?;
            check!(
                seen.parent.as_ref() == Some(&root),
                "{} still has parent {:?}",
                child.id,
                seen.parent
            );
        }
        let root_node = r.scene().root().await?;
        check!(
            children.iter().all(|c| root_node.children.contains(&c.id)),
            "root children {:?}",
            root_node.children
        );
        Ok(())
    }

    /// DST-004: IndexStability.
    ///
    /// **Assertion**: removing entry k keeps indices below k and shifts the
    /// rest down by one.
    async fn run_index_stability(&self, world: &SimWorld) -> Outcome {
        info!("DST-004: IndexStability - resolved indices survive removals");

        let writer = world.connect("writer").await?;
        let reader = world.connect("reader").await?;
        let w = writer.world("base").await?;
        let r = reader.world("base").await?;

        let nodes: Vec<Node> = (0..self.node_count())
            .map(|i| world.entity(format!("n{}", i)))
            .collect();
        w.scene().update_all(nodes.clone()).await?;
        let total = nodes.len() + 1;
        check!(
            world.settle(|| r.scene().len() == total).await,
            "reader saw {} of {} nodes",
            r.scene().len(),
            total
        );

        let resolved: Vec<NodeId> = r.scene().all().await?.into_iter().map(|n| n.id).collect();
        let removed = 1 + nodes.len() / 2;
        w.scene().remove(&resolved[removed]).await?;
        check!(
            world.settle(|| r.scene().len() == total - 1).await,
            "reader still reports {} nodes",
            r.scene().len()
        );

        for index in 0..total - 1 {
            let expected = if index < removed {
                &resolved[index]
            } else {
                &resolved[index + 1]
            };
            let seen = r.scene().get(index).await?;
            check!(
                &seen.id == expected,
                "index {} holds {}, expected {}",
                index,
                seen.id,
                expected
            );
        }
        Ok(())
    }

    /// DST-005: MeshDedup.
    ///
    /// **Assertion**: the second upload of identical geometry is skipped and
    /// the store holds one blob per distinct content.
    async fn run_mesh_dedup(&self, world: &SimWorld) -> Outcome {
        info!("DST-005: MeshDedup - content-addressed uploads");

        let a = world.connect("uploader-a").await?;
        let b = world.connect("uploader-b").await?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mesh = random_mesh(&mut rng, 64);

        let id = a.push_mesh(mesh.clone()).await?;
        check!(b.has_mesh(&id).await?, "mesh {} missing after first upload", id);
        let again = b.push_mesh(mesh.clone()).await?;
        check!(again == id, "same content hashed to {} and {}", id, again);
        check!(world.meshes.len() == 1, "{} blobs stored", world.meshes.len());

        let mut other = mesh.clone();
        other.vertices[0][0] += 1.0;
        let other_id = b.push_mesh(other).await?;
        check!(other_id != id, "distinct content shares hash {}", id);
        check!(world.meshes.len() == 2, "{} blobs stored", world.meshes.len());

        let fetched = a.mesh(&id).await?;
        check!(fetched == mesh, "mesh {} came back altered", id);

        let replica = a.world("base").await?;
        let mut node = Node::mesh("blob", vec![id.clone(), other_id]);
        node.id = world.entity("blob").id;
        replica.scene().update(node.clone()).await?;
        let stored = b.world("base").await?.scene().get_by_id(&node.id).await?;
        check!(
            stored.properties.mesh_ids.len() == 2,
            "node lost its mesh references"
        );
        Ok(())
    }

    /// DST-006: SessionEviction.
    ///
    /// **Assertion**: a partitioned subscriber is gone from the topology once
    /// its deliveries time out, and its session is unusable.
    async fn run_session_eviction(&self, world: &SimWorld) -> Outcome {
        info!("DST-006: SessionEviction - unresponsive reader");

        let writer = world.connect("writer").await?;
        let victim = world.connect("victim").await?;
        let w = writer.world("base").await?;
        let v = victim.world("base").await?;

        world.network_controller.partition(victim.id());
        w.scene().update(world.entity("first")).await?;
        w.scene().update(world.entity("second")).await?;
        world.advance(self.window() * 3).await;

        let topology = writer.topology().await?;
        check!(
            !topology.contains_client(&victim.id()),
            "victim {} still in topology",
            victim.id()
        );
        check!(
            topology.contains_client(&writer.id()),
            "writer was evicted too"
        );
        check!(
            matches!(victim.topology().await, Err(UwdsError::UnknownClient(_))),
            "evicted session still answers"
        );
        check!(
            world.settle(|| !v.is_listening()).await,
            "victim's listener still running"
        );
        let evictions = world.stats().await.evictions;
        check!(evictions == 1, "{} evictions", evictions);

        // Healing does not resurrect the session
        world.network_controller.heal_all();
        w.scene().update(world.entity("third")).await?;
        world.advance(self.window()).await;
        check!(
            !writer.topology().await?.contains_client(&victim.id()),
            "victim came back after heal"
        );
        Ok(())
    }

    /// DST-007: ConcurrentWriters.
    ///
    /// **Assertion**: with every client writing at once (including nested
    /// parents), all replicas converge on the server's node set and the
    /// hierarchy stays consistent.
    async fn run_concurrent_writers(&self, world: &SimWorld) -> Outcome {
        info!("DST-007: ConcurrentWriters - everyone writes");

        let clients = world.connect_all().await?;
        let mut replicas = Vec::new();
        for client in &clients {
            replicas.push(client.world("base").await?);
        }
        let root = replicas[0].scene().root().await?.id;

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut handles = Vec::new();
        for (c, replica) in replicas.iter().enumerate() {
            let mut parents = vec![root.clone()];
            let mut batch = Vec::new();
            for i in 0..self.node_count() {
                let parent = parents[rng.gen_range(0..parents.len())].clone();
                let node = world
                    .entity(format!("w{}-n{}", c, i))
                    .with_parent(parent);
                parents.push(node.id.clone());
                batch.push(node);
            }

            let replica = Arc::clone(replica);
            handles.push(tokio::spawn(async move {
                for node in batch {
                    replica.scene().update(node).await?;
                }
                Ok::<(), UwdsError>(())
            }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| assertion(format!("writer task failed: {}", e)))??;
        }

        let api = world.api();
        let server_ids: BTreeSet<NodeId> = api
            .world_node_ids(clients[0].id(), "base")
            .await?
            .into_iter()
            .collect();
        let expected = 1 + replicas.len() * self.node_count();
        check!(
            server_ids.len() == expected,
            "server holds {} nodes, expected {}",
            server_ids.len(),
            expected
        );

        for (i, replica) in replicas.iter().enumerate() {
            check!(
                world.settle(|| replica.scene().len() == expected).await,
                "client-{} reports {} of {} nodes",
                i,
                replica.scene().len(),
                expected
            );
            let nodes = replica.scene().all().await?;
            let ids: BTreeSet<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
            check!(ids == server_ids, "client-{} resolved a different node set", i);
            for node in nodes.iter().filter(|n| !n.is_root()) {
                let attached = node.parent.as_ref().map_or(false, |p| ids.contains(p));
                check!(
                    attached,
                    "client-{}: {} has dangling parent {:?}",
                    i,
                    node.id,
                    node.parent
                );
            }
        }
        Ok(())
    }

    /// DST-008: SlowLink.
    ///
    /// **Assertion**: latency below the delivery timeout delays convergence
    /// but never evicts.
    async fn run_slow_link(&self, world: &SimWorld) -> Outcome {
        info!("DST-008: SlowLink - 300ms per delivery");

        let writer = world.connect("writer").await?;
        let reader = world.connect("reader").await?;
        world.network_controller.set_link_latency(reader.id(), 300);

        let w = writer.world("base").await?;
        let r = reader.world("base").await?;
        let nodes: Vec<Node> = (0..self.node_count())
            .map(|i| world.entity(format!("slow-{}", i)))
            .collect();
        let started = world.context.now();
        w.scene().update_all(nodes.clone()).await?;

        let total = nodes.len() + 1;
        check!(
            world.settle(|| r.scene().len() == total).await,
            "reader saw {} of {} nodes",
            r.scene().len(),
            total
        );
        let elapsed = world.context.now() - started;
        debug!("Converged after {:?} of virtual time", elapsed);
        check!(
            elapsed >= Duration::from_millis(300),
            "converged in {:?}, faster than the link",
            elapsed
        );
        check!(
            writer.topology().await?.contains_client(&reader.id()),
            "slow reader was evicted"
        );
        Ok(())
    }

    /// DST-009: LossyLink.
    ///
    /// **Assertion**: every node the lossy replica resolves matches the
    /// server; missing records only ever surface as errors, never as wrong
    /// data.
    async fn run_lossy_link(&self, world: &SimWorld) -> Outcome {
        info!("DST-009: LossyLink - 30% record loss");

        let writer = world.connect("writer").await?;
        let reader = world.connect("reader").await?;
        world.network_controller.set_link_loss(reader.id(), 0.3);

        let w = writer.world("base").await?;
        let r = reader.world("base").await?;
        let nodes: Vec<Node> = (0..self.node_count() * 2)
            .map(|i| world.entity(format!("lossy-{}", i)))
            .collect();
        w.scene().update_all(nodes).await?;
        world.advance(self.window()).await;

        let api = world.api();
        let mut resolved = 0;
        let mut errors = 0;
        for index in 0..r.scene().len() {
            match r.scene().get(index).await {
                Ok(node) => {
                    let truth = api.get_node(writer.id(), "base", &node.id).await?;
                    check!(
                        node.name == truth.name && node.parent == truth.parent,
                        "replica holds a wrong copy of {}",
                        node.id
                    );
                    resolved += 1;
                }
                Err(UwdsError::Inconsistency(_)) | Err(UwdsError::IndexOutOfRange { .. }) => {
                    errors += 1
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Lossy replica resolved {} nodes, {} errors", resolved, errors);
        check!(resolved >= 1, "root was never resolved");
        check!(
            writer.topology().await?.contains_client(&reader.id()),
            "lossy reader was evicted"
        );
        Ok(())
    }
}

fn assertion(message: impl Into<String>) -> ScenarioFailure {
    ScenarioFailure::Assertion(message.into())
}

async fn observer_of(
    world: &SimWorld,
    name: &str,
) -> Result<underworlds_core::WorldMonitor, UwdsError> {
    world.connect(name).await?.monitor("base").await
}

/// Seeded triangle soup.
fn random_mesh(rng: &mut ChaCha8Rng, triangles: usize) -> Mesh {
    let mut mesh = Mesh {
        material: Material {
            diffuse: [rng.gen(), rng.gen(), rng.gen(), 1.0],
        },
        ..Mesh::default()
    };
    for t in 0..triangles {
        for _ in 0..3 {
            mesh.vertices.push([rng.gen(), rng.gen(), rng.gen()]);
            mesh.normals.push([0.0, 0.0, 1.0]);
        }
        let base = (t * 3) as u32;
        mesh.faces.push([base, base + 1, base + 2]);
    }
    mesh
}
