//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::network::{SimNetwork, SimNetworkController};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use underworlds_core::{
    ClientConfig, Context, InMemoryMeshStore, MetricsSnapshot, Node, NodeId, NodeType,
    ServerConfig, UnderworldsApi, UnderworldsServer, UwdsError,
};
use underworlds_env::UnderworldsContext;

/// Server type used by every simulation.
pub type SimServer = UnderworldsServer<SimContext, SimNetwork>;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of client sessions
    pub num_clients: usize,

    /// Nodes written by each writing client
    pub nodes_per_client: usize,

    /// Server-side bound on a single delivery
    pub delivery_timeout_ms: u64,

    /// Client-side wait for expected notifications
    pub propagation_window_ms: u64,

    /// Buffered records per link
    pub link_capacity: usize,

    /// Virtual time allowed for replicas to converge
    pub settle_timeout_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_clients: 3,
            nodes_per_client: 10,
            delivery_timeout_ms: 1000,
            propagation_window_ms: 50,
            link_capacity: 1024,
            settle_timeout_ms: 30_000,
        }
    }
}

/// The SimWorld - one server, its simulated links and a virtual clock.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub network_controller: Arc<SimNetworkController>,

    /// The server under test
    pub server: Arc<SimServer>,

    /// Mesh store, kept to count stored blobs
    pub meshes: Arc<InMemoryMeshStore>,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        // Derive separate seeds for different subsystems
        let context_seed = config.seed;
        let link_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let context = SimContext::shared(context_seed);
        let network_controller = Arc::new(SimNetworkController::new(link_seed));
        let network = Arc::new(SimNetwork::new(
            network_controller.clone(),
            config.link_capacity,
        ));
        let meshes = Arc::new(InMemoryMeshStore::new());

        let server_config = ServerConfig::default()
            .with_delivery_timeout(Duration::from_millis(config.delivery_timeout_ms))
            .with_subscriber_capacity(config.link_capacity);
        let server = Arc::new(
            UnderworldsServer::new(context.clone(), network, server_config)
                .with_mesh_store(meshes.clone()),
        );

        Self {
            config,
            context,
            network_controller,
            server,
            meshes,
        }
    }

    pub fn api(&self) -> Arc<dyn UnderworldsApi> {
        self.server.clone()
    }

    pub fn client_config(&self, name: &str) -> ClientConfig {
        ClientConfig::new(name)
            .with_propagation_window(Duration::from_millis(self.config.propagation_window_ms))
    }

    /// Opens one client session.
    pub async fn connect(&self, name: &str) -> Result<Context, UwdsError> {
        Context::connect(self.api(), self.client_config(name)).await
    }

    /// Opens `num_clients` sessions (at least two).
    pub async fn connect_all(&self) -> Result<Vec<Context>, UwdsError> {
        let mut clients = Vec::new();
        for i in 0..self.config.num_clients.max(2) {
            clients.push(self.connect(&format!("client-{}", i)).await?);
        }
        Ok(clients)
    }

    /// An entity node with a seed-derived id.
    pub fn entity(&self, name: impl Into<String>) -> Node {
        Node::with_id(
            NodeId::from(self.context.generate_id()),
            name,
            NodeType::Entity,
        )
    }

    /// Advances the virtual clock and the runtime's timers together.
    pub async fn advance(&self, duration: Duration) {
        self.context.advance_time(duration);
        tokio::time::sleep(duration).await;
    }

    /// Steps time until `condition` holds or the settle timeout elapses.
    pub async fn settle(&self, condition: impl Fn() -> bool) -> bool {
        let step = Duration::from_millis(5);
        let steps = self.config.settle_timeout_ms / 5;
        for _ in 0..steps {
            if condition() {
                return true;
            }
            self.advance(step).await;
        }
        condition()
    }

    pub async fn stats(&self) -> MetricsSnapshot {
        self.server.stats().await.unwrap_or_default()
    }

    /// Closes every subscription, waiting for pending deliveries.
    pub async fn shutdown(&self) {
        self.server.shutdown().await;
    }
}
