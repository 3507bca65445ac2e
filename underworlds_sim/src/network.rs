//! Simulated invalidation transport with fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use underworlds_env::{
    ClientId, EnvError, Invalidation, InvalidationNetwork, InvalidationSink, InvalidationStream,
    NetworkController,
};

/// Link counters for a simulation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub stalled: u64,
}

/// Network controller for fault injection.
///
/// Faults are per client and apply to every world link of that client.
pub struct SimNetworkController {
    /// Per-client latency in milliseconds
    link_latency: Mutex<HashMap<ClientId, u64>>,

    /// Per-client record loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<ClientId, f64>>,

    /// Clients whose deliveries hang
    partitioned: Mutex<HashSet<ClientId>>,

    /// Loss decisions
    rng: Mutex<ChaCha8Rng>,

    delivered: AtomicU64,
    dropped: AtomicU64,
    stalled: AtomicU64,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new(seed: u64) -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            partitioned: Mutex::new(HashSet::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            stalled: AtomicU64::new(0),
        }
    }

    /// Checks if deliveries to a client hang.
    pub fn is_partitioned(&self, client: ClientId) -> bool {
        self.partitioned.lock().contains(&client)
    }

    /// Gets the latency for a client (default 0).
    pub fn get_latency(&self, client: ClientId) -> u64 {
        *self.link_latency.lock().get(&client).unwrap_or(&0)
    }

    /// Gets the loss rate for a client (default 0.0).
    pub fn get_loss(&self, client: ClientId) -> f64 {
        *self.link_loss.lock().get(&client).unwrap_or(&0.0)
    }

    /// Rolls the loss dice for one record.
    fn should_drop(&self, client: ClientId) -> bool {
        let loss = self.get_loss(client);
        loss > 0.0 && self.rng.lock().gen_bool(loss)
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
        }
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, client: ClientId) {
        self.partitioned.lock().insert(client);
    }

    fn heal_all(&self) {
        self.partitioned.lock().clear();
    }

    fn set_link_latency(&self, client: ClientId, latency_ms: u64) {
        self.link_latency.lock().insert(client, latency_ms);
    }

    fn set_link_loss(&self, client: ClientId, loss_rate: f64) {
        self.link_loss.lock().insert(client, loss_rate.clamp(0.0, 1.0));
    }
}

/// Simulated subscription links, all governed by one controller.
pub struct SimNetwork {
    controller: Arc<SimNetworkController>,
    capacity: usize,
}

impl SimNetwork {
    pub fn new(controller: Arc<SimNetworkController>, capacity: usize) -> Self {
        Self {
            controller,
            capacity,
        }
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }
}

impl InvalidationNetwork for SimNetwork {
    type Sink = SimSink;

    fn connect(&self, client: ClientId, _world: &str) -> (SimSink, InvalidationStream) {
        let (tx, rx) = mpsc::channel(self.capacity);
        (
            SimSink {
                client,
                tx,
                controller: self.controller.clone(),
            },
            rx,
        )
    }
}

/// Server-side end of a simulated link.
pub struct SimSink {
    client: ClientId,
    tx: mpsc::Sender<Invalidation>,
    controller: Arc<SimNetworkController>,
}

#[async_trait]
impl InvalidationSink for SimSink {
    async fn deliver(&self, record: Invalidation) -> Result<(), EnvError> {
        if self.controller.is_partitioned(self.client) {
            self.controller.stalled.fetch_add(1, Ordering::Relaxed);
            std::future::pending::<()>().await;
        }

        let latency = self.controller.get_latency(self.client);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        // Subscription NOPs are control traffic and never lost
        if !record.is_nop() && self.controller.should_drop(self.client) {
            self.controller.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.tx
            .send(record)
            .await
            .map_err(|_| EnvError::unreachable(self.client))?;
        self.controller.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn client_id(&self) -> ClientId {
        self.client
    }
}
