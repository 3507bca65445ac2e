//! The Invalidation Bus - per-world fan-out of change records.
//!
//! Every (session, world) subscription owns a delivery worker fed by a
//! bounded queue. `publish` only enqueues, so it never blocks the writer
//! or other subscribers, and records reach a given subscriber in publish
//! order. Each delivery is bounded by the configured timeout. The first
//! failed delivery or queue overflow evicts the session from the registry
//! and from every world.
//!
//! ```text
//! publish ──┬─> queue(c1, w) ──> worker ──deliver/timeout──> sink(c1)
//!           └─> queue(c2, w) ──> worker ──deliver/timeout──> sink(c2)
//! ```

use crate::metrics::ServerMetrics;
use crate::server::registry::SessionRegistry;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use underworlds_env::{
    ClientId, Invalidation, InvalidationNetwork, InvalidationSink, InvalidationStream,
    UnderworldsContext,
};

struct Subscriber {
    /// Distinguishes this subscription from later ones of the same pair
    id: u64,
    queue: mpsc::Sender<Invalidation>,
    worker: JoinHandle<()>,
}

/// State shared between the bus and its delivery workers.
struct BusShared {
    subscribers: Mutex<HashMap<String, BTreeMap<ClientId, Subscriber>>>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
    delivery_timeout: Duration,
    queue_capacity: usize,
    next_id: AtomicU64,
}

impl BusShared {
    fn is_current(&self, client: ClientId, world: &str, id: u64) -> bool {
        self.subscribers
            .lock()
            .get(world)
            .and_then(|subs| subs.get(&client))
            .map(|sub| sub.id == id)
            .unwrap_or(false)
    }

    /// Evicts `client` unless the failing subscription was already closed
    /// or replaced.
    fn fail(&self, client: ClientId, world: &str, id: u64, reason: &str) {
        self.metrics.record_failure();
        if self.is_current(client, world, id) {
            self.evict(client, reason);
        } else {
            debug!(
                "Ignoring failure of closed subscription of {} on {}: {}",
                client, world, reason
            );
        }
    }

    /// Drops every subscription of `client` and removes it from the registry.
    fn evict(&self, client: ClientId, reason: &str) {
        let removed = self.detach(client);
        for sub in removed {
            sub.worker.abort();
        }
        if self.registry.evict(client) {
            self.metrics.record_eviction();
            warn!("Evicted client {}: {}", client, reason);
        }
    }

    fn detach(&self, client: ClientId) -> Vec<Subscriber> {
        let mut subscribers = self.subscribers.lock();
        let mut removed = Vec::new();
        for world_subs in subscribers.values_mut() {
            if let Some(sub) = world_subs.remove(&client) {
                removed.push(sub);
            }
        }
        subscribers.retain(|_, subs| !subs.is_empty());
        removed
    }
}

/// Publish/subscribe channel for all worlds of one server.
pub struct InvalidationBus<Ctx, Net> {
    context: Arc<Ctx>,
    network: Arc<Net>,
    shared: Arc<BusShared>,
}

impl<Ctx, Net> InvalidationBus<Ctx, Net>
where
    Ctx: UnderworldsContext,
    Net: InvalidationNetwork,
{
    pub fn new(
        context: Arc<Ctx>,
        network: Arc<Net>,
        registry: Arc<SessionRegistry>,
        metrics: Arc<ServerMetrics>,
        delivery_timeout: Duration,
        queue_capacity: usize,
    ) -> Self {
        Self {
            context,
            network,
            shared: Arc::new(BusShared {
                subscribers: Mutex::new(HashMap::new()),
                registry,
                metrics,
                delivery_timeout,
                queue_capacity: queue_capacity.max(1),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Opens a subscription for `client` on `world`.
    ///
    /// The first record on the returned stream is always a NOP, so the
    /// subscriber can tell when every later publish is guaranteed to reach it.
    /// Re-subscribing replaces the previous subscription; the replaced
    /// worker finishes its backlog without affecting the session.
    pub fn subscribe(&self, client: ClientId, world: &str) -> InvalidationStream {
        let (sink, stream) = self.network.connect(client, world);
        let (queue, pending) = mpsc::channel(self.shared.queue_capacity);
        if queue.try_send(Invalidation::nop(world)).is_err() {
            debug!("Could not queue the NOP of {} on {}", client, world);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.shared.subscribers.lock();
        let worker = self.context.spawn(
            "invalidation-delivery",
            delivery_worker(self.shared.clone(), sink, world.to_string(), id, pending),
        );
        let previous = subscribers
            .entry(world.to_string())
            .or_default()
            .insert(client, Subscriber { id, queue, worker });
        drop(subscribers);

        if previous.is_some() {
            debug!("Client {} re-subscribed to world {}", client, world);
        }
        stream
    }

    /// Enqueues a record for every current subscriber of its world.
    ///
    /// A subscriber whose backlog is full is evicted.
    pub fn publish(&self, record: Invalidation) {
        let mut overflowed = Vec::new();
        {
            let subscribers = self.shared.subscribers.lock();
            if let Some(world_subs) = subscribers.get(&record.world) {
                for (client, sub) in world_subs {
                    match sub.queue.try_send(record.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => overflowed.push(*client),
                        Err(TrySendError::Closed(_)) => {
                            debug!("Dropped record for finished worker of {}", client);
                        }
                    }
                }
            }
        }
        self.shared.metrics.record_published();

        for client in overflowed {
            self.shared.metrics.record_failure();
            self.shared.evict(
                client,
                &format!(
                    "more than {} undelivered records on {}",
                    self.shared.queue_capacity, record.world
                ),
            );
        }
    }

    /// Closes one subscription after its pending deliveries resolve.
    pub async fn unsubscribe(&self, client: ClientId, world: &str) -> bool {
        let removed = {
            let mut subscribers = self.shared.subscribers.lock();
            let sub = subscribers.get_mut(world).and_then(|subs| subs.remove(&client));
            subscribers.retain(|_, subs| !subs.is_empty());
            sub
        };

        match removed {
            Some(sub) => {
                drain(sub).await;
                true
            }
            None => false,
        }
    }

    /// Closes every subscription of `client`, awaiting pending deliveries.
    pub async fn close_client(&self, client: ClientId) {
        let removed = self.shared.detach(client);
        for sub in removed {
            drain(sub).await;
        }
    }

    /// Closes every subscription of every client.
    pub async fn shutdown(&self) {
        let removed: Vec<Subscriber> = {
            let mut subscribers = self.shared.subscribers.lock();
            subscribers
                .drain()
                .flat_map(|(_, subs)| subs.into_values())
                .collect()
        };
        for sub in removed {
            drain(sub).await;
        }
    }

    pub fn is_subscribed(&self, client: ClientId, world: &str) -> bool {
        self.shared
            .subscribers
            .lock()
            .get(world)
            .map(|subs| subs.contains_key(&client))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, world: &str) -> usize {
        self.shared
            .subscribers
            .lock()
            .get(world)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

/// Closing the queue lets the worker finish what is already enqueued.
async fn drain(sub: Subscriber) {
    drop(sub.queue);
    if let Err(e) = sub.worker.await {
        if !e.is_cancelled() {
            warn!("Delivery worker failed: {}", e);
        }
    }
}

async fn delivery_worker<S: InvalidationSink>(
    shared: Arc<BusShared>,
    sink: S,
    world: String,
    id: u64,
    mut pending: mpsc::Receiver<Invalidation>,
) {
    let client = sink.client_id();

    while let Some(record) = pending.recv().await {
        let kind = record.kind;
        match tokio::time::timeout(shared.delivery_timeout, sink.deliver(record)).await {
            Ok(Ok(())) => {
                shared.metrics.record_delivery();
                debug!("Delivered {:?} on {} to {}", kind, world, client);
            }
            Ok(Err(e)) => {
                shared.fail(client, &world, id, &format!("delivery on {} failed: {}", world, e));
                return;
            }
            Err(_) => {
                shared.fail(
                    client,
                    &world,
                    id,
                    &format!(
                        "delivery on {} timed out after {:?}",
                        world, shared.delivery_timeout
                    ),
                );
                return;
            }
        }
    }
}
