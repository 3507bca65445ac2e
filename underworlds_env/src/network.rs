//! Invalidation transport abstraction between the server and its clients.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{ClientId, Invalidation};
use tokio::sync::mpsc;

/// Client-side end of a subscription: change records in publish order.
pub type InvalidationStream = mpsc::Receiver<Invalidation>;

/// Server-side end of one (client, world) subscription.
///
/// # Implementations
///
/// - **Production**: bounded tokio channel to an in-process proxy
/// - **Simulation**: channel with configurable latency/loss/partition
///
/// # Record Flow
///
/// ```text
/// Server bus                  Link                     Client proxy
///   |                           |                          |
///   |-- deliver(record) ------->|                          |
///   |                           |-- [latency/jitter] ----->|
///   |                           |                          |-- recv() -> record
/// ```
#[async_trait]
pub trait InvalidationSink: Send + Sync + 'static {
    /// Delivers one change record to the subscriber.
    ///
    /// # Returns
    /// * `Ok(())` - Record handed to the subscriber
    /// * `Err(EnvError::ClientUnreachable)` - The subscriber is gone
    ///
    /// # Blocking
    /// May block while the subscriber's queue is full. Callers bound this
    /// with their own timeout.
    async fn deliver(&self, record: Invalidation) -> Result<(), EnvError>;

    /// Returns the subscriber's client id.
    fn client_id(&self) -> ClientId;
}

/// Factory for subscription links.
pub trait InvalidationNetwork: Send + Sync + 'static {
    /// The server-side sink type produced by this network.
    type Sink: InvalidationSink;

    /// Opens a link for `client` on `world`, returning the server-side sink
    /// and the client-side stream.
    fn connect(&self, client: ClientId, world: &str) -> (Self::Sink, InvalidationStream);
}

/// Marker trait for link controllers in simulation.
///
/// Allows injecting faults like partitions and latency.
pub trait NetworkController: Send + Sync {
    /// Cuts every link to the given client (deliveries hang).
    fn partition(&self, client: ClientId);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets delivery latency for a client's links.
    fn set_link_latency(&self, client: ClientId, latency_ms: u64);

    /// Sets record loss probability for a client's links (0.0 - 1.0).
    fn set_link_loss(&self, client: ClientId, loss_rate: f64);
}
