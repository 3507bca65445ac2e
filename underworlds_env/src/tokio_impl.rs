//! Production implementation of the environment using Tokio.

use crate::error::EnvError;
use crate::network::{InvalidationNetwork, InvalidationSink, InvalidationStream};
use crate::types::{ClientId, Invalidation};
use crate::UnderworldsContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug_span, Instrument};
use uuid::Uuid;

/// Production context backed by Tokio and the system clock.
///
/// This is the "real" implementation used in production deployments.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UnderworldsContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.instrument(debug_span!("task", name = %name)))
    }

    fn generate_id(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

/// In-process subscription links backed by bounded tokio channels.
#[derive(Debug, Clone)]
pub struct ChannelNetwork {
    /// Per-link queue depth before `deliver` starts waiting
    capacity: usize,
}

impl ChannelNetwork {
    /// Creates a network whose links buffer up to `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl Default for ChannelNetwork {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InvalidationNetwork for ChannelNetwork {
    type Sink = ChannelSink;

    fn connect(&self, client: ClientId, _world: &str) -> (ChannelSink, InvalidationStream) {
        let (tx, rx) = mpsc::channel(self.capacity);
        (ChannelSink { client, tx }, rx)
    }
}

/// Server-side end of an in-process link.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    client: ClientId,
    tx: mpsc::Sender<Invalidation>,
}

#[async_trait]
impl InvalidationSink for ChannelSink {
    async fn deliver(&self, record: Invalidation) -> Result<(), EnvError> {
        self.tx
            .send(record)
            .await
            .map_err(|_| EnvError::unreachable(self.client))
    }

    fn client_id(&self) -> ClientId {
        self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InvalidationKind, InvalidationTarget};

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_tokio_context_ids_are_unique() {
        let ctx = TokioContext::new();
        assert_ne!(ctx.generate_id(), ctx.generate_id());
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }

    #[tokio::test]
    async fn test_tokio_context_spawn_joinable() {
        let ctx = TokioContext::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = ctx.spawn("test", async move {
            let _ = tx.send(42u32);
        });
        handle.await.unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_channel_link_preserves_order() {
        let network = ChannelNetwork::new(8);
        let client = ClientId::from_seed(1);
        let (sink, mut stream) = network.connect(client, "base");

        sink.deliver(Invalidation::nop("base")).await.unwrap();
        sink.deliver(Invalidation::new(
            "base",
            InvalidationTarget::Scene,
            InvalidationKind::New,
            vec!["a".to_string()],
        ))
        .await
        .unwrap();

        assert!(stream.recv().await.unwrap().is_nop());
        assert_eq!(stream.recv().await.unwrap().kind, InvalidationKind::New);
        assert_eq!(sink.client_id(), client);
    }

    #[tokio::test]
    async fn test_channel_link_reports_dropped_receiver() {
        let network = ChannelNetwork::new(8);
        let (sink, stream) = network.connect(ClientId::from_seed(2), "base");
        drop(stream);

        let err = sink.deliver(Invalidation::nop("base")).await.unwrap_err();
        assert!(err.is_unreachable());
    }
}
