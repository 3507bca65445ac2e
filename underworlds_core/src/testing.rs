//! Test doubles shared by the unit tests of this crate.

use async_trait::async_trait;
use tokio::sync::mpsc;
use underworlds_env::{
    ClientId, EnvError, Invalidation, InvalidationNetwork, InvalidationSink, InvalidationStream,
};

/// Links whose deliveries never complete, as if the client stopped reading.
#[derive(Debug, Default)]
pub struct StalledNetwork;

pub struct StalledSink {
    client: ClientId,
    _keepalive: mpsc::Sender<Invalidation>,
}

#[async_trait]
impl InvalidationSink for StalledSink {
    async fn deliver(&self, _record: Invalidation) -> Result<(), EnvError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    fn client_id(&self) -> ClientId {
        self.client
    }
}

impl InvalidationNetwork for StalledNetwork {
    type Sink = StalledSink;

    fn connect(&self, client: ClientId, _world: &str) -> (StalledSink, InvalidationStream) {
        let (tx, rx) = mpsc::channel(1);
        (
            StalledSink {
                client,
                _keepalive: tx,
            },
            rx,
        )
    }
}
