//! Core environment context trait for the Underworlds server and clients.

use crate::types::Timestamp;
use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the replication engine can
/// run in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, UUID v4
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)` ids
///
/// # Determinism
///
/// For DST, all methods that would normally introduce non-determinism
/// (time, id generation) are controlled by the implementation.
#[async_trait]
pub trait UnderworldsContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for uptime and duration measurements.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Returns the wall-clock time as a replication timestamp.
    fn timestamp(&self) -> Timestamp {
        Timestamp::from_system_time(self.system_time())
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock and yields
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task and returns its handle so callers can join
    /// on it at teardown.
    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static;

    /// Generates a fresh unique identifier (client ids, node ids).
    fn generate_id(&self) -> Uuid;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
