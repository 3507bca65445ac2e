//! Simulation context implementing UnderworldsContext for deterministic testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug_span, Instrument};
use underworlds_env::UnderworldsContext;
use uuid::Uuid;

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `UnderworldsContext` using:
/// - A virtual clock that can be advanced manually
/// - A seeded ChaCha8 RNG for deterministic client and node ids
/// - Simulated sleep that advances virtual time
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Deterministic RNG for id generation
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock();
        *time += duration.as_nanos() as u64;
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        *self.virtual_time_ns.lock() = time_ns;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl UnderworldsContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleep advances virtual time, then lets other tasks run
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.instrument(debug_span!("sim_task", name = %name, seed = self.seed)))
    }

    fn generate_id(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.rng.lock().fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sim_context_deterministic_ids() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);

        // Same seed = same id sequence
        let a: Vec<Uuid> = (0..3).map(|_| ctx1.generate_id()).collect();
        let b: Vec<Uuid> = (0..3).map(|_| ctx2.generate_id()).collect();
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);

        // Different seed = different ids
        let other = SimContext::new(43);
        assert_ne!(other.generate_id(), a[0]);
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
        assert_eq!(
            ctx2.system_time().duration_since(UNIX_EPOCH).unwrap(),
            Duration::from_secs(1704067205)
        );
    }

    #[tokio::test]
    async fn test_sim_sleep_advances_clock() {
        let ctx = SimContext::new(7);
        ctx.sleep(Duration::from_millis(250)).await;
        assert_eq!(ctx.time_ns(), 250_000_000);
        ctx.set_time(0);
        assert_eq!(ctx.now(), Duration::ZERO);
    }
}
