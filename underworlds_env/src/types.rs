//! Common types for the Underworlds environment abstraction.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a connected client session.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Creates a new random ClientId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a ClientId from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic ClientId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Wall-clock instant, in microseconds since the UNIX epoch.
///
/// Server-assigned `last_update` stamps and timeline bounds use this type so
/// that they survive serialization without float rounding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The UNIX epoch.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Converts a wall-clock time. Times before the epoch clamp to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        let micros = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self(micros)
    }

    /// Returns the timestamp as fractional seconds since the epoch.
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Returns the elapsed time since `earlier` (zero if `earlier` is later).
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    /// Returns `self` if it is strictly after `previous`, otherwise the
    /// smallest timestamp that is.
    pub fn after(self, previous: Timestamp) -> Timestamp {
        if self > previous {
            self
        } else {
            Timestamp(previous.0 + 1)
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}", self.as_secs_f64())
    }
}

/// Which half of a world a change record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationTarget {
    /// Scene nodes
    Scene,
    /// Timeline situations
    Timeline,
}

/// The kind of change carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationKind {
    /// Reserved no-op, used to confirm a subscription is live
    Nop,
    /// The ids were created
    New,
    /// The ids were modified
    Update,
    /// The ids were removed
    Delete,
}

/// A change record broadcast to every subscriber of a world.
///
/// This is a transport-level envelope: ids are opaque strings that the
/// receiving proxy resolves against the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// World the change happened in
    pub world: String,

    /// Scene or timeline
    pub target: InvalidationTarget,

    /// What happened to the ids
    pub kind: InvalidationKind,

    /// Affected node or situation ids
    pub ids: Vec<String>,
}

impl Invalidation {
    /// Creates a change record.
    pub fn new(
        world: impl Into<String>,
        target: InvalidationTarget,
        kind: InvalidationKind,
        ids: Vec<String>,
    ) -> Self {
        Self {
            world: world.into(),
            target,
            kind,
            ids,
        }
    }

    /// Creates the reserved no-op record for a world.
    pub fn nop(world: impl Into<String>) -> Self {
        Self::new(world, InvalidationTarget::Scene, InvalidationKind::Nop, Vec::new())
    }

    /// Returns true for the reserved no-op record.
    pub fn is_nop(&self) -> bool {
        self.kind == InvalidationKind::Nop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_from_seed_is_deterministic() {
        assert_eq!(ClientId::from_seed(7), ClientId::from_seed(7));
        assert_ne!(ClientId::from_seed(7), ClientId::from_seed(8));
    }

    #[test]
    fn test_timestamp_after_is_strictly_monotonic() {
        let t = Timestamp(100);
        assert_eq!(Timestamp(150).after(t), Timestamp(150));
        assert_eq!(Timestamp(100).after(t), Timestamp(101));
        assert_eq!(Timestamp(20).after(t), Timestamp(101));
    }

    #[test]
    fn test_timestamp_from_system_time() {
        let time = UNIX_EPOCH + Duration::from_millis(1500);
        let ts = Timestamp::from_system_time(time);
        assert_eq!(ts, Timestamp(1_500_000));
        assert!((ts.as_secs_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_nop_record() {
        let nop = Invalidation::nop("base");
        assert!(nop.is_nop());
        assert!(nop.ids.is_empty());
        assert_eq!(nop.world, "base");
    }
}
