//! Chaos engineering scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: One client creates nodes, every other replica observes them
    CreateObserve,

    /// DST-002: Deleting a leaf yields UPDATE(parent) then DELETE
    DeleteOrdering,

    /// DST-003: Deleting a parent reparents its children to root
    Reparenting,

    /// DST-004: Resolved indices shift only below a removed entry
    IndexStability,

    /// DST-005: Identical meshes are stored once
    MeshDedup,

    /// DST-006: A partitioned subscriber is evicted
    SessionEviction,

    /// DST-007: Many writers, every replica converges
    ConcurrentWriters,

    // ═══════════════════════════════════════════════════
    // DEGRADED LINKS
    // ═══════════════════════════════════════════════════

    /// DST-008: Slow but live links converge without eviction
    SlowLink,

    /// DST-009: Lost records never produce wrong data
    LossyLink,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::CreateObserve,
            ScenarioId::DeleteOrdering,
            ScenarioId::Reparenting,
            ScenarioId::IndexStability,
            ScenarioId::MeshDedup,
            ScenarioId::SessionEviction,
            ScenarioId::ConcurrentWriters,
            // Degraded links
            ScenarioId::SlowLink,
            ScenarioId::LossyLink,
        ]
    }

    /// Returns scenarios with healthy links only.
    pub fn standard() -> Vec<ScenarioId> {
        Self::all()
            .into_iter()
            .filter(|s| !s.is_degraded())
            .collect()
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::CreateObserve => "create_observe",
            ScenarioId::DeleteOrdering => "delete_ordering",
            ScenarioId::Reparenting => "reparenting",
            ScenarioId::IndexStability => "index_stability",
            ScenarioId::MeshDedup => "mesh_dedup",
            ScenarioId::SessionEviction => "session_eviction",
            ScenarioId::ConcurrentWriters => "concurrent_writers",
            ScenarioId::SlowLink => "slow_link",
            ScenarioId::LossyLink => "lossy_link",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::CreateObserve => "Writer creates nodes under root, every reader sees len+N and names",
            ScenarioId::DeleteOrdering => "Monitor drains exactly UPDATE(former parent) then DELETE",
            ScenarioId::Reparenting => "Parent with two children deleted, children end up under root",
            ScenarioId::IndexStability => "Middle node removed, lower indices keep their id",
            ScenarioId::MeshDedup => "Two clients push the same mesh, one blob stored",
            ScenarioId::SessionEviction => "Partitioned reader misses two deliveries and leaves the topology",
            ScenarioId::ConcurrentWriters => "Every client writes at once, all replicas converge",
            ScenarioId::SlowLink => "300ms link latency under the delivery timeout, no eviction",
            ScenarioId::LossyLink => "30% record loss, resolved nodes always match the server",
        }
    }

    /// Returns true if this scenario injects link faults.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            ScenarioId::SessionEviction | ScenarioId::SlowLink | ScenarioId::LossyLink
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl serde::Serialize for ScenarioId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create_observe" | "createobserve" | "dst-001" => Ok(ScenarioId::CreateObserve),
            "delete_ordering" | "deleteordering" | "dst-002" => Ok(ScenarioId::DeleteOrdering),
            "reparenting" | "dst-003" => Ok(ScenarioId::Reparenting),
            "index_stability" | "indexstability" | "dst-004" => Ok(ScenarioId::IndexStability),
            "mesh_dedup" | "meshdedup" | "dst-005" => Ok(ScenarioId::MeshDedup),
            "session_eviction" | "sessioneviction" | "dst-006" => Ok(ScenarioId::SessionEviction),
            "concurrent_writers" | "concurrentwriters" | "dst-007" => {
                Ok(ScenarioId::ConcurrentWriters)
            }
            "slow_link" | "slowlink" | "dst-008" => Ok(ScenarioId::SlowLink),
            "lossy_link" | "lossylink" | "dst-009" => Ok(ScenarioId::LossyLink),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
