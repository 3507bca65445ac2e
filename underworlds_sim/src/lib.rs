//! Underworlds Deterministic Simulation Testing (DST) Harness
//!
//! This crate runs a complete Underworlds server and its clients inside a
//! controlled environment, so that replication scenarios are reproducible
//! from a single seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock, tokio timers paused and advanced in lock step
//! - **Network**: Invalidation links with configurable latency, loss and partitions
//! - **Randomness**: Ids and loss decisions derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock + Seeded Ids)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                        │                                    │
//! │               ┌────────▼────────┐                           │
//! │               │ UnderworldsServer│                          │
//! │               └────────┬────────┘                           │
//! │          SimNetwork    │   (latency / loss / partition)     │
//! │       ┌────────────────┼────────────────┐                   │
//! │  ┌────▼────┐      ┌────▼────┐      ┌────▼────┐              │
//! │  │ Context │      │ Context │      │ Context │   ...        │
//! │  │   #1    │      │   #2    │      │   #3    │              │
//! │  └─────────┘      └─────────┘      └─────────┘              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use underworlds_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42, 3).with_nodes(10);
//! let result = runner.run(ScenarioId::SessionEviction);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod runner;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::SimReport;
pub use network::{LinkStats, SimNetwork, SimNetworkController, SimSink};
pub use runner::{ScenarioFailure, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimServer, SimWorld};
