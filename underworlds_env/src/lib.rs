//! Underworlds Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Underworlds
//! server and client proxies to run in both **Production** (tokio channels)
//! and **Simulation** (virtual clock, fault-injecting links) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Everything that would make a replication test non-reproducible is routed
//! through this crate:
//! - Time (`now()`, `timestamp()`, `sleep()`)
//! - Identity generation (`generate_id()`)
//! - Invalidation delivery (`InvalidationSink::deliver()`)
//!
//! # Example
//!
//! ```ignore
//! use underworlds_env::{ChannelNetwork, InvalidationNetwork, TokioContext};
//!
//! let network = ChannelNetwork::new(64);
//! let (sink, mut stream) = network.connect(client_id, "base");
//! sink.deliver(Invalidation::nop("base")).await?;
//! assert!(stream.recv().await.unwrap().is_nop());
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::UnderworldsContext;
pub use network::{InvalidationNetwork, InvalidationSink, InvalidationStream, NetworkController};
pub use types::{ClientId, Invalidation, InvalidationKind, InvalidationTarget, Timestamp};
pub use error::EnvError;
pub use tokio_impl::{ChannelNetwork, ChannelSink, TokioContext};
