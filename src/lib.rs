//! A single node of a replicated key-value store.
//!
//! A cluster of these nodes agrees, via the Raft consensus protocol, on an
//! ordered log of mutation commands, applies that log deterministically to an
//! in-memory map, and exposes the resulting state over HTTP.
//!
//! The [`Raft`] type is the consensus engine's public handle. The [`Node`]
//! type bundles an engine, a [`Store`] and the HTTP façade into the two entry
//! points the bootstrap glue needs: [`Node::open`] and [`Node::start`].

pub mod api;
mod config;
mod core;
pub mod error;
pub mod kv;
mod metrics;
pub mod network;
pub mod node;
pub mod raft;
mod raft_types;
mod replication;
pub mod storage;
pub mod store;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::SnapshotPolicy;
pub use crate::core::State;
pub use crate::error::ChangeConfigError;
pub use crate::error::ClientReadError;
pub use crate::error::ClientWriteError;
pub use crate::error::ConfigError;
pub use crate::error::InitializeError;
pub use crate::error::RaftError;
pub use crate::kv::Command;
pub use crate::kv::CommandResponse;
pub use crate::metrics::RaftMetrics;
pub use crate::metrics::Wait;
pub use crate::network::RaftNetwork;
pub use crate::node::Node;
pub use crate::raft::Raft;
pub use crate::raft_types::LogId;
pub use crate::storage::RaftStorage;
pub use crate::store::Store;

/// A Raft node's ID.
pub type NodeId = u64;
