// src/lib.rs

pub mod config;
pub mod connection;
pub mod core;

// Re-export
pub use crate::config::{ClusterConfig, NodeOptions, ScaleReads};
pub use crate::core::cluster::{Cluster, ClusterStatus, PinnedNode};
pub use crate::core::commands::Command;
pub use crate::core::errors::ClusterError;
pub use crate::core::events::ClusterEvent;
pub use crate::core::protocol::RespValue;
pub use crate::connection::{NodeEndpoint, PubSubMessage};
