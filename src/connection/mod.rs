// src/connection/mod.rs

//! The single-node client: one lazily-dialed connection per cluster node.

pub mod node;

pub use node::{Node, NodeEndpoint, NodeEvent, NodeEventKind, PubSubMessage};
