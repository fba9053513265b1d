// src/core/errors.rs

//! Defines the primary error type for the entire client.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the client.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
///
/// Variants are `Clone` because a single failure may have to be reported to
/// several waiters at once (e.g. coalesced topology refreshes).
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// An error reply received from a server. The message is kept verbatim so
    /// that redirection tokens (`MOVED`, `ASK`, ...) can be classified lexically.
    #[error("{0}")]
    Server(String),

    /// The underlying connection is gone; recoverable through the failover
    /// retry path while the cluster is ready.
    #[error("Connection is closed.")]
    ConnectionClosed,

    #[error("Operation timed out")]
    Timeout,

    /// Terminal cluster state; every in-flight retry aborts with this.
    #[error("Cluster is ended.")]
    Ended,

    #[error("Cluster is disconnected.")]
    Disconnected,

    #[error("Failed to refresh slots cache.")]
    RefreshFailed {
        #[source]
        last: Option<Box<ClusterError>>,
    },

    #[error("Too many Cluster redirections. Last error: {0}")]
    MaxRedirections(String),

    #[error("None of startup nodes is available")]
    NoStartupNodes,

    #[error("No subscriber for the cluster")]
    NoSubscriber,

    #[error("Cluster isn't ready and enableOfflineQueue options is false")]
    OfflineQueueDisabled,

    #[error("Offline queue is full")]
    OfflineQueueFull,

    #[error("Cluster is already connecting/connected")]
    AlreadyConnecting,

    #[error("`startup_nodes` should contain at least one node")]
    InvalidStartupNodes,
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Io(Arc::new(err))
    }
}

impl ClusterError {
    /// Whether this error denotes a lost transport rather than a server reply.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ClusterError::ConnectionClosed)
    }
}
