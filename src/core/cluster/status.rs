// src/core/cluster/status.rs

//! The cluster lifecycle state set.

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// The lifecycle status of the cluster client.
///
/// Transitions are monotone except for the reconnect cycle
/// `close → reconnecting → connecting → …`; `end` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Created lazily; no connection attempt yet.
    Wait,
    /// Fetching the initial topology.
    Connecting,
    /// Topology fetched; at least one node reachable.
    Connect,
    /// Ready check passed (or skipped); commands flow.
    Ready,
    /// Teardown in progress.
    Disconnecting,
    /// All connections gone; a reconnect decision follows.
    Close,
    /// Waiting out the reconnect delay.
    Reconnecting,
    /// Terminal. Every command aborts.
    End,
}

impl ClusterStatus {
    /// Whether no further transition can occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, ClusterStatus::End)
    }
}
