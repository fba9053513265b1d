// src/config.rs

//! Client configuration: cluster-level routing options and the per-node
//! options handed verbatim to every single-node client.

use crate::connection::Node;
use crate::core::commands::Command;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Given the reconnect attempt count, returns the delay before the next
/// attempt, or `None` to stop reconnecting for good.
pub type RetryStrategyFn = Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>;

/// A user-supplied read-scaling policy. Receives the resolved node clients of
/// a slot (primary first) and the command being dispatched; returns the
/// candidates to pick from. An empty vector falls back to the primary.
pub type ScaleReadsFn = Arc<dyn Fn(&[Arc<Node>], &Command) -> Vec<Arc<Node>> + Send + Sync>;

/// Controls which nodes of a slot may serve readonly commands.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleReads {
    /// All reads go to the slot's primary.
    #[default]
    Master,
    /// Readonly commands go to a replica when the slot has one.
    Slave,
    /// Readonly commands are spread uniformly over all nodes of the slot.
    All,
    /// A user function picks the target.
    #[serde(skip)]
    Custom(ScaleReadsFn),
}

impl fmt::Debug for ScaleReads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleReads::Master => write!(f, "Master"),
            ScaleReads::Slave => write!(f, "Slave"),
            ScaleReads::All => write!(f, "All"),
            ScaleReads::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Options applied to every single-node client the pool creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOptions {
    /// Timeout for establishing the TCP connection to a node.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Optional username sent with `AUTH` after connecting.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password sent with `AUTH` after connecting.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            username: None,
            password: None,
        }
    }
}

/// Cluster-level configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Custom reconnect strategy; when unset, the default
    /// `min(100 + 2 * attempts, 2000)` milliseconds formula applies.
    #[serde(skip)]
    pub cluster_retry_strategy: Option<RetryStrategyFn>,

    /// Buffer commands submitted before the cluster is ready; when false,
    /// such commands are rejected instead.
    #[serde(default = "default_true")]
    pub enable_offline_queue: bool,

    /// Gate the `ready` status on `CLUSTER INFO` reporting a non-failed state.
    #[serde(default = "default_true")]
    pub enable_ready_check: bool,

    /// Read-scaling policy for commands flagged readonly.
    #[serde(default)]
    pub scale_reads: ScaleReads,

    /// Per-command budget for MOVED/ASK/retry chains.
    #[serde(default = "default_max_redirections")]
    pub max_redirections: u32,

    /// Delay before retrying commands that failed because their connection
    /// closed while the cluster was ready. Zero disables the retry.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay_on_failover: Duration,

    /// Delay before retrying commands rejected with `CLUSTERDOWN`.
    /// Zero disables the retry.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay_on_cluster_down: Duration,

    /// Delay before retrying commands rejected with `TRYAGAIN`.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay_on_try_again: Duration,

    /// Per-attempt timeout for `CLUSTER SLOTS` during a topology refresh.
    #[serde(default = "default_slots_refresh_timeout", with = "humantime_serde")]
    pub slots_refresh_timeout: Duration,

    /// Cadence of the periodic topology refresh once ready.
    #[serde(default = "default_slots_refresh_interval", with = "humantime_serde")]
    pub slots_refresh_interval: Duration,

    /// Stay in `wait` until the first command instead of connecting eagerly.
    #[serde(default)]
    pub lazy_connect: bool,

    /// Upper bound on buffered offline commands; a full queue fails the
    /// command immediately.
    #[serde(default = "default_offline_queue_capacity")]
    pub offline_queue_capacity: usize,

    /// Options passed verbatim to every single-node client.
    #[serde(default)]
    pub node_options: NodeOptions,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_retry_strategy: None,
            enable_offline_queue: default_true(),
            enable_ready_check: default_true(),
            scale_reads: ScaleReads::default(),
            max_redirections: default_max_redirections(),
            retry_delay_on_failover: default_retry_delay(),
            retry_delay_on_cluster_down: default_retry_delay(),
            retry_delay_on_try_again: default_retry_delay(),
            slots_refresh_timeout: default_slots_refresh_timeout(),
            slots_refresh_interval: default_slots_refresh_interval(),
            lazy_connect: false,
            offline_queue_capacity: default_offline_queue_capacity(),
            node_options: NodeOptions::default(),
        }
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("enable_offline_queue", &self.enable_offline_queue)
            .field("enable_ready_check", &self.enable_ready_check)
            .field("scale_reads", &self.scale_reads)
            .field("max_redirections", &self.max_redirections)
            .field("retry_delay_on_failover", &self.retry_delay_on_failover)
            .field("retry_delay_on_cluster_down", &self.retry_delay_on_cluster_down)
            .field("retry_delay_on_try_again", &self.retry_delay_on_try_again)
            .field("slots_refresh_timeout", &self.slots_refresh_timeout)
            .field("slots_refresh_interval", &self.slots_refresh_interval)
            .field("lazy_connect", &self.lazy_connect)
            .field("offline_queue_capacity", &self.offline_queue_capacity)
            .field("node_options", &self.node_options)
            .finish()
    }
}

impl ClusterConfig {
    /// Resolves the reconnect delay for the given attempt count.
    pub fn reconnect_delay(&self, attempts: u32) -> Option<Duration> {
        match &self.cluster_retry_strategy {
            Some(strategy) => strategy(attempts),
            None => Some(Duration::from_millis(
                (100 + 2 * u64::from(attempts)).min(2000),
            )),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_redirections() -> u32 {
    16
}
fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_slots_refresh_timeout() -> Duration {
    Duration::from_millis(1000)
}
fn default_slots_refresh_interval() -> Duration {
    Duration::from_millis(5000)
}
fn default_offline_queue_capacity() -> usize {
    1024
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}
