// src/core/cluster/pool.rs

//! Owns the single-node clients of the cluster, keyed by `host:port`.
//!
//! The pool is the single source of truth for node roles. Nodes are created
//! on demand and removed only by topology reconciliation; a node reporting an
//! error stays in the pool until a reconcile omits it.

use crate::config::NodeOptions;
use crate::connection::{Node, NodeEndpoint, NodeEvent};
use crate::core::events::{ClusterEvent, EventBus};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Selects which roles a pool query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFilter {
    All,
    Master,
    Replica,
}

pub struct ConnectionPool {
    nodes: HashMap<String, Arc<Node>>,
    node_options: NodeOptions,
    events: EventBus,
    node_events: mpsc::UnboundedSender<NodeEvent>,
}

impl ConnectionPool {
    pub fn new(
        node_options: NodeOptions,
        events: EventBus,
        node_events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            nodes: HashMap::new(),
            node_options,
            events,
            node_events,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Node>> {
        self.nodes.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Returns an existing node for the endpoint or creates one. Idempotent:
    /// N calls for the same endpoint yield one client. An existing node whose
    /// role differs is reclassified in place.
    pub fn find_or_create(&mut self, endpoint: NodeEndpoint, read_only: bool) -> Arc<Node> {
        let key = endpoint.key();
        if let Some(node) = self.nodes.get(&key) {
            if node.is_read_only() != read_only {
                debug!(node = %key, read_only, "reclassifying node role");
                node.set_read_only(read_only);
            }
            return node.clone();
        }
        debug!(node = %key, read_only, "adding node to the pool");
        let node = Node::new(
            endpoint,
            read_only,
            self.node_options.clone(),
            self.node_events.clone(),
            None,
        );
        self.nodes.insert(key.clone(), node.clone());
        self.events.publish(ClusterEvent::NodeAdded(key));
        node
    }

    /// The pool members matching a role filter.
    pub fn get_nodes(&self, filter: NodeFilter) -> Vec<Arc<Node>> {
        self.nodes
            .values()
            .filter(|node| match filter {
                NodeFilter::All => true,
                NodeFilter::Master => !node.is_read_only(),
                NodeFilter::Replica => node.is_read_only(),
            })
            .cloned()
            .collect()
    }

    /// A uniformly sampled member matching the filter.
    pub fn sample(&self, filter: NodeFilter) -> Option<Arc<Node>> {
        let candidates = self.get_nodes(filter);
        let mut rng = SmallRng::from_entropy();
        candidates.choose(&mut rng).cloned()
    }

    /// Reconciles the pool against an authoritative node list: creates
    /// missing members, removes absent ones, and updates roles of the rest.
    ///
    /// Returns true when the reset emptied a previously non-empty pool, in
    /// which case a `drain` event was published.
    pub fn reset(&mut self, authoritative: &[(NodeEndpoint, bool)]) -> bool {
        let had_members = !self.nodes.is_empty();

        let keep: HashSet<String> = authoritative
            .iter()
            .map(|(endpoint, _)| endpoint.key())
            .collect();
        let removed: Vec<String> = self
            .nodes
            .keys()
            .filter(|key| !keep.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(node) = self.nodes.remove(&key) {
                debug!(node = %key, "removing node from the pool");
                node.close();
                self.events.publish(ClusterEvent::NodeRemoved(key));
            }
        }

        for (endpoint, read_only) in authoritative {
            self.find_or_create(endpoint.clone(), *read_only);
        }

        let drained = had_members && self.nodes.is_empty();
        if drained {
            debug!("connection pool drained");
            self.events.publish(ClusterEvent::Drain);
        }
        drained
    }
}
