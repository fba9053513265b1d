// src/core/cluster/subscriber.rs

//! Maintains the cluster's single subscription-capable connection.
//!
//! Pub/sub taints a connection, so the subscriber owns a dedicated node
//! client outside the pool, re-selected whenever its node is lost or removed
//! by a topology reconcile. Active subscriptions survive reselection: they
//! are replayed onto the new connection.

use super::pool::{ConnectionPool, NodeFilter};
use crate::config::NodeOptions;
use crate::connection::{Node, NodeEvent, PubSubMessage};
use crate::core::commands::Command;
use crate::core::protocol::command_frame;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

pub struct ClusterSubscriber {
    node_options: NodeOptions,
    events: mpsc::UnboundedSender<NodeEvent>,
    pushes: broadcast::Sender<PubSubMessage>,
    current: Option<Arc<Node>>,
    started: bool,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
}

impl ClusterSubscriber {
    pub fn new(
        node_options: NodeOptions,
        events: mpsc::UnboundedSender<NodeEvent>,
        pushes: broadcast::Sender<PubSubMessage>,
    ) -> Self {
        Self {
            node_options,
            events,
            pushes,
            current: None,
            started: false,
            channels: HashSet::new(),
            patterns: HashSet::new(),
        }
    }

    /// Starts the subscriber, selecting a node from the pool.
    pub fn start(&mut self, pool: &ConnectionPool) {
        self.started = true;
        self.select_node(pool);
    }

    /// Stops the subscriber and closes its connection.
    pub fn stop(&mut self) {
        self.started = false;
        if let Some(node) = self.current.take() {
            node.close();
        }
    }

    /// Replaces the current connection with one to another pool node,
    /// replaying active subscriptions.
    pub fn reselect(&mut self, pool: &ConnectionPool) {
        if !self.started {
            return;
        }
        if let Some(node) = self.current.take() {
            node.close();
        }
        self.select_node(pool);
    }

    /// The current subscriber client, if one is selected.
    pub fn instance(&self) -> Option<Arc<Node>> {
        self.current.clone()
    }

    /// Whether the given node key is the subscriber's current connection.
    pub fn is_current(&self, key: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|node| node.key() == key)
    }

    /// Records the subscription change a routed command implies, so that a
    /// later reselection can replay it.
    pub fn track(&mut self, command: &Command) {
        match command.name() {
            "SUBSCRIBE" => self.channels.extend(command.args().iter().cloned()),
            "PSUBSCRIBE" => self.patterns.extend(command.args().iter().cloned()),
            "UNSUBSCRIBE" => retain_except(&mut self.channels, command.args()),
            "PUNSUBSCRIBE" => retain_except(&mut self.patterns, command.args()),
            _ => {}
        }
    }

    fn select_node(&mut self, pool: &ConnectionPool) {
        let Some(member) = pool.sample(NodeFilter::All) else {
            debug!("no candidate node for the cluster subscriber");
            self.current = None;
            return;
        };
        debug!(node = %member.key(), "selected subscriber node");
        // A dedicated connection: subscriber mode must not taint pool nodes.
        let node = Node::new(
            member.endpoint().clone(),
            false,
            self.node_options.clone(),
            self.events.clone(),
            Some(self.pushes.clone()),
        );
        self.replay(&node);
        self.current = Some(node);
    }

    /// Replays active subscriptions onto a fresh connection.
    fn replay(&self, node: &Arc<Node>) {
        if !self.channels.is_empty() {
            let args: Vec<Bytes> = self.channels.iter().cloned().collect();
            fire_and_forget(node, "SUBSCRIBE", args);
        }
        if !self.patterns.is_empty() {
            let args: Vec<Bytes> = self.patterns.iter().cloned().collect();
            fire_and_forget(node, "PSUBSCRIBE", args);
        }
    }
}

/// Removes the listed members; an empty list clears the whole set, matching
/// the unsubscribe-from-everything command form.
fn retain_except(set: &mut HashSet<Bytes>, removed: &[Bytes]) {
    if removed.is_empty() {
        set.clear();
    } else {
        for member in removed {
            set.remove(member);
        }
    }
}

fn fire_and_forget(node: &Arc<Node>, name: &'static str, args: Vec<Bytes>) {
    let receiver = node.request(command_frame(name, &args), false);
    let key = node.key().to_string();
    tokio::spawn(async move {
        if let Ok(Err(error)) = receiver.await {
            warn!(node = %key, %error, command = name, "subscription replay failed");
        }
    });
}
