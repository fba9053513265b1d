// src/core/cluster/router.rs

//! The command router: a single actor owning every piece of mutable cluster
//! state (status, pool, slot map, queues, subscriber).
//!
//! All observation and mutation happens inside this actor's loop, so no locks
//! are needed. Network attempts run in spawned tasks and re-enter the loop as
//! messages; classification of a failed attempt produces a tagged outcome the
//! loop dispatches on, which is how the reject path of a command stays under
//! router control until its terminal state.

use super::delay_queue::DelayQueue;
use super::offline_queue::OfflineQueue;
use super::pool::{ConnectionPool, NodeFilter};
use super::slot_map::SlotMap;
use super::status::ClusterStatus;
use super::subscriber::ClusterSubscriber;
use super::topology::{self, SlotRange};
use crate::config::{ClusterConfig, ScaleReads};
use crate::connection::{Node, NodeEndpoint, NodeEvent, NodeEventKind};
use crate::core::ClusterError;
use crate::core::commands::Command;
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::protocol::{RespFrame, RespValue};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A caller-pinned dispatch target: an optional pre-resolved slot,
/// independent of the command's own computed slot, plus the client the router
/// binds on first selection so retries stick to it.
#[derive(Debug, Clone, Default)]
pub struct PinnedNode {
    pub slot: Option<u16>,
    pub client: Option<Arc<Node>>,
}

/// Everything a command carries through dispatch and retries.
#[derive(Debug)]
pub(crate) struct DispatchCtx {
    pub command: Command,
    /// Exact-connection preference, preserved through the offline queue.
    pub stream_hint: Option<String>,
    pub pinned: Option<PinnedNode>,
    /// Node key to retry against with an `ASKING` preamble; one-shot.
    pub asking: Option<String>,
    /// Redirection budget, initialized lazily on the first failure.
    pub ttl: Option<u32>,
}

impl DispatchCtx {
    pub fn new(command: Command, stream_hint: Option<String>, pinned: Option<PinnedNode>) -> Self {
        Self {
            command,
            stream_hint,
            pinned,
            asking: None,
            ttl: None,
        }
    }
}

/// What classification decided to do with a failed attempt.
enum Outcome {
    Moved { slot: u16, endpoint: NodeEndpoint },
    Ask { endpoint: NodeEndpoint },
    TryAgain,
    ClusterDown,
    Failover,
    Fail,
}

pub(crate) enum RouterMessage {
    Submit(DispatchCtx),
    Connect {
        reply: oneshot::Sender<Result<(), ClusterError>>,
    },
    Disconnect {
        reconnect: bool,
    },
    Quit {
        reply: oneshot::Sender<Result<RespValue, ClusterError>>,
    },
    QuitSettled {
        reply: oneshot::Sender<Result<RespValue, ClusterError>>,
    },
    Refresh {
        reply: Option<oneshot::Sender<Result<(), ClusterError>>>,
    },
    Finished {
        ctx: DispatchCtx,
        result: Result<RespFrame, ClusterError>,
    },
    TopologyLoaded(Result<Vec<SlotRange>, ClusterError>),
    ReadyChecked(Result<Option<String>, ClusterError>),
    ReconnectTimerFired,
    NodeKeys {
        reply: oneshot::Sender<Vec<String>>,
    },
    /// The last user-facing handle was dropped; tear everything down.
    /// (The router holds a sender to itself, so channel closure alone cannot
    /// signal this.)
    HandleDropped,
}

pub(crate) struct Router {
    pub config: ClusterConfig,
    pub startup_nodes: Vec<NodeEndpoint>,
    pub status: ClusterStatus,
    pub status_tx: watch::Sender<ClusterStatus>,
    pub events: EventBus,
    pub pool: ConnectionPool,
    pub slot_map: SlotMap,
    pub subscriber: ClusterSubscriber,
    pub offline_queue: OfflineQueue<DispatchCtx>,
    pub delay_queue: DelayQueue<DispatchCtx>,
    pub msg_tx: mpsc::UnboundedSender<RouterMessage>,
    pub is_refreshing: bool,
    pub refresh_waiters: Vec<oneshot::Sender<Result<(), ClusterError>>>,
    pub connect_waiters: Vec<oneshot::Sender<Result<(), ClusterError>>>,
    pub retry_attempts: u32,
    pub manually_closing: bool,
    pub reconnect_timer: Option<JoinHandle<()>>,
    pub refresh_timer: Option<JoinHandle<()>>,
}

impl Router {
    pub(crate) async fn run(
        mut self,
        mut messages: mpsc::UnboundedReceiver<RouterMessage>,
        mut flushes: mpsc::UnboundedReceiver<&'static str>,
        mut pool_events: mpsc::UnboundedReceiver<NodeEvent>,
        mut subscriber_events: mpsc::UnboundedReceiver<NodeEvent>,
    ) {
        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Some(message) => {
                        if !self.handle(message) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(bucket) = flushes.recv() => self.flush_bucket(bucket),
                Some(event) = pool_events.recv() => self.on_pool_event(event),
                Some(event) = subscriber_events.recv() => self.on_subscriber_event(event),
            }
        }
        self.shutdown();
    }

    /// Processes one message; returns false when the loop should stop.
    fn handle(&mut self, message: RouterMessage) -> bool {
        match message {
            RouterMessage::Submit(ctx) => self.handle_submit(ctx),
            RouterMessage::Connect { reply } => self.handle_connect(reply),
            RouterMessage::Disconnect { reconnect } => self.internal_disconnect(reconnect),
            RouterMessage::Quit { reply } => self.handle_quit(reply),
            RouterMessage::QuitSettled { reply } => {
                let _ = reply.send(Ok(RespValue::ok()));
                self.internal_disconnect(false);
            }
            RouterMessage::Refresh { reply } => self.refresh_slots(reply),
            RouterMessage::Finished { ctx, result } => self.handle_finished(ctx, result),
            RouterMessage::TopologyLoaded(result) => self.handle_topology(result),
            RouterMessage::ReadyChecked(result) => self.handle_ready_checked(result),
            RouterMessage::ReconnectTimerFired => {
                if self.status == ClusterStatus::Reconnecting {
                    self.start_connect();
                }
            }
            RouterMessage::NodeKeys { reply } => {
                let _ = reply.send(self.pool.keys());
            }
            RouterMessage::HandleDropped => return false,
        }
        true
    }

    // --- Status ---

    fn set_status(&mut self, status: ClusterStatus) {
        if self.status == status {
            return;
        }
        debug!(from = %self.status, to = %status, "status change");
        self.status = status;
        let _ = self.status_tx.send(status);
        self.events.publish(ClusterEvent::Status(status));
    }

    // --- Dispatch ---

    fn handle_submit(&mut self, mut ctx: DispatchCtx) {
        if self.status == ClusterStatus::Wait {
            // Lazy connect: kick off the attempt; the command falls into the
            // offline queue until the cluster is ready.
            self.start_connect();
        }
        if self.status == ClusterStatus::End {
            ctx.command.fail(ClusterError::ConnectionClosed);
            return;
        }
        self.try_connection(ctx);
    }

    /// The connection-selection half of dispatch. Sends when a client can be
    /// chosen, buffers offline otherwise.
    fn try_connection(&mut self, mut ctx: DispatchCtx) {
        if self.status == ClusterStatus::End {
            ctx.command.fail(ClusterError::Ended);
            return;
        }

        let mut chosen: Option<Arc<Node>> = None;
        if self.status == ClusterStatus::Ready || ctx.command.is_cluster_control() {
            if let Some(client) = ctx.pinned.as_ref().and_then(|pinned| pinned.client.clone()) {
                chosen = Some(client);
            } else if let Some(node) = ctx
                .stream_hint
                .as_deref()
                .and_then(|key| self.pool.get(key))
            {
                chosen = Some(node);
            } else if ctx.command.enters_subscriber_mode() || ctx.command.exits_subscriber_mode() {
                match self.subscriber.instance() {
                    Some(node) => {
                        self.subscriber.track(&ctx.command);
                        chosen = Some(node);
                    }
                    None => {
                        ctx.command.fail(ClusterError::NoSubscriber);
                        return;
                    }
                }
            } else {
                let target_slot = ctx
                    .pinned
                    .as_ref()
                    .and_then(|pinned| pinned.slot)
                    .or_else(|| ctx.command.slot());
                if let Some(slot) = target_slot {
                    let keys = self.slot_map.lookup(slot).to_vec();
                    if !keys.is_empty() {
                        chosen = self.pick_node(&keys, &ctx.command);
                    }
                }
                // An ASK retry overrides selection with the exact node named
                // by the redirection.
                if let Some(ask_key) = ctx.asking.as_deref() {
                    chosen = self.pool.get(ask_key);
                }
                if chosen.is_none() {
                    let filter = self.fallback_filter(&ctx.command);
                    chosen = self
                        .pool
                        .sample(filter)
                        .or_else(|| self.pool.sample(NodeFilter::All));
                }
            }
            // Bind the chosen client to the pinned node so later retries of
            // this command reuse it.
            if let (Some(pinned), Some(node)) = (ctx.pinned.as_mut(), chosen.as_ref()) {
                if pinned.client.is_none() {
                    pinned.client = Some(node.clone());
                }
            }
        }

        match chosen {
            Some(node) => self.send_to_node(node, ctx),
            None if self.config.enable_offline_queue => {
                debug!(
                    command = ctx.command.name(),
                    status = %self.status,
                    "cluster not ready, command buffered in the offline queue"
                );
                if let Err(mut rejected) = self.offline_queue.push(ctx) {
                    rejected.command.fail(ClusterError::OfflineQueueFull);
                }
            }
            None => ctx.command.fail(ClusterError::OfflineQueueDisabled),
        }
    }

    /// Resolves the effective read-scaling policy: anything other than
    /// `master` applies only to commands flagged readonly.
    fn effective_scale_reads(&self, command: &Command) -> ScaleReads {
        match &self.config.scale_reads {
            ScaleReads::Master => ScaleReads::Master,
            other if command.is_readonly() => other.clone(),
            _ => ScaleReads::Master,
        }
    }

    /// Picks a client among the node keys serving a slot, primary first.
    fn pick_node(&self, keys: &[String], command: &Command) -> Option<Arc<Node>> {
        let mut rng = SmallRng::from_entropy();
        match self.effective_scale_reads(command) {
            ScaleReads::Master => self.pool.get(&keys[0]),
            ScaleReads::All => keys.choose(&mut rng).and_then(|key| self.pool.get(key)),
            ScaleReads::Slave if keys.len() > 1 => keys[1..]
                .choose(&mut rng)
                .and_then(|key| self.pool.get(key)),
            ScaleReads::Slave => self.pool.get(&keys[0]),
            ScaleReads::Custom(select) => {
                let nodes: Vec<Arc<Node>> =
                    keys.iter().filter_map(|key| self.pool.get(key)).collect();
                let picked = select(&nodes, command);
                match picked.len() {
                    0 => nodes.first().cloned(),
                    1 => Some(picked[0].clone()),
                    _ => picked.choose(&mut rng).cloned(),
                }
            }
        }
    }

    /// The role filter used when slot-based selection produced nothing.
    fn fallback_filter(&self, command: &Command) -> NodeFilter {
        match self.effective_scale_reads(command) {
            ScaleReads::Master => NodeFilter::Master,
            ScaleReads::Slave => NodeFilter::Replica,
            ScaleReads::All | ScaleReads::Custom(_) => NodeFilter::All,
        }
    }

    /// Ships the command to a node; the attempt re-enters the loop as a
    /// `Finished` message.
    fn send_to_node(&self, node: Arc<Node>, mut ctx: DispatchCtx) {
        // The ASK override is one-shot: consumed by this attempt.
        let asking = ctx.asking.take().is_some();
        let receiver = node.request(ctx.command.to_frame(), asking);
        let sender = self.msg_tx.clone();
        tokio::spawn(async move {
            let result = match receiver.await {
                Ok(result) => result,
                Err(_) => Err(ClusterError::ConnectionClosed),
            };
            let _ = sender.send(RouterMessage::Finished { ctx, result });
        });
    }

    // --- Completion & classification ---

    fn handle_finished(&mut self, mut ctx: DispatchCtx, result: Result<RespFrame, ClusterError>) {
        match result {
            Ok(RespFrame::Error(message)) => self.handle_error(ctx, ClusterError::Server(message)),
            Ok(frame) => ctx.command.resolve(RespValue::from(frame)),
            Err(error) => self.handle_error(ctx, error),
        }
    }

    /// Classifies a failed attempt and dispatches on the outcome. Recoverable
    /// errors are retried (possibly after a delay) and never reach the
    /// caller; only definitive failures touch the command's reply.
    fn handle_error(&mut self, mut ctx: DispatchCtx, error: ClusterError) {
        // The redirection budget is initialized lazily on the first failure
        // and burned down by one on every subsequent one.
        let ttl = match ctx.ttl {
            None => {
                ctx.ttl = Some(self.config.max_redirections);
                self.config.max_redirections
            }
            Some(remaining) => {
                let remaining = remaining.saturating_sub(1);
                ctx.ttl = Some(remaining);
                remaining
            }
        };
        if ttl == 0 {
            ctx.command
                .fail(ClusterError::MaxRedirections(error.to_string()));
            return;
        }

        match self.classify(&error) {
            Outcome::Moved { slot, endpoint } => {
                debug!(command = ctx.command.name(), slot, target = %endpoint, "MOVED redirection");
                let key = endpoint.key();
                self.pool.find_or_create(endpoint, false);
                self.slot_map.set_primary(slot, key);
                self.try_connection(ctx);
                // The permanent ownership change means the rest of the map is
                // suspect too.
                self.refresh_slots(None);
            }
            Outcome::Ask { endpoint } => {
                debug!(command = ctx.command.name(), target = %endpoint, "ASK redirection");
                let key = endpoint.key();
                self.pool.find_or_create(endpoint, false);
                ctx.asking = Some(key);
                self.try_connection(ctx);
            }
            Outcome::TryAgain => {
                self.delay_queue.push(
                    "tryagain",
                    ctx,
                    self.config.retry_delay_on_try_again,
                    false,
                );
            }
            Outcome::ClusterDown => {
                self.delay_queue.push(
                    "clusterdown",
                    ctx,
                    self.config.retry_delay_on_cluster_down,
                    true,
                );
            }
            Outcome::Failover => {
                self.delay_queue
                    .push("failover", ctx, self.config.retry_delay_on_failover, true);
            }
            Outcome::Fail => ctx.command.fail(error),
        }
    }

    /// Lexical classification of a failure by the server message's first
    /// space-delimited token.
    fn classify(&self, error: &ClusterError) -> Outcome {
        match error {
            ClusterError::Server(message) => {
                let mut parts = message.splitn(3, ' ');
                match parts.next() {
                    Some("MOVED") => {
                        let slot = parts.next().and_then(|s| s.parse::<u16>().ok());
                        let endpoint = parts.next().and_then(NodeEndpoint::parse);
                        match (slot, endpoint) {
                            (Some(slot), Some(endpoint)) => Outcome::Moved { slot, endpoint },
                            _ => Outcome::Fail,
                        }
                    }
                    Some("ASK") => match parts.nth(1).and_then(NodeEndpoint::parse) {
                        Some(endpoint) => Outcome::Ask { endpoint },
                        None => Outcome::Fail,
                    },
                    Some("TRYAGAIN") => Outcome::TryAgain,
                    Some("CLUSTERDOWN")
                        if !self.config.retry_delay_on_cluster_down.is_zero() =>
                    {
                        Outcome::ClusterDown
                    }
                    _ => Outcome::Fail,
                }
            }
            ClusterError::ConnectionClosed
                if self.status == ClusterStatus::Ready
                    && !self.config.retry_delay_on_failover.is_zero() =>
            {
                Outcome::Failover
            }
            _ => Outcome::Fail,
        }
    }

    /// Drains a fired retry bucket: retries in insertion order, then the
    /// side effect at most once.
    fn flush_bucket(&mut self, bucket: &'static str) {
        if let Some((items, side_effect)) = self.delay_queue.take(bucket) {
            debug!(bucket, retries = items.len(), "flushing retry bucket");
            for ctx in items {
                self.try_connection(ctx);
            }
            if side_effect {
                self.refresh_slots(None);
            }
        }
    }

    // --- Topology refresh ---

    /// Kicks off a topology refresh. Serialized: a refresh already in flight
    /// satisfies new callers immediately.
    fn refresh_slots(&mut self, reply: Option<oneshot::Sender<Result<(), ClusterError>>>) {
        if self.status == ClusterStatus::End {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ClusterError::Disconnected));
            }
            return;
        }
        if self.is_refreshing {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        self.is_refreshing = true;
        if let Some(reply) = reply {
            self.refresh_waiters.push(reply);
        }

        let mut candidates = self.pool.get_nodes(NodeFilter::All);
        // Spread the topology queries over the membership.
        let mut rng = SmallRng::from_entropy();
        candidates.shuffle(&mut rng);

        let timeout = self.config.slots_refresh_timeout;
        let status = self.status_tx.subscribe();
        let sender = self.msg_tx.clone();
        tokio::spawn(async move {
            let mut last_error: Option<ClusterError> = None;
            for node in candidates {
                if *status.borrow() == ClusterStatus::End {
                    let _ =
                        sender.send(RouterMessage::TopologyLoaded(Err(ClusterError::Disconnected)));
                    return;
                }
                debug!(node = %node.key(), "querying slot layout");
                match tokio::time::timeout(timeout, node.send(topology::slots_frame())).await {
                    Err(_) => {
                        warn!(node = %node.key(), "CLUSTER SLOTS timed out");
                        node.disconnect();
                        last_error = Some(ClusterError::Timeout);
                    }
                    Ok(Err(error)) => {
                        warn!(node = %node.key(), %error, "CLUSTER SLOTS failed");
                        node.disconnect();
                        last_error = Some(error);
                    }
                    Ok(Ok(RespFrame::Error(message))) => {
                        warn!(node = %node.key(), %message, "CLUSTER SLOTS rejected");
                        node.disconnect();
                        last_error = Some(ClusterError::Server(message));
                    }
                    Ok(Ok(frame)) => match topology::parse_cluster_slots(&frame) {
                        Ok(ranges) => {
                            let _ = sender.send(RouterMessage::TopologyLoaded(Ok(ranges)));
                            return;
                        }
                        Err(error) => {
                            warn!(node = %node.key(), %error, "unparsable CLUSTER SLOTS reply");
                            node.disconnect();
                            last_error = Some(error);
                        }
                    },
                }
            }
            let _ = sender.send(RouterMessage::TopologyLoaded(Err(
                ClusterError::RefreshFailed {
                    last: last_error.map(Box::new),
                },
            )));
        });
    }

    /// Applies a finished refresh: the new node set and slot layout land
    /// together, so no slot ever references a node missing from the pool.
    fn handle_topology(&mut self, result: Result<Vec<SlotRange>, ClusterError>) {
        self.is_refreshing = false;
        match result {
            Ok(ranges) => {
                let nodes = topology::node_set(&ranges);
                let drained = self.pool.reset(&nodes);
                self.slot_map.clear();
                for range in &ranges {
                    self.slot_map
                        .assign_range(range.start, range.end, &range.keys());
                }
                info!(
                    nodes = nodes.len(),
                    slots = self.slot_map.assigned(),
                    "slots cache refreshed"
                );
                for waiter in self.refresh_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.events.publish(ClusterEvent::Refresh);

                // The reconcile may have removed the subscriber's node.
                let subscriber_healthy = self
                    .subscriber
                    .instance()
                    .is_some_and(|node| self.pool.contains(node.key()));
                if !subscriber_healthy {
                    self.subscriber.reselect(&self.pool);
                }

                if drained {
                    self.on_close();
                } else if self.status == ClusterStatus::Connecting {
                    self.on_initial_topology();
                }
            }
            Err(error) => {
                warn!(%error, "failed to refresh slots cache");
                for waiter in self.refresh_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
                if matches!(error, ClusterError::Disconnected) {
                    return;
                }
                self.events.publish(ClusterEvent::Error(error.to_string()));
                if self.status == ClusterStatus::Connecting {
                    // No startup node yielded a topology; empty the pool so
                    // the close handler decides on a reconnect.
                    self.pool.reset(&[]);
                    self.on_close();
                }
            }
        }
    }

    // --- Connect orchestration ---

    fn handle_connect(&mut self, reply: oneshot::Sender<Result<(), ClusterError>>) {
        if matches!(
            self.status,
            ClusterStatus::Connecting | ClusterStatus::Connect | ClusterStatus::Ready
        ) {
            let _ = reply.send(Err(ClusterError::AlreadyConnecting));
            return;
        }
        self.connect_waiters.push(reply);
        self.start_connect();
    }

    fn start_connect(&mut self) {
        if matches!(
            self.status,
            ClusterStatus::Connecting | ClusterStatus::Connect | ClusterStatus::Ready
        ) {
            return;
        }
        self.manually_closing = false;
        self.set_status(ClusterStatus::Connecting);

        if self.startup_nodes.is_empty() {
            error!("cannot connect: no startup nodes configured");
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(ClusterError::InvalidStartupNodes));
            }
            // Retrying cannot help an empty seed list.
            self.set_status(ClusterStatus::End);
            return;
        }

        for endpoint in self.startup_nodes.clone() {
            self.pool.find_or_create(endpoint, false);
        }
        self.refresh_slots(None);
        self.subscriber.start(&self.pool);
    }

    /// The initial topology arrived while connecting: advance to `connect`
    /// and run (or skip) the ready check.
    fn on_initial_topology(&mut self) {
        self.set_status(ClusterStatus::Connect);
        if self.config.enable_ready_check {
            self.spawn_ready_check();
        } else {
            self.on_ready();
        }
    }

    fn spawn_ready_check(&mut self) {
        let Some(node) = self.pool.sample(NodeFilter::All) else {
            let _ = self
                .msg_tx
                .send(RouterMessage::ReadyChecked(Err(ClusterError::ConnectionClosed)));
            return;
        };
        let sender = self.msg_tx.clone();
        tokio::spawn(async move {
            let result = node
                .send(topology::info_frame())
                .await
                .map(|frame| topology::cluster_state(&frame));
            let _ = sender.send(RouterMessage::ReadyChecked(result));
        });
    }

    fn handle_ready_checked(&mut self, result: Result<Option<String>, ClusterError>) {
        if self.status != ClusterStatus::Connect {
            return;
        }
        match result {
            Ok(Some(state)) if state == "fail" => {
                warn!("ready check reported cluster_state:fail, disconnecting");
                self.internal_disconnect(true);
            }
            Ok(_) => self.on_ready(),
            Err(error) => {
                warn!(%error, "ready check failed, disconnecting");
                self.internal_disconnect(true);
            }
        }
    }

    fn on_ready(&mut self) {
        self.set_status(ClusterStatus::Ready);
        self.retry_attempts = 0;

        // Offline commands drain in strict FIFO before anything submitted
        // after this transition reaches dispatch.
        let buffered = self.offline_queue.drain();
        if !buffered.is_empty() {
            debug!(commands = buffered.len(), "draining offline queue");
        }
        for ctx in buffered {
            self.try_connection(ctx);
        }

        self.install_refresh_timer();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// The periodic refresh timer, installed at most once per ready cluster
    /// and cleared on disconnect/quit.
    fn install_refresh_timer(&mut self) {
        if self.refresh_timer.is_some() {
            return;
        }
        let interval = self.config.slots_refresh_interval;
        let sender = self.msg_tx.clone();
        self.refresh_timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick; the connect flow already refreshed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.send(RouterMessage::Refresh { reply: None }).is_err() {
                    break;
                }
            }
        }));
    }

    // --- Disconnect / close / reconnect ---

    fn internal_disconnect(&mut self, reconnect: bool) {
        let was_wait = self.status == ClusterStatus::Wait;
        if self.status == ClusterStatus::End {
            return;
        }
        if !reconnect {
            self.manually_closing = true;
        }
        self.cancel_timers();
        self.subscriber.stop();

        if was_wait {
            self.on_close();
        } else {
            self.set_status(ClusterStatus::Disconnecting);
            self.pool.reset(&[]);
            self.on_close();
        }
    }

    /// Runs once per close: rejects pending connect attempts, then either
    /// schedules a reconnect or ends the cluster.
    fn on_close(&mut self) {
        self.set_status(ClusterStatus::Close);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClusterError::NoStartupNodes));
        }

        let next_delay = if self.manually_closing {
            None
        } else {
            self.config.reconnect_delay(self.retry_attempts + 1)
        };
        match next_delay {
            Some(delay) => {
                self.retry_attempts += 1;
                debug!(attempt = self.retry_attempts, ?delay, "scheduling reconnect");
                self.set_status(ClusterStatus::Reconnecting);
                let sender = self.msg_tx.clone();
                self.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(RouterMessage::ReconnectTimerFired);
                }));
            }
            None => {
                self.set_status(ClusterStatus::End);
                for mut ctx in self.offline_queue.drain() {
                    ctx.command.fail(ClusterError::NoStartupNodes);
                }
                for mut ctx in self.delay_queue.clear() {
                    ctx.command.fail(ClusterError::Ended);
                }
            }
        }
    }

    fn handle_quit(&mut self, reply: oneshot::Sender<Result<RespValue, ClusterError>>) {
        self.manually_closing = true;
        self.cancel_timers();

        if self.status == ClusterStatus::Wait {
            let _ = reply.send(Ok(RespValue::ok()));
            self.internal_disconnect(false);
            return;
        }

        // Quit every node in parallel; resolve once all attempts settle.
        let nodes = self.pool.get_nodes(NodeFilter::All);
        let sender = self.msg_tx.clone();
        tokio::spawn(async move {
            let quits = nodes.iter().map(|node| node.send(topology::quit_frame()));
            let _ = futures::future::join_all(quits).await;
            let _ = sender.send(RouterMessage::QuitSettled { reply });
        });
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.refresh_timer.take() {
            timer.abort();
        }
    }

    // --- Node events ---

    fn on_pool_event(&mut self, event: NodeEvent) {
        match event.kind {
            NodeEventKind::Error(message) => {
                warn!(node = %event.key, %message, "node error");
                self.events.publish(ClusterEvent::NodeError {
                    node: event.key,
                    message,
                });
            }
            NodeEventKind::Closed => {
                debug!(node = %event.key, "node connection closed");
            }
        }
    }

    fn on_subscriber_event(&mut self, event: NodeEvent) {
        match event.kind {
            NodeEventKind::Closed if self.subscriber.is_current(&event.key) => {
                debug!(node = %event.key, "subscriber connection lost, reselecting");
                self.subscriber.reselect(&self.pool);
            }
            NodeEventKind::Error(message) => {
                debug!(node = %event.key, %message, "subscriber connection error");
            }
            _ => {}
        }
    }

    // --- Teardown ---

    fn shutdown(&mut self) {
        self.cancel_timers();
        self.subscriber.stop();
        for mut ctx in self.offline_queue.drain() {
            ctx.command.fail(ClusterError::ConnectionClosed);
        }
        for mut ctx in self.delay_queue.clear() {
            ctx.command.fail(ClusterError::ConnectionClosed);
        }
        self.pool.reset(&[]);
        self.set_status(ClusterStatus::End);
    }
}
