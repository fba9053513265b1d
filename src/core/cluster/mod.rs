// src/core/cluster/mod.rs

//! The cluster client: a handle over the router actor that owns all cluster
//! state.

pub mod delay_queue;
pub mod offline_queue;
pub mod pool;
pub mod router;
pub mod slot_map;
pub mod status;
pub mod subscriber;
pub mod topology;

pub use router::PinnedNode;
pub use status::ClusterStatus;

use crate::config::ClusterConfig;
use crate::connection::{NodeEndpoint, PubSubMessage};
use crate::core::ClusterError;
use crate::core::commands::Command;
use crate::core::events::{ClusterEvent, EventBus};
use crate::core::protocol::RespValue;
use bytes::Bytes;
use delay_queue::DelayQueue;
use offline_queue::OfflineQueue;
use pool::ConnectionPool;
use router::{DispatchCtx, Router, RouterMessage};
use slot_map::SlotMap;
use subscriber::ClusterSubscriber;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Capacity of the pub/sub message broadcast to callers.
const PUBSUB_CHANNEL_CAPACITY: usize = 4096;

/// A client for a sharded, multi-node in-memory data store.
///
/// The handle is cheap to clone; every clone talks to the same router actor.
/// Must be created within a Tokio runtime.
#[derive(Clone)]
pub struct Cluster {
    msg_tx: mpsc::UnboundedSender<RouterMessage>,
    status_rx: watch::Receiver<ClusterStatus>,
    events: EventBus,
    pushes: broadcast::Sender<PubSubMessage>,
    _guard: std::sync::Arc<HandleGuard>,
}

/// Tells the router to tear down once the last `Cluster` clone is gone. The
/// router keeps a sender to itself, so it cannot rely on channel closure.
struct HandleGuard {
    sender: mpsc::UnboundedSender<RouterMessage>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let _ = self.sender.send(RouterMessage::HandleDropped);
    }
}

impl Cluster {
    /// Creates the client. Unless `lazy_connect` is set, the connection
    /// attempt starts immediately in the background.
    pub fn new<I, E>(startup_nodes: I, config: ClusterConfig) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<NodeEndpoint>,
    {
        let startup_nodes: Vec<NodeEndpoint> =
            startup_nodes.into_iter().map(Into::into).collect();

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ClusterStatus::Wait);
        let events = EventBus::new();
        let (pushes, _) = broadcast::channel(PUBSUB_CHANNEL_CAPACITY);
        let (pool_events_tx, pool_events_rx) = mpsc::unbounded_channel();
        let (subscriber_events_tx, subscriber_events_rx) = mpsc::unbounded_channel();
        let (delay_queue, flush_rx) = DelayQueue::new();

        let pool = ConnectionPool::new(
            config.node_options.clone(),
            events.clone(),
            pool_events_tx,
        );
        let subscriber = ClusterSubscriber::new(
            config.node_options.clone(),
            subscriber_events_tx,
            pushes.clone(),
        );
        let offline_queue = OfflineQueue::new(config.offline_queue_capacity);
        let lazy_connect = config.lazy_connect;

        let router = Router {
            config,
            startup_nodes,
            status: ClusterStatus::Wait,
            status_tx,
            events: events.clone(),
            pool,
            slot_map: SlotMap::new(),
            subscriber,
            offline_queue,
            delay_queue,
            msg_tx: msg_tx.clone(),
            is_refreshing: false,
            refresh_waiters: Vec::new(),
            connect_waiters: Vec::new(),
            retry_attempts: 0,
            manually_closing: false,
            reconnect_timer: None,
            refresh_timer: None,
        };
        tokio::spawn(router.run(msg_rx, flush_rx, pool_events_rx, subscriber_events_rx));

        let cluster = Self {
            _guard: std::sync::Arc::new(HandleGuard {
                sender: msg_tx.clone(),
            }),
            msg_tx,
            status_rx,
            events,
            pushes,
        };
        if !lazy_connect {
            let (reply, _) = oneshot::channel();
            let _ = cluster.msg_tx.send(RouterMessage::Connect { reply });
        }
        cluster
    }

    /// Connects to the cluster; resolves when the status reaches `ready`.
    ///
    /// Rejects immediately when a connection attempt is already under way or
    /// established.
    pub async fn connect(&self) -> Result<(), ClusterError> {
        let (reply, receiver) = oneshot::channel();
        self.msg_tx
            .send(RouterMessage::Connect { reply })
            .map_err(|_| ClusterError::Ended)?;
        receiver.await.map_err(|_| ClusterError::ConnectionClosed)?
    }

    /// Sends a command built from a name and arguments and awaits its reply.
    pub async fn call<N, I, A>(&self, name: N, args: I) -> Result<RespValue, ClusterError>
    where
        N: AsRef<str>,
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let args: Vec<Bytes> = args.into_iter().map(Into::into).collect();
        let (command, reply) = Command::new(name, args);
        self.dispatch(command, None, None)?;
        reply.await
    }

    /// Submits a prebuilt command, optionally with an exact-connection hint
    /// or a pinned node, for callers layering transactions or scans on top.
    /// The command's reply future resolves independently.
    pub fn dispatch(
        &self,
        command: Command,
        stream_hint: Option<String>,
        pinned: Option<PinnedNode>,
    ) -> Result<(), ClusterError> {
        self.msg_tx
            .send(RouterMessage::Submit(DispatchCtx::new(
                command,
                stream_hint,
                pinned,
            )))
            .map_err(|_| ClusterError::Ended)
    }

    /// Tears the cluster down. With `reconnect`, the retry strategy decides
    /// whether a new attempt follows; without it, the cluster ends.
    pub fn disconnect(&self, reconnect: bool) {
        let _ = self.msg_tx.send(RouterMessage::Disconnect { reconnect });
    }

    /// Gracefully quits: `QUIT` goes to every node in parallel and the call
    /// resolves `OK` once all attempts settle.
    pub async fn quit(&self) -> Result<RespValue, ClusterError> {
        let (reply, receiver) = oneshot::channel();
        self.msg_tx
            .send(RouterMessage::Quit { reply })
            .map_err(|_| ClusterError::Ended)?;
        receiver.await.map_err(|_| ClusterError::ConnectionClosed)?
    }

    /// Forces a topology refresh; resolves once the refresh (or the one
    /// already in flight) completes.
    pub async fn refresh_slots(&self) -> Result<(), ClusterError> {
        let (reply, receiver) = oneshot::channel();
        self.msg_tx
            .send(RouterMessage::Refresh { reply: Some(reply) })
            .map_err(|_| ClusterError::Ended)?;
        receiver.await.map_err(|_| ClusterError::ConnectionClosed)?
    }

    /// The current cluster status.
    pub fn status(&self) -> ClusterStatus {
        *self.status_rx.borrow()
    }

    /// A watch over status transitions, for callers that need to await one.
    pub fn status_watch(&self) -> watch::Receiver<ClusterStatus> {
        self.status_rx.clone()
    }

    /// Subscribes to cluster lifecycle and topology events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Subscribes to pub/sub messages received by the cluster subscriber.
    pub fn messages(&self) -> broadcast::Receiver<PubSubMessage> {
        self.pushes.subscribe()
    }

    /// The node keys currently in the connection pool.
    pub async fn node_keys(&self) -> Vec<String> {
        let (reply, receiver) = oneshot::channel();
        if self.msg_tx.send(RouterMessage::NodeKeys { reply }).is_err() {
            return Vec::new();
        }
        receiver.await.unwrap_or_default()
    }
}
