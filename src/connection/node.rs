// src/connection/node.rs

//! A client for a single cluster node.
//!
//! Each `Node` owns exactly one TCP connection, dialed lazily on the first
//! request. Requests are written in submission order and replies are matched
//! to the oldest in-flight request. Transport failures fail every in-flight
//! request with the connection-closed error and leave the actor alive for a
//! lazy re-dial.

use crate::config::NodeOptions;
use crate::core::ClusterError;
use crate::core::protocol::{RespFrame, RespFrameCodec, command_frame};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Canonical `host:port` identity of a cluster node. The string form produced
/// by [`NodeEndpoint::key`] is the sole identity used across the slot map and
/// the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The canonical node key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parses a canonical node key back into an endpoint. Splits on the last
    /// colon so hosts containing colons round-trip.
    pub fn parse(key: &str) -> Option<Self> {
        let idx = key.rfind(':')?;
        let port = key[idx + 1..].parse().ok()?;
        if idx == 0 {
            return None;
        }
        Some(Self::new(&key[..idx], port))
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<(&str, u16)> for NodeEndpoint {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

impl From<(String, u16)> for NodeEndpoint {
    fn from((host, port): (String, u16)) -> Self {
        Self::new(host, port)
    }
}

/// Lifecycle signals a node reports to its owner.
#[derive(Debug, Clone)]
pub enum NodeEventKind {
    /// The connection was lost or could not be established.
    Closed,
    /// An unrecoverable transport or protocol error.
    Error(String),
}

/// A lifecycle event tagged with the emitting node's key.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub key: String,
    pub kind: NodeEventKind,
}

/// A message received on a subscriber-mode connection.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: Bytes,
    pub payload: Bytes,
    /// Set when the message was delivered through a pattern subscription.
    pub pattern: Option<Bytes>,
}

type ReplySender = oneshot::Sender<Result<RespFrame, ClusterError>>;

enum NodeRequest {
    Send {
        frame: RespFrame,
        /// Write an `ASKING` preamble ahead of the frame on the same
        /// connection, discarding the preamble's reply.
        asking: bool,
        reply: ReplySender,
    },
    /// Change the replica role; toggles `READONLY`/`READWRITE` on a live
    /// connection.
    SetRole(bool),
    /// Drop the socket, failing in-flight requests, but keep the actor.
    Disconnect,
    /// Drop the socket and terminate the actor.
    Close,
}

/// A handle to a single-node client actor.
pub struct Node {
    endpoint: NodeEndpoint,
    key: String,
    read_only: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<NodeRequest>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

impl Node {
    /// Creates the node and spawns its connection actor. No socket is opened
    /// until the first request.
    ///
    /// `events` receives lifecycle signals; `pushes`, when set, receives
    /// pub/sub messages arriving on this connection.
    pub fn new(
        endpoint: NodeEndpoint,
        read_only: bool,
        options: NodeOptions,
        events: mpsc::UnboundedSender<NodeEvent>,
        pushes: Option<broadcast::Sender<PubSubMessage>>,
    ) -> Arc<Self> {
        let key = endpoint.key();
        let read_only = Arc::new(AtomicBool::new(read_only));
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = NodeWorker {
            key: key.clone(),
            endpoint: endpoint.clone(),
            options,
            read_only: read_only.clone(),
            receiver,
            events,
            pushes,
        };
        tokio::spawn(worker.run());
        Arc::new(Self {
            endpoint,
            key,
            read_only,
            sender,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Reclassifies the node; a live connection is toggled with
    /// `READONLY`/`READWRITE`.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
        let _ = self.sender.send(NodeRequest::SetRole(read_only));
    }

    /// Submits a frame and returns the receiver of its reply. Never blocks;
    /// a dead actor yields an immediately-failed receiver.
    pub fn request(
        &self,
        frame: RespFrame,
        asking: bool,
    ) -> oneshot::Receiver<Result<RespFrame, ClusterError>> {
        let (tx, rx) = oneshot::channel();
        let request = NodeRequest::Send {
            frame,
            asking,
            reply: tx,
        };
        if let Err(mpsc::error::SendError(request)) = self.sender.send(request) {
            if let NodeRequest::Send { reply, .. } = request {
                let _ = reply.send(Err(ClusterError::ConnectionClosed));
            }
        }
        rx
    }

    /// Sends a frame and awaits its reply.
    pub async fn send(&self, frame: RespFrame) -> Result<RespFrame, ClusterError> {
        self.request(frame, false)
            .await
            .map_err(|_| ClusterError::ConnectionClosed)?
    }

    /// Drops the connection, failing in-flight requests. The node re-dials on
    /// the next request.
    pub fn disconnect(&self) {
        let _ = self.sender.send(NodeRequest::Disconnect);
    }

    /// Permanently shuts the actor down.
    pub fn close(&self) {
        let _ = self.sender.send(NodeRequest::Close);
    }
}

struct NodeWorker {
    key: String,
    endpoint: NodeEndpoint,
    options: NodeOptions,
    read_only: Arc<AtomicBool>,
    receiver: mpsc::UnboundedReceiver<NodeRequest>,
    events: mpsc::UnboundedSender<NodeEvent>,
    pushes: Option<broadcast::Sender<PubSubMessage>>,
}

impl NodeWorker {
    async fn run(self) {
        let NodeWorker {
            key,
            endpoint,
            options,
            read_only,
            mut receiver,
            events,
            pushes,
        } = self;

        let mut stream: Option<Framed<TcpStream, RespFrameCodec>> = None;
        // `None` entries are replies to internally-issued frames
        // (handshake, ASKING preambles, role toggles) that must be discarded.
        let mut pending: VecDeque<Option<ReplySender>> = VecDeque::new();

        loop {
            tokio::select! {
                biased;
                request = receiver.recv() => match request {
                    None | Some(NodeRequest::Close) => {
                        fail_pending(&mut pending);
                        return;
                    }
                    Some(NodeRequest::Disconnect) => {
                        stream = None;
                        fail_pending(&mut pending);
                    }
                    Some(NodeRequest::SetRole(replica)) => {
                        if let Some(framed) = stream.as_mut() {
                            let toggle =
                                command_frame(if replica { "READONLY" } else { "READWRITE" }, &[]);
                            if framed.send(toggle).await.is_ok() {
                                pending.push_back(None);
                            } else {
                                emit_closed(&events, &key);
                                stream = None;
                                fail_pending(&mut pending);
                            }
                        }
                    }
                    Some(NodeRequest::Send { frame, asking, reply }) => {
                        if stream.is_none() {
                            match dial(&endpoint, &options, read_only.load(Ordering::Relaxed)).await
                            {
                                Ok((framed, handshake_replies)) => {
                                    debug!(node = %key, "connection established");
                                    stream = Some(framed);
                                    for _ in 0..handshake_replies {
                                        pending.push_back(None);
                                    }
                                }
                                Err(error) => {
                                    warn!(node = %key, %error, "failed to connect");
                                    emit_error(&events, &key, &error);
                                    emit_closed(&events, &key);
                                    let _ = reply.send(Err(ClusterError::ConnectionClosed));
                                    continue;
                                }
                            }
                        }
                        let mut reply = Some(reply);
                        let mut failed = false;
                        if let Some(framed) = stream.as_mut() {
                            if asking {
                                match framed.send(command_frame("ASKING", &[])).await {
                                    Ok(()) => pending.push_back(None),
                                    Err(_) => failed = true,
                                }
                            }
                            if !failed {
                                match framed.send(frame).await {
                                    Ok(()) => pending.push_back(reply.take()),
                                    Err(_) => failed = true,
                                }
                            }
                        }
                        if failed {
                            if let Some(tx) = reply.take() {
                                let _ = tx.send(Err(ClusterError::ConnectionClosed));
                            }
                            emit_closed(&events, &key);
                            stream = None;
                            fail_pending(&mut pending);
                        }
                    }
                },
                frame = next_frame(&mut stream) => match frame {
                    Some(Ok(frame)) => {
                        if let Some(message) = as_push_message(&frame) {
                            match &pushes {
                                Some(tx) => {
                                    let _ = tx.send(message);
                                }
                                None => {
                                    warn!(node = %key, "dropping pub/sub push on a non-subscriber connection");
                                }
                            }
                        } else if let Some(slot) = pending.pop_front() {
                            if let Some(tx) = slot {
                                let _ = tx.send(Ok(frame));
                            }
                        } else {
                            warn!(node = %key, "unsolicited reply from node");
                        }
                    }
                    Some(Err(error)) => {
                        warn!(node = %key, %error, "connection error");
                        emit_error(&events, &key, &error);
                        emit_closed(&events, &key);
                        stream = None;
                        fail_pending(&mut pending);
                    }
                    None => {
                        debug!(node = %key, "connection closed by peer");
                        emit_closed(&events, &key);
                        stream = None;
                        fail_pending(&mut pending);
                    }
                },
            }
        }
    }
}

/// Resolves the next frame on an open connection; parks forever when the
/// connection is down, letting the request arm of the select drive the loop.
async fn next_frame(
    stream: &mut Option<Framed<TcpStream, RespFrameCodec>>,
) -> Option<Result<RespFrame, ClusterError>> {
    match stream.as_mut() {
        Some(framed) => framed.next().await,
        None => std::future::pending().await,
    }
}

/// Opens the connection and writes the handshake (`AUTH`, `READONLY`).
/// Returns the framed stream and the number of handshake replies to discard.
async fn dial(
    endpoint: &NodeEndpoint,
    options: &NodeOptions,
    read_only: bool,
) -> Result<(Framed<TcpStream, RespFrameCodec>, usize), ClusterError> {
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let socket = tokio::time::timeout(options.connect_timeout, connect)
        .await
        .map_err(|_| ClusterError::Timeout)??;
    let mut framed = Framed::new(socket, RespFrameCodec);

    let mut handshake_replies = 0;
    if let Some(password) = &options.password {
        let mut args = Vec::new();
        if let Some(username) = &options.username {
            args.push(Bytes::copy_from_slice(username.as_bytes()));
        }
        args.push(Bytes::copy_from_slice(password.as_bytes()));
        framed.send(command_frame("AUTH", &args)).await?;
        handshake_replies += 1;
    }
    if read_only {
        framed.send(command_frame("READONLY", &[])).await?;
        handshake_replies += 1;
    }
    Ok((framed, handshake_replies))
}

/// Interprets `message`/`pmessage` arrays as pub/sub pushes.
fn as_push_message(frame: &RespFrame) -> Option<PubSubMessage> {
    let RespFrame::Array(items) = frame else {
        return None;
    };
    match items.as_slice() {
        [
            RespFrame::BulkString(kind),
            RespFrame::BulkString(channel),
            RespFrame::BulkString(payload),
        ] if kind.eq_ignore_ascii_case(b"message") => Some(PubSubMessage {
            channel: channel.clone(),
            payload: payload.clone(),
            pattern: None,
        }),
        [
            RespFrame::BulkString(kind),
            RespFrame::BulkString(pattern),
            RespFrame::BulkString(channel),
            RespFrame::BulkString(payload),
        ] if kind.eq_ignore_ascii_case(b"pmessage") => Some(PubSubMessage {
            channel: channel.clone(),
            payload: payload.clone(),
            pattern: Some(pattern.clone()),
        }),
        _ => None,
    }
}

fn fail_pending(pending: &mut VecDeque<Option<ReplySender>>) {
    for slot in pending.drain(..) {
        if let Some(tx) = slot {
            let _ = tx.send(Err(ClusterError::ConnectionClosed));
        }
    }
}

fn emit_closed(events: &mpsc::UnboundedSender<NodeEvent>, key: &str) {
    let _ = events.send(NodeEvent {
        key: key.to_string(),
        kind: NodeEventKind::Closed,
    });
}

fn emit_error(events: &mpsc::UnboundedSender<NodeEvent>, key: &str, error: &ClusterError) {
    let _ = events.send(NodeEvent {
        key: key.to_string(),
        kind: NodeEventKind::Error(error.to_string()),
    });
}
