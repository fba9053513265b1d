// src/core/commands/mod.rs

//! Defines the `Command` object routed by the cluster, together with the
//! static catalog classifying commands by flags and key position.

use crate::core::errors::ClusterError;
use crate::core::protocol::{RespFrame, RespValue, command_frame};
use crate::core::slot::get_slot;
use bitflags::bitflags;
use bytes::Bytes;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

bitflags! {
    /// Flags describing how the router may dispatch a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u32 {
        /// The command only reads data and is eligible for read scaling.
        const READONLY         = 1 << 0;
        /// The command puts the connection into subscriber mode.
        const ENTER_SUBSCRIBER = 1 << 1;
        /// The command takes the connection out of subscriber mode.
        const EXIT_SUBSCRIBER  = 1 << 2;
        /// A cluster-control command, dispatchable before the cluster is ready.
        const CLUSTER_CONTROL  = 1 << 3;
        /// The command's arguments carry no key, so it has no slot.
        const KEYLESS          = 1 << 4;
    }
}

/// Commands that only read data, following the command families the server
/// implements. Anything not listed here is treated as a write and is always
/// routed to a primary.
static READONLY_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // generic
        "EXISTS", "TYPE", "TTL", "PTTL", "DUMP", "KEYS", "RANDOMKEY", "TOUCH", "OBJECT", "MEMORY",
        "DBSIZE", "PING", "ECHO", "SCAN",
        // string
        "GET", "GETRANGE", "STRLEN", "MGET", "GETBIT", "BITCOUNT", "BITPOS",
        // hash
        "HGET", "HMGET", "HGETALL", "HKEYS", "HVALS", "HLEN", "HEXISTS", "HSTRLEN", "HRANDFIELD",
        "HSCAN",
        // list
        "LLEN", "LRANGE", "LINDEX", "LPOS",
        // set
        "SCARD", "SISMEMBER", "SMISMEMBER", "SMEMBERS", "SRANDMEMBER", "SUNION", "SINTER",
        "SINTERCARD", "SDIFF", "SSCAN",
        // zset
        "ZSCORE", "ZMSCORE", "ZCARD", "ZCOUNT", "ZRANGE", "ZRANGEBYSCORE", "ZRANGEBYLEX",
        "ZREVRANGE", "ZREVRANGEBYSCORE", "ZRANK", "ZREVRANK", "ZRANDMEMBER", "ZSCAN", "ZLEXCOUNT",
        // hyperloglog
        "PFCOUNT",
        // geospatial
        "GEOPOS", "GEODIST", "GEOHASH", "GEOSEARCH",
        // streams
        "XLEN", "XRANGE", "XREVRANGE", "XREAD",
        // json
        "JSON.GET", "JSON.MGET", "JSON.TYPE", "JSON.STRLEN", "JSON.ARRLEN", "JSON.OBJLEN",
    ]
    .into_iter()
    .collect()
});

/// Commands whose arguments are not keys; they never resolve to a slot.
static KEYLESS_COMMANDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "PING", "ECHO", "AUTH", "SELECT", "QUIT", "INFO", "CLUSTER", "COMMAND", "CONFIG",
        "CLIENT", "DBSIZE", "FLUSHALL", "FLUSHDB", "SCRIPT", "SCAN", "KEYS", "RANDOMKEY",
        "ASKING", "READONLY", "READWRITE", "SHUTDOWN", "LASTSAVE", "BGSAVE", "SAVE", "TIME",
        "LATENCY", "SLOWLOG", "MEMORY", "PUBLISH", "PUBSUB", "SUBSCRIBE", "UNSUBSCRIBE",
        "PSUBSCRIBE", "PUNSUBSCRIBE",
    ]
    .into_iter()
    .collect()
});

/// Looks up the dispatch flags for a command name (already uppercased).
pub fn flags_for(name: &str) -> CommandFlags {
    let mut flags = CommandFlags::empty();
    if READONLY_COMMANDS.contains(name) {
        flags |= CommandFlags::READONLY;
    }
    if KEYLESS_COMMANDS.contains(name) {
        flags |= CommandFlags::KEYLESS;
    }
    match name {
        "SUBSCRIBE" | "PSUBSCRIBE" => flags |= CommandFlags::ENTER_SUBSCRIBER,
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" => flags |= CommandFlags::EXIT_SUBSCRIBER,
        "CLUSTER" => flags |= CommandFlags::CLUSTER_CONTROL,
        _ => {}
    }
    flags
}

/// Locates the first key among a command's arguments.
///
/// Most commands carry their key first; scripting commands declare a key
/// count and list keys after it.
fn first_key<'a>(name: &str, args: &'a [Bytes]) -> Option<&'a Bytes> {
    match name {
        "EVAL" | "EVALSHA" | "FCALL" | "FCALL_RO" => {
            let numkeys: usize = std::str::from_utf8(args.get(1)?).ok()?.parse().ok()?;
            if numkeys == 0 { None } else { args.get(2) }
        }
        _ => args.first(),
    }
}

/// The caller-visible future of a command, resolved by the router exactly once.
pub struct ReplyFuture {
    receiver: oneshot::Receiver<Result<RespValue, ClusterError>>,
}

impl Future for ReplyFuture {
    type Output = Result<RespValue, ClusterError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|result| match result {
                Ok(outcome) => outcome,
                // The router dropped the command without a terminal state;
                // only possible when the whole cluster handle went away.
                Err(_) => Err(ClusterError::ConnectionClosed),
            })
    }
}

/// A single user command owned by the router from submission until its
/// terminal state.
///
/// The reply sender is single-use: resolving or failing the command consumes
/// it, so a command can never complete twice.
#[derive(Debug)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
    flags: CommandFlags,
    slot: Option<u16>,
    reply: Option<oneshot::Sender<Result<RespValue, ClusterError>>>,
}

impl Command {
    /// Creates a command and the future its caller awaits.
    pub fn new(name: impl AsRef<str>, args: Vec<Bytes>) -> (Self, ReplyFuture) {
        let name = name.as_ref().to_ascii_uppercase();
        let flags = flags_for(&name);
        let slot = if flags.contains(CommandFlags::KEYLESS) {
            None
        } else {
            first_key(&name, &args).map(|key| get_slot(key))
        };
        let (tx, rx) = oneshot::channel();
        (
            Self {
                name,
                args,
                flags,
                slot,
                reply: Some(tx),
            },
            ReplyFuture { receiver: rx },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The hash slot of the command's first key, if it has one.
    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(CommandFlags::READONLY)
    }

    pub fn enters_subscriber_mode(&self) -> bool {
        self.flags.contains(CommandFlags::ENTER_SUBSCRIBER)
    }

    pub fn exits_subscriber_mode(&self) -> bool {
        self.flags.contains(CommandFlags::EXIT_SUBSCRIBER)
    }

    pub fn is_cluster_control(&self) -> bool {
        self.flags.contains(CommandFlags::CLUSTER_CONTROL)
    }

    /// Encodes the command as its outgoing wire frame.
    pub fn to_frame(&self) -> RespFrame {
        command_frame(&self.name, &self.args)
    }

    /// Completes the command with a server reply. A no-op if the command
    /// already reached a terminal state.
    pub fn resolve(&mut self, value: RespValue) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Ok(value));
        }
    }

    /// Completes the command with an error. A no-op if the command already
    /// reached a terminal state.
    pub fn fail(&mut self, error: ClusterError) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(error));
        }
    }
}
