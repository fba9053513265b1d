//! End-to-end router behavior against in-process mock nodes speaking RESP.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use spinel_cluster::core::protocol::{RespFrame, RespFrameCodec};
use spinel_cluster::core::slot::get_slot;
use spinel_cluster::{
    Cluster, ClusterConfig, ClusterError, ClusterEvent, ClusterStatus, NodeEndpoint, RespValue,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::codec::Framed;

type Handler = Arc<dyn Fn(&str, &[Bytes]) -> Vec<RespFrame> + Send + Sync>;

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Serves every accepted connection with the given request handler. A
/// handler may return several frames, which lets a test push pub/sub
/// messages after a reply.
fn serve(listener: TcpListener, handler: Handler) {
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, RespFrameCodec);
                while let Some(Ok(frame)) = framed.next().await {
                    let (name, args) = parse_command(&frame);
                    if name == "QUIT" {
                        let _ = framed.send(ok()).await;
                        break;
                    }
                    for reply in handler(&name, &args) {
                        if framed.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
}

fn parse_command(frame: &RespFrame) -> (String, Vec<Bytes>) {
    let RespFrame::Array(items) = frame else {
        return (String::new(), Vec::new());
    };
    let mut parts = items.iter().filter_map(|item| match item {
        RespFrame::BulkString(bytes) => Some(bytes.clone()),
        _ => None,
    });
    let name = parts
        .next()
        .map(|bytes| String::from_utf8_lossy(&bytes).to_ascii_uppercase())
        .unwrap_or_default();
    (name, parts.collect())
}

fn is_subcommand(args: &[Bytes], subcommand: &[u8]) -> bool {
    args.first().is_some_and(|arg| arg.as_ref() == subcommand)
}

fn slots_reply(rows: &[(u16, u16, u16)]) -> RespFrame {
    RespFrame::Array(
        rows.iter()
            .map(|(start, end, port)| {
                RespFrame::Array(vec![
                    RespFrame::Integer(i64::from(*start)),
                    RespFrame::Integer(i64::from(*end)),
                    RespFrame::Array(vec![
                        RespFrame::BulkString(Bytes::from_static(b"127.0.0.1")),
                        RespFrame::Integer(i64::from(*port)),
                    ]),
                ])
            })
            .collect(),
    )
}

/// Rows mapping one slot to `owner` and the rest of the space to `rest`.
fn split_rows(slot: u16, owner: u16, rest: u16) -> Vec<(u16, u16, u16)> {
    let mut rows = vec![(slot, slot, owner)];
    if slot > 0 {
        rows.push((0, slot - 1, rest));
    }
    if slot < 16383 {
        rows.push((slot + 1, 16383, rest));
    }
    rows
}

fn info_ok() -> RespFrame {
    RespFrame::BulkString(Bytes::from_static(
        b"cluster_state:ok\r\ncluster_slots_assigned:16384\r\n",
    ))
}

fn info_fail() -> RespFrame {
    RespFrame::BulkString(Bytes::from_static(b"cluster_state:fail\r\n"))
}

fn bulk(text: &'static str) -> RespFrame {
    RespFrame::BulkString(Bytes::from_static(text.as_bytes()))
}

fn ok() -> RespFrame {
    RespFrame::SimpleString("OK".to_string())
}

fn lazy_config() -> ClusterConfig {
    ClusterConfig {
        lazy_connect: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_normal_dispatch_and_ready_check() {
    let (listener, addr) = bind().await;
    let port = addr.port();
    let gets = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let gets = gets.clone();
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port)])],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                gets.fetch_add(1, Ordering::SeqCst);
                vec![bulk("bar")]
            }
            _ => vec![ok()],
        })
    };
    serve(listener, handler);

    let cluster = Cluster::new([("127.0.0.1", port)], lazy_config());
    cluster.connect().await.unwrap();
    assert_eq!(cluster.status(), ClusterStatus::Ready);
    assert_eq!(cluster.node_keys().await, vec![format!("127.0.0.1:{port}")]);

    let reply = cluster.call("GET", ["foo"]).await.unwrap();
    assert_eq!(reply.as_str(), Some("bar"));
    assert_eq!(gets.load(Ordering::SeqCst), 1);

    assert_eq!(cluster.quit().await.unwrap(), RespValue::ok());
}

#[tokio::test]
async fn test_connect_rejects_while_connected() {
    let (listener, addr) = bind().await;
    let port = addr.port();
    let handler: Handler = Arc::new(move |name, args| match name {
        "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port)])],
        "CLUSTER" => vec![info_ok()],
        _ => vec![ok()],
    });
    serve(listener, handler);

    let cluster = Cluster::new([("127.0.0.1", port)], lazy_config());
    cluster.connect().await.unwrap();
    let err = cluster.connect().await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyConnecting));
    // Rejecting the redundant attempt must not disturb the ready cluster.
    assert_eq!(cluster.status(), ClusterStatus::Ready);
}

#[tokio::test]
async fn test_moved_redirection() {
    let slot = get_slot(b"foo");
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;
    let (port_a, port_b) = (addr_a.port(), addr_b.port());

    let moved = Arc::new(AtomicBool::new(false));
    let a_gets = Arc::new(AtomicUsize::new(0));
    let b_gets = Arc::new(AtomicUsize::new(0));

    let topology = {
        let moved = moved.clone();
        move || {
            if moved.load(Ordering::SeqCst) {
                slots_reply(&split_rows(slot, port_b, port_a))
            } else {
                slots_reply(&[(0, 16383, port_a)])
            }
        }
    };

    let handler_a: Handler = {
        let (moved, a_gets, topology) = (moved.clone(), a_gets.clone(), topology.clone());
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![topology()],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                a_gets.fetch_add(1, Ordering::SeqCst);
                moved.store(true, Ordering::SeqCst);
                vec![RespFrame::Error(format!("MOVED {slot} 127.0.0.1:{port_b}"))]
            }
            _ => vec![ok()],
        })
    };
    let handler_b: Handler = {
        let (b_gets, topology) = (b_gets.clone(), topology.clone());
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![topology()],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                b_gets.fetch_add(1, Ordering::SeqCst);
                vec![bulk("bar")]
            }
            _ => vec![ok()],
        })
    };
    serve(listener_a, handler_a);
    serve(listener_b, handler_b);

    let cluster = Cluster::new([("127.0.0.1", port_a)], lazy_config());
    cluster.connect().await.unwrap();

    // The redirected command lands on the new owner transparently.
    let reply = cluster.call("GET", ["foo"]).await.unwrap();
    assert_eq!(reply.as_str(), Some("bar"));
    assert_eq!(a_gets.load(Ordering::SeqCst), 1);
    assert_eq!(b_gets.load(Ordering::SeqCst), 1);

    // The slot now points at the new owner, so a later read skips the
    // old primary entirely.
    let reply = cluster.call("GET", ["foo"]).await.unwrap();
    assert_eq!(reply.as_str(), Some("bar"));
    assert_eq!(a_gets.load(Ordering::SeqCst), 1);
    assert_eq!(b_gets.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ask_redirection() {
    let slot = get_slot(b"foo");
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;
    let (port_a, port_b) = (addr_a.port(), addr_b.port());

    let a_gets = Arc::new(AtomicUsize::new(0));
    let b_log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let handler_a: Handler = {
        let a_gets = a_gets.clone();
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port_a)])],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                let attempt = a_gets.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    vec![RespFrame::Error(format!("ASK {slot} 127.0.0.1:{port_b}"))]
                } else {
                    vec![bulk("from-a")]
                }
            }
            _ => vec![ok()],
        })
    };
    let handler_b: Handler = {
        let b_log = b_log.clone();
        Arc::new(move |name, _args| {
            b_log.lock().unwrap().push(name.to_string());
            match name {
                "ASKING" => vec![ok()],
                "GET" => vec![bulk("bar")],
                _ => vec![ok()],
            }
        })
    };
    serve(listener_a, handler_a);
    serve(listener_b, handler_b);

    let cluster = Cluster::new([("127.0.0.1", port_a)], lazy_config());
    cluster.connect().await.unwrap();

    // The ASK retry goes to the named node, ASKING first, on one connection.
    let reply = cluster.call("GET", ["foo"]).await.unwrap();
    assert_eq!(reply.as_str(), Some("bar"));
    assert_eq!(
        *b_log.lock().unwrap(),
        vec!["ASKING".to_string(), "GET".to_string()]
    );

    // ASK is one-shot and leaves the slot map alone: the next read goes back
    // to the original owner.
    let reply = cluster.call("GET", ["foo"]).await.unwrap();
    assert_eq!(reply.as_str(), Some("from-a"));
    assert_eq!(b_log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_tryagain_retries_coalesce() {
    let (listener, addr) = bind().await;
    let port = addr.port();
    let attempts = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let attempts = attempts.clone();
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port)])],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    vec![RespFrame::Error("TRYAGAIN Multiple keys request during rehashing of slot".to_string())]
                } else {
                    vec![bulk("ok")]
                }
            }
            _ => vec![ok()],
        })
    };
    serve(listener, handler);

    let config = ClusterConfig {
        lazy_connect: true,
        retry_delay_on_try_again: Duration::from_millis(50),
        ..Default::default()
    };
    let cluster = Cluster::new([("127.0.0.1", port)], config);
    cluster.connect().await.unwrap();

    let start = std::time::Instant::now();
    let (r1, r2, r3) = tokio::join!(
        cluster.call("GET", ["k1"]),
        cluster.call("GET", ["k2"]),
        cluster.call("GET", ["k3"]),
    );
    assert_eq!(r1.unwrap().as_str(), Some("ok"));
    assert_eq!(r2.unwrap().as_str(), Some("ok"));
    assert_eq!(r3.unwrap().as_str(), Some("ok"));

    // One coalesced delay, then one retry per command: 3 + 3 attempts total.
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_clusterdown_retries_coalesce_with_one_topology_repair() {
    let (listener, addr) = bind().await;
    let port = addr.port();
    let attempts = Arc::new(AtomicUsize::new(0));
    let slots_queries = Arc::new(AtomicUsize::new(0));
    let handler: Handler = {
        let (attempts, slots_queries) = (attempts.clone(), slots_queries.clone());
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => {
                slots_queries.fetch_add(1, Ordering::SeqCst);
                vec![slots_reply(&[(0, 16383, port)])]
            }
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    vec![RespFrame::Error(
                        "CLUSTERDOWN The cluster is down".to_string(),
                    )]
                } else {
                    vec![bulk("ok")]
                }
            }
            _ => vec![ok()],
        })
    };
    serve(listener, handler);

    let config = ClusterConfig {
        lazy_connect: true,
        retry_delay_on_cluster_down: Duration::from_millis(50),
        ..Default::default()
    };
    let cluster = Cluster::new([("127.0.0.1", port)], config);
    cluster.connect().await.unwrap();
    let queries_after_connect = slots_queries.load(Ordering::SeqCst);

    let (r1, r2) = tokio::join!(cluster.call("GET", ["k1"]), cluster.call("GET", ["k2"]));
    assert_eq!(r1.unwrap().as_str(), Some("ok"));
    assert_eq!(r2.unwrap().as_str(), Some("ok"));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    // Both failures coalesced into one bucket, whose flush repairs the
    // topology exactly once.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let repairs = slots_queries.load(Ordering::SeqCst) - queries_after_connect;
    assert_eq!(repairs, 1);
}

#[tokio::test]
async fn test_redirection_loop_is_bounded() {
    let slot = get_slot(b"foo");
    let (listener_a, addr_a) = bind().await;
    let (listener_b, addr_b) = bind().await;
    let (port_a, port_b) = (addr_a.port(), addr_b.port());

    let a_gets = Arc::new(AtomicUsize::new(0));
    let b_gets = Arc::new(AtomicUsize::new(0));

    let handler_a: Handler = {
        let a_gets = a_gets.clone();
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port_a)])],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                a_gets.fetch_add(1, Ordering::SeqCst);
                vec![RespFrame::Error(format!("MOVED {slot} 127.0.0.1:{port_b}"))]
            }
            _ => vec![ok()],
        })
    };
    let handler_b: Handler = {
        let b_gets = b_gets.clone();
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port_a)])],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                b_gets.fetch_add(1, Ordering::SeqCst);
                vec![RespFrame::Error(format!("MOVED {slot} 127.0.0.1:{port_a}"))]
            }
            _ => vec![ok()],
        })
    };
    serve(listener_a, handler_a);
    serve(listener_b, handler_b);

    let config = ClusterConfig {
        lazy_connect: true,
        max_redirections: 3,
        ..Default::default()
    };
    let cluster = Cluster::new([("127.0.0.1", port_a)], config);
    cluster.connect().await.unwrap();

    let err = cluster.call("GET", ["foo"]).await.unwrap_err();
    assert!(matches!(err, ClusterError::MaxRedirections(_)));
    assert!(
        err.to_string()
            .starts_with("Too many Cluster redirections. Last error:")
    );
    // One original attempt plus exactly `max_redirections` retries.
    let total = a_gets.load(Ordering::SeqCst) + b_gets.load(Ordering::SeqCst);
    assert_eq!(total, 4);
}

#[tokio::test]
async fn test_offline_queue_drains_in_order() {
    let (listener, addr) = bind().await;
    let port = addr.port();
    let keys: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let handler: Handler = {
        let keys = keys.clone();
        Arc::new(move |name, args| match name {
            "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port)])],
            "CLUSTER" => vec![info_ok()],
            "GET" => {
                keys.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&args[0]).into_owned());
                vec![bulk("v")]
            }
            _ => vec![ok()],
        })
    };
    serve(listener, handler);

    // Lazy: the first submitted command triggers the connect, and everything
    // buffers offline until ready.
    let cluster = Cluster::new([("127.0.0.1", port)], lazy_config());
    assert_eq!(cluster.status(), ClusterStatus::Wait);

    let (r1, r2, r3) = tokio::join!(
        cluster.call("GET", ["k1"]),
        cluster.call("GET", ["k2"]),
        cluster.call("GET", ["k3"]),
    );
    assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());
    assert_eq!(
        *keys.lock().unwrap(),
        vec!["k1".to_string(), "k2".to_string(), "k3".to_string()]
    );
    assert_eq!(cluster.status(), ClusterStatus::Ready);
}

#[tokio::test]
async fn test_offline_queue_disabled_rejects_before_ready() {
    let config = ClusterConfig {
        lazy_connect: true,
        enable_offline_queue: false,
        ..Default::default()
    };
    let cluster = Cluster::new([("127.0.0.1", 1)], config);
    let err = cluster.call("GET", ["foo"]).await.unwrap_err();
    assert!(matches!(err, ClusterError::OfflineQueueDisabled));
}

#[tokio::test]
async fn test_quit_during_wait() {
    let cluster = Cluster::new([("127.0.0.1", 1)], lazy_config());
    assert_eq!(cluster.status(), ClusterStatus::Wait);

    let mut events = cluster.subscribe_events();
    let reply = cluster.quit().await.unwrap();
    assert_eq!(reply, RespValue::ok());

    let mut watch = cluster.status_watch();
    timeout(
        Duration::from_secs(1),
        watch.wait_for(|status| *status == ClusterStatus::End),
    )
    .await
    .unwrap()
    .unwrap();

    // close precedes end; no socket was ever opened.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClusterEvent::Status(status) = event {
            seen.push(status);
        }
    }
    assert_eq!(seen, vec![ClusterStatus::Close, ClusterStatus::End]);

    // Terminal: every later command aborts immediately.
    let err = cluster.call("GET", ["foo"]).await.unwrap_err();
    assert!(matches!(err, ClusterError::ConnectionClosed));
}

#[tokio::test]
async fn test_connect_fails_with_no_startup_nodes() {
    let cluster = Cluster::new(Vec::<NodeEndpoint>::new(), lazy_config());
    let err = cluster.connect().await.unwrap_err();
    assert!(matches!(err, ClusterError::InvalidStartupNodes));
    assert_eq!(cluster.status(), ClusterStatus::End);
}

#[tokio::test]
async fn test_unreachable_startup_nodes_reject_connect() {
    // Reserve a port with no listener behind it.
    let (listener, addr) = bind().await;
    let port = addr.port();
    drop(listener);

    let config = ClusterConfig {
        lazy_connect: true,
        cluster_retry_strategy: Some(Arc::new(|_| None)),
        ..Default::default()
    };
    let cluster = Cluster::new([("127.0.0.1", port)], config);
    let mut events = cluster.subscribe_events();

    let err = cluster.connect().await.unwrap_err();
    assert!(matches!(err, ClusterError::NoStartupNodes));

    let mut watch = cluster.status_watch();
    timeout(
        Duration::from_secs(1),
        watch.wait_for(|status| *status == ClusterStatus::End),
    )
    .await
    .unwrap()
    .unwrap();

    // The topology failure surfaced as an `error` event.
    let mut saw_refresh_error = false;
    while let Ok(event) = events.try_recv() {
        if let ClusterEvent::Error(message) = event {
            saw_refresh_error |= message.contains("Failed to refresh slots cache.");
        }
    }
    assert!(saw_refresh_error);
}

#[tokio::test]
async fn test_ready_check_failure_prevents_ready() {
    let (listener, addr) = bind().await;
    let port = addr.port();
    let handler: Handler = Arc::new(move |name, args| match name {
        "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port)])],
        "CLUSTER" => vec![info_fail()],
        _ => vec![ok()],
    });
    serve(listener, handler);

    let config = ClusterConfig {
        lazy_connect: true,
        cluster_retry_strategy: Some(Arc::new(|_| None)),
        ..Default::default()
    };
    let cluster = Cluster::new([("127.0.0.1", port)], config);
    let err = cluster.connect().await.unwrap_err();
    assert!(matches!(err, ClusterError::NoStartupNodes));

    let mut watch = cluster.status_watch();
    timeout(
        Duration::from_secs(1),
        watch.wait_for(|status| *status == ClusterStatus::End),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_subscribe_routes_through_the_subscriber() {
    let (listener, addr) = bind().await;
    let port = addr.port();
    let handler: Handler = Arc::new(move |name, args| match name {
        "CLUSTER" if is_subcommand(args, b"SLOTS") => vec![slots_reply(&[(0, 16383, port)])],
        "CLUSTER" => vec![info_ok()],
        "SUBSCRIBE" => {
            let channel = args[0].clone();
            vec![
                // Confirmation, then an immediate message on the channel.
                RespFrame::Array(vec![
                    RespFrame::BulkString(Bytes::from_static(b"subscribe")),
                    RespFrame::BulkString(channel.clone()),
                    RespFrame::Integer(1),
                ]),
                RespFrame::Array(vec![
                    RespFrame::BulkString(Bytes::from_static(b"message")),
                    RespFrame::BulkString(channel),
                    RespFrame::BulkString(Bytes::from_static(b"hello")),
                ]),
            ]
        }
        _ => vec![ok()],
    });
    serve(listener, handler);

    let cluster = Cluster::new([("127.0.0.1", port)], lazy_config());
    cluster.connect().await.unwrap();

    let mut messages = cluster.messages();
    let reply = cluster.call("SUBSCRIBE", ["news"]).await.unwrap();
    assert!(matches!(reply, RespValue::Array(_)));

    let message = timeout(Duration::from_secs(1), messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.channel.as_ref(), b"news");
    assert_eq!(message.payload.as_ref(), b"hello");
    assert_eq!(message.pattern, None);
}
