//! End-to-end bridge tests over in-memory duplex pipes.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pylon_bridge::{
    Bridge, BridgeConfig, DcRegistry, NullSink, PermitAll, UpstreamConnector, framing,
};
use pylon_session::{KvStore, MemoryKv, SessionId, SessionStore};
use tokio::io::DuplexStream;
use tokio::time::timeout;

const MAX: usize = 1 << 20;
const TICK: Duration = Duration::from_secs(2);

/// Hands out preloaded duplex pipes instead of TCP sockets. Connecting to an
/// address with nothing preloaded is refused, like an unreachable datacenter.
#[derive(Clone)]
struct TestConnector {
    streams: Arc<Mutex<HashMap<String, VecDeque<DuplexStream>>>>,
}

impl TestConnector {
    fn new() -> Self {
        Self { streams: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Queue a pipe for `addr` and return the far (datacenter) end.
    fn preload(&self, addr: &str) -> DuplexStream {
        self.preload_with_capacity(addr, 1 << 16)
    }

    fn preload_with_capacity(&self, addr: &str, capacity: usize) -> DuplexStream {
        let (near, far) = tokio::io::duplex(capacity);
        self.streams.lock().unwrap().entry(addr.to_owned()).or_default().push_back(near);
        far
    }
}

impl UpstreamConnector for TestConnector {
    type Stream = DuplexStream;

    fn connect(&self, addr: &str) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        let stream = self.streams.lock().unwrap().get_mut(addr).and_then(VecDeque::pop_front);
        async move {
            stream.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no upstream"))
        }
    }
}

struct Harness {
    bridge: Bridge<TestConnector>,
    connector: TestConnector,
    store: Arc<SessionStore>,
    kv: Arc<MemoryKv>,
}

fn harness() -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let store = Arc::new(SessionStore::new(kv.clone(), Duration::from_secs(60)));
    let mut registry = DcRegistry::empty();
    registry.set_endpoint(2, "dc2.test:443");
    let connector = TestConnector::new();
    let bridge = Bridge::new(
        BridgeConfig::default(),
        store.clone(),
        registry,
        Arc::new(PermitAll),
        Arc::new(NullSink),
        connector.clone(),
    );
    Harness { bridge, connector, store, kv }
}

impl Harness {
    /// The single live session, via the backing kv. Panics unless exactly
    /// one exists.
    fn only_session(&self) -> pylon_session::Session {
        let keys = self.kv.list("session/").unwrap();
        assert_eq!(keys.len(), 1, "expected exactly one session");
        let id = keys[0].strip_prefix("session/").and_then(SessionId::from_hex).unwrap();
        self.store.get(id).unwrap()
    }
}

/// Open a client connection; the bridge serves the far end in a task.
fn connect_client<C: UpstreamConnector>(bridge: &Bridge<C>) -> DuplexStream {
    let (client, served) = tokio::io::duplex(1 << 16);
    let bridge = bridge.clone();
    tokio::spawn(async move {
        bridge.serve_connection(served, IpAddr::from([127, 0, 0, 1]), None).await;
    });
    client
}

/// A shape-valid binary frame: `len` bytes of `fill`, first 8 acting as the
/// auth_key_id. `fill` must not be `b'{'`.
fn binary_frame(fill: u8, len: usize) -> Vec<u8> {
    assert!(len >= 24 && len % 4 == 0);
    vec![fill; len]
}

async fn recv(stream: &mut DuplexStream) -> Vec<u8> {
    timeout(TICK, framing::read_frame(stream, MAX))
        .await
        .expect("timed out waiting for frame")
        .expect("read failed")
        .expect("stream closed")
}

async fn recv_json(stream: &mut DuplexStream) -> serde_json::Value {
    serde_json::from_slice(&recv(stream).await).expect("reply is not json")
}

async fn send(stream: &mut DuplexStream, payload: &[u8]) {
    framing::write_frame(stream, payload).await.expect("write failed");
}

// ─── Control channel ──────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_pong() {
    let h = harness();
    let mut client = connect_client(&h.bridge);

    send(&mut client, br#"{"type":"ping"}"#).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn unknown_control_type_gets_error_reply() {
    let h = harness();
    let mut client = connect_client(&h.bridge);

    send(&mut client, br#"{"type":"reverse_polarity"}"#).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "unknown_type");
}

#[tokio::test]
async fn malformed_control_gets_error_reply() {
    let h = harness();
    let mut client = connect_client(&h.bridge);

    send(&mut client, br#"{"not json"#).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_control");
}

#[tokio::test]
async fn get_session_info_round_trip() {
    let h = harness();
    let created = h.bridge.session_api().create(2, Some(7)).unwrap();

    let mut client = connect_client(&h.bridge);
    let req = format!(r#"{{"type":"get_session_info","session_id":"{}"}}"#, created.session_id);
    send(&mut client, req.as_bytes()).await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "session_info");
    assert_eq!(reply["session"]["session_id"], created.session_id);
    assert_eq!(reply["session"]["dc_id"], 2);
    assert_eq!(reply["session"]["user_id"], 7);
    // Key material never leaves the process.
    assert!(reply["session"].get("auth_key").is_none());
}

#[tokio::test]
async fn get_session_info_for_missing_session() {
    let h = harness();
    let mut client = connect_client(&h.bridge);

    send(&mut client, br#"{"type":"get_session_info","session_id":"00000000000000ff"}"#).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "session_not_found");
}

// ─── Relay path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn forwards_frame_and_routes_reply_back() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    let out = binary_frame(0xAA, 40);
    send(&mut client, &out).await;
    // Forwarded verbatim, byte for byte.
    assert_eq!(recv(&mut dc2).await, out);

    // The datacenter replies with a frame tagged with the same key id.
    let reply = binary_frame(0xAA, 32);
    send(&mut dc2, &reply).await;
    assert_eq!(recv(&mut client).await, reply);
}

#[tokio::test]
async fn first_frame_creates_session_and_upstream() {
    let h = harness();
    let _dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    send(&mut client, &binary_frame(0xAA, 40)).await;
    send(&mut client, br#"{"type":"get_stats"}"#).await;

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "stats");
    assert_eq!(reply["connections"], 1);
    assert_eq!(reply["upstreams"], 1);
    assert_eq!(reply["sessions"], 1);
}

#[tokio::test]
async fn replies_route_only_to_the_owning_connection() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut alice = connect_client(&h.bridge);
    let mut bob = connect_client(&h.bridge);

    // Both clients bind through the same shared upstream.
    send(&mut alice, &binary_frame(0xAA, 40)).await;
    send(&mut bob, &binary_frame(0xBB, 40)).await;
    let first = recv(&mut dc2).await;
    let second = recv(&mut dc2).await;
    let mut fills: Vec<u8> = vec![first[0], second[0]];
    fills.sort_unstable();
    assert_eq!(fills, vec![0xAA, 0xBB]);

    // A reply tagged with Bob's key id reaches only Bob.
    let for_bob = binary_frame(0xBB, 32);
    send(&mut dc2, &for_bob).await;
    assert_eq!(recv(&mut bob).await, for_bob);
    assert!(
        timeout(Duration::from_millis(100), framing::read_frame(&mut alice, MAX)).await.is_err(),
        "reply for bob leaked to alice"
    );

    // And vice versa.
    let for_alice = binary_frame(0xAA, 32);
    send(&mut dc2, &for_alice).await;
    assert_eq!(recv(&mut alice).await, for_alice);
}

#[tokio::test]
async fn unroutable_upstream_frame_is_dropped() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    send(&mut client, &binary_frame(0xAA, 40)).await;
    recv(&mut dc2).await;

    // Tagged with a key id nobody is bound to: silently dropped.
    send(&mut dc2, &binary_frame(0xCC, 32)).await;
    let for_client = binary_frame(0xAA, 32);
    send(&mut dc2, &for_client).await;
    // The client sees only its own frame; the stray one never arrives.
    assert_eq!(recv(&mut client).await, for_client);
}

#[tokio::test]
async fn runt_binary_frame_is_rejected_without_closing() {
    let h = harness();
    let _dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    send(&mut client, &[0xAAu8; 10]).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_frame");

    // The connection is still fully functional.
    let mut dc2 = _dc2;
    let out = binary_frame(0xAA, 40);
    send(&mut client, &out).await;
    assert_eq!(recv(&mut dc2).await, out);
}

#[tokio::test]
async fn unreachable_upstream_fails_the_frame_not_the_connection() {
    let h = harness();
    let mut client = connect_client(&h.bridge);

    // Nothing preloaded for dc2: connect is refused.
    send(&mut client, &binary_frame(0xAA, 40)).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "connection_error");

    // The datacenter comes back; the same connection recovers on the next
    // frame without reconnecting.
    let mut dc2 = h.connector.preload("dc2.test:443");
    let out = binary_frame(0xAA, 40);
    send(&mut client, &out).await;
    assert_eq!(recv(&mut dc2).await, out);
}

#[tokio::test]
async fn reconnecting_client_rebinds_its_session() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    send(&mut client, &binary_frame(0xAA, 40)).await;
    recv(&mut dc2).await;
    let first = h.only_session();
    drop(client);
    timeout(TICK, async {
        while h.bridge.stats().await.connections > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection entry never removed");

    // Same key id on a new connection: the surviving session is re-bound,
    // not replaced.
    let mut client = connect_client(&h.bridge);
    send(&mut client, &binary_frame(0xAA, 40)).await;
    recv(&mut dc2).await;
    let rebound = h.only_session();
    assert_eq!(rebound.session_id, first.session_id);

    // Replies route to the reconnected socket.
    let reply = binary_frame(0xAA, 32);
    send(&mut dc2, &reply).await;
    assert_eq!(recv(&mut client).await, reply);
}

#[tokio::test]
async fn different_key_ids_get_different_sessions() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut alice = connect_client(&h.bridge);
    let mut bob = connect_client(&h.bridge);

    send(&mut alice, &binary_frame(0xAA, 40)).await;
    recv(&mut dc2).await;
    send(&mut bob, &binary_frame(0xBB, 40)).await;
    recv(&mut dc2).await;

    assert_eq!(h.bridge.stats().await.sessions, 2);
}

#[tokio::test]
async fn hanging_upstream_connect_does_not_block_other_connections() {
    struct HangingConnector;
    impl UpstreamConnector for HangingConnector {
        type Stream = DuplexStream;
        fn connect(&self, _addr: &str) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            std::future::pending()
        }
    }

    let store = Arc::new(SessionStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(60)));
    let mut registry = DcRegistry::empty();
    registry.set_endpoint(2, "dc2.test:443");
    let config =
        BridgeConfig { connect_deadline: Duration::from_millis(200), ..BridgeConfig::default() };
    let bridge = Bridge::new(
        config,
        store,
        registry,
        Arc::new(PermitAll),
        Arc::new(NullSink),
        HangingConnector,
    );

    let mut alice = connect_client(&bridge);
    let mut bob = connect_client(&bridge);

    // Alice's frame stalls in a connect that never resolves; Bob's control
    // traffic must still be answered while it does.
    send(&mut alice, &binary_frame(0xAA, 40)).await;
    send(&mut bob, br#"{"type":"get_stats"}"#).await;
    assert_eq!(recv_json(&mut bob).await["type"], "stats");

    // Alice's frame fails with a connection error once the deadline fires.
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "connection_error");
}

#[tokio::test]
async fn stale_reader_does_not_evict_a_replacement_upstream() {
    let store = Arc::new(SessionStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(60)));
    let mut registry = DcRegistry::empty();
    registry.set_endpoint(2, "dc2.test:443");
    let connector = TestConnector::new();
    let config =
        BridgeConfig { write_deadline: Duration::from_millis(100), ..BridgeConfig::default() };
    let bridge = Bridge::new(
        config,
        store,
        registry,
        Arc::new(PermitAll),
        Arc::new(NullSink),
        connector.clone(),
    );

    // First pipe's buffer is too small for one frame: its writer stalls and
    // dies at the write deadline while its reader stays alive.
    let first = connector.preload_with_capacity("dc2.test:443", 16);
    let mut second = connector.preload("dc2.test:443");
    let mut client = connect_client(&bridge);

    send(&mut client, &binary_frame(0xAA, 40)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The dead writer is noticed and the replacement socket takes over.
    let out = binary_frame(0xAA, 40);
    send(&mut client, &out).await;
    assert_eq!(recv(&mut second).await, out);

    // Now the first socket's reader exits. It must not evict the
    // replacement: the next frame still flows over it, with no third pipe
    // available to reconnect through.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let out = binary_frame(0xAA, 40);
    send(&mut client, &out).await;
    assert_eq!(recv(&mut second).await, out);
}

#[tokio::test]
async fn frame_violations_shrink_the_ip_connection_budget() {
    let store = Arc::new(SessionStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(60)));
    let bridge = Bridge::new(
        BridgeConfig::default(),
        store,
        DcRegistry::empty(),
        Arc::new(pylon_bridge::FixedWindow::new(2, Duration::from_secs(60))),
        Arc::new(NullSink),
        TestConnector::new(),
    );

    // First connection spends one budget unit, the malformed frame a second.
    let mut client = connect_client(&bridge);
    send(&mut client, &[0xAAu8; 10]).await;
    assert_eq!(recv_json(&mut client).await["code"], "invalid_frame");

    // The same IP's next connection is refused.
    let mut repeat = connect_client(&bridge);
    let reply = recv_json(&mut repeat).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "rate_limited");
}

#[tokio::test]
async fn unregistered_dc_is_a_connection_error() {
    let store = Arc::new(SessionStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(60)));
    let connector = TestConnector::new();
    let bridge = Bridge::new(
        BridgeConfig::default(),
        store,
        DcRegistry::empty(),
        Arc::new(PermitAll),
        Arc::new(NullSink),
        connector,
    );
    let mut client = connect_client(&bridge);

    send(&mut client, &binary_frame(0xAA, 40)).await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "connection_error");
}

#[tokio::test]
async fn upstream_socket_is_shared_across_clients() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    // No second pipe preloaded: a second connect attempt would fail, so a
    // passing test proves the socket was reused.
    let mut alice = connect_client(&h.bridge);
    let mut bob = connect_client(&h.bridge);

    send(&mut alice, &binary_frame(0xAA, 40)).await;
    recv(&mut dc2).await;
    send(&mut bob, &binary_frame(0xBB, 40)).await;
    assert_eq!(recv(&mut dc2).await[0], 0xBB);
}

#[tokio::test]
async fn per_connection_frame_order_is_preserved() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    for i in 0..5u8 {
        let mut frame = binary_frame(0xAA, 40);
        frame[39] = i;
        send(&mut client, &frame).await;
    }
    for i in 0..5u8 {
        assert_eq!(recv(&mut dc2).await[39], i);
    }
}

#[tokio::test]
async fn seq_no_advances_per_forwarded_frame() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    for _ in 0..3 {
        send(&mut client, &binary_frame(0xAA, 40)).await;
        recv(&mut dc2).await;
    }
    // Forwarding is acknowledged back to the store after the upstream send,
    // so poll briefly.
    timeout(TICK, async {
        loop {
            if h.only_session().seq_no == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("seq_no never reached 3");
}

#[tokio::test]
async fn closed_connection_is_unindexed_but_session_survives() {
    let h = harness();
    let mut dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    send(&mut client, &binary_frame(0xAA, 40)).await;
    recv(&mut dc2).await;
    drop(client);

    // Wait for the serve task to notice the close.
    timeout(TICK, async {
        loop {
            if h.bridge.stats().await.connections == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection entry never removed");

    let stats = h.bridge.stats().await;
    assert_eq!(stats.connections, 0);
    // The session record survives the disconnect.
    assert_eq!(stats.sessions, 1);

    // Frames for the departed client are dropped, not delivered elsewhere.
    send(&mut dc2, &binary_frame(0xAA, 32)).await;
    let mut other = connect_client(&h.bridge);
    send(&mut other, br#"{"type":"ping"}"#).await;
    assert_eq!(recv_json(&mut other).await["type"], "pong");
}

#[tokio::test]
async fn upstream_close_empties_the_pool() {
    let h = harness();
    let dc2 = h.connector.preload("dc2.test:443");
    let mut client = connect_client(&h.bridge);

    send(&mut client, &binary_frame(0xAA, 40)).await;
    timeout(TICK, async {
        loop {
            if h.bridge.stats().await.upstreams == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream never registered");

    drop(dc2);
    timeout(TICK, async {
        loop {
            if h.bridge.stats().await.upstreams == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream never unregistered after close");

    // The next frame reconnects through a fresh pipe.
    let mut dc2 = h.connector.preload("dc2.test:443");
    let out = binary_frame(0xAA, 40);
    send(&mut client, &out).await;
    assert_eq!(recv(&mut dc2).await, out);
}

// ─── Abuse gate ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_connection_gets_rate_limited_reply() {
    struct DenyAll;
    impl pylon_bridge::AbuseGate for DenyAll {
        fn allow(&self, _ip: IpAddr) -> Result<bool, pylon_bridge::GateError> {
            Ok(false)
        }
    }

    let store = Arc::new(SessionStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(60)));
    let bridge = Bridge::new(
        BridgeConfig::default(),
        store,
        DcRegistry::empty(),
        Arc::new(DenyAll),
        Arc::new(NullSink),
        TestConnector::new(),
    );
    let mut client = connect_client(&bridge);

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "rate_limited");
}

#[tokio::test]
async fn failing_gate_fails_open() {
    struct BrokenGate;
    impl pylon_bridge::AbuseGate for BrokenGate {
        fn allow(&self, _ip: IpAddr) -> Result<bool, pylon_bridge::GateError> {
            Err(pylon_bridge::GateError("backend down".into()))
        }
    }

    let store = Arc::new(SessionStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(60)));
    let bridge = Bridge::new(
        BridgeConfig::default(),
        store,
        DcRegistry::empty(),
        Arc::new(BrokenGate),
        Arc::new(NullSink),
        TestConnector::new(),
    );
    let mut client = connect_client(&bridge);

    send(&mut client, br#"{"type":"ping"}"#).await;
    assert_eq!(recv_json(&mut client).await["type"], "pong");
}
