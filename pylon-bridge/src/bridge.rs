//! The connection bridge.
//!
//! Multiplexes many client sockets against at most one shared upstream
//! socket per datacenter. Each client connection is one task that reads
//! frames in arrival order; each socket has exactly one writer task fed by a
//! channel, so per-direction FIFO order is preserved. Datacenter frames are
//! routed back by the 8-byte `auth_key_id` prefix through an explicit
//! per-connection index — never broadcast.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use pylon_crypto::{frame_auth_key_id, frame_shape_ok};
use pylon_session::{Session, SessionApi, SessionId, SessionStore, StoreError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};

use crate::abuse::AbuseGate;
use crate::control::{ControlReply, ControlRequest};
use crate::errors::BridgeError;
use crate::framing;
use crate::registry::DcRegistry;
use crate::telemetry::{Event, TelemetrySink};
use crate::upstream::{UpstreamConnector, UpstreamHandle};

/// Tunables for the bridge.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Datacenter used when a first frame carries no routing information.
    pub default_dc: u8,
    /// Hard cap on a single framed message.
    pub max_frame_len: usize,
    /// A socket write slower than this fails the connection instead of
    /// hanging it.
    pub write_deadline: Duration,
    /// An upstream connect slower than this fails the frame with a
    /// connection error.
    pub connect_deadline: Duration,
    /// Depth of each per-socket writer queue.
    pub queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_dc: 2,
            max_frame_len: 1 << 20,
            write_deadline: Duration::from_secs(10),
            connect_deadline: Duration::from_secs(10),
            queue_depth: 64,
        }
    }
}

/// Lifecycle of one client connection.
///
/// A fully closed connection has no entry in the table at all, so there is
/// no stored terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    /// Socket accepted, no session bound yet.
    Connecting,
    /// Session established on the first valid binary frame.
    Bound,
    /// Steady state, frames flowing.
    Forwarding,
    /// Close initiated by either side.
    Closing,
}

struct ConnectionEntry {
    tx: mpsc::Sender<Vec<u8>>,
    session_id: Option<SessionId>,
    dc_id: Option<u8>,
    /// auth_key_id observed on this connection's frames; upstream replies
    /// carrying it are routed here.
    wire_key_id: Option<u64>,
    client_ip: IpAddr,
    country: Option<String>,
    state: ConnState,
}

/// Point-in-time counters, served over the control channel.
#[derive(Clone, Copy, Debug)]
pub struct BridgeStats {
    pub connections: usize,
    pub upstreams: usize,
    pub sessions: usize,
}

struct Inner<C: UpstreamConnector> {
    config: BridgeConfig,
    store: Arc<SessionStore>,
    api: SessionApi,
    registry: DcRegistry,
    gate: Arc<dyn AbuseGate>,
    sink: Arc<dyn TelemetrySink>,
    connector: C,
    conns: DashMap<u64, ConnectionEntry>,
    /// session_id → connection_id, maintained on bind, removed on close.
    route_by_session: DashMap<SessionId, u64>,
    /// auth_key_id → connection_id, ditto.
    route_by_key_id: DashMap<u64, u64>,
    /// At most one shared socket per datacenter. Registration is serialized
    /// by this lock; the connect itself runs outside it so a slow datacenter
    /// cannot stall the others.
    upstreams: Mutex<HashMap<u8, UpstreamHandle>>,
    next_conn_id: AtomicU64,
}

/// The bridge itself. Cheap to clone; all clones share state.
pub struct Bridge<C: UpstreamConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: UpstreamConnector> Clone for Bridge<C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<C: UpstreamConnector> Bridge<C> {
    pub fn new(
        config: BridgeConfig,
        store: Arc<SessionStore>,
        registry: DcRegistry,
        gate: Arc<dyn AbuseGate>,
        sink: Arc<dyn TelemetrySink>,
        connector: C,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                api: SessionApi::new(store.clone()),
                store,
                registry,
                gate,
                sink,
                connector,
                conns: DashMap::new(),
                route_by_session: DashMap::new(),
                route_by_key_id: DashMap::new(),
                upstreams: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// The thin session API (create/validate/delete/info).
    pub fn session_api(&self) -> SessionApi {
        self.inner.api.clone()
    }

    /// Current connection/upstream/session counts.
    pub async fn stats(&self) -> BridgeStats {
        BridgeStats {
            connections: self.inner.conns.len(),
            upstreams: self.inner.upstreams.lock().await.len(),
            sessions: self.inner.store.count().unwrap_or(0),
        }
    }

    // ─── Connection lifecycle ─────────────────────────────────────────────────

    /// Drive one client connection to completion. The caller typically
    /// spawns this per accepted socket.
    pub async fn serve_connection<S>(&self, stream: S, client_ip: IpAddr, country: Option<String>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = &self.inner;
        // Gate errors fail open: a degraded abuse backend must not become a
        // denial of service against legitimate traffic.
        let allowed = match inner.gate.allow(client_ip) {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(%client_ip, error = %e, "abuse gate unavailable, allowing");
                true
            }
        };

        let (mut reader, mut writer) = tokio::io::split(stream);
        if !allowed {
            inner.sink.record(Event::ConnectionRejected { client_ip });
            let reply = ControlReply::Error {
                code: "rate_limited",
                message: "connection refused".into(),
            };
            let _ = framing::write_frame(&mut writer, &reply.to_bytes()).await;
            return;
        }

        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(inner.config.queue_depth);
        inner.conns.insert(
            conn_id,
            ConnectionEntry {
                tx,
                session_id: None,
                dc_id: None,
                wire_key_id: None,
                client_ip,
                country: country.clone(),
                state: ConnState::Connecting,
            },
        );
        inner.sink.record(Event::ConnectionOpened { connection_id: conn_id, client_ip, country });

        // Single writer per client socket; frames stay in submission order.
        let deadline = inner.config.write_deadline;
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match tokio::time::timeout(deadline, framing::write_frame(&mut writer, &frame)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        });

        loop {
            match framing::read_frame(&mut reader, inner.config.max_frame_len).await {
                Ok(Some(frame)) => self.dispatch(conn_id, frame).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(conn_id, error = %e, "client read failed");
                    break;
                }
            }
        }

        if let Some(mut entry) = inner.conns.get_mut(&conn_id) {
            entry.state = ConnState::Closing;
        }
        self.close_connection(conn_id);
        // Tears down this connection's pending writes only; shared upstream
        // sockets and other clients are untouched.
        writer_task.abort();
    }

    /// Flush session activity, drop the entry and its routing index rows.
    /// The session record itself survives for reconnection.
    fn close_connection(&self, conn_id: u64) {
        let Some((_, entry)) = self.inner.conns.remove(&conn_id) else {
            return;
        };
        if let Some(sid) = entry.session_id {
            self.inner.route_by_session.remove(&sid);
            if let Ok(mut session) = self.inner.store.get(sid) {
                if let Err(e) = self.inner.store.update(&mut session) {
                    tracing::warn!(conn_id, error = %e, "failed to flush session on close");
                }
            }
        }
        if let Some(kid) = entry.wire_key_id {
            self.inner.route_by_key_id.remove_if(&kid, |_, v| *v == conn_id);
        }
        tracing::debug!(
            conn_id,
            client_ip = %entry.client_ip,
            country = ?entry.country,
            state = ?entry.state,
            "connection closed"
        );
        self.inner.sink.record(Event::ConnectionClosed { connection_id: conn_id });
    }

    // ─── Frame dispatch ───────────────────────────────────────────────────────

    async fn dispatch(&self, conn_id: u64, frame: Vec<u8>) {
        // JSON control messages share the socket; a binary MTProto frame
        // never begins with '{' (see Session key generation).
        if frame.first() == Some(&b'{') {
            self.handle_control(conn_id, &frame).await;
        } else {
            self.handle_client_frame(conn_id, frame).await;
        }
    }

    async fn handle_client_frame(&self, conn_id: u64, frame: Vec<u8>) {
        if !frame_shape_ok(&frame) {
            self.fail_frame(conn_id, BridgeError::InvalidFrame).await;
            return;
        }

        let session = match self.ensure_bound(conn_id, &frame) {
            Ok(session) => session,
            Err(e) => {
                self.fail_frame(conn_id, e).await;
                return;
            }
        };
        let dc_id = session.dc_id;

        let upstream_tx = match self.ensure_upstream(dc_id).await {
            Ok(tx) => tx,
            Err(e) => {
                self.fail_frame(conn_id, e).await;
                return;
            }
        };

        let bytes = frame.len();
        if upstream_tx.send(frame).await.is_err() {
            // The writer died between lookup and send; forget the handle so
            // the next frame reconnects.
            let mut pool = self.inner.upstreams.lock().await;
            if pool.get(&dc_id).is_some_and(|h| !h.is_open()) {
                pool.remove(&dc_id);
            }
            drop(pool);
            self.fail_frame(conn_id, BridgeError::Connection(dc_id)).await;
            return;
        }

        match self.inner.store.touch(session.session_id) {
            Ok(_) => {
                if let Some(mut entry) = self.inner.conns.get_mut(&conn_id) {
                    entry.state = ConnState::Forwarding;
                }
                self.inner.sink.record(Event::FrameForwarded { connection_id: conn_id, dc_id, bytes });
            }
            Err(e) => self.fail_frame(conn_id, e.into()).await,
        }
    }

    /// Resolve the bound session. On the first valid frame the key id is
    /// looked up in the store, so a reconnecting client re-binds the session
    /// it already owns; only an unknown (or expired) key id creates a fresh
    /// one. The store copy is always re-fetched; a cached session is never
    /// authoritative across suspension points.
    fn ensure_bound(&self, conn_id: u64, frame: &[u8]) -> Result<Session, BridgeError> {
        if let Some(sid) = self.inner.conns.get(&conn_id).and_then(|e| e.session_id) {
            return match self.inner.store.get(sid) {
                Ok(session) => Ok(session),
                Err(e @ (StoreError::NotFound | StoreError::Expired)) => {
                    self.unbind(conn_id, sid);
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            };
        }

        let key_id = frame_auth_key_id(frame).ok_or(BridgeError::InvalidFrame)?;
        let session = match self.inner.store.find_by_key_id(key_id) {
            Ok(session) => session,
            Err(StoreError::NotFound | StoreError::Expired) => {
                self.inner.store.create_with_key_id(self.inner.config.default_dc, None, key_id)?
            }
            Err(e) => return Err(e.into()),
        };

        self.inner.route_by_session.insert(session.session_id, conn_id);
        self.inner.route_by_key_id.insert(key_id, conn_id);
        if let Some(mut entry) = self.inner.conns.get_mut(&conn_id) {
            entry.session_id = Some(session.session_id);
            entry.dc_id = Some(session.dc_id);
            entry.wire_key_id = Some(key_id);
            entry.state = ConnState::Bound;
        }
        tracing::debug!(conn_id, session = %session.session_id, dc_id = session.dc_id, "session bound");
        Ok(session)
    }

    fn unbind(&self, conn_id: u64, sid: SessionId) {
        self.inner.route_by_session.remove(&sid);
        let key_id = self.inner.conns.get_mut(&conn_id).and_then(|mut entry| {
            entry.session_id = None;
            entry.dc_id = None;
            entry.state = ConnState::Connecting;
            entry.wire_key_id.take()
        });
        if let Some(kid) = key_id {
            self.inner.route_by_key_id.remove_if(&kid, |_, v| *v == conn_id);
        }
    }

    // ─── Upstream pool ────────────────────────────────────────────────────────

    /// Sender for the shared upstream to `dc_id`, connecting lazily.
    ///
    /// The pool lock is never held across the connect: a slow or blackholed
    /// datacenter must not stall traffic bound for the others. The connect
    /// itself is deadline-bounded, and the pool is re-checked before
    /// registration so a racing creator's surplus socket is dropped instead
    /// of orphaning a registered one.
    async fn ensure_upstream(&self, dc_id: u8) -> Result<mpsc::Sender<Vec<u8>>, BridgeError> {
        {
            let mut pool = self.inner.upstreams.lock().await;
            if let Some(handle) = pool.get(&dc_id) {
                if handle.is_open() {
                    return Ok(handle.tx.clone());
                }
                pool.remove(&dc_id);
            }
        }

        let addr = self
            .inner
            .registry
            .endpoint_for(dc_id)
            .ok_or(BridgeError::Connection(dc_id))?;
        let connect = self.inner.connector.connect(addr);
        let stream = match tokio::time::timeout(self.inner.config.connect_deadline, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(dc_id, addr, error = %e, "upstream connect failed");
                return Err(BridgeError::Connection(dc_id));
            }
            Err(_) => {
                tracing::warn!(dc_id, addr, "upstream connect timed out");
                return Err(BridgeError::Connection(dc_id));
            }
        };

        let mut pool = self.inner.upstreams.lock().await;
        if let Some(handle) = pool.get(&dc_id) {
            if handle.is_open() {
                // Another task won the race; our socket is surplus and is
                // closed by the drop here, never registered.
                return Ok(handle.tx.clone());
            }
            pool.remove(&dc_id);
        }

        let (read_half, mut write_half) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.inner.config.queue_depth);
        let deadline = self.inner.config.write_deadline;
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match tokio::time::timeout(deadline, framing::write_frame(&mut write_half, &frame))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        });

        let bridge = self.clone();
        let reader_tx = tx.clone();
        tokio::spawn(async move {
            bridge.upstream_reader(dc_id, read_half, reader_tx).await;
        });

        pool.insert(dc_id, UpstreamHandle { tx: tx.clone() });
        self.inner.sink.record(Event::UpstreamOpened { dc_id });
        Ok(tx)
    }

    /// `tx` identifies the socket this reader belongs to, so an old reader
    /// outliving its writer can never evict a replacement handle.
    async fn upstream_reader<R>(&self, dc_id: u8, mut reader: R, tx: mpsc::Sender<Vec<u8>>)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match framing::read_frame(&mut reader, self.inner.config.max_frame_len).await {
                Ok(Some(frame)) => self.route_upstream_frame(dc_id, frame).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(dc_id, error = %e, "upstream read failed");
                    break;
                }
            }
        }
        let mut pool = self.inner.upstreams.lock().await;
        if pool.get(&dc_id).is_some_and(|h| h.tx.same_channel(&tx)) {
            pool.remove(&dc_id);
            drop(pool);
            self.inner.sink.record(Event::UpstreamClosed { dc_id });
        }
    }

    /// Deliver a datacenter frame to the one connection whose bound session
    /// carries the frame's key id. Unroutable frames are dropped and
    /// counted, never broadcast.
    async fn route_upstream_frame(&self, dc_id: u8, frame: Vec<u8>) {
        let Some(key_id) = frame_auth_key_id(&frame) else {
            tracing::debug!(dc_id, len = frame.len(), "runt upstream frame dropped");
            return;
        };
        let Some(conn_id) = self.inner.route_by_key_id.get(&key_id).map(|r| *r) else {
            self.inner.sink.record(Event::Error { connection_id: None, code: "unroutable_frame" });
            tracing::debug!(dc_id, "no connection bound for upstream frame");
            return;
        };
        let tx = {
            let Some(entry) = self.inner.conns.get(&conn_id) else {
                return;
            };
            if entry.dc_id != Some(dc_id) {
                tracing::warn!(conn_id, dc_id, "upstream frame for foreign dc, dropped");
                return;
            }
            entry.tx.clone()
        };
        let bytes = frame.len();
        if tx.send(frame).await.is_ok() {
            self.inner.sink.record(Event::FrameDelivered { connection_id: conn_id, dc_id, bytes });
        }
    }

    // ─── Control channel ──────────────────────────────────────────────────────

    async fn handle_control(&self, conn_id: u64, frame: &[u8]) {
        let reply = match serde_json::from_slice::<ControlRequest>(frame) {
            Ok(ControlRequest::Ping) => ControlReply::Pong,
            Ok(ControlRequest::GetStats) => {
                let stats = self.stats().await;
                ControlReply::Stats {
                    connections: stats.connections,
                    upstreams: stats.upstreams,
                    sessions: stats.sessions,
                }
            }
            Ok(ControlRequest::GetSessionInfo { session_id }) => {
                match self.inner.api.info(&session_id) {
                    Ok(session) => ControlReply::SessionInfo { session },
                    Err(e) => ControlReply::error(&BridgeError::Store(e)),
                }
            }
            Ok(ControlRequest::Unknown) => ControlReply::Error {
                code: "unknown_type",
                message: "unrecognized control message".into(),
            },
            Err(e) => ControlReply::Error { code: "invalid_control", message: e.to_string() },
        };
        self.send_to_client(conn_id, reply.to_bytes()).await;
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    /// Fail one message: structured acknowledgement to the client, telemetry,
    /// connection stays open. Malformed and tampered frames count against
    /// the sender's abuse budget.
    async fn fail_frame(&self, conn_id: u64, err: BridgeError) {
        if matches!(err, BridgeError::Encryption(_)) {
            tracing::error!(conn_id, error = %err, "codec precondition violated");
        } else {
            tracing::debug!(conn_id, error = %err, "frame failed");
        }
        if matches!(err, BridgeError::InvalidFrame | BridgeError::Integrity) {
            if let Some(entry) = self.inner.conns.get(&conn_id) {
                self.inner.gate.penalize(entry.client_ip);
            }
        }
        self.inner.sink.record(Event::Error { connection_id: Some(conn_id), code: err.code() });
        self.send_to_client(conn_id, ControlReply::error(&err).to_bytes()).await;
    }

    async fn send_to_client(&self, conn_id: u64, payload: Vec<u8>) {
        let tx = match self.inner.conns.get(&conn_id) {
            Some(entry) => entry.tx.clone(),
            None => return,
        };
        let _ = tx.send(payload).await;
    }
}
