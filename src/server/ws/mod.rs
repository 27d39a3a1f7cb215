//! WebSocket gateway
//!
//! Shared gateway state plus the axum upgrade handler. Each accepted socket
//! is owned by a [`ConnectionSupervisor`]; the state here holds the registries
//! every supervisor shares (connections, authenticated clients, presence,
//! health, nodes) and the broadcaster that fans events out to clients.

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::challenge::ChallengeAuthenticator;
use crate::auth::{self, Role};
use crate::server::ratelimit::ConnectRateLimiter;

pub mod config;
pub mod dispatch;
pub mod frames;
mod handlers;
pub mod nodes;
pub mod outbound;
pub mod supervisor;
pub mod versions;


pub use config::{
    build_ws_config_from_value, resolve_bind_address,
    GatewayConfigError, WsPolicy, WsServerConfig,
};
pub use dispatch::{MethodHandler, MethodTable, RequestContext, Responder};
pub use frames::{ErrorShape, PROTOCOL_VERSION};
pub use supervisor::{CloseCause, CloseRecord, ConnectionMeta, ConnectionSupervisor, HandshakeState};
pub use versions::{StateVersion, StateVersions};

use frames::{
    now_ms, server_hostname, server_version, EventFrame, Features, HelloOkPayload, PolicyInfo,
    ServerInfo, Snapshot, EVENT_HEALTH, EVENT_PRESENCE, EVENT_SHUTDOWN, GATEWAY_EVENTS,
    METHOD_NODE_EVENT, METHOD_NODE_HEARTBEAT, METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE,
};
use nodes::NodeRegistry;
use outbound::{spawn_writer, Outbound};
use supervisor::Client;

/// Presence entries returned in snapshots and broadcasts.
const MAX_PRESENCE_ENTRIES: usize = 200;

/// How long a closed socket's writer gets to flush its final frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const HEALTH_OK: &str = "healthy";
pub const HEALTH_SHUTTING_DOWN: &str = "shutting-down";

/// One authenticated client in the presence snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub conn_id: String,
    pub client_id: String,
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Remote clients only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub ts: u64,
}

impl PresenceEntry {
    fn for_client(client: &Client) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            conn_id: client.conn_id.clone(),
            client_id: client.client_id.clone(),
            role: client.role.as_str(),
            node_id: client.role.node_id().map(str::to_string),
            host: client.info.display_name.clone(),
            ip: (!auth::is_loopback_addr(client.remote_ip)).then(|| client.remote_ip.to_string()),
            version: non_empty(&client.info.version),
            platform: non_empty(&client.info.platform),
            mode: non_empty(&client.info.mode),
            instance_id: client.info.instance_id.clone(),
            ts: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub ts: u64,
}

/// Per-broadcast delivery policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOptions {
    /// Skip clients whose outbound buffer is saturated instead of
    /// evicting them.
    pub drop_if_slow: bool,
    pub state_version: Option<StateVersion>,
}

impl BroadcastOptions {
    pub fn droppable() -> Self {
        Self {
            drop_if_slow: true,
            state_version: None,
        }
    }

    pub fn reliable() -> Self {
        Self::default()
    }

    pub fn with_state_version(mut self, version: StateVersion) -> Self {
        self.state_version = Some(version);
        self
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Saturated clients skipped under `drop_if_slow`.
    pub dropped_slow: usize,
    /// Clients not subscribed to the event.
    pub filtered: usize,
    /// Clients whose writer had already shut down.
    pub failed: usize,
    /// Saturated clients evicted as slow consumers.
    pub closed_slow: usize,
}

#[derive(Clone)]
struct ClientHandle {
    supervisor: Arc<ConnectionSupervisor>,
    client: Arc<Client>,
}

pub struct WsServerState {
    config: WsServerConfig,
    start_time: Instant,
    authenticator: ChallengeAuthenticator,
    connect_limiter: ConnectRateLimiter,
    methods: MethodTable,
    /// Every accepted connection, pending or authenticated.
    connections: RwLock<HashMap<String, Arc<ConnectionSupervisor>>>,
    /// Authenticated clients keyed by connection id.
    clients: RwLock<HashMap<String, ClientHandle>>,
    presence: Mutex<HashMap<String, PresenceEntry>>,
    health: Mutex<HealthSnapshot>,
    versions: StateVersions,
    event_seq: AtomicU64,
    /// Serializes version bump + fan-out so versioned events leave in order.
    state_fanout: Mutex<()>,
    nodes: NodeRegistry,
    shutting_down: AtomicBool,
}

impl WsServerState {
    pub fn new(config: WsServerConfig) -> Self {
        Self::with_methods(config, MethodTable::with_builtins())
    }

    /// Build with an externally supplied method table.
    pub fn with_methods(config: WsServerConfig, methods: MethodTable) -> Self {
        let authenticator = ChallengeAuthenticator::from_config(&config.auth);
        if authenticator.is_degraded() {
            warn!(
                target: "auth",
                "challenge auth disabled; only loopback clients can authenticate"
            );
        }
        Self {
            connect_limiter: ConnectRateLimiter::new(config.rate_limit.clone()),
            authenticator,
            methods,
            start_time: Instant::now(),
            connections: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthSnapshot {
                status: HEALTH_OK.to_string(),
                ts: now_ms(),
            }),
            versions: StateVersions::new(),
            event_seq: AtomicU64::new(0),
            state_fanout: Mutex::new(()),
            nodes: NodeRegistry::new(),
            shutting_down: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &WsServerConfig {
        &self.config
    }

    pub fn authenticator(&self) -> &ChallengeAuthenticator {
        &self.authenticator
    }

    pub fn connect_limiter(&self) -> &ConnectRateLimiter {
        &self.connect_limiter
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn versions(&self) -> &StateVersions {
        &self.versions
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn next_event_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_client(&self, conn_id: &str) -> bool {
        self.clients.read().contains_key(conn_id)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.lock().clone()
    }

    pub(crate) fn track_connection(&self, supervisor: &Arc<ConnectionSupervisor>) {
        self.connections
            .write()
            .insert(supervisor.conn_id().to_string(), supervisor.clone());
    }

    pub(crate) fn untrack_connection(&self, conn_id: &str) {
        self.connections.write().remove(conn_id);
    }

    /// Join half of client registration: record presence, bump the presence
    /// version, hand the `hello-ok` payload to `send_hello`, then add the
    /// client to the fan-out set and broadcast `presence`. All of it runs
    /// under the fan-out ordering lock, so the hello snapshot carries the
    /// version that already counts this client. Returns slow consumers for
    /// the caller to evict once it holds no connection lock.
    pub(crate) fn admit_client(
        &self,
        supervisor: &Arc<ConnectionSupervisor>,
        client: &Arc<Client>,
        send_hello: impl FnOnce(HelloOkPayload),
    ) -> Vec<Arc<ConnectionSupervisor>> {
        let _order = self.state_fanout.lock();
        self.presence
            .lock()
            .insert(client.presence_key.clone(), PresenceEntry::for_client(client));
        self.versions.bump_presence();
        let state_version = self.versions.current();

        send_hello(self.hello_payload(supervisor.conn_id()));

        self.clients.write().insert(
            client.conn_id.clone(),
            ClientHandle {
                supervisor: supervisor.clone(),
                client: client.clone(),
            },
        );
        let (_, slow) = self.fan_out(
            EVENT_PRESENCE,
            json!({ "presence": self.presence_list() }),
            BroadcastOptions::droppable().with_state_version(state_version),
        );
        slow
    }

    /// Teardown half of client registration: drop the client, withdraw its
    /// presence entry, release any node registration, then announce.
    pub(crate) fn unregister_client(&self, conn_id: &str, client: &Client) {
        self.clients.write().remove(conn_id);
        self.presence.lock().remove(&client.presence_key);
        if client.role.is_node() {
            match self.nodes.unregister(conn_id) {
                Some(node_id) => {
                    debug!(target: "ws", conn_id, node_id = %node_id, "node unregistered")
                }
                None => debug!(target: "ws", conn_id, "node already displaced"),
            }
        }
        self.announce_presence();
    }

    /// Presence snapshot, newest first.
    pub fn presence_list(&self) -> Vec<Value> {
        let mut entries: Vec<PresenceEntry> = self.presence.lock().values().cloned().collect();
        entries.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.conn_id.cmp(&b.conn_id)));
        entries
            .into_iter()
            .take(MAX_PRESENCE_ENTRIES)
            .filter_map(|entry| serde_json::to_value(entry).ok())
            .collect()
    }

    pub(crate) fn hello_payload(&self, conn_id: &str) -> HelloOkPayload {
        let mut methods = self.methods.method_names();
        methods.extend(
            [
                METHOD_SUBSCRIBE,
                METHOD_UNSUBSCRIBE,
                METHOD_NODE_EVENT,
                METHOD_NODE_HEARTBEAT,
            ]
            .iter()
            .map(|m| m.to_string()),
        );
        methods.sort();
        methods.dedup();

        HelloOkPayload {
            payload_type: "hello-ok",
            protocol: PROTOCOL_VERSION,
            server: ServerInfo {
                version: server_version(),
                host: server_hostname(),
                conn_id: conn_id.to_string(),
            },
            features: Features {
                methods,
                events: GATEWAY_EVENTS.iter().map(|e| e.to_string()).collect(),
            },
            snapshot: Snapshot {
                presence: self.presence_list(),
                health: json!(self.health()),
                state_version: self.versions.current(),
                uptime_ms: self.uptime_ms(),
            },
            policy: PolicyInfo {
                max_payload: self.config.policy.max_payload,
                max_buffered_bytes: self.config.policy.max_buffered_bytes,
                tick_interval_ms: self.config.policy.tick_interval_ms,
            },
        }
    }

    /// Liveness summary shared by `/health` and the `health`/`status` methods.
    pub fn status_snapshot(&self) -> Value {
        json!({
            "status": self.health.lock().status.clone(),
            "version": server_version(),
            "uptimeMs": self.uptime_ms(),
            "connections": self.connection_count(),
            "clients": self.client_count(),
            "nodes": self.nodes.len(),
            "stateVersion": self.versions.current(),
        })
    }

    /// Bump the presence version and broadcast the new snapshot.
    pub fn announce_presence(&self) -> u64 {
        let (version, slow) = {
            let _order = self.state_fanout.lock();
            let version = self.versions.bump_presence();
            let state_version = self.versions.current();
            let (_, slow) = self.fan_out(
                EVENT_PRESENCE,
                json!({ "presence": self.presence_list() }),
                BroadcastOptions::droppable().with_state_version(state_version),
            );
            (version, slow)
        };
        self.close_slow(slow);
        version
    }

    /// Record a health status change. Unchanged status is a no-op; a change
    /// bumps the health version and broadcasts `health`.
    pub fn update_health(&self, status: &str) -> Option<u64> {
        let (version, slow) = {
            let _order = self.state_fanout.lock();
            let snapshot = {
                let mut health = self.health.lock();
                if health.status == status {
                    return None;
                }
                health.status = status.to_string();
                health.ts = now_ms();
                health.clone()
            };
            let version = self.versions.bump_health();
            let state_version = self.versions.current();
            let (_, slow) = self.fan_out(
                EVENT_HEALTH,
                json!(snapshot),
                BroadcastOptions::droppable().with_state_version(state_version),
            );
            (version, slow)
        };
        self.close_slow(slow);
        Some(version)
    }

    /// Fan an event out to every authenticated client that wants it.
    pub fn broadcast(&self, event: &str, payload: Value, options: BroadcastOptions) -> BroadcastReport {
        let (mut report, slow) = self.fan_out(event, payload, options);
        report.closed_slow = self.close_slow(slow);
        report
    }

    /// Deliver to a snapshot of the client set. Saturated clients are either
    /// skipped or returned for eviction; no lock is held while sending.
    fn fan_out(
        &self,
        event: &str,
        payload: Value,
        options: BroadcastOptions,
    ) -> (BroadcastReport, Vec<Arc<ConnectionSupervisor>>) {
        let mut report = BroadcastReport::default();
        let mut slow = Vec::new();

        let mut frame = EventFrame::new(event, stamp_state_version(payload, options.state_version));
        frame.seq = Some(self.next_event_seq());
        frame.state_version = options.state_version;
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "gateway", event, error = %err, "failed to serialize event");
                return (report, slow);
            }
        };

        let targets: Vec<ClientHandle> = self.clients.read().values().cloned().collect();
        let limit = self.config.policy.max_buffered_bytes;
        for handle in targets {
            if !self.wants_event(&handle.client, event) {
                report.filtered += 1;
                continue;
            }
            if handle.supervisor.outbound().buffered_bytes() > limit {
                if options.drop_if_slow {
                    report.dropped_slow += 1;
                } else {
                    slow.push(handle.supervisor.clone());
                }
                continue;
            }
            match handle.supervisor.outbound().send_text(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed += 1,
            }
        }
        (report, slow)
    }

    fn wants_event(&self, client: &Client, event: &str) -> bool {
        match &client.role {
            Role::Node(_) => self.nodes.conn_subscribed(&client.conn_id, event),
            Role::Interactive => client.wants_event(event),
        }
    }

    pub(crate) fn close_slow(&self, slow: Vec<Arc<ConnectionSupervisor>>) -> usize {
        slow.into_iter()
            .filter(|supervisor| {
                warn!(
                    target: "ws",
                    conn_id = %supervisor.conn_id(),
                    buffered = supervisor.outbound().buffered_bytes(),
                    "closing slow consumer"
                );
                supervisor.close(CloseCause::SlowConsumer)
            })
            .count()
    }

    /// Begin graceful shutdown: flip health, tell clients, close everything.
    /// New connections are refused from here on.
    pub fn shutdown(&self, reason: &str) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(target: "gateway", reason, "gateway shutting down");
        self.update_health(HEALTH_SHUTTING_DOWN);
        self.broadcast(
            EVENT_SHUTDOWN,
            json!({ "reason": reason, "ts": now_ms() }),
            BroadcastOptions::droppable(),
        );
        self.close_all(CloseCause::ServerShutdown);
    }

    /// Close every tracked connection, pending or authenticated.
    pub fn close_all(&self, cause: CloseCause) -> usize {
        let all: Vec<Arc<ConnectionSupervisor>> =
            self.connections.read().values().cloned().collect();
        all.into_iter()
            .filter(|supervisor| supervisor.close(cause.clone()))
            .count()
    }
}

/// Stamp the state version into object payloads so recipients that only
/// look at the payload can still detect gaps.
fn stamp_state_version(payload: Value, version: Option<StateVersion>) -> Value {
    match (payload, version) {
        (Value::Object(mut map), Some(version)) => {
            map.entry("stateVersion")
                .or_insert_with(|| json!(version));
            Value::Object(map)
        }
        (payload, _) => payload,
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let max_message = state.config.policy.max_payload.saturating_mul(2);
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| handle_socket(socket, state, addr, headers))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<WsServerState>,
    remote_addr: SocketAddr,
    headers: HeaderMap,
) {
    let (sink, stream) = socket.split();
    let (outbound, rx) = Outbound::channel();
    let writer = spawn_writer(sink, rx);

    let meta = ConnectionMeta::from_headers(remote_addr, &headers);
    let supervisor = ConnectionSupervisor::on_accept(state, meta, outbound);
    supervisor.run(stream).await;
    let conn_id = supervisor.conn_id().to_string();
    drop(supervisor);

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(target: "ws", conn_id = %conn_id, "writer did not drain in time");
        abort.abort();
    }
}
