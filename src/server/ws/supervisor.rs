//! Per-connection supervisor
//!
//! Owns the handshake state machine for one socket:
//!
//! ```text
//! pending --(auth success)--> connected --(close)--> terminal
//! pending --(timeout | rate-limit | origin | auth failure)--> failed --(close)--> terminal
//! ```
//!
//! Every teardown trigger (handshake timer, socket error, socket close,
//! slow-consumer eviction, server shutdown) funnels into [`ConnectionSupervisor::close`],
//! which runs the teardown body exactly once behind a checked-and-set
//! `closed` flag.

use axum::extract::ws::Message;
use axum::http::HeaderMap;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::challenge::{AuthError, Challenge, ConnectClaims};
use crate::auth::{self, Role};
use crate::server::origin::validate_origin;
use crate::server::ratelimit::{MessageRateLimiter, RateLimitError};

use super::dispatch;
use super::frames::{
    classify, decode_text_frame, error_shape, message_to_text, now_ms, ClientInfo,
    ConnectParams, ErrorShape, EventFrame, FrameKind, FrameRejection, InboundText,
    NodeEventParams, ParsedRequest, SubscriptionParams, ERROR_INVALID_REQUEST,
    ERROR_NOT_AUTHORIZED, ERROR_RATE_LIMITED, EVENT_CONNECT_CHALLENGE, EVENT_NODE, EVENT_TICK,
    METHOD_NODE_EVENT, METHOD_NODE_HEARTBEAT, PROTOCOL_VERSION,
};
use super::nodes::NodeInfo;
use super::outbound::Outbound;
use super::{BroadcastOptions, WsServerState};

/// Consecutive rate-limited requests tolerated before the connection is closed.
const MAX_RATE_LIMIT_STRIKES: u32 = 3;

/// Request ids remembered per connection for duplicate suppression.
const REQUEST_LEDGER_CAPACITY: usize = 4096;

/// Upgrade-request metadata captured at accept time. Diagnostics and
/// pre-auth policy only; never an authorization input.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub remote_addr: SocketAddr,
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
    pub origin: Option<String>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
}

impl ConnectionMeta {
    pub fn from_headers(remote_addr: SocketAddr, headers: &HeaderMap) -> Self {
        Self {
            remote_addr,
            forwarded_for: auth::header_value(headers, "x-forwarded-for"),
            real_ip: auth::header_value(headers, "x-real-ip"),
            origin: auth::header_value(headers, "origin"),
            host: auth::header_value(headers, "host"),
            user_agent: auth::header_value(headers, "user-agent"),
        }
    }

    /// Metadata for a peer that sent no interesting headers.
    pub fn direct(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            forwarded_for: None,
            real_ip: None,
            origin: None,
            host: None,
            user_agent: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// One accepted duplex stream.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub opened_at: Instant,
    pub opened_at_ms: u64,
    pub meta: ConnectionMeta,
    /// Trusted-proxy aware client address.
    pub client_ip: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Connected,
    Failed,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::Pending => "pending",
            HandshakeState::Connected => "connected",
            HandshakeState::Failed => "failed",
        }
    }
}

/// Why a connection ended. Rendered to a wire `(code, reason)` only when the
/// close frame is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    RateLimited,
    OriginRejected,
    HandshakeTimeout,
    AuthFailed,
    ProtocolMismatch,
    ProtocolViolation(String),
    ClientClosed { code: u16, reason: String },
    TransportError(String),
    SlowConsumer,
    ServerShutdown,
    Internal(String),
}

impl CloseCause {
    /// Close code sent on the wire.
    pub fn code(&self) -> u16 {
        match self {
            CloseCause::RateLimited => 1013,
            CloseCause::OriginRejected => 1008,
            CloseCause::HandshakeTimeout => 1000,
            CloseCause::AuthFailed => 1008,
            CloseCause::ProtocolMismatch => 1002,
            CloseCause::ProtocolViolation(_) => 1008,
            CloseCause::ClientClosed { code, .. } => sendable_code(*code),
            CloseCause::TransportError(_) => 1011,
            CloseCause::SlowConsumer => 1008,
            CloseCause::ServerShutdown => 1012,
            CloseCause::Internal(_) => 1011,
        }
    }

    /// Reason sent on the wire. Authentication failures stay generic.
    pub fn reason(&self) -> String {
        match self {
            CloseCause::RateLimited => "rate limit exceeded".to_string(),
            CloseCause::OriginRejected => "origin not allowed".to_string(),
            CloseCause::HandshakeTimeout => "handshake-timeout".to_string(),
            CloseCause::AuthFailed => "authentication failed".to_string(),
            CloseCause::ProtocolMismatch => "protocol mismatch".to_string(),
            CloseCause::ProtocolViolation(reason) => reason.clone(),
            CloseCause::ClientClosed { reason, .. } => reason.clone(),
            CloseCause::TransportError(_) => "transport error".to_string(),
            CloseCause::SlowConsumer => "slow consumer".to_string(),
            CloseCause::ServerShutdown => "server shutdown".to_string(),
            CloseCause::Internal(_) => "internal error".to_string(),
        }
    }

    /// Stable machine-readable label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            CloseCause::RateLimited => "rate-limit",
            CloseCause::OriginRejected => "origin-rejected",
            CloseCause::HandshakeTimeout => "handshake-timeout",
            CloseCause::AuthFailed => "auth-failed",
            CloseCause::ProtocolMismatch => "protocol-mismatch",
            CloseCause::ProtocolViolation(_) => "protocol-violation",
            CloseCause::ClientClosed { .. } => "client-close",
            CloseCause::TransportError(_) => "transport-error",
            CloseCause::SlowConsumer => "slow-consumer",
            CloseCause::ServerShutdown => "server-shutdown",
            CloseCause::Internal(_) => "internal",
        }
    }

    /// Causes that count as a rejection (as opposed to a normal departure).
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            CloseCause::ClientClosed { .. } | CloseCause::ServerShutdown
        )
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::TransportError(detail) | CloseCause::Internal(detail) => {
                write!(f, "{}: {}", self.label(), detail)
            }
            CloseCause::ClientClosed { code, .. } => write!(f, "{} ({})", self.label(), code),
            _ => f.write_str(self.label()),
        }
    }
}

/// 1005/1006/1015 are reserved for local signalling and must never be sent.
fn sendable_code(code: u16) -> u16 {
    match code {
        1000..=1003 | 1007..=1014 | 3000..=4999 => code,
        _ => 1000,
    }
}

/// Most recent inbound frame descriptors, kept for close diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastFrame {
    pub frame_type: Option<String>,
    pub method: Option<String>,
    pub id: Option<String>,
}

/// Final accounting for a closed connection. The cause is written once.
#[derive(Debug, Clone)]
pub struct CloseRecord {
    pub cause: CloseCause,
    pub code: u16,
    pub reason: String,
    /// Handshake state at the moment close began.
    pub handshake: HandshakeState,
    pub duration_ms: u64,
    pub last_frame: LastFrame,
    /// Auxiliary metadata, including triggers that arrived after the cause
    /// was already fixed.
    pub notes: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct RequestLedger {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RequestLedger {
    /// Returns false for an id this connection already used.
    fn admit(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= REQUEST_LEDGER_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

/// Authenticated view of a connection; exists only after a successful
/// handshake and is dropped exactly once during teardown.
#[derive(Debug)]
pub struct Client {
    pub conn_id: String,
    pub client_id: String,
    pub role: Role,
    pub presence_key: String,
    pub info: ClientInfo,
    pub remote_ip: IpAddr,
    /// `None` = every event; `Some` = only the listed events.
    filter: Mutex<Option<BTreeSet<String>>>,
}

impl Client {
    fn new(conn_id: &str, role: Role, info: ClientInfo, remote_ip: IpAddr) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            client_id: info.id.clone(),
            role,
            presence_key: conn_id.to_string(),
            info,
            remote_ip,
            filter: Mutex::new(None),
        }
    }

    pub fn wants_event(&self, event: &str) -> bool {
        match &*self.filter.lock() {
            None => true,
            Some(events) => events.contains(event),
        }
    }

    pub fn subscribe(&self, events: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut filter = self.filter.lock();
        let set = filter.get_or_insert_with(BTreeSet::new);
        set.extend(
            events
                .into_iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
        );
        set.iter().cloned().collect()
    }

    /// Remove events from an explicit subscription set. A client that never
    /// subscribed keeps receiving everything.
    pub fn unsubscribe(&self, events: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut filter = self.filter.lock();
        match filter.as_mut() {
            Some(set) => {
                for event in events {
                    set.remove(event.trim());
                }
                set.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn subscribed_events(&self) -> Option<Vec<String>> {
        self.filter
            .lock()
            .as_ref()
            .map(|set| set.iter().cloned().collect())
    }
}

#[derive(Debug)]
struct Lifecycle {
    handshake: HandshakeState,
    closed: bool,
    client: Option<Arc<Client>>,
}

/// Control flow result of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopSignal {
    Continue,
    Break,
}

pub struct ConnectionSupervisor {
    conn: Connection,
    gateway: Arc<WsServerState>,
    outbound: Outbound,
    lifecycle: Mutex<Lifecycle>,
    close_record: OnceLock<CloseRecord>,
    notes: Mutex<Vec<(String, String)>>,
    /// Cancelled on teardown; stops the reader loop, timer and tick task.
    cancel: CancellationToken,
    /// Child of `cancel`; additionally cancelled on promotion.
    handshake_cancel: CancellationToken,
    challenge: Mutex<Option<Challenge>>,
    last_frame: Mutex<LastFrame>,
    ledger: Mutex<RequestLedger>,
    msg_limiter: MessageRateLimiter,
    rate_strikes: AtomicU32,
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("conn", &self.conn)
            .field("lifecycle", &*self.lifecycle.lock())
            .finish_non_exhaustive()
    }
}

impl ConnectionSupervisor {
    /// Accept a new connection: rate-limit check, origin check, then
    /// challenge issuance and the handshake timer. Rejections close the
    /// connection before this returns.
    pub fn on_accept(
        gateway: Arc<WsServerState>,
        meta: ConnectionMeta,
        outbound: Outbound,
    ) -> Arc<Self> {
        let config = gateway.config();
        let client_ip = auth::resolve_client_ip(
            meta.remote_addr,
            meta.forwarded_for.as_deref(),
            meta.real_ip.as_deref(),
            &config.trusted_proxies,
        );
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Self {
            conn: Connection {
                id: Uuid::new_v4().to_string(),
                opened_at: Instant::now(),
                opened_at_ms: now_ms(),
                meta,
                client_ip,
            },
            outbound,
            lifecycle: Mutex::new(Lifecycle {
                handshake: HandshakeState::Pending,
                closed: false,
                client: None,
            }),
            close_record: OnceLock::new(),
            notes: Mutex::new(Vec::new()),
            handshake_cancel: cancel.child_token(),
            cancel,
            challenge: Mutex::new(None),
            last_frame: Mutex::new(LastFrame::default()),
            ledger: Mutex::new(RequestLedger::default()),
            msg_limiter: MessageRateLimiter::new(config.message_rate, config.message_burst),
            rate_strikes: AtomicU32::new(0),
            gateway: gateway.clone(),
        });

        gateway.track_connection(&supervisor);
        debug!(
            target: "ws",
            conn_id = %supervisor.conn.id,
            remote = %supervisor.conn.meta.remote_addr,
            client_ip = %client_ip,
            origin = ?supervisor.conn.meta.origin,
            "connection accepted"
        );

        if gateway.is_shutting_down() {
            supervisor.close(CloseCause::ServerShutdown);
            return supervisor;
        }

        if let Err(RateLimitError::LimitExceeded { retry_after_secs }) =
            gateway.connect_limiter().check(client_ip)
        {
            supervisor.note("retryAfterSecs", retry_after_secs.to_string());
            supervisor.close(CloseCause::RateLimited);
            return supervisor;
        }

        if !validate_origin(
            supervisor.conn.meta.origin.as_deref(),
            &gateway.config().allowed_origins,
        ) {
            supervisor.close(CloseCause::OriginRejected);
            return supervisor;
        }

        match gateway.authenticator().issue() {
            Ok(challenge) => supervisor.send_challenge(challenge),
            Err(err) => {
                error!(target: "auth", conn_id = %supervisor.conn.id, error = %err, "challenge issuance failed");
                supervisor.close(CloseCause::Internal(err.to_string()));
                return supervisor;
            }
        }

        supervisor.spawn_handshake_timer(gateway.config().handshake_timeout);
        supervisor
    }

    fn send_challenge(&self, challenge: Challenge) {
        let frame = EventFrame::new(
            EVENT_CONNECT_CHALLENGE,
            json!({
                "challengeId": challenge.id,
                "nonce": challenge.nonce,
                "ts": challenge.issued_at_ms,
                "alg": self.gateway.authenticator().algorithm(),
            }),
        );
        let _ = self.outbound.send_event(&frame);
        *self.challenge.lock() = Some(challenge);
    }

    fn spawn_handshake_timer(self: &Arc<Self>, timeout: Duration) {
        let weak = Arc::downgrade(self);
        let cancel = self.handshake_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(supervisor) = weak.upgrade() {
                        supervisor.close_if_pending(CloseCause::HandshakeTimeout);
                    }
                }
            }
        });
    }

    fn spawn_tick_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = Duration::from_millis(self.gateway.config().policy.tick_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(supervisor) = weak.upgrade() else { break };
                        let frame = EventFrame::new(EVENT_TICK, json!({ "ts": now_ms() }));
                        if supervisor.outbound.send_event(&frame).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Reader loop. Returns once the connection is closed, whichever side
    /// triggered it.
    pub async fn run<S, E>(self: &Arc<Self>, mut stream: S)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                None => {
                    self.close(CloseCause::ClientClosed {
                        code: 1006,
                        reason: String::new(),
                    });
                    break;
                }
                Some(Err(err)) => {
                    self.close(CloseCause::TransportError(err.to_string()));
                    break;
                }
                Some(Ok(msg)) => {
                    if self.handle_message(msg) == LoopSignal::Break {
                        break;
                    }
                }
            }
        }
    }

    pub(crate) fn handle_message(self: &Arc<Self>, msg: Message) -> LoopSignal {
        if self.is_closed() {
            return LoopSignal::Break;
        }
        let text = match message_to_text(msg) {
            Ok(InboundText::Text(text)) => text,
            Ok(InboundText::Control) => return LoopSignal::Continue,
            Ok(InboundText::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (f.code, f.reason.as_str().to_string()))
                    .unwrap_or((1005, String::new()));
                self.close(CloseCause::ClientClosed { code, reason });
                return LoopSignal::Break;
            }
            Err(reason) => {
                self.close(CloseCause::ProtocolViolation(reason.to_string()));
                return LoopSignal::Break;
            }
        };

        let config = self.gateway.config();
        let request =
            match decode_text_frame(&text, config.policy.max_payload, config.max_json_depth) {
                Ok(request) => request,
                Err(FrameRejection::Close(reason)) => {
                    self.close(CloseCause::ProtocolViolation(reason));
                    return LoopSignal::Break;
                }
                Err(FrameRejection::Reply { id, error }) => {
                    self.record_frame(Some(&id), None);
                    if self.handshake_state() == HandshakeState::Connected
                        && !self.ledger.lock().admit(&id)
                    {
                        debug!(target: "ws", conn_id = %self.conn.id, id = %id, "duplicate request id dropped");
                        return LoopSignal::Continue;
                    }
                    let reason = error.message.clone();
                    let _ = self.outbound.send_response(&id, false, None, Some(error));
                    if self.handshake_state() == HandshakeState::Pending {
                        self.close(CloseCause::ProtocolViolation(reason));
                        return LoopSignal::Break;
                    }
                    return LoopSignal::Continue;
                }
            };
        self.record_frame(Some(&request.id), Some(&request.method));

        match self.handshake_state() {
            HandshakeState::Pending => self.handle_handshake(request),
            HandshakeState::Connected => self.handle_request(request),
            HandshakeState::Failed => LoopSignal::Break,
        }
    }

    fn record_frame(&self, id: Option<&str>, method: Option<&str>) {
        *self.last_frame.lock() = LastFrame {
            frame_type: Some("req".to_string()),
            method: method.map(str::to_string),
            id: id.map(str::to_string),
        };
    }

    fn reply_error(&self, id: &str, error: ErrorShape) {
        let _ = self.outbound.send_response(id, false, None, Some(error));
    }

    fn reply_ok(&self, id: &str, payload: Value) {
        let _ = self.outbound.send_response(id, true, Some(payload), None);
    }

    /// Reject a pending handshake with a protocol error reply and close.
    fn reject_handshake(&self, id: &str, error: ErrorShape, cause: CloseCause) -> LoopSignal {
        self.reply_error(id, error);
        self.close(cause);
        LoopSignal::Break
    }

    fn handle_handshake(self: &Arc<Self>, request: ParsedRequest) -> LoopSignal {
        if classify(&request.method) != FrameKind::Connect {
            let message = "invalid handshake: first request must be connect";
            return self.reject_handshake(
                &request.id,
                error_shape(ERROR_INVALID_REQUEST, message, None),
                CloseCause::ProtocolViolation(message.to_string()),
            );
        }

        let params = match request
            .params
            .clone()
            .map(serde_json::from_value::<ConnectParams>)
        {
            Some(Ok(params)) if !params.client.id.trim().is_empty() => params,
            _ => {
                return self.reject_handshake(
                    &request.id,
                    error_shape(ERROR_INVALID_REQUEST, "invalid connect params", None),
                    CloseCause::ProtocolViolation("invalid connect params".to_string()),
                );
            }
        };

        if PROTOCOL_VERSION < params.min_protocol || PROTOCOL_VERSION > params.max_protocol {
            return self.reject_handshake(
                &request.id,
                error_shape(
                    ERROR_INVALID_REQUEST,
                    "protocol mismatch",
                    Some(json!({ "expectedProtocol": PROTOCOL_VERSION })),
                ),
                CloseCause::ProtocolMismatch,
            );
        }

        let role = match resolve_role(&params) {
            Ok(role) => role,
            Err(message) => {
                return self.reject_handshake(
                    &request.id,
                    error_shape(ERROR_INVALID_REQUEST, message, None),
                    CloseCause::ProtocolViolation(message.to_string()),
                );
            }
        };

        let Some(auth_params) = params.auth.clone() else {
            return self.fail_auth(&request.id, "missing auth params");
        };

        let expected_id = self.challenge.lock().as_ref().map(|c| c.id.clone());
        if expected_id.as_deref() != Some(auth_params.challenge_id.as_str()) {
            return self.fail_auth(&request.id, "challenge not issued to this connection");
        }

        let authenticator = self.gateway.authenticator();
        if authenticator.is_degraded() && !auth::is_loopback_addr(self.conn.client_ip) {
            authenticator.discard(&auth_params.challenge_id);
            return self.fail_auth(&request.id, "challenge auth disabled; non-loopback peer");
        }

        let claims = ConnectClaims {
            client_id: params.client.id.clone(),
            role,
        };
        let verified = authenticator.verify(&auth_params.challenge_id, &claims, &auth_params.response);
        self.challenge.lock().take();
        match verified {
            Ok(identity) => {
                if self.promote(&request.id, identity.role, params) {
                    LoopSignal::Continue
                } else {
                    LoopSignal::Break
                }
            }
            Err(err) => self.fail_auth(&request.id, &auth_error_detail(&err)),
        }
    }

    /// Authentication failed. The wire sees only a generic reason; the
    /// specific check is logged internally.
    fn fail_auth(&self, id: &str, detail: &str) -> LoopSignal {
        warn!(
            target: "auth",
            phase = "pre-auth",
            conn_id = %self.conn.id,
            client_ip = %self.conn.client_ip,
            detail,
            "authentication failed"
        );
        self.note("authDetail", detail.to_string());
        self.reject_handshake(
            id,
            error_shape(ERROR_NOT_AUTHORIZED, "authentication failed", None),
            CloseCause::AuthFailed,
        )
    }

    /// Transition `pending -> connected` and register the client.
    fn promote(self: &Arc<Self>, request_id: &str, role: Role, params: ConnectParams) -> bool {
        let client = Arc::new(Client::new(
            &self.conn.id,
            role,
            params.client.clone(),
            self.conn.client_ip,
        ));
        let subscriptions = params.subscriptions.clone().unwrap_or_default();

        let slow = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed || lifecycle.handshake != HandshakeState::Pending {
                return false;
            }
            self.ledger.lock().admit(request_id);

            match &client.role {
                Role::Node(node_id) => {
                    let info = NodeInfo {
                        display_name: params.client.display_name.clone(),
                        platform: Some(params.client.platform.clone()),
                        version: Some(params.client.version.clone()),
                    };
                    if let Some(displaced) = self.gateway.nodes().register(
                        &self.conn.id,
                        node_id,
                        info,
                        subscriptions,
                        now_ms(),
                    ) {
                        info!(target: "ws", node_id = %node_id, displaced_conn = %displaced, "node re-registered from new connection");
                    }
                }
                Role::Interactive => {
                    if !subscriptions.is_empty() {
                        client.subscribe(subscriptions);
                    }
                }
            }
            let slow = self.gateway.admit_client(self, &client, |hello| {
                let _ = self.outbound.send_response(
                    request_id,
                    true,
                    serde_json::to_value(&hello).ok(),
                    None,
                );
            });
            lifecycle.handshake = HandshakeState::Connected;
            lifecycle.client = Some(client.clone());
            slow
        };

        self.handshake_cancel.cancel();
        info!(
            target: "ws",
            conn_id = %self.conn.id,
            client_id = %client.client_id,
            role = client.role.as_str(),
            node_id = ?client.role.node_id(),
            handshake_ms = self.conn.opened_at.elapsed().as_millis() as u64,
            "client connected"
        );
        self.gateway.close_slow(slow);
        self.spawn_tick_task();
        true
    }

    fn handle_request(self: &Arc<Self>, request: ParsedRequest) -> LoopSignal {
        if !self.ledger.lock().admit(&request.id) {
            debug!(target: "ws", conn_id = %self.conn.id, id = %request.id, "duplicate request id dropped");
            return LoopSignal::Continue;
        }

        if !self.msg_limiter.try_acquire() {
            let strikes = self.rate_strikes.fetch_add(1, Ordering::AcqRel) + 1;
            if strikes >= MAX_RATE_LIMIT_STRIKES {
                self.close(CloseCause::RateLimited);
                return LoopSignal::Break;
            }
            self.reply_error(
                &request.id,
                error_shape(ERROR_RATE_LIMITED, "rate limit exceeded", None),
            );
            return LoopSignal::Continue;
        }
        self.rate_strikes.store(0, Ordering::Release);

        let Some(client) = self.client() else {
            return LoopSignal::Break;
        };

        match classify(&request.method) {
            FrameKind::Connect => {
                self.reply_error(
                    &request.id,
                    error_shape(ERROR_INVALID_REQUEST, "connect already completed", None),
                );
            }
            FrameKind::Subscribe => self.handle_subscription(&client, request, true),
            FrameKind::Unsubscribe => self.handle_subscription(&client, request, false),
            FrameKind::NodeControl => self.handle_node_control(&client, request),
            FrameKind::Rpc => dispatch::dispatch(self, &client, request),
        }
        LoopSignal::Continue
    }

    fn handle_subscription(&self, client: &Client, request: ParsedRequest, subscribe: bool) {
        let params = match request
            .params
            .map(serde_json::from_value::<SubscriptionParams>)
        {
            Some(Ok(params)) => params,
            _ => {
                self.reply_error(
                    &request.id,
                    error_shape(ERROR_INVALID_REQUEST, "events must be an array of strings", None),
                );
                return;
            }
        };

        let events = match &client.role {
            Role::Node(_) => {
                let Some(node_id) = self.gateway.nodes().node_for_conn(&self.conn.id) else {
                    self.reply_error(
                        &request.id,
                        error_shape(ERROR_NOT_AUTHORIZED, "node registration superseded", None),
                    );
                    return;
                };
                let nodes = self.gateway.nodes();
                let updated = if subscribe {
                    nodes.subscribe(&node_id, params.events)
                } else {
                    nodes.unsubscribe(&node_id, params.events)
                };
                updated.unwrap_or_default()
            }
            Role::Interactive => {
                if subscribe {
                    client.subscribe(params.events)
                } else {
                    client.unsubscribe(params.events)
                }
            }
        };
        self.reply_ok(&request.id, json!({ "events": events }));
    }

    fn handle_node_control(&self, client: &Client, request: ParsedRequest) {
        if !client.role.is_node() {
            self.reply_error(
                &request.id,
                error_shape(ERROR_NOT_AUTHORIZED, "node role required", None),
            );
            return;
        }
        let Some(node_id) = self.gateway.nodes().node_for_conn(&self.conn.id) else {
            self.reply_error(
                &request.id,
                error_shape(ERROR_NOT_AUTHORIZED, "node registration superseded", None),
            );
            return;
        };
        let ts = now_ms();
        self.gateway.nodes().touch(&node_id, ts);

        match request.method.as_str() {
            METHOD_NODE_HEARTBEAT => self.reply_ok(&request.id, json!({ "ts": ts })),
            METHOD_NODE_EVENT => {
                let params = match request.params.map(serde_json::from_value::<NodeEventParams>) {
                    Some(Ok(params)) if !params.event.trim().is_empty() => params,
                    _ => {
                        self.reply_error(
                            &request.id,
                            error_shape(ERROR_INVALID_REQUEST, "invalid node.event params", None),
                        );
                        return;
                    }
                };
                let report = self.gateway.broadcast(
                    EVENT_NODE,
                    json!({
                        "nodeId": node_id,
                        "event": params.event,
                        "payload": params.payload,
                    }),
                    BroadcastOptions::droppable(),
                );
                self.reply_ok(&request.id, json!({ "delivered": report.delivered }));
            }
            other => self.reply_error(
                &request.id,
                error_shape(
                    ERROR_INVALID_REQUEST,
                    "unknown node control frame",
                    Some(json!({ "method": other })),
                ),
            ),
        }
    }

    /// Close the connection. Idempotent: the first call tears down, later
    /// calls only note the ignored cause and return false.
    pub fn close(&self, cause: CloseCause) -> bool {
        self.close_inner(cause, false)
    }

    /// Close only if the handshake is still pending (timer path).
    pub fn close_if_pending(&self, cause: CloseCause) -> bool {
        self.close_inner(cause, true)
    }

    fn close_inner(&self, cause: CloseCause, only_if_pending: bool) -> bool {
        let (handshake_before, client) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                drop(lifecycle);
                self.note("suppressedCause", cause.to_string());
                return false;
            }
            if only_if_pending && lifecycle.handshake != HandshakeState::Pending {
                return false;
            }
            lifecycle.closed = true;
            let before = lifecycle.handshake;
            if before == HandshakeState::Pending {
                lifecycle.handshake = HandshakeState::Failed;
            }
            (before, lifecycle.client.take())
        };

        self.cancel.cancel();

        let code = cause.code();
        let reason = cause.reason();
        let _ = self.close_record.set(CloseRecord {
            cause: cause.clone(),
            code,
            reason: reason.clone(),
            handshake: handshake_before,
            duration_ms: self.conn.opened_at.elapsed().as_millis() as u64,
            last_frame: self.last_frame.lock().clone(),
            notes: Vec::new(),
        });

        if let Some(challenge) = self.challenge.lock().take() {
            self.gateway.authenticator().discard(&challenge.id);
        }
        self.gateway.untrack_connection(&self.conn.id);
        if let Some(client) = client.as_ref() {
            self.gateway.unregister_client(&self.conn.id, client);
        }

        let _ = self.outbound.send_close(code, &reason);
        self.log_close(&cause, handshake_before, client.as_deref());
        true
    }

    fn log_close(&self, cause: &CloseCause, handshake: HandshakeState, client: Option<&Client>) {
        let last = self.last_frame.lock().clone();
        let meta = &self.conn.meta;
        let duration_ms = self.conn.opened_at.elapsed().as_millis() as u64;
        if handshake == HandshakeState::Pending && cause.is_rejection() {
            warn!(
                target: "auth",
                phase = "pre-auth",
                conn_id = %self.conn.id,
                cause = %cause,
                code = cause.code(),
                duration_ms,
                client_ip = %self.conn.client_ip,
                remote = %meta.remote_addr,
                forwarded_for = ?meta.forwarded_for,
                real_ip = ?meta.real_ip,
                origin = ?meta.origin,
                host = ?meta.host,
                user_agent = ?meta.user_agent,
                last_frame_method = ?last.method,
                last_frame_id = ?last.id,
                "connection rejected before auth"
            );
        } else {
            info!(
                target: "ws",
                conn_id = %self.conn.id,
                cause = %cause,
                code = cause.code(),
                duration_ms,
                handshake = handshake.as_str(),
                client_id = ?client.map(|c| c.client_id.as_str()),
                role = ?client.map(|c| c.role.as_str()),
                remote = %meta.remote_addr,
                origin = ?meta.origin,
                last_frame_type = ?last.frame_type,
                last_frame_method = ?last.method,
                last_frame_id = ?last.id,
                "connection closed"
            );
        }
    }

    /// Attach auxiliary close metadata.
    pub fn note(&self, key: &str, value: String) {
        self.notes.lock().push((key.to_string(), value));
    }

    pub fn conn_id(&self) -> &str {
        &self.conn.id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn gateway(&self) -> &Arc<WsServerState> {
        &self.gateway
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.lifecycle.lock().handshake
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.lock().closed
    }

    pub fn client(&self) -> Option<Arc<Client>> {
        self.lifecycle.lock().client.clone()
    }

    /// Close accounting, available once the connection has closed.
    pub fn close_record(&self) -> Option<CloseRecord> {
        let mut record = self.close_record.get()?.clone();
        record.notes = self.notes.lock().clone();
        Some(record)
    }

    /// The id of the challenge still awaiting a response, if any.
    pub fn pending_challenge_id(&self) -> Option<String> {
        self.challenge.lock().as_ref().map(|c| c.id.clone())
    }
}

fn resolve_role(params: &ConnectParams) -> Result<Role, &'static str> {
    match params.role.as_deref().map(str::trim) {
        None | Some("") | Some("operator") => Ok(Role::Interactive),
        Some("node") => {
            let node_id = params
                .node_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or("nodeId required for node role")?;
            Ok(Role::Node(node_id.to_string()))
        }
        Some(_) => Err("invalid role"),
    }
}

fn auth_error_detail(err: &AuthError) -> String {
    match err {
        AuthError::ChallengeNotFound => "challenge-not-found".to_string(),
        AuthError::ChallengeExpired { age_ms } => format!("challenge-expired ({age_ms}ms)"),
        AuthError::ResponseMismatch => "response-mismatch".to_string(),
        AuthError::RandomSource(msg) => format!("random-source: {msg}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_cause_wire_rendering() {
        assert_eq!(CloseCause::RateLimited.code(), 1013);
        assert_eq!(CloseCause::RateLimited.reason(), "rate limit exceeded");
        assert_eq!(CloseCause::OriginRejected.reason(), "origin not allowed");
        assert_eq!(CloseCause::HandshakeTimeout.code(), 1000);
        assert_eq!(CloseCause::HandshakeTimeout.reason(), "handshake-timeout");
        assert_eq!(CloseCause::AuthFailed.reason(), "authentication failed");
        assert_eq!(CloseCause::ProtocolMismatch.code(), 1002);
        assert_eq!(CloseCause::ServerShutdown.code(), 1012);
        assert_eq!(
            CloseCause::TransportError("broken pipe".to_string()).reason(),
            "transport error"
        );
    }

    #[test]
    fn test_client_close_codes_echoed_when_sendable() {
        let normal = CloseCause::ClientClosed {
            code: 4001,
            reason: "bye".to_string(),
        };
        assert_eq!(normal.code(), 4001);
        assert_eq!(normal.reason(), "bye");

        for reserved in [1005, 1006, 1015, 999] {
            let cause = CloseCause::ClientClosed {
                code: reserved,
                reason: String::new(),
            };
            assert_eq!(cause.code(), 1000);
        }
    }

    #[test]
    fn test_rejection_classification() {
        assert!(CloseCause::HandshakeTimeout.is_rejection());
        assert!(CloseCause::AuthFailed.is_rejection());
        assert!(!CloseCause::ServerShutdown.is_rejection());
        assert!(!CloseCause::ClientClosed {
            code: 1000,
            reason: String::new()
        }
        .is_rejection());
    }

    #[test]
    fn test_request_ledger_rejects_duplicates_and_is_bounded() {
        let mut ledger = RequestLedger::default();
        assert!(ledger.admit("a"));
        assert!(!ledger.admit("a"));
        for i in 0..REQUEST_LEDGER_CAPACITY {
            ledger.admit(&format!("id-{i}"));
        }
        assert_eq!(ledger.order.len(), REQUEST_LEDGER_CAPACITY);
        assert_eq!(ledger.seen.len(), REQUEST_LEDGER_CAPACITY);
        // "a" was evicted as the oldest entry.
        assert!(ledger.admit("a"));
    }

    #[test]
    fn test_client_filter_semantics() {
        let client = Client::new(
            "conn-1",
            Role::Interactive,
            ClientInfo {
                id: "cli".to_string(),
                ..Default::default()
            },
            "127.0.0.1".parse().unwrap(),
        );
        assert!(client.wants_event("anything"));
        assert!(client.unsubscribe(vec!["presence".to_string()]).is_empty());
        assert!(client.wants_event("presence"));

        assert_eq!(
            client.subscribe(vec!["presence".to_string(), "tick".to_string()]),
            vec!["presence".to_string(), "tick".to_string()]
        );
        assert!(client.wants_event("presence"));
        assert!(!client.wants_event("health"));
        assert_eq!(
            client.unsubscribe(vec!["tick".to_string()]),
            vec!["presence".to_string()]
        );
        assert!(!client.wants_event("tick"));
    }

    #[test]
    fn test_resolve_role() {
        let mut params: ConnectParams = serde_json::from_value(json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": { "id": "c" }
        }))
        .unwrap();
        assert_eq!(resolve_role(&params), Ok(Role::Interactive));

        params.role = Some("node".to_string());
        assert_eq!(resolve_role(&params), Err("nodeId required for node role"));

        params.node_id = Some(" n-1 ".to_string());
        assert_eq!(resolve_role(&params), Ok(Role::Node("n-1".to_string())));

        params.role = Some("admin".to_string());
        assert_eq!(resolve_role(&params), Err("invalid role"));
    }
}
