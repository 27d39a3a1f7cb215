//! Method dispatch
//!
//! Maps a request's method name to a registered [`MethodHandler`]. Each
//! handler runs on its own task; a handler may respond immediately or from
//! a later task, but a request is answered at most once, and never after its
//! connection has closed.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::auth::Role;

use super::frames::{error_shape, ErrorShape, ParsedRequest, ERROR_INTERNAL, ERROR_METHOD_NOT_FOUND};
use super::handlers;
use super::supervisor::{Client, ConnectionSupervisor};
use super::WsServerState;

/// What a handler knows about the request it is serving.
#[derive(Clone)]
pub struct RequestContext {
    pub conn_id: String,
    pub request_id: String,
    pub method: String,
    pub client_id: String,
    pub role: Role,
    pub remote_ip: IpAddr,
    pub gateway: Arc<WsServerState>,
}

/// Single-use reply channel for one request.
#[derive(Clone)]
pub struct Responder {
    supervisor: Arc<ConnectionSupervisor>,
    request_id: String,
    responded: Arc<AtomicBool>,
}

impl Responder {
    fn new(supervisor: Arc<ConnectionSupervisor>, request_id: String) -> Self {
        Self {
            supervisor,
            request_id,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver the response. Returns false when it was dropped: a response
    /// was already sent, or the connection is gone.
    pub fn respond(&self, ok: bool, payload: Option<Value>, error: Option<ErrorShape>) -> bool {
        if self.supervisor.is_closed() {
            debug!(
                target: "ws",
                conn_id = %self.supervisor.conn_id(),
                id = %self.request_id,
                "response dropped: connection closed"
            );
            return false;
        }
        if self.responded.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.supervisor
            .outbound()
            .send_response(&self.request_id, ok, payload, error)
            .is_ok()
    }

    pub fn ok(&self, payload: Value) -> bool {
        self.respond(true, Some(payload), None)
    }

    pub fn error(&self, error: ErrorShape) -> bool {
        self.respond(false, None, Some(error))
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }
}

#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>, respond: Responder, ctx: RequestContext);
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F, Fut>
where
    F: Fn(Option<Value>, Responder, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, respond: Responder, ctx: RequestContext) {
        (self.f)(params, respond, ctx).await
    }
}

#[derive(Default)]
pub struct MethodTable {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the gateway's built-in methods registered.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        handlers::register_builtins(&mut table);
        table
    }

    /// Register a handler, replacing any previous handler for `method`.
    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    pub fn register_fn<F, Fut>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(Option<Value>, Responder, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(
            method,
            Arc::new(FnHandler {
                f,
                _fut: PhantomData,
            }),
        );
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted, as advertised in `hello-ok`.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Route a request from a connected client to its handler.
pub(crate) fn dispatch(
    supervisor: &Arc<ConnectionSupervisor>,
    client: &Arc<Client>,
    request: ParsedRequest,
) {
    let gateway = supervisor.gateway().clone();
    let Some(handler) = gateway.methods().get(&request.method) else {
        let _ = supervisor.outbound().send_response(
            &request.id,
            false,
            None,
            Some(error_shape(
                ERROR_METHOD_NOT_FOUND,
                "unknown method",
                Some(json!({ "method": request.method })),
            )),
        );
        return;
    };

    let ctx = RequestContext {
        conn_id: supervisor.conn_id().to_string(),
        request_id: request.id.clone(),
        method: request.method.clone(),
        client_id: client.client_id.clone(),
        role: client.role.clone(),
        remote_ip: client.remote_ip,
        gateway,
    };
    let responder = Responder::new(supervisor.clone(), request.id);
    let params = request.params;
    let method = request.method;

    tokio::spawn(async move {
        let task = tokio::spawn({
            let responder = responder.clone();
            async move { handler.handle(params, responder, ctx).await }
        });
        if let Err(err) = task.await {
            if err.is_panic() {
                error!(target: "ws", method = %method, "method handler panicked");
                if !responder.has_responded() {
                    responder.error(error_shape(ERROR_INTERNAL, "internal error", None));
                }
            }
        }
    });
}
