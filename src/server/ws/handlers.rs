//! Built-in gateway methods
//!
//! Registered in every default [`MethodTable`]. Application methods are
//! supplied by the embedder through [`MethodTable::register`].

use serde_json::{json, Value};

use super::dispatch::{MethodTable, RequestContext, Responder};
use super::frames::now_ms;

pub(super) fn register_builtins(table: &mut MethodTable) {
    table.register_fn("health", |_params, respond, ctx| async move {
        handle_health(respond, ctx)
    });
    table.register_fn("status", |_params, respond, ctx| async move {
        handle_status(respond, ctx)
    });
    table.register_fn("system-presence", |_params, respond, ctx| async move {
        handle_system_presence(respond, ctx)
    });
    table.register_fn("node.list", |_params, respond, ctx| async move {
        handle_node_list(respond, ctx)
    });
}

fn handle_health(respond: Responder, ctx: RequestContext) {
    let health = ctx.gateway.health();
    respond.ok(json!({
        "status": health.status,
        "ts": now_ms(),
        "uptimeMs": ctx.gateway.uptime_ms(),
        "stateVersion": ctx.gateway.versions().current(),
    }));
}

fn handle_status(respond: Responder, ctx: RequestContext) {
    let mut status = ctx.gateway.status_snapshot();
    if let Value::Object(ref mut map) = status {
        map.insert("ts".to_string(), json!(now_ms()));
        map.insert(
            "degraded".to_string(),
            json!(ctx.gateway.authenticator().is_degraded()),
        );
        map.insert(
            "auth".to_string(),
            json!({ "alg": ctx.gateway.authenticator().algorithm() }),
        );
        map.insert(
            "caller".to_string(),
            json!({
                "connId": ctx.conn_id,
                "clientId": ctx.client_id,
                "role": ctx.role.as_str(),
            }),
        );
    }
    respond.ok(status);
}

fn handle_system_presence(respond: Responder, ctx: RequestContext) {
    respond.ok(json!({
        "presence": ctx.gateway.presence_list(),
        "stateVersion": ctx.gateway.versions().current(),
    }));
}

fn handle_node_list(respond: Responder, ctx: RequestContext) {
    respond.ok(json!({ "nodes": ctx.gateway.nodes().list() }));
}
