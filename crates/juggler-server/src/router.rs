//! The axum router: websocket upgrade endpoint and metrics endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};

use juggler_wire::MsgType;

use crate::{Server, SUBPROTOCOLS};

/// Request header restricting the messages a connection may send:
/// a comma-separated, case-insensitive subset of `call, sub, unsb, pub`.
/// `*` or absence allows all of them.
pub const ALLOWED_MESSAGES_HEADER: &str = "juggler-allowed-messages";

/// Router serving the websocket endpoint on `/ws` and the metrics endpoint
/// on `/debug/vars`.
pub fn router(server: Arc<Server>) -> Router {
    router_with_paths(server, &["/ws".to_string()])
}

/// Same as [`router`], with the websocket endpoint mounted on each of
/// `paths`.
pub fn router_with_paths(server: Arc<Server>, paths: &[String]) -> Router {
    let mut router = Router::new().route("/debug/vars", get(vars_json));
    for path in paths {
        router = router.route(path, get(upgrade));
    }
    router.with_state(server)
}

/// Parse the `Juggler-Allowed-Messages` header value. An empty result means
/// no restriction.
pub fn parse_allowed_messages(value: Option<&HeaderValue>) -> Vec<MsgType> {
    let Some(value) = value.and_then(|v| v.to_str().ok()).map(str::trim) else {
        return Vec::new();
    };
    if value.is_empty() || value == "*" {
        return Vec::new();
    }
    value
        .split(',')
        .filter_map(|t| match t.trim().to_ascii_lowercase().as_str() {
            "call" => Some(MsgType::CALL),
            "sub" => Some(MsgType::SUB),
            "unsb" => Some(MsgType::UNSB),
            "pub" => Some(MsgType::PUB),
            _ => None,
        })
        .collect()
}

async fn upgrade(
    State(srv): State<Arc<Server>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    let allowed = parse_allowed_messages(headers.get(ALLOWED_MESSAGES_HEADER));

    let mut ws = ws.protocols(SUBPROTOCOLS.iter().copied());
    if srv.read_limit > 0 {
        ws = ws.max_message_size(srv.read_limit);
    }

    ws.on_upgrade(move |socket| async move {
        // the negotiated subprotocol must be one of the supported ones,
        // otherwise the connection is dropped right away
        let negotiated = socket.protocol().and_then(|p| p.to_str().ok());
        let supported = match negotiated {
            Some(p) => SUBPROTOCOLS.contains(&p),
            None => srv.allow_empty_subprotocol,
        };
        if !supported {
            return;
        }
        srv.serve_conn(socket, allowed).await;
    })
}

async fn vars_json(State(srv): State<Arc<Server>>) -> Json<BTreeMap<String, i64>> {
    Json(
        srv.vars
            .as_ref()
            .map(|v| v.snapshot())
            .unwrap_or_default(),
    )
}
