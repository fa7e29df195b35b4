#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;

use crate::server::hub::Hub;
use crate::server::session;

/// WebSocket entry point: `GET /ws/chat?token=<bearer>` or an
/// `Authorization: Bearer` header.
pub fn router(hub: Arc<Hub>) -> Router {
	Router::new().route("/ws/chat", get(ws_chat)).with_state(hub)
}

async fn ws_chat(
	ws: WebSocketUpgrade,
	State(hub): State<Arc<Hub>>,
	Query(params): Query<HashMap<String, String>>,
	headers: HeaderMap,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
	let bearer = params
		.get("token")
		.cloned()
		.filter(|t| !t.is_empty())
		.or_else(|| bearer_from_headers(&headers));
	let device = params.get("device").cloned().filter(|d| !d.is_empty());

	// auth outcomes are reported as WebSocket close codes, so the upgrade
	// itself always succeeds
	ws.on_upgrade(move |socket| session::run_session(hub, socket, addr.ip(), bearer, device))
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
	let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
	let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
	let token = token.trim();
	if token.is_empty() { None } else { Some(token.to_string()) }
}
