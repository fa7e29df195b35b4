#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::json;

use crate::server::hub::Hub;

/// Readiness flag flipped once the store is migrated and the listener is
/// bound. Liveness needs no state.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// `/healthz` and `/readyz`, mounted next to the chat endpoint.
pub fn router(hub: Arc<Hub>, state: HealthState) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.with_state((state, hub))
}

async fn healthz() -> &'static str {
	"ok"
}

/// Readiness plus a small operational snapshot for probes and dashboards.
async fn readyz(State((state, hub)): State<(HealthState, Arc<Hub>)>) -> (StatusCode, Json<serde_json::Value>) {
	if !state.is_ready() {
		return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not-ready" })));
	}

	let body = json!({
		"status": "ready",
		"sessions": hub.session_count(),
		"rooms": hub.registry.room_count().await,
	});
	(StatusCode::OK, Json(body))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readiness_starts_false_and_latches() {
		let state = HealthState::new();
		assert!(!state.is_ready());
		state.mark_ready();
		assert!(state.is_ready());

		// clones observe the same flag
		let clone = state.clone();
		assert!(clone.is_ready());
	}
}
