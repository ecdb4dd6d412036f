// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Liveness probe.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
	let head = state.store.head_id().await;

	match head {
		Ok(head_id) => (
			StatusCode::OK,
			Json(json!({
				"status": "ok",
				"event_head": head_id,
				"timestamp": chrono::Utc::now().to_rfc3339(),
			})),
		),
		Err(e) => {
			tracing::error!(error = %e, "health check failed to reach the event store");
			(
				StatusCode::SERVICE_UNAVAILABLE,
				Json(json!({"status": "unavailable"})),
			)
		}
	}
}
