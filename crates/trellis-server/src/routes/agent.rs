// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent-facing handlers: register, sync, heartbeat.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::{authenticate_node, bearer_token};
use crate::error::ServerResult;
use crate::nodes::{HeartbeatResponse, RegisterRequest, RegisterResponse};
use crate::state::AppState;
use trellis_common_core::{CoreError, NodeId, NodeStatus};
use trellis_common_wg::{Directive, FirewallRuleSpec, InterfaceSpec, PeerSpec, PlanHash};
use trellis_server_engine::HeartbeatMetrics;

/// POST /api/v1/agent/register
///
/// Open endpoint; idempotent on `(hostname, public_key)`. Pending agents
/// poll it until approval, and the first poll after approval carries the
/// one-shot bearer token.
pub async fn register(
	State(state): State<AppState>,
	Json(request): Json<RegisterRequest>,
) -> ServerResult<Json<RegisterResponse>> {
	Ok(Json(state.register_node(request).await?))
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
	pub node_id: NodeId,
	/// Informational payload (agent version, OS details); not scored.
	#[serde(default)]
	pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
	pub plan_hash: PlanHash,
	pub interface: InterfaceSpec,
	pub peers: Vec<PeerSpec>,
	pub firewall_rules: Vec<FirewallRuleSpec>,
	pub directives: Vec<Directive>,
}

/// POST /api/v1/agent/sync
///
/// Returns the node's compiled plan, or 304 when `If-None-Match` carries
/// the current plan hash. Suspended nodes receive the isolate directive.
pub async fn sync(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(request): Json<SyncRequest>,
) -> ServerResult<Response> {
	let node = match authenticate_node(&state, &headers).await {
		Ok(node) => node,
		Err(err) => {
			// A pending node has no token yet: answer its sync with the
			// NotApproved shape so it falls back to register polling.
			if bearer_token(&headers).is_none() {
				if let Some(node) = state.nodes.get(request.node_id).await? {
					if node.status == NodeStatus::Pending {
						return Err(CoreError::NotApproved.into());
					}
				}
			}
			return Err(err);
		}
	};
	AppState::require_active(&node)?;

	if node.id != request.node_id {
		return Err(crate::error::ServerError::unauthorized());
	}
	if let Some(ref info) = request.device_info {
		tracing::debug!(hostname = %node.hostname, ?info, "sync device info");
	}

	let bundle = state.plan_for_node(&node).await?;

	let unchanged = headers
		.get(header::IF_NONE_MATCH)
		.and_then(|h| h.to_str().ok())
		.map(|etag| etag.trim_matches('"') == bundle.hash.0)
		.unwrap_or(false);
	if unchanged && bundle.directives.is_empty() {
		return Ok(StatusCode::NOT_MODIFIED.into_response());
	}

	let response = SyncResponse {
		plan_hash: bundle.hash.clone(),
		interface: bundle.plan.interface,
		peers: bundle.plan.peers,
		firewall_rules: bundle.plan.firewall_rules,
		directives: bundle.directives,
	};

	Ok((
		[(header::ETAG, format!("\"{}\"", bundle.hash))],
		Json(response),
	)
		.into_response())
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
	pub node_id: NodeId,
	#[serde(default)]
	pub metrics: HeartbeatMetrics,
}

/// POST /api/v1/agent/heartbeat
pub async fn heartbeat(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(request): Json<HeartbeatRequest>,
) -> ServerResult<Json<HeartbeatResponse>> {
	let node = authenticate_node(&state, &headers).await?;
	if node.id != request.node_id {
		return Err(crate::error::ServerError::unauthorized());
	}

	Ok(Json(state.process_heartbeat(&node, &request.metrics).await?))
}
