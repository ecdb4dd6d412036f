// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Admin handlers: node lifecycle verbs, network-policy CRUD, IPAM
//! statistics, and trust trends.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use trellis_common_core::{NodeId, NodeRole, PolicyId, PoolKind, PortRange, Protocol};
use trellis_common_wg::FirewallAction;
use trellis_server_db::models::{NetworkPolicy, Node};
use trellis_server_engine::IpamStats;
use trellis_server_events::{AggregateType, DomainEvent};

const ADMIN_ACTOR: &str = "admin";

#[derive(Debug, Default, Deserialize)]
pub struct ReasonBody {
	#[serde(default)]
	pub reason: Option<String>,
}

// =============================================================================
// Nodes
// =============================================================================

pub async fn list_nodes(State(state): State<AppState>) -> ServerResult<Json<Vec<Node>>> {
	Ok(Json(state.nodes.list().await?))
}

pub async fn get_node(
	State(state): State<AppState>,
	Path(id): Path<NodeId>,
) -> ServerResult<Json<Node>> {
	state
		.nodes
		.get(id)
		.await?
		.map(Json)
		.ok_or_else(|| ServerError::not_found(format!("node {id}")))
}

pub async fn approve_node(
	State(state): State<AppState>,
	Path(id): Path<NodeId>,
) -> ServerResult<Json<Node>> {
	Ok(Json(state.approve_node(id, ADMIN_ACTOR.to_string()).await?))
}

pub async fn suspend_node(
	State(state): State<AppState>,
	Path(id): Path<NodeId>,
	body: Option<Json<ReasonBody>>,
) -> ServerResult<Json<Node>> {
	let reason = body
		.and_then(|Json(b)| b.reason)
		.unwrap_or_else(|| "suspended by operator".to_string());
	Ok(Json(
		state
			.suspend_node(id, reason, ADMIN_ACTOR.to_string())
			.await?,
	))
}

pub async fn resume_node(
	State(state): State<AppState>,
	Path(id): Path<NodeId>,
) -> ServerResult<Json<Node>> {
	Ok(Json(state.resume_node(id, ADMIN_ACTOR.to_string()).await?))
}

pub async fn revoke_node(
	State(state): State<AppState>,
	Path(id): Path<NodeId>,
	body: Option<Json<ReasonBody>>,
) -> ServerResult<Json<Node>> {
	let reason = body
		.and_then(|Json(b)| b.reason)
		.unwrap_or_else(|| "revoked by operator".to_string());
	Ok(Json(
		state
			.revoke_node(id, reason, ADMIN_ACTOR.to_string())
			.await?,
	))
}

// =============================================================================
// Trust trend
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
	#[serde(default = "default_trend_hours")]
	pub hours: i64,
}

fn default_trend_hours() -> i64 {
	24
}

#[derive(Debug, Serialize)]
pub struct TrendPoint {
	pub score: i64,
	pub risk_level: String,
	pub calculated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TrustTrendResponse {
	pub node_id: NodeId,
	pub trend: &'static str,
	pub average: f64,
	pub min: i64,
	pub max: i64,
	pub data_points: usize,
	pub data: Vec<TrendPoint>,
}

/// GET /api/v1/admin/nodes/{id}/trust?hours=24
pub async fn trust_trend(
	State(state): State<AppState>,
	Path(id): Path<NodeId>,
	Query(query): Query<TrendQuery>,
) -> ServerResult<Json<TrustTrendResponse>> {
	if state.nodes.get(id).await?.is_none() {
		return Err(ServerError::not_found(format!("node {id}")));
	}

	let since = Utc::now() - Duration::hours(query.hours.clamp(1, 24 * 30));
	let history = state.trust_history.list_for_node(id, since, 200).await?;

	let scores: Vec<i64> = history.iter().map(|h| h.score).collect();
	let (average, min, max) = if scores.is_empty() {
		(0.0, 0, 0)
	} else {
		(
			scores.iter().sum::<i64>() as f64 / scores.len() as f64,
			*scores.iter().min().expect("nonempty"),
			*scores.iter().max().expect("nonempty"),
		)
	};

	// History is newest-first; compare the recent half to the older half.
	let trend = if scores.len() >= 2 {
		let mid = scores.len() / 2;
		let recent: f64 = scores[..mid].iter().sum::<i64>() as f64 / mid as f64;
		let older: f64 =
			scores[mid..].iter().sum::<i64>() as f64 / (scores.len() - mid) as f64;
		if recent > older + 5.0 {
			"improving"
		} else if recent < older - 5.0 {
			"declining"
		} else {
			"stable"
		}
	} else {
		"stable"
	};

	Ok(Json(TrustTrendResponse {
		node_id: id,
		trend,
		average,
		min,
		max,
		data_points: scores.len(),
		data: history
			.into_iter()
			.take(50)
			.map(|h| TrendPoint {
				score: h.score,
				risk_level: h.risk_level,
				calculated_at: h.calculated_at,
			})
			.collect(),
	}))
}

// =============================================================================
// IPAM stats
// =============================================================================

#[derive(Debug, Serialize)]
pub struct IpamStatsResponse {
	pub node_pool: IpamStats,
	pub client_pool: IpamStats,
}

/// GET /api/v1/admin/ipam/stats
pub async fn ipam_stats(State(state): State<AppState>) -> ServerResult<Json<IpamStatsResponse>> {
	let now = Utc::now();
	let cooldown = Duration::hours(state.config.ip_cooldown_hours);

	let mut pools = Vec::with_capacity(2);
	for pool in [PoolKind::Node, PoolKind::Client] {
		let in_use = state.ipam_repo.count_in_use(pool).await? as u32;
		let cooling = state
			.ipam_repo
			.cooling_down(pool, now, cooldown)
			.await?
			.len() as u32;
		pools.push(state.ipam.stats(pool, in_use, cooling));
	}
	let client_pool = pools.pop().expect("two pools");
	let node_pool = pools.pop().expect("two pools");

	Ok(Json(IpamStatsResponse {
		node_pool,
		client_pool,
	}))
}

// =============================================================================
// Network policies
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateNetworkPolicyRequest {
	pub src_role: NodeRole,
	pub dst_role: NodeRole,
	pub proto: Protocol,
	#[serde(default)]
	pub port: Option<PortRange>,
	pub action: FirewallAction,
	#[serde(default = "default_priority")]
	pub priority: i32,
}

fn default_priority() -> i32 {
	100
}

pub async fn create_network_policy(
	State(state): State<AppState>,
	Json(request): Json<CreateNetworkPolicyRequest>,
) -> ServerResult<(StatusCode, Json<NetworkPolicy>)> {
	if request.proto == Protocol::Icmp && request.port.is_some() {
		return Err(ServerError::invalid("icmp rules cannot carry a port"));
	}

	let policy_id = PolicyId::new();
	state
		.append_event(
			AggregateType::NetworkPolicy,
			policy_id.to_string(),
			DomainEvent::NetworkPolicyCreated {
				policy_id,
				src_role: request.src_role,
				dst_role: request.dst_role,
				proto: request.proto,
				port: request.port,
				action: request.action,
				priority: request.priority,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;

	let policy = state
		.policies
		.get_network_policy(policy_id)
		.await?
		.ok_or_else(|| ServerError::Internal("created network policy vanished".into()))?;
	Ok((StatusCode::CREATED, Json(policy)))
}

pub async fn list_network_policies(
	State(state): State<AppState>,
) -> ServerResult<Json<Vec<NetworkPolicy>>> {
	Ok(Json(state.policies.list_network_policies().await?))
}

pub async fn delete_network_policy(
	State(state): State<AppState>,
	Path(id): Path<PolicyId>,
) -> ServerResult<StatusCode> {
	if state.policies.get_network_policy(id).await?.is_none() {
		return Err(ServerError::not_found(format!("network policy {id}")));
	}

	state
		.append_event(
			AggregateType::NetworkPolicy,
			id.to_string(),
			DomainEvent::NetworkPolicyDeleted { policy_id: id },
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}
