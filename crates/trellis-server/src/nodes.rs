// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node lifecycle commands: register, approve, suspend, resume, revoke,
//! and heartbeat processing.
//!
//! Registration is idempotent on `(hostname, public_key)`. Two concurrent
//! first-time registers race on the hostname's partial unique index; the
//! loser's transaction fails as a conflict, its provisional address is
//! released, and the retry resolves to the winner's record, so exactly
//! one `node_registered` event survives.

use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;

use crate::auth::{generate_token, NODE_TOKEN_PREFIX};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use serde::{Deserialize, Serialize};
use trellis_common_core::{
	normalize_hostname, CoreError, NodeId, NodeRole, NodeStatus, PoolKind, TrustAction,
};
use trellis_common_wg::WgPublicKey;
use trellis_server_db::models::Node;
use trellis_server_engine::HeartbeatMetrics;
use trellis_server_events::{AggregateType, DomainEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
	pub hostname: String,
	pub role: NodeRole,
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub real_ip: Option<Ipv4Addr>,
	pub agent_version: String,
	pub os_info: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
	pub node_id: NodeId,
	pub status: NodeStatus,
	pub overlay_ip: Option<Ipv4Addr>,
	pub hub_public_key: Option<WgPublicKey>,
	pub hub_endpoint: Option<String>,
	pub server_time: DateTime<Utc>,
	/// Present exactly once: on the first poll after approval.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub agent_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
	pub ack: bool,
	pub next_interval: u64,
}

impl AppState {
	async fn register_response(&self, node: &Node) -> ServerResult<RegisterResponse> {
		let hub = self.nodes.hub().await?;

		// One-shot token delivery after approval.
		let agent_token = match (&node.token_enc, node.status) {
			(Some(enc), NodeStatus::Active) => {
				let plaintext = self.secrets.decrypt(enc)?;
				let token = String::from_utf8(plaintext.to_vec())
					.map_err(|_| ServerError::Internal("corrupt stored token".into()))?;
				self.nodes.claim_agent_token(node.id).await?;
				Some(token)
			}
			_ => None,
		};

		Ok(RegisterResponse {
			node_id: node.id,
			status: node.status,
			overlay_ip: node.overlay_ip,
			hub_public_key: hub.as_ref().map(|h| h.public_key),
			hub_endpoint: self.hub_endpoint().await?,
			server_time: Utc::now(),
			agent_token,
		})
	}

	#[tracing::instrument(skip(self, request), fields(hostname = %request.hostname))]
	pub async fn register_node(&self, request: RegisterRequest) -> ServerResult<RegisterResponse> {
		let hostname = normalize_hostname(&request.hostname)?;
		let actor = format!("agent:{hostname}");

		if self.nodes.is_key_blacklisted(&request.public_key).await? {
			return Err(ServerError::unauthorized());
		}

		// Idempotent re-register, and the poll path while pending.
		if let Some(existing) = self.nodes.get_by_hostname(&hostname).await? {
			if existing.public_key == request.public_key {
				return self.register_response(&existing).await;
			}
			return Err(ServerError::conflict(format!(
				"hostname {hostname} is registered with a different key"
			)));
		}
		if self
			.nodes
			.get_by_public_key(&request.public_key)
			.await?
			.is_some()
		{
			return Err(ServerError::conflict(
				"public key is registered to another hostname",
			));
		}

		let node_id = NodeId::new();
		let overlay_ip = if request.role == NodeRole::Hub {
			self.allocate_hub_address(format!("node:{node_id}"), actor.clone())
				.await?
		} else {
			self.allocate_address(PoolKind::Node, format!("node:{node_id}"), actor.clone())
				.await?
		};

		let created = self
			.store
			.append(trellis_server_db::NewEvent {
				aggregate_type: AggregateType::Node,
				aggregate_id: node_id.to_string(),
				expected_version: 0,
				event: DomainEvent::NodeRegistered {
					node_id,
					hostname: hostname.clone(),
					role: request.role,
					public_key: request.public_key,
					real_ip: request.real_ip,
					overlay_ip,
					agent_version: request.agent_version.clone(),
					os_info: request.os_info.clone(),
				},
				actor: actor.clone(),
				client_request_id: None,
			})
			.await;

		match created {
			Ok(_) => {}
			Err(err) if err.is_conflict() => {
				// Lost the race for this hostname. Give the provisional
				// address back and fold onto the winner if it is really us.
				self.release_address(overlay_ip, actor).await?;
				let winner = self
					.nodes
					.get_by_hostname(&hostname)
					.await?
					.ok_or_else(|| ServerError::conflict("registration race"))?;
				if winner.public_key == request.public_key {
					return self.register_response(&winner).await;
				}
				return Err(ServerError::conflict(format!(
					"hostname {hostname} is registered with a different key"
				)));
			}
			Err(err) => return Err(err.into()),
		}

		if self.config.auto_approve {
			self.approve_node(node_id, "auto-approve".to_string()).await?;
		}

		let node = self
			.nodes
			.get(node_id)
			.await?
			.ok_or_else(|| ServerError::Internal("registered node vanished".into()))?;
		self.register_response(&node).await
	}

	async fn node_or_404(&self, node_id: NodeId) -> ServerResult<Node> {
		self.nodes
			.get(node_id)
			.await?
			.ok_or_else(|| ServerError::not_found(format!("node {node_id}")))
	}

	fn check_transition(node: &Node, next: NodeStatus) -> ServerResult<()> {
		if !node.status.can_transition_to(next) {
			return Err(ServerError::conflict(format!(
				"cannot move node {} from {} to {}",
				node.hostname, node.status, next
			)));
		}
		Ok(())
	}

	/// Approve a pending node: generate its bearer token and activate it.
	#[tracing::instrument(skip(self), fields(%node_id))]
	pub async fn approve_node(&self, node_id: NodeId, approved_by: String) -> ServerResult<Node> {
		let node = self.node_or_404(node_id).await?;
		Self::check_transition(&node, NodeStatus::Active)?;

		let (token, token_hash) = generate_token(NODE_TOKEN_PREFIX);
		let token_enc = self.secrets.encrypt(token.as_bytes())?;

		self.append_event(
			AggregateType::Node,
			node_id.to_string(),
			DomainEvent::NodeApproved {
				node_id,
				approved_by: approved_by.clone(),
				token_hash,
				token_enc,
			},
			approved_by,
			None,
		)
		.await?;

		self.node_or_404(node_id).await
	}

	#[tracing::instrument(skip(self), fields(%node_id))]
	pub async fn suspend_node(
		&self,
		node_id: NodeId,
		reason: String,
		actor: String,
	) -> ServerResult<Node> {
		let node = self.node_or_404(node_id).await?;
		Self::check_transition(&node, NodeStatus::Suspended)?;

		self.append_event(
			AggregateType::Node,
			node_id.to_string(),
			DomainEvent::NodeSuspended { node_id, reason },
			actor,
			None,
		)
		.await?;

		self.node_or_404(node_id).await
	}

	#[tracing::instrument(skip(self), fields(%node_id))]
	pub async fn resume_node(&self, node_id: NodeId, actor: String) -> ServerResult<Node> {
		let node = self.node_or_404(node_id).await?;
		if node.status != NodeStatus::Suspended {
			return Err(ServerError::conflict(format!(
				"cannot resume node {} from {}",
				node.hostname, node.status
			)));
		}

		self.append_event(
			AggregateType::Node,
			node_id.to_string(),
			DomainEvent::NodeResumed { node_id },
			actor,
			None,
		)
		.await?;

		self.node_or_404(node_id).await
	}

	/// Revoke a node: terminal state, key blacklisted, address released
	/// into the cool-down window.
	#[tracing::instrument(skip(self), fields(%node_id))]
	pub async fn revoke_node(
		&self,
		node_id: NodeId,
		reason: String,
		actor: String,
	) -> ServerResult<Node> {
		let node = self.node_or_404(node_id).await?;
		Self::check_transition(&node, NodeStatus::Revoked)?;
		let released_addr = node.overlay_ip;

		self.append_event(
			AggregateType::Node,
			node_id.to_string(),
			DomainEvent::NodeRevoked {
				node_id,
				reason,
				public_key: node.public_key,
			},
			actor.clone(),
			None,
		)
		.await?;

		if let Some(addr) = released_addr {
			self.release_address(addr, actor).await?;
		}

		self.node_or_404(node_id).await
	}

	/// Process one heartbeat: refresh liveness, rescore trust, and apply
	/// the automatic suspension when the score crosses the critical
	/// threshold.
	#[tracing::instrument(skip(self, node, metrics), fields(hostname = %node.hostname))]
	pub async fn process_heartbeat(
		&self,
		node: &Node,
		metrics: &HeartbeatMetrics,
	) -> ServerResult<HeartbeatResponse> {
		let now = Utc::now();
		let gap_secs = node
			.last_heartbeat_at
			.map(|at| (now - at).num_seconds());
		self.nodes.touch_heartbeat(node.id, now).await?;

		let assessment = self
			.trust
			.assess(node.role, node.trust_score, gap_secs, metrics);

		if assessment.changed() {
			self.append_event(
				AggregateType::Node,
				node.id.to_string(),
				DomainEvent::TrustScoreChanged {
					node_id: node.id,
					score: assessment.score,
					previous_score: assessment.previous_score,
					risk_level: assessment.risk_level,
					action: assessment.action,
					role_score: assessment.role_score,
					device_health_score: assessment.device_health_score,
					behavior_score: assessment.behavior_score,
					security_score: assessment.security_score,
					inputs: serde_json::to_value(metrics)
						.map_err(|e| ServerError::Internal(e.to_string()))?,
				},
				format!("agent:{}", node.hostname),
				None,
			)
			.await?;

			// The critical band forces suspension as its own event.
			if assessment.action == TrustAction::Isolate && node.status == NodeStatus::Active {
				self.suspend_node(
					node.id,
					"trust score below critical threshold".to_string(),
					"trust-engine".to_string(),
				)
				.await?;
			}
		}

		Ok(HeartbeatResponse {
			ack: true,
			next_interval: self.config.heartbeat_interval_secs,
		})
	}

	/// Pending nodes poll register; everything else authenticates. Used
	/// by the sync handler to produce the 403 `{status: pending}` shape.
	pub fn require_active(node: &Node) -> ServerResult<()> {
		match node.status {
			NodeStatus::Active | NodeStatus::Suspended => Ok(()),
			NodeStatus::Pending => Err(CoreError::NotApproved.into()),
			NodeStatus::Revoked => Err(ServerError::unauthorized()),
		}
	}
}
