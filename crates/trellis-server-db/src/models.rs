// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Projected read-model records and their raw row forms.
//!
//! Rows come out of SQLite as strings; the `TryFrom` conversions parse
//! them into the typed domain structs. A parse failure means the read
//! model no longer matches what the projector wrote, which is an
//! invariant violation, not a user error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::net::Ipv4Addr;

use crate::error::DbError;
use trellis_common_core::{
	DeviceId, DeviceStatus, GroupId, NodeId, NodeRole, NodeStatus, PolicyAction, PolicyId,
	PoolKind, PortRange, Protocol, Resource, RiskLevel, Subject, TunnelMode, UserId, UserStatus,
};
use trellis_common_wg::{FirewallAction, WgPublicKey};

fn corrupt(table: &str, field: &str, err: impl std::fmt::Display) -> DbError {
	DbError::Corrupt(format!("{table}.{field}: {err}"))
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
	pub id: String,
	pub hostname: String,
	pub role: String,
	pub public_key: String,
	pub real_ip: Option<String>,
	pub overlay_ip: Option<String>,
	pub status: String,
	pub trust_score: i64,
	pub risk_level: String,
	pub token_hash: Option<String>,
	pub token_enc: Option<String>,
	pub last_heartbeat_at: Option<DateTime<Utc>>,
	pub agent_version: String,
	pub os_info: String,
	pub created_at: DateTime<Utc>,
	pub approved_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
	pub id: NodeId,
	pub hostname: String,
	pub role: NodeRole,
	pub public_key: WgPublicKey,
	pub real_ip: Option<Ipv4Addr>,
	pub overlay_ip: Option<Ipv4Addr>,
	pub status: NodeStatus,
	pub trust_score: u8,
	pub risk_level: RiskLevel,
	#[serde(skip_serializing)]
	pub token_hash: Option<String>,
	#[serde(skip_serializing)]
	pub token_enc: Option<String>,
	pub last_heartbeat_at: Option<DateTime<Utc>>,
	pub agent_version: String,
	pub os_info: String,
	pub created_at: DateTime<Utc>,
	pub approved_by: Option<String>,
}

impl Node {
	pub fn is_active(&self) -> bool {
		self.status == NodeStatus::Active
	}
}

impl TryFrom<NodeRow> for Node {
	type Error = DbError;

	fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
		Ok(Node {
			id: row.id.parse().map_err(|e| corrupt("nodes", "id", e))?,
			hostname: row.hostname,
			role: row.role.parse().map_err(|e| corrupt("nodes", "role", e))?,
			public_key: WgPublicKey::from_base64(&row.public_key)
				.map_err(|e| corrupt("nodes", "public_key", e))?,
			real_ip: row
				.real_ip
				.map(|s| s.parse().map_err(|e| corrupt("nodes", "real_ip", e)))
				.transpose()?,
			overlay_ip: row
				.overlay_ip
				.map(|s| s.parse().map_err(|e| corrupt("nodes", "overlay_ip", e)))
				.transpose()?,
			status: row
				.status
				.parse()
				.map_err(|e| corrupt("nodes", "status", e))?,
			trust_score: row.trust_score.clamp(0, 100) as u8,
			risk_level: row
				.risk_level
				.parse()
				.map_err(|e| corrupt("nodes", "risk_level", e))?,
			token_hash: row.token_hash,
			token_enc: row.token_enc,
			last_heartbeat_at: row.last_heartbeat_at,
			agent_version: row.agent_version,
			os_info: row.os_info,
			created_at: row.created_at,
			approved_by: row.approved_by,
		})
	}
}

// =============================================================================
// Users and groups
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
	pub id: String,
	pub external_id: String,
	pub email: String,
	pub display_name: String,
	pub department: Option<String>,
	pub status: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
	pub id: UserId,
	pub external_id: String,
	pub email: String,
	pub display_name: String,
	pub department: Option<String>,
	pub status: UserStatus,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
	type Error = DbError;

	fn try_from(row: UserRow) -> Result<Self, Self::Error> {
		Ok(User {
			id: row.id.parse().map_err(|e| corrupt("users", "id", e))?,
			external_id: row.external_id,
			email: row.email,
			display_name: row.display_name,
			department: row.department,
			status: row
				.status
				.parse()
				.map_err(|e| corrupt("users", "status", e))?,
			created_at: row.created_at,
			updated_at: row.updated_at,
		})
	}
}

#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
	pub id: String,
	pub name: String,
	pub description: Option<String>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
	pub id: GroupId,
	pub name: String,
	pub description: Option<String>,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<GroupRow> for Group {
	type Error = DbError;

	fn try_from(row: GroupRow) -> Result<Self, Self::Error> {
		Ok(Group {
			id: row.id.parse().map_err(|e| corrupt("groups", "id", e))?,
			name: row.name,
			description: row.description,
			created_at: row.created_at,
		})
	}
}

// =============================================================================
// Policies
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct AccessPolicyRow {
	pub id: String,
	pub name: String,
	pub subject_type: String,
	pub subject_id: String,
	pub resource: String,
	pub action: String,
	pub priority: i64,
	pub enabled: i64,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessPolicy {
	pub id: PolicyId,
	pub name: String,
	pub subject: Subject,
	pub resource: Resource,
	pub action: PolicyAction,
	pub priority: i32,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<AccessPolicyRow> for AccessPolicy {
	type Error = DbError;

	fn try_from(row: AccessPolicyRow) -> Result<Self, Self::Error> {
		let subject = match row.subject_type.as_str() {
			"user" => Subject::User {
				id: row
					.subject_id
					.parse()
					.map_err(|e| corrupt("policies", "subject_id", e))?,
			},
			"group" => Subject::Group {
				id: row
					.subject_id
					.parse()
					.map_err(|e| corrupt("policies", "subject_id", e))?,
			},
			other => return Err(corrupt("policies", "subject_type", other)),
		};
		Ok(AccessPolicy {
			id: row.id.parse().map_err(|e| corrupt("policies", "id", e))?,
			name: row.name,
			subject,
			resource: serde_json::from_str(&row.resource)
				.map_err(|e| corrupt("policies", "resource", e))?,
			action: row
				.action
				.parse()
				.map_err(|e| corrupt("policies", "action", e))?,
			priority: row.priority as i32,
			enabled: row.enabled != 0,
			created_at: row.created_at,
		})
	}
}

#[derive(Debug, Clone, FromRow)]
pub struct NetworkPolicyRow {
	pub id: String,
	pub src_role: String,
	pub dst_role: String,
	pub proto: String,
	pub port: Option<String>,
	pub action: String,
	pub priority: i64,
	pub position: i64,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkPolicy {
	pub id: PolicyId,
	pub src_role: NodeRole,
	pub dst_role: NodeRole,
	pub proto: Protocol,
	pub port: Option<PortRange>,
	pub action: FirewallAction,
	pub priority: i32,
	/// Insertion order, the final tiebreaker in rule ordering.
	pub position: i64,
	pub created_at: DateTime<Utc>,
}

impl TryFrom<NetworkPolicyRow> for NetworkPolicy {
	type Error = DbError;

	fn try_from(row: NetworkPolicyRow) -> Result<Self, Self::Error> {
		Ok(NetworkPolicy {
			id: row
				.id
				.parse()
				.map_err(|e| corrupt("network_policies", "id", e))?,
			src_role: row
				.src_role
				.parse()
				.map_err(|e| corrupt("network_policies", "src_role", e))?,
			dst_role: row
				.dst_role
				.parse()
				.map_err(|e| corrupt("network_policies", "dst_role", e))?,
			proto: row
				.proto
				.parse()
				.map_err(|e| corrupt("network_policies", "proto", e))?,
			port: row
				.port
				.map(|s| PortRange::parse(&s).map_err(|e| corrupt("network_policies", "port", e)))
				.transpose()?,
			action: row
				.action
				.parse()
				.map_err(|e| corrupt("network_policies", "action", e))?,
			priority: row.priority as i32,
			position: row.position,
			created_at: row.created_at,
		})
	}
}

// =============================================================================
// Client devices
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct ClientDeviceRow {
	pub id: String,
	pub user_id: String,
	pub name: String,
	pub device_type: String,
	pub tunnel_mode: String,
	pub overlay_ip: Option<String>,
	pub public_key: String,
	pub private_key_enc: String,
	pub status: String,
	pub expires_at: DateTime<Utc>,
	pub config_token_hash: Option<String>,
	pub config_claimed_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientDevice {
	pub id: DeviceId,
	pub user_id: UserId,
	pub name: String,
	pub device_type: String,
	pub tunnel_mode: TunnelMode,
	pub overlay_ip: Option<Ipv4Addr>,
	pub public_key: WgPublicKey,
	#[serde(skip_serializing)]
	pub private_key_enc: String,
	pub status: DeviceStatus,
	pub expires_at: DateTime<Utc>,
	#[serde(skip_serializing)]
	pub config_token_hash: Option<String>,
	pub config_claimed_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

impl ClientDevice {
	/// A device counts as active only until its expiry instant.
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.status == DeviceStatus::Active && self.expires_at > now
	}
}

impl TryFrom<ClientDeviceRow> for ClientDevice {
	type Error = DbError;

	fn try_from(row: ClientDeviceRow) -> Result<Self, Self::Error> {
		Ok(ClientDevice {
			id: row
				.id
				.parse()
				.map_err(|e| corrupt("client_devices", "id", e))?,
			user_id: row
				.user_id
				.parse()
				.map_err(|e| corrupt("client_devices", "user_id", e))?,
			name: row.name,
			device_type: row.device_type,
			tunnel_mode: row
				.tunnel_mode
				.parse()
				.map_err(|e| corrupt("client_devices", "tunnel_mode", e))?,
			overlay_ip: row
				.overlay_ip
				.map(|s| {
					s.parse()
						.map_err(|e| corrupt("client_devices", "overlay_ip", e))
				})
				.transpose()?,
			public_key: WgPublicKey::from_base64(&row.public_key)
				.map_err(|e| corrupt("client_devices", "public_key", e))?,
			private_key_enc: row.private_key_enc,
			status: row
				.status
				.parse()
				.map_err(|e| corrupt("client_devices", "status", e))?,
			expires_at: row.expires_at,
			config_token_hash: row.config_token_hash,
			config_claimed_at: row.config_claimed_at,
			created_at: row.created_at,
		})
	}
}

// =============================================================================
// Trust history and IPAM
// =============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TrustHistoryEntry {
	pub id: i64,
	pub node_id: String,
	pub score: i64,
	pub previous_score: i64,
	pub risk_level: String,
	pub action_taken: String,
	pub role_score: i64,
	pub device_health_score: i64,
	pub behavior_score: i64,
	pub security_score: i64,
	pub inputs: String,
	pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct IpamAllocationRow {
	pub addr: String,
	pub pool: String,
	pub owner: Option<String>,
	pub allocated_at: DateTime<Utc>,
	pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpamAllocation {
	pub addr: Ipv4Addr,
	pub pool: PoolKind,
	pub owner: Option<String>,
	pub allocated_at: DateTime<Utc>,
	pub released_at: Option<DateTime<Utc>>,
}

impl TryFrom<IpamAllocationRow> for IpamAllocation {
	type Error = DbError;

	fn try_from(row: IpamAllocationRow) -> Result<Self, Self::Error> {
		let pool = match row.pool.as_str() {
			"node" => PoolKind::Node,
			"client" => PoolKind::Client,
			other => return Err(corrupt("ipam_allocations", "pool", other)),
		};
		Ok(IpamAllocation {
			addr: row
				.addr
				.parse()
				.map_err(|e| corrupt("ipam_allocations", "addr", e))?,
			pool,
			owner: row.owner,
			allocated_at: row.allocated_at,
			released_at: row.released_at,
		})
	}
}
