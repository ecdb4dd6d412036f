// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Domain event types and the committed-record envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use trellis_common_core::{
	DeviceId, GroupId, NodeId, NodeRole, PolicyAction, PolicyId, PoolKind, PortRange, Protocol,
	Resource, RiskLevel, Subject, TrustAction, TunnelMode, UserId,
};
use trellis_common_wg::{FirewallAction, WgPublicKey};

/// Which aggregate a committed event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
	Node,
	User,
	Group,
	AccessPolicy,
	NetworkPolicy,
	ClientDevice,
	Ipam,
	Schema,
}

impl AggregateType {
	pub fn as_str(&self) -> &'static str {
		match self {
			AggregateType::Node => "node",
			AggregateType::User => "user",
			AggregateType::Group => "group",
			AggregateType::AccessPolicy => "access_policy",
			AggregateType::NetworkPolicy => "network_policy",
			AggregateType::ClientDevice => "client_device",
			AggregateType::Ipam => "ipam",
			AggregateType::Schema => "schema",
		}
	}
}

impl fmt::Display for AggregateType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for AggregateType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"node" => Ok(AggregateType::Node),
			"user" => Ok(AggregateType::User),
			"group" => Ok(AggregateType::Group),
			"access_policy" => Ok(AggregateType::AccessPolicy),
			"network_policy" => Ok(AggregateType::NetworkPolicy),
			"client_device" => Ok(AggregateType::ClientDevice),
			"ipam" => Ok(AggregateType::Ipam),
			"schema" => Ok(AggregateType::Schema),
			other => Err(format!("unknown aggregate type: {other}")),
		}
	}
}

/// Every state change in the system, in its committed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
	// Node lifecycle
	NodeRegistered {
		node_id: NodeId,
		hostname: String,
		role: NodeRole,
		public_key: WgPublicKey,
		real_ip: Option<Ipv4Addr>,
		overlay_ip: Ipv4Addr,
		agent_version: String,
		os_info: String,
	},
	NodeApproved {
		node_id: NodeId,
		approved_by: String,
		/// SHA-256 of the agent bearer token; the plaintext is never logged.
		token_hash: String,
		/// The token encrypted at rest, delivered once on the agent's next
		/// register poll and cleared on claim.
		token_enc: String,
	},
	NodeSuspended {
		node_id: NodeId,
		reason: String,
	},
	NodeResumed {
		node_id: NodeId,
	},
	NodeRevoked {
		node_id: NodeId,
		reason: String,
		public_key: WgPublicKey,
	},
	TrustScoreChanged {
		node_id: NodeId,
		score: u8,
		previous_score: u8,
		risk_level: RiskLevel,
		action: TrustAction,
		role_score: u8,
		device_health_score: u8,
		behavior_score: u8,
		security_score: u8,
		inputs: serde_json::Value,
	},

	// Address management
	IpAllocated {
		addr: Ipv4Addr,
		pool: PoolKind,
		owner: String,
	},
	IpReleased {
		addr: Ipv4Addr,
		pool: PoolKind,
	},
	IpamExhausted {
		pool: PoolKind,
	},

	// Identity
	UserCreated {
		user_id: UserId,
		external_id: String,
		email: String,
		display_name: String,
		department: Option<String>,
	},
	UserUpdated {
		user_id: UserId,
		email: Option<String>,
		display_name: Option<String>,
		department: Option<String>,
		status: Option<trellis_common_core::UserStatus>,
	},
	UserDeleted {
		user_id: UserId,
	},
	GroupCreated {
		group_id: GroupId,
		name: String,
		description: Option<String>,
	},
	GroupDeleted {
		group_id: GroupId,
	},
	GroupMemberAdded {
		group_id: GroupId,
		user_id: UserId,
	},
	GroupMemberRemoved {
		group_id: GroupId,
		user_id: UserId,
	},

	// Access plane
	AccessPolicyCreated {
		policy_id: PolicyId,
		name: String,
		subject: Subject,
		resource: Resource,
		action: PolicyAction,
		priority: i32,
		enabled: bool,
	},
	AccessPolicyUpdated {
		policy_id: PolicyId,
		action: Option<PolicyAction>,
		priority: Option<i32>,
		enabled: Option<bool>,
	},
	AccessPolicyDeleted {
		policy_id: PolicyId,
	},

	// Network plane
	NetworkPolicyCreated {
		policy_id: PolicyId,
		src_role: NodeRole,
		dst_role: NodeRole,
		proto: Protocol,
		port: Option<PortRange>,
		action: FirewallAction,
		priority: i32,
	},
	NetworkPolicyDeleted {
		policy_id: PolicyId,
	},

	// Client devices
	DeviceProvisioned {
		device_id: DeviceId,
		user_id: UserId,
		name: String,
		device_type: String,
		tunnel_mode: TunnelMode,
		overlay_ip: Ipv4Addr,
		public_key: WgPublicKey,
		/// AES-256-GCM ciphertext of the device private key; the log never
		/// carries key material in the clear.
		private_key_enc: String,
		expires_at: DateTime<Utc>,
		config_token_hash: String,
	},
	DeviceRevoked {
		device_id: DeviceId,
		reason: String,
	},

	// Schema migrations are themselves events.
	SchemaMigrated {
		version: i64,
		name: String,
	},
}

impl DomainEvent {
	/// The wire name of this event, matching its serde tag.
	pub fn event_type(&self) -> &'static str {
		match self {
			DomainEvent::NodeRegistered { .. } => "node_registered",
			DomainEvent::NodeApproved { .. } => "node_approved",
			DomainEvent::NodeSuspended { .. } => "node_suspended",
			DomainEvent::NodeResumed { .. } => "node_resumed",
			DomainEvent::NodeRevoked { .. } => "node_revoked",
			DomainEvent::TrustScoreChanged { .. } => "trust_score_changed",
			DomainEvent::IpAllocated { .. } => "ip_allocated",
			DomainEvent::IpReleased { .. } => "ip_released",
			DomainEvent::IpamExhausted { .. } => "ipam_exhausted",
			DomainEvent::UserCreated { .. } => "user_created",
			DomainEvent::UserUpdated { .. } => "user_updated",
			DomainEvent::UserDeleted { .. } => "user_deleted",
			DomainEvent::GroupCreated { .. } => "group_created",
			DomainEvent::GroupDeleted { .. } => "group_deleted",
			DomainEvent::GroupMemberAdded { .. } => "group_member_added",
			DomainEvent::GroupMemberRemoved { .. } => "group_member_removed",
			DomainEvent::AccessPolicyCreated { .. } => "access_policy_created",
			DomainEvent::AccessPolicyUpdated { .. } => "access_policy_updated",
			DomainEvent::AccessPolicyDeleted { .. } => "access_policy_deleted",
			DomainEvent::NetworkPolicyCreated { .. } => "network_policy_created",
			DomainEvent::NetworkPolicyDeleted { .. } => "network_policy_deleted",
			DomainEvent::DeviceProvisioned { .. } => "device_provisioned",
			DomainEvent::DeviceRevoked { .. } => "device_revoked",
			DomainEvent::SchemaMigrated { .. } => "schema_migrated",
		}
	}

	/// Whether this event can alter some node's compiled plan. Used to
	/// filter the agent-facing stream.
	pub fn affects_plans(&self) -> bool {
		!matches!(
			self,
			DomainEvent::UserCreated { .. }
				| DomainEvent::UserUpdated { .. }
				| DomainEvent::UserDeleted { .. }
				| DomainEvent::GroupCreated { .. }
				| DomainEvent::GroupDeleted { .. }
				| DomainEvent::GroupMemberAdded { .. }
				| DomainEvent::GroupMemberRemoved { .. }
				| DomainEvent::AccessPolicyCreated { .. }
				| DomainEvent::AccessPolicyUpdated { .. }
				| DomainEvent::AccessPolicyDeleted { .. }
				| DomainEvent::SchemaMigrated { .. }
		)
	}
}

/// A committed event: the envelope the store assigns at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
	/// Globally monotonic id, assigned at commit.
	pub id: i64,
	pub aggregate_type: AggregateType,
	pub aggregate_id: String,
	/// Per-aggregate version; increases by exactly one per accepted event.
	pub aggregate_version: i64,
	#[serde(flatten)]
	pub event: DomainEvent,
	pub actor: String,
	pub created_at: DateTime<Utc>,
}
