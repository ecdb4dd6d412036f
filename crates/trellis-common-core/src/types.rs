// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Aggregate identifiers and domain enumerations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! define_id {
	($name:ident, $doc:literal) => {
		#[doc = $doc]
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub Uuid);

		impl $name {
			pub fn new() -> Self {
				Self(Uuid::new_v4())
			}

			pub fn as_uuid(&self) -> &Uuid {
				&self.0
			}
		}

		impl Default for $name {
			fn default() -> Self {
				Self::new()
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				self.0.fmt(f)
			}
		}

		impl FromStr for $name {
			type Err = uuid::Error;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Ok(Self(Uuid::parse_str(s)?))
			}
		}

		impl From<Uuid> for $name {
			fn from(id: Uuid) -> Self {
				Self(id)
			}
		}
	};
}

define_id!(NodeId, "Identifier for a registered overlay node.");
define_id!(UserId, "Identifier for a user known to the control plane.");
define_id!(GroupId, "Identifier for a user group.");
define_id!(PolicyId, "Identifier for an access or network policy.");
define_id!(DeviceId, "Identifier for a provisioned client device.");

/// Role a node plays on the overlay. Determines its base trust weight and
/// which network-plane rules apply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
	Hub,
	App,
	Db,
	Ops,
	Monitor,
	Gateway,
	Client,
}

impl NodeRole {
	pub const ALL: [NodeRole; 7] = [
		NodeRole::Hub,
		NodeRole::App,
		NodeRole::Db,
		NodeRole::Ops,
		NodeRole::Monitor,
		NodeRole::Gateway,
		NodeRole::Client,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			NodeRole::Hub => "hub",
			NodeRole::App => "app",
			NodeRole::Db => "db",
			NodeRole::Ops => "ops",
			NodeRole::Monitor => "monitor",
			NodeRole::Gateway => "gateway",
			NodeRole::Client => "client",
		}
	}
}

impl fmt::Display for NodeRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NodeRole {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"hub" => Ok(NodeRole::Hub),
			"app" => Ok(NodeRole::App),
			"db" => Ok(NodeRole::Db),
			"ops" => Ok(NodeRole::Ops),
			"monitor" => Ok(NodeRole::Monitor),
			"gateway" => Ok(NodeRole::Gateway),
			"client" => Ok(NodeRole::Client),
			other => Err(format!("unknown node role: {other}")),
		}
	}
}

/// Node lifecycle state.
///
/// ```text
/// register -> Pending -approve-> Active -suspend-> Suspended -resume-> Active
///                |                  |                  |
///                +------revoke------+------revoke------+--> Revoked (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
	Pending,
	Active,
	Suspended,
	Revoked,
}

impl NodeStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			NodeStatus::Pending => "pending",
			NodeStatus::Active => "active",
			NodeStatus::Suspended => "suspended",
			NodeStatus::Revoked => "revoked",
		}
	}

	/// Whether the transition to `next` is legal. `Revoked` is terminal.
	pub fn can_transition_to(&self, next: NodeStatus) -> bool {
		use NodeStatus::*;
		matches!(
			(self, next),
			(Pending, Active)
				| (Active, Suspended)
				| (Suspended, Active)
				| (Pending, Revoked)
				| (Active, Revoked)
				| (Suspended, Revoked)
		)
	}
}

impl fmt::Display for NodeStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NodeStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(NodeStatus::Pending),
			"active" => Ok(NodeStatus::Active),
			"suspended" => Ok(NodeStatus::Suspended),
			"revoked" => Ok(NodeStatus::Revoked),
			other => Err(format!("unknown node status: {other}")),
		}
	}
}

/// Client device lifecycle. Devices are created active and become revoked
/// either explicitly or when `expires_at` passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
	Active,
	Revoked,
}

impl DeviceStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			DeviceStatus::Active => "active",
			DeviceStatus::Revoked => "revoked",
		}
	}
}

impl FromStr for DeviceStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(DeviceStatus::Active),
			"revoked" => Ok(DeviceStatus::Revoked),
			other => Err(format!("unknown device status: {other}")),
		}
	}
}

/// User account state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
	Active,
	Disabled,
}

impl UserStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			UserStatus::Active => "active",
			UserStatus::Disabled => "disabled",
		}
	}
}

impl FromStr for UserStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(UserStatus::Active),
			"disabled" => Ok(UserStatus::Disabled),
			other => Err(format!("unknown user status: {other}")),
		}
	}
}

/// Access-plane policy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
	Allow,
	Deny,
}

impl PolicyAction {
	pub fn as_str(&self) -> &'static str {
		match self {
			PolicyAction::Allow => "allow",
			PolicyAction::Deny => "deny",
		}
	}
}

impl FromStr for PolicyAction {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"allow" => Ok(PolicyAction::Allow),
			"deny" => Ok(PolicyAction::Deny),
			other => Err(format!("unknown policy action: {other}")),
		}
	}
}

/// Coarse risk bucket derived from a trust score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
	Low,
	Medium,
	High,
	Critical,
}

impl RiskLevel {
	/// Bucket a trust score: low >= 80, medium >= 60, high >= 40, critical < 40.
	pub fn from_score(score: u8) -> Self {
		match score {
			80..=u8::MAX => RiskLevel::Low,
			60..=79 => RiskLevel::Medium,
			40..=59 => RiskLevel::High,
			_ => RiskLevel::Critical,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			RiskLevel::Low => "low",
			RiskLevel::Medium => "medium",
			RiskLevel::High => "high",
			RiskLevel::Critical => "critical",
		}
	}
}

impl FromStr for RiskLevel {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"low" => Ok(RiskLevel::Low),
			"medium" => Ok(RiskLevel::Medium),
			"high" => Ok(RiskLevel::High),
			"critical" => Ok(RiskLevel::Critical),
			other => Err(format!("unknown risk level: {other}")),
		}
	}
}

/// What the control plane does about a node at a given risk level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustAction {
	Allow,
	Restrict,
	Isolate,
}

impl TrustAction {
	pub fn for_risk(risk: RiskLevel) -> Self {
		match risk {
			RiskLevel::Low | RiskLevel::Medium => TrustAction::Allow,
			RiskLevel::High => TrustAction::Restrict,
			RiskLevel::Critical => TrustAction::Isolate,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			TrustAction::Allow => "allow",
			TrustAction::Restrict => "restrict",
			TrustAction::Isolate => "isolate",
		}
	}
}

/// How a client device routes traffic: everything through the Hub, or only
/// the overlay network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelMode {
	Full,
	Split,
}

impl TunnelMode {
	pub fn as_str(&self) -> &'static str {
		match self {
			TunnelMode::Full => "full",
			TunnelMode::Split => "split",
		}
	}
}

impl FromStr for TunnelMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"full" => Ok(TunnelMode::Full),
			"split" => Ok(TunnelMode::Split),
			other => Err(format!("unknown tunnel mode: {other}")),
		}
	}
}
