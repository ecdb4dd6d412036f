// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The compiled per-node plan: interface parameters, peer list, and
//! firewall rules, plus the content hash agents use to skip unchanged
//! syncs.
//!
//! Plans are deterministic: the compiler emits peers and rules in a fixed
//! sort order, so serializing the same projected state twice yields the
//! same bytes and therefore the same hash.

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::Ipv4Addr;

use crate::keys::WgPublicKey;

pub use trellis_common_core::net::{PortRange, Protocol};

/// Firewall verdicts, named after the netfilter targets they become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirewallAction {
	#[serde(rename = "ACCEPT")]
	Accept,
	#[serde(rename = "DROP")]
	Drop,
}

impl FirewallAction {
	pub fn as_str(&self) -> &'static str {
		match self {
			FirewallAction::Accept => "ACCEPT",
			FirewallAction::Drop => "DROP",
		}
	}
}

impl std::str::FromStr for FirewallAction {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"ACCEPT" | "accept" => Ok(FirewallAction::Accept),
			"DROP" | "drop" => Ok(FirewallAction::Drop),
			other => Err(format!("unknown firewall action: {other}")),
		}
	}
}

/// Interface parameters for one node's tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
	/// Overlay address with the overlay prefix, e.g. `10.10.0.2/24`.
	pub address: Ipv4Net,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub listen_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub dns: Option<Ipv4Addr>,
	/// Present only in one-shot client profiles, never in agent sync plans.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub private_key: Option<String>,
}

/// One WireGuard peer entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
	pub public_key: WgPublicKey,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub endpoint: Option<String>,
	pub allowed_ips: Vec<Ipv4Net>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub persistent_keepalive: Option<u16>,
}

/// One compiled firewall rule, scoped to the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleSpec {
	pub src: Ipv4Net,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub dst: Option<Ipv4Addr>,
	pub proto: Protocol,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub port: Option<PortRange>,
	pub action: FirewallAction,
	pub priority: i32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub comment: Option<String>,
}

/// Out-of-band instructions delivered with a sync response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
	/// Tear down the tunnel and chain immediately, then idle.
	Isolate,
	/// Rotate the node key before the given deadline.
	RotateKeyBy { deadline: DateTime<Utc> },
	/// Discard local identity and register again.
	Reenroll,
	/// Stop the agent service.
	Shutdown,
}

/// The complete compiled plan for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePlan {
	pub interface: InterfaceSpec,
	pub peers: Vec<PeerSpec>,
	pub firewall_rules: Vec<FirewallRuleSpec>,
}

impl NodePlan {
	/// Stable content hash over the canonical JSON serialization. Private
	/// key material never participates: plans carrying one are client
	/// profiles, which are not hashed.
	pub fn content_hash(&self) -> PlanHash {
		let canonical = serde_json::to_vec(self).expect("plan serialization is infallible");
		let digest = Sha256::digest(&canonical);
		PlanHash(format!("{digest:x}"))
	}
}

/// Hex-encoded SHA-256 of a plan's canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanHash(pub String);

impl fmt::Display for PlanHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keys::WgKeyPair;

	fn sample_plan() -> NodePlan {
		let key = WgKeyPair::generate();
		NodePlan {
			interface: InterfaceSpec {
				address: "10.10.0.2/24".parse().unwrap(),
				listen_port: Some(51820),
				dns: None,
				private_key: None,
			},
			peers: vec![PeerSpec {
				public_key: *key.public_key(),
				endpoint: Some("198.51.100.7:51820".to_string()),
				allowed_ips: vec!["10.10.0.0/24".parse().unwrap()],
				persistent_keepalive: Some(25),
			}],
			firewall_rules: vec![FirewallRuleSpec {
				src: "10.10.0.3/32".parse().unwrap(),
				dst: None,
				proto: Protocol::Tcp,
				port: Some(PortRange::single(5432)),
				action: FirewallAction::Accept,
				priority: 100,
				comment: Some("app->db".to_string()),
			}],
		}
	}

	#[test]
	fn test_hash_is_stable() {
		let plan = sample_plan();
		assert_eq!(plan.content_hash(), plan.content_hash());
	}

	#[test]
	fn test_hash_changes_with_content() {
		let plan = sample_plan();
		let mut modified = plan.clone();
		modified.firewall_rules[0].port = Some(PortRange::single(5433));
		assert_ne!(plan.content_hash(), modified.content_hash());
	}

	#[test]
	fn test_plan_serde_round_trip() {
		let plan = sample_plan();
		let json = serde_json::to_string(&plan).unwrap();
		let back: NodePlan = serde_json::from_str(&json).unwrap();
		assert_eq!(back, plan);
		assert_eq!(back.content_hash(), plan.content_hash());
	}

	#[test]
	fn test_directive_wire_format() {
		let json = serde_json::to_string(&Directive::Isolate).unwrap();
		assert_eq!(json, r#"{"kind":"isolate"}"#);
	}
}
