// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The two policy planes.
//!
//! Network plane: role-to-role rules ordered by explicit priority, then
//! specificity (exact port beats port range beats any port), then
//! insertion order. The synthesizer closes every compiled table with an
//! implicit drop.
//!
//! Access plane: subject resolution through group membership, resource
//! matching with wildcard domains, highest priority wins, and default
//! deny when nothing matches.

use std::net::Ipv4Addr;

use serde::Serialize;
use trellis_common_core::{PolicyAction, PolicyId, Resource, UserId};
use trellis_server_db::models::{AccessPolicy, NetworkPolicy};

/// The verdict for one `(subject, resource)` evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct AccessDecision {
	pub allowed: bool,
	pub action: PolicyAction,
	pub matched_policy_id: Option<PolicyId>,
	pub reason: String,
}

impl AccessDecision {
	pub fn deny(reason: impl Into<String>) -> Self {
		Self {
			allowed: false,
			action: PolicyAction::Deny,
			matched_policy_id: None,
			reason: reason.into(),
		}
	}
}

/// Match a domain pattern against a requested hostname.
///
/// `*.X` matches hostnames ending in `.X` with exactly one extra label;
/// `**.X` matches any depth of extra labels; anything else must match
/// exactly. Comparison is case-insensitive.
pub fn match_domain(pattern: &str, host: &str) -> bool {
	let pattern = pattern.to_ascii_lowercase();
	let host = host.to_ascii_lowercase();

	if let Some(suffix) = pattern.strip_prefix("**.") {
		return host
			.strip_suffix(suffix)
			.and_then(|rest| rest.strip_suffix('.'))
			.is_some_and(|labels| !labels.is_empty());
	}

	if let Some(suffix) = pattern.strip_prefix("*.") {
		return host
			.strip_suffix(suffix)
			.and_then(|rest| rest.strip_suffix('.'))
			.is_some_and(|label| !label.is_empty() && !label.contains('.'));
	}

	pattern == host
}

/// Match a policy resource against the requested resource string.
///
/// The request formats are: a hostname for domain policies, a dotted IPv4
/// address for overlay-ip policies, `proto:port` for port policies, and a
/// role name for role policies.
pub fn match_resource(resource: &Resource, requested: &str) -> bool {
	match resource {
		Resource::Domain { pattern } => match_domain(pattern, requested),
		Resource::OverlayIp { cidr } => requested
			.parse::<Ipv4Addr>()
			.map(|addr| cidr.contains(&addr))
			.unwrap_or(false),
		Resource::Port { proto, range } => {
			let Some((req_proto, req_port)) = requested.split_once(':') else {
				return false;
			};
			let Ok(req_proto) = req_proto.parse() else {
				return false;
			};
			let Ok(req_port) = req_port.parse::<u16>() else {
				return false;
			};
			proto.covers(req_proto) && range.contains(req_port)
		}
		Resource::Role { name } => requested.eq_ignore_ascii_case(name.as_str()),
	}
}

/// Evaluate `(user, resource)` against the user's effective policies.
///
/// `policies` must already be scoped to the user's subject set (direct
/// plus group policies) and sorted highest priority first, which is what
/// the policy repository returns. The first match wins; no match is a
/// deny.
#[tracing::instrument(skip(policies), fields(%user_id, requested))]
pub fn evaluate_access(
	user_id: UserId,
	policies: &[AccessPolicy],
	requested: &str,
) -> AccessDecision {
	for policy in policies {
		if !policy.enabled {
			continue;
		}
		if !match_resource(&policy.resource, requested) {
			continue;
		}
		return AccessDecision {
			allowed: policy.action == PolicyAction::Allow,
			action: policy.action,
			matched_policy_id: Some(policy.id),
			reason: format!("matched policy {}", policy.name),
		};
	}

	AccessDecision::deny("no matching policy")
}

/// Specificity rank for the network-plane ordering: exact port, then
/// port range, then any port.
fn specificity(policy: &NetworkPolicy) -> u8 {
	match policy.port {
		Some(range) if range.is_single() => 0,
		Some(_) => 1,
		None => 2,
	}
}

/// Order the network plane: priority descending, then specificity, then
/// insertion order. Deterministic for identical projections.
pub fn compile_network_plane(policies: &[NetworkPolicy]) -> Vec<NetworkPolicy> {
	let mut ordered: Vec<NetworkPolicy> = policies.to_vec();
	ordered.sort_by(|a, b| {
		b.priority
			.cmp(&a.priority)
			.then_with(|| specificity(a).cmp(&specificity(b)))
			.then_with(|| a.position.cmp(&b.position))
	});
	ordered
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use trellis_common_core::{PortRange, Protocol, Subject};
	use trellis_common_wg::FirewallAction;

	#[test]
	fn test_domain_wildcard_one_label() {
		assert!(match_domain(
			"*.internal.example.com",
			"api.internal.example.com"
		));
		assert!(match_domain(
			"*.internal.example.com",
			"API.Internal.Example.Com"
		));
		// Zero extra labels: no match.
		assert!(!match_domain("*.internal.example.com", "internal.example.com"));
		// Two extra labels: no match for single-star.
		assert!(!match_domain(
			"*.internal.example.com",
			"a.b.internal.example.com"
		));
		// Different suffix.
		assert!(!match_domain(
			"*.internal.example.com",
			"api.external.example.com"
		));
	}

	#[test]
	fn test_domain_wildcard_any_depth() {
		assert!(match_domain(
			"**.internal.example.com",
			"api.internal.example.com"
		));
		assert!(match_domain(
			"**.internal.example.com",
			"a.b.c.internal.example.com"
		));
		assert!(!match_domain("**.internal.example.com", "internal.example.com"));
	}

	#[test]
	fn test_domain_exact() {
		assert!(match_domain("example.com", "example.com"));
		assert!(!match_domain("example.com", "api.example.com"));
	}

	#[test]
	fn test_resource_matching() {
		let ip = Resource::OverlayIp {
			cidr: "10.10.0.0/24".parse().unwrap(),
		};
		assert!(match_resource(&ip, "10.10.0.5"));
		assert!(!match_resource(&ip, "10.11.0.5"));
		assert!(!match_resource(&ip, "not-an-ip"));

		let port = Resource::Port {
			proto: Protocol::Tcp,
			range: PortRange::parse("5000-6000").unwrap(),
		};
		assert!(match_resource(&port, "tcp:5432"));
		assert!(!match_resource(&port, "udp:5432"));
		assert!(!match_resource(&port, "tcp:80"));
		assert!(!match_resource(&port, "5432"));

		let role = Resource::Role {
			name: trellis_common_core::NodeRole::Db,
		};
		assert!(match_resource(&role, "db"));
		assert!(!match_resource(&role, "app"));
	}

	fn policy(
		name: &str,
		action: PolicyAction,
		priority: i32,
		pattern: &str,
		enabled: bool,
	) -> AccessPolicy {
		AccessPolicy {
			id: PolicyId::new(),
			name: name.to_string(),
			subject: Subject::User { id: UserId::new() },
			resource: Resource::Domain {
				pattern: pattern.to_string(),
			},
			action,
			priority,
			enabled,
			created_at: Utc::now(),
		}
	}

	#[test]
	fn test_evaluate_default_deny() {
		let decision = evaluate_access(UserId::new(), &[], "api.internal.example.com");
		assert!(!decision.allowed);
		assert_eq!(decision.matched_policy_id, None);
	}

	#[test]
	fn test_evaluate_highest_priority_wins() {
		// Repository order: priority descending.
		let deny = policy("deny-all", PolicyAction::Deny, 200, "**.example.com", true);
		let allow = policy(
			"allow-internal",
			PolicyAction::Allow,
			100,
			"*.internal.example.com",
			true,
		);
		let policies = vec![deny.clone(), allow];

		let decision = evaluate_access(UserId::new(), &policies, "api.internal.example.com");
		assert!(!decision.allowed);
		assert_eq!(decision.matched_policy_id, Some(deny.id));
	}

	#[test]
	fn test_evaluate_skips_disabled_and_nonmatching() {
		let disabled = policy("disabled", PolicyAction::Deny, 300, "**.example.com", false);
		let allow = policy(
			"allow-internal",
			PolicyAction::Allow,
			100,
			"*.internal.example.com",
			true,
		);
		let policies = vec![disabled, allow.clone()];

		let decision = evaluate_access(UserId::new(), &policies, "api.internal.example.com");
		assert!(decision.allowed);
		assert_eq!(decision.matched_policy_id, Some(allow.id));

		let miss = evaluate_access(UserId::new(), &policies, "api.external.example.com");
		assert!(!miss.allowed);
	}

	fn network_policy(
		priority: i32,
		port: Option<&str>,
		position: i64,
	) -> NetworkPolicy {
		NetworkPolicy {
			id: PolicyId::new(),
			src_role: trellis_common_core::NodeRole::App,
			dst_role: trellis_common_core::NodeRole::Db,
			proto: Protocol::Tcp,
			port: port.map(|p| PortRange::parse(p).unwrap()),
			action: FirewallAction::Accept,
			priority,
			position,
			created_at: Utc::now(),
		}
	}

	#[test]
	fn test_network_plane_ordering() {
		let any_port = network_policy(100, None, 1);
		let range = network_policy(100, Some("5000-6000"), 2);
		let exact = network_policy(100, Some("5432"), 3);
		let high = network_policy(200, None, 4);

		let ordered = compile_network_plane(&[
			any_port.clone(),
			range.clone(),
			exact.clone(),
			high.clone(),
		]);
		let ids: Vec<PolicyId> = ordered.iter().map(|p| p.id).collect();
		// Priority first, then exact > range > any within equal priority.
		assert_eq!(ids, vec![high.id, exact.id, range.id, any_port.id]);
	}

	#[test]
	fn test_network_plane_insertion_order_tiebreak() {
		let first = network_policy(100, Some("5432"), 10);
		let second = network_policy(100, Some("9000"), 20);

		let ordered = compile_network_plane(&[second.clone(), first.clone()]);
		assert_eq!(ordered[0].id, first.id);
		assert_eq!(ordered[1].id, second.id);
	}
}
