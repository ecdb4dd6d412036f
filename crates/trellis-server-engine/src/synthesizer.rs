// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-node plan synthesis.
//!
//! Spoke posture: every spoke carries the Hub with the whole overlay in
//! `allowed_ips`, plus a `/32` entry for each peer its role can exchange
//! traffic with under the compiled network plane. The Hub carries every
//! active node and every live client device at `/32`. WireGuard's
//! longest-prefix match on `allowed_ips` makes the specific routes win
//! over the Hub's catch-all.
//!
//! Output order is fully determined (peers by public key, rule sources by
//! address), so identical snapshots compile to identical bytes.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

use crate::compiler::compile_network_plane;
use crate::error::EngineError;
use crate::snapshot::CompileSnapshot;
use trellis_common_core::{NodeRole, OverlaySettings, TunnelMode};
use trellis_common_wg::{
	FirewallAction, FirewallRuleSpec, InterfaceSpec, NodePlan, PeerSpec, Protocol,
};
use trellis_server_db::models::{ClientDevice, NetworkPolicy, Node};

const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

fn host_net(addr: Ipv4Addr) -> Ipv4Net {
	Ipv4Net::new(addr, 32).expect("/32 of a host address is always valid")
}

fn endpoint_of(node: &Node, wg_port: u16) -> Option<String> {
	node.real_ip.map(|ip| format!("{ip}:{wg_port}"))
}

/// Whether two roles may exchange traffic under the compiled plane. Peer
/// entries are symmetric: an allow in either direction needs tunnels on
/// both ends, and the firewall still scopes what actually flows.
fn roles_reachable(plane: &[NetworkPolicy], a: NodeRole, b: NodeRole) -> bool {
	plane.iter().any(|rule| {
		rule.action == FirewallAction::Accept
			&& ((rule.src_role == a && rule.dst_role == b)
				|| (rule.src_role == b && rule.dst_role == a))
	})
}

fn hub_peer(hub: &Node, overlay: &OverlaySettings, hub_endpoint: Option<&str>) -> PeerSpec {
	PeerSpec {
		public_key: hub.public_key,
		endpoint: hub_endpoint
			.map(str::to_string)
			.or_else(|| endpoint_of(hub, overlay.wg_port)),
		allowed_ips: vec![overlay.network],
		persistent_keepalive: Some(PERSISTENT_KEEPALIVE_SECS),
	}
}

/// Compile the complete plan for one node.
#[tracing::instrument(skip(snapshot), fields(hostname = %node.hostname, role = %node.role))]
pub fn synthesize_node_plan(
	snapshot: &CompileSnapshot,
	node: &Node,
) -> Result<NodePlan, EngineError> {
	let overlay = &snapshot.overlay;
	let node_addr = node
		.overlay_ip
		.ok_or_else(|| EngineError::MissingOverlayIp(format!("node {}", node.hostname)))?;
	let prefix = overlay.network.prefix_len();

	let interface = InterfaceSpec {
		address: Ipv4Net::new(node_addr, prefix).expect("overlay address fits its network"),
		listen_port: Some(overlay.wg_port),
		dns: None,
		private_key: None,
	};

	let plane = compile_network_plane(&snapshot.network_policies);

	let mut peers: Vec<PeerSpec> = Vec::new();
	if node.role == NodeRole::Hub {
		for other in snapshot.active_nodes() {
			if other.id == node.id {
				continue;
			}
			let Some(other_addr) = other.overlay_ip else {
				continue;
			};
			peers.push(PeerSpec {
				public_key: other.public_key,
				endpoint: endpoint_of(other, overlay.wg_port),
				allowed_ips: vec![host_net(other_addr)],
				persistent_keepalive: Some(PERSISTENT_KEEPALIVE_SECS),
			});
		}
		for device in &snapshot.devices {
			let Some(device_addr) = device.overlay_ip else {
				continue;
			};
			peers.push(PeerSpec {
				public_key: device.public_key,
				endpoint: None,
				allowed_ips: vec![host_net(device_addr)],
				persistent_keepalive: None,
			});
		}
		peers.sort_by_key(|p| p.public_key.to_base64());
	} else {
		let mut mesh: Vec<PeerSpec> = Vec::new();
		for other in snapshot.active_nodes() {
			if other.id == node.id || other.role == NodeRole::Hub {
				continue;
			}
			let Some(other_addr) = other.overlay_ip else {
				continue;
			};
			if !roles_reachable(&plane, node.role, other.role) {
				continue;
			}
			mesh.push(PeerSpec {
				public_key: other.public_key,
				endpoint: endpoint_of(other, overlay.wg_port),
				allowed_ips: vec![host_net(other_addr)],
				persistent_keepalive: Some(PERSISTENT_KEEPALIVE_SECS),
			});
		}
		mesh.sort_by_key(|p| p.public_key.to_base64());

		// Hub first, then the mesh peers.
		if let Some(hub) = snapshot.hub() {
			peers.push(hub_peer(hub, overlay, snapshot.hub_endpoint.as_deref()));
		}
		peers.extend(mesh);
	}

	let mut firewall_rules: Vec<FirewallRuleSpec> = Vec::new();
	for rule in &plane {
		if rule.dst_role != node.role {
			continue;
		}
		let comment = format!("{}->{}", rule.src_role, rule.dst_role);

		let mut sources: Vec<Ipv4Addr> = if rule.src_role == NodeRole::Client {
			snapshot
				.devices
				.iter()
				.filter_map(|d| d.overlay_ip)
				.collect()
		} else {
			snapshot
				.active_nodes()
				.filter(|n| n.role == rule.src_role && n.id != node.id)
				.filter_map(|n| n.overlay_ip)
				.collect()
		};
		sources.sort_unstable();

		for src in sources {
			firewall_rules.push(FirewallRuleSpec {
				src: host_net(src),
				dst: Some(node_addr),
				proto: rule.proto,
				port: rule.port,
				action: rule.action,
				priority: rule.priority,
				comment: Some(comment.clone()),
			});
		}
	}

	// The table always closes with an explicit deny.
	firewall_rules.push(FirewallRuleSpec {
		src: "0.0.0.0/0".parse().expect("valid catch-all network"),
		dst: Some(node_addr),
		proto: Protocol::Any,
		port: None,
		action: FirewallAction::Drop,
		priority: -1,
		comment: Some("default deny".to_string()),
	});

	Ok(NodePlan {
		interface,
		peers,
		firewall_rules,
	})
}

/// Build the one-shot tunnel profile for a client device. Unlike node
/// plans this carries the private key, so it is rendered once and never
/// hashed or stored.
#[tracing::instrument(skip(overlay, private_key_b64), fields(device = %device.name))]
pub fn synthesize_client_profile(
	overlay: &OverlaySettings,
	hub_public_key: trellis_common_wg::WgPublicKey,
	hub_endpoint: Option<&str>,
	device: &ClientDevice,
	private_key_b64: String,
) -> Result<NodePlan, EngineError> {
	let device_addr = device
		.overlay_ip
		.ok_or_else(|| EngineError::MissingOverlayIp(format!("device {}", device.name)))?;

	let allowed_ips = match device.tunnel_mode {
		TunnelMode::Full => vec!["0.0.0.0/0".parse().expect("valid catch-all network")],
		TunnelMode::Split => vec![overlay.network],
	};

	// Full-tunnel clients resolve through the Hub.
	let dns = match device.tunnel_mode {
		TunnelMode::Full => Some(overlay.hub_addr),
		TunnelMode::Split => None,
	};

	Ok(NodePlan {
		interface: InterfaceSpec {
			address: Ipv4Net::new(device_addr, overlay.network.prefix_len())
				.expect("overlay address fits its network"),
			listen_port: None,
			dns,
			private_key: Some(private_key_b64),
		},
		peers: vec![PeerSpec {
			public_key: hub_public_key,
			endpoint: hub_endpoint.map(str::to_string),
			allowed_ips,
			persistent_keepalive: Some(PERSISTENT_KEEPALIVE_SECS),
		}],
		firewall_rules: vec![],
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::{Duration, Utc};
	use trellis_common_core::{
		DeviceId, DeviceStatus, NodeId, NodeStatus, PortRange, RiskLevel, UserId,
	};
	use trellis_common_core::PolicyId;
	use trellis_common_wg::WgKeyPair;

	fn node(hostname: &str, role: NodeRole, addr: &str, status: NodeStatus) -> Node {
		Node {
			id: NodeId::new(),
			hostname: hostname.to_string(),
			role,
			public_key: *WgKeyPair::generate().public_key(),
			real_ip: Some("198.51.100.7".parse().unwrap()),
			overlay_ip: Some(addr.parse().unwrap()),
			status,
			trust_score: 100,
			risk_level: RiskLevel::Low,
			token_hash: None,
			token_enc: None,
			last_heartbeat_at: None,
			agent_version: "0.4.0".to_string(),
			os_info: "linux".to_string(),
			created_at: Utc::now(),
			approved_by: Some("admin".to_string()),
		}
	}

	fn device(name: &str, addr: &str, mode: TunnelMode) -> ClientDevice {
		ClientDevice {
			id: DeviceId::new(),
			user_id: UserId::new(),
			name: name.to_string(),
			device_type: "laptop".to_string(),
			tunnel_mode: mode,
			overlay_ip: Some(addr.parse().unwrap()),
			public_key: *WgKeyPair::generate().public_key(),
			private_key_enc: "ciphertext".to_string(),
			status: DeviceStatus::Active,
			expires_at: Utc::now() + Duration::days(1),
			config_token_hash: None,
			config_claimed_at: None,
			created_at: Utc::now(),
		}
	}

	fn network_policy(src: NodeRole, dst: NodeRole, port: u16, position: i64) -> NetworkPolicy {
		NetworkPolicy {
			id: PolicyId::new(),
			src_role: src,
			dst_role: dst,
			proto: Protocol::Tcp,
			port: Some(PortRange::single(port)),
			action: FirewallAction::Accept,
			priority: 100,
			position,
			created_at: Utc::now(),
		}
	}

	fn snapshot(nodes: Vec<Node>, devices: Vec<ClientDevice>, policies: Vec<NetworkPolicy>) -> CompileSnapshot {
		CompileSnapshot {
			overlay: OverlaySettings::default(),
			hub_endpoint: Some("hub.example.com:51820".to_string()),
			nodes,
			devices,
			network_policies: policies,
			taken_at: Utc::now(),
		}
	}

	#[test]
	fn test_fresh_spoke_gets_hub_and_default_deny_only() {
		let hub = node("hub-01", NodeRole::Hub, "10.10.0.1", NodeStatus::Active);
		let db = node("db-01", NodeRole::Db, "10.10.0.2", NodeStatus::Active);
		let snapshot = snapshot(vec![hub.clone(), db.clone()], vec![], vec![]);

		let plan = synthesize_node_plan(&snapshot, &db).unwrap();

		assert_eq!(plan.peers.len(), 1);
		assert_eq!(plan.peers[0].public_key, hub.public_key);
		assert_eq!(
			plan.peers[0].allowed_ips,
			vec!["10.10.0.0/24".parse::<Ipv4Net>().unwrap()]
		);
		assert_eq!(
			plan.peers[0].endpoint.as_deref(),
			Some("hub.example.com:51820")
		);

		// No allow rules: just the closing deny.
		assert_eq!(plan.firewall_rules.len(), 1);
		let last = plan.firewall_rules.last().unwrap();
		assert_eq!(last.action, FirewallAction::Drop);
		assert_eq!(last.src, "0.0.0.0/0".parse::<Ipv4Net>().unwrap());
	}

	#[test]
	fn test_role_rule_materializes_per_source_node() {
		let hub = node("hub-01", NodeRole::Hub, "10.10.0.1", NodeStatus::Active);
		let db = node("db-01", NodeRole::Db, "10.10.0.2", NodeStatus::Active);
		let app = node("app-01", NodeRole::App, "10.10.0.3", NodeStatus::Active);
		let policy = network_policy(NodeRole::App, NodeRole::Db, 5432, 1);
		let snapshot = snapshot(vec![hub, db.clone(), app.clone()], vec![], vec![policy]);

		let plan = synthesize_node_plan(&snapshot, &db).unwrap();

		// Exactly one allow rule, from app-01, plus the implicit deny.
		assert_eq!(plan.firewall_rules.len(), 2);
		let allow = &plan.firewall_rules[0];
		assert_eq!(allow.src, "10.10.0.3/32".parse::<Ipv4Net>().unwrap());
		assert_eq!(allow.proto, Protocol::Tcp);
		assert_eq!(allow.port, Some(PortRange::single(5432)));
		assert_eq!(allow.action, FirewallAction::Accept);
		assert_eq!(plan.firewall_rules[1].action, FirewallAction::Drop);

		// The reachable app node becomes a mesh peer after the Hub.
		assert_eq!(plan.peers.len(), 2);
		assert_eq!(plan.peers[1].public_key, app.public_key);
		assert_eq!(
			plan.peers[1].allowed_ips,
			vec!["10.10.0.3/32".parse::<Ipv4Net>().unwrap()]
		);
	}

	#[test]
	fn test_hub_sees_all_nodes_and_devices() {
		let hub = node("hub-01", NodeRole::Hub, "10.10.0.1", NodeStatus::Active);
		let db = node("db-01", NodeRole::Db, "10.10.0.2", NodeStatus::Active);
		let suspended = node("app-01", NodeRole::App, "10.10.0.3", NodeStatus::Suspended);
		let laptop = device("laptop", "10.10.0.100", TunnelMode::Full);
		let snapshot = snapshot(
			vec![hub.clone(), db.clone(), suspended],
			vec![laptop.clone()],
			vec![],
		);

		let plan = synthesize_node_plan(&snapshot, &hub).unwrap();

		// The suspended node is excluded; db and the device remain.
		assert_eq!(plan.peers.len(), 2);
		let keys: Vec<String> = plan.peers.iter().map(|p| p.public_key.to_base64()).collect();
		assert!(keys.contains(&db.public_key.to_base64()));
		assert!(keys.contains(&laptop.public_key.to_base64()));
	}

	#[test]
	fn test_inactive_nodes_never_appear() {
		let hub = node("hub-01", NodeRole::Hub, "10.10.0.1", NodeStatus::Active);
		let db = node("db-01", NodeRole::Db, "10.10.0.2", NodeStatus::Active);
		let pending = node("app-01", NodeRole::App, "10.10.0.3", NodeStatus::Pending);
		let policy = network_policy(NodeRole::App, NodeRole::Db, 5432, 1);
		let snapshot = snapshot(vec![hub, db.clone(), pending], vec![], vec![policy]);

		let plan = synthesize_node_plan(&snapshot, &db).unwrap();

		// Pending app node contributes neither a peer nor a rule source.
		assert_eq!(plan.peers.len(), 1);
		assert_eq!(plan.firewall_rules.len(), 1);
	}

	#[test]
	fn test_plan_is_deterministic() {
		let hub = node("hub-01", NodeRole::Hub, "10.10.0.1", NodeStatus::Active);
		let db = node("db-01", NodeRole::Db, "10.10.0.2", NodeStatus::Active);
		let app = node("app-01", NodeRole::App, "10.10.0.3", NodeStatus::Active);
		let policy = network_policy(NodeRole::App, NodeRole::Db, 5432, 1);
		let snapshot = snapshot(vec![hub, db.clone(), app], vec![], vec![policy]);

		let first = synthesize_node_plan(&snapshot, &db).unwrap();
		let second = synthesize_node_plan(&snapshot, &db).unwrap();
		assert_eq!(first.content_hash(), second.content_hash());
	}

	#[test]
	fn test_client_profile_modes() {
		let overlay = OverlaySettings::default();
		let hub_key = *WgKeyPair::generate().public_key();

		let full = device("phone", "10.10.0.100", TunnelMode::Full);
		let plan = synthesize_client_profile(
			&overlay,
			hub_key,
			Some("hub.example.com:51820"),
			&full,
			"PRIVATEKEY".to_string(),
		)
		.unwrap();
		assert_eq!(
			plan.peers[0].allowed_ips,
			vec!["0.0.0.0/0".parse::<Ipv4Net>().unwrap()]
		);
		assert_eq!(plan.interface.dns, Some("10.10.0.1".parse().unwrap()));
		assert_eq!(plan.interface.private_key.as_deref(), Some("PRIVATEKEY"));

		let split = device("phone", "10.10.0.101", TunnelMode::Split);
		let plan = synthesize_client_profile(&overlay, hub_key, None, &split, "K".to_string())
			.unwrap();
		assert_eq!(
			plan.peers[0].allowed_ips,
			vec!["10.10.0.0/24".parse::<Ipv4Net>().unwrap()]
		);
		assert_eq!(plan.interface.dns, None);
	}
}
