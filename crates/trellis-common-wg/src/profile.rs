// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rendering a [`NodePlan`] as a wg-quick configuration file.
//!
//! Used for one-shot client device profiles; node agents consume the plan
//! structurally and never see this format.

use crate::plan::NodePlan;
use std::fmt::Write;

/// Render the plan as wg-quick INI text.
pub fn render_profile(plan: &NodePlan) -> String {
	let mut out = String::new();

	out.push_str("[Interface]\n");
	let _ = writeln!(out, "Address = {}", plan.interface.address);
	if let Some(ref private_key) = plan.interface.private_key {
		let _ = writeln!(out, "PrivateKey = {private_key}");
	}
	if let Some(dns) = plan.interface.dns {
		let _ = writeln!(out, "DNS = {dns}");
	}
	if let Some(port) = plan.interface.listen_port {
		let _ = writeln!(out, "ListenPort = {port}");
	}

	for peer in &plan.peers {
		out.push('\n');
		out.push_str("[Peer]\n");
		let _ = writeln!(out, "PublicKey = {}", peer.public_key);
		if let Some(ref endpoint) = peer.endpoint {
			let _ = writeln!(out, "Endpoint = {endpoint}");
		}
		let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
		let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
		if let Some(keepalive) = peer.persistent_keepalive {
			let _ = writeln!(out, "PersistentKeepalive = {keepalive}");
		}
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::keys::WgKeyPair;
	use crate::plan::{InterfaceSpec, PeerSpec};

	#[test]
	fn test_render_full_tunnel_profile() {
		let hub = WgKeyPair::generate();
		let device = WgKeyPair::generate();

		let plan = NodePlan {
			interface: InterfaceSpec {
				address: "10.10.0.100/24".parse().unwrap(),
				listen_port: None,
				dns: Some("10.10.0.1".parse().unwrap()),
				private_key: Some(device.private_key().expose_base64()),
			},
			peers: vec![PeerSpec {
				public_key: *hub.public_key(),
				endpoint: Some("hub.example.com:51820".to_string()),
				allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
				persistent_keepalive: Some(25),
			}],
			firewall_rules: vec![],
		};

		let text = render_profile(&plan);
		assert!(text.starts_with("[Interface]\n"));
		assert!(text.contains("Address = 10.10.0.100/24"));
		assert!(text.contains(&format!(
			"PrivateKey = {}",
			device.private_key().expose_base64()
		)));
		assert!(text.contains("DNS = 10.10.0.1"));
		assert!(text.contains("[Peer]"));
		assert!(text.contains(&format!("PublicKey = {}", hub.public_key())));
		assert!(text.contains("Endpoint = hub.example.com:51820"));
		assert!(text.contains("AllowedIPs = 0.0.0.0/0"));
		assert!(text.contains("PersistentKeepalive = 25"));
	}

	#[test]
	fn test_split_tunnel_allowed_ips() {
		let hub = WgKeyPair::generate();
		let plan = NodePlan {
			interface: InterfaceSpec {
				address: "10.10.0.101/24".parse().unwrap(),
				listen_port: None,
				dns: None,
				private_key: None,
			},
			peers: vec![PeerSpec {
				public_key: *hub.public_key(),
				endpoint: Some("hub.example.com:51820".to_string()),
				allowed_ips: vec!["10.10.0.0/24".parse().unwrap()],
				persistent_keepalive: Some(25),
			}],
			firewall_rules: vec![],
		};

		let text = render_profile(&plan);
		assert!(text.contains("AllowedIPs = 10.10.0.0/24"));
		assert!(!text.contains("PrivateKey"));
	}
}
