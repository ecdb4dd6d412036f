// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard interface lifecycle and in-place peer reconciliation.
//!
//! Peers are added, updated, and removed individually with `wg set`; the
//! interface itself is only (re)configured when its own parameters
//! change, so steady-state plan updates never drop established tunnels.

use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::commands::CommandRunner;
use crate::error::Result;
use trellis_common_wg::{InterfaceSpec, PeerSpec, WgPublicKey};

/// A peer as reported by `wg show <iface> dump`.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelPeer {
	pub public_key: WgPublicKey,
	pub endpoint: Option<String>,
	pub allowed_ips: Vec<String>,
	pub persistent_keepalive: Option<u16>,
}

/// What a reconciliation pass did.
#[derive(Debug, Default, PartialEq)]
pub struct PeerChanges {
	pub added: usize,
	pub updated: usize,
	pub removed: usize,
}

impl PeerChanges {
	pub fn is_noop(&self) -> bool {
		self.added == 0 && self.updated == 0 && self.removed == 0
	}
}

pub struct WgReconciler {
	runner: Arc<dyn CommandRunner>,
	interface: String,
}

impl WgReconciler {
	pub fn new(runner: Arc<dyn CommandRunner>, interface: impl Into<String>) -> Self {
		Self {
			runner,
			interface: interface.into(),
		}
	}

	/// Bring the interface up with the given key, address, and port.
	/// Idempotent: `addr replace` and `wg set` converge without tearing
	/// anything down.
	#[instrument(skip(self, private_key_b64))]
	pub async fn ensure_interface(
		&self,
		private_key_b64: &str,
		address: Ipv4Net,
		listen_port: Option<u16>,
	) -> Result<()> {
		let exists = self
			.runner
			.run("ip", &["link", "show", &self.interface], None)
			.await?
			.success;
		if !exists {
			info!(interface = %self.interface, "creating WireGuard interface");
			self.runner
				.run_checked(
					"ip",
					&["link", "add", &self.interface, "type", "wireguard"],
					None,
				)
				.await?;
		}

		self.runner
			.run_checked(
				"wg",
				&["set", &self.interface, "private-key", "/dev/stdin"],
				Some(private_key_b64),
			)
			.await?;

		if let Some(port) = listen_port {
			let port = port.to_string();
			self.runner
				.run_checked("wg", &["set", &self.interface, "listen-port", &port], None)
				.await?;
		}

		let addr = address.to_string();
		self.runner
			.run_checked(
				"ip",
				&["-4", "addr", "replace", &addr, "dev", &self.interface],
				None,
			)
			.await?;
		self.runner
			.run_checked("ip", &["link", "set", &self.interface, "up"], None)
			.await?;

		Ok(())
	}

	/// Current peer set from the kernel.
	#[instrument(skip(self))]
	pub async fn kernel_peers(&self) -> Result<Vec<KernelPeer>> {
		let dump = self
			.runner
			.run_checked("wg", &["show", &self.interface, "dump"], None)
			.await?;
		Ok(parse_wg_dump(&dump))
	}

	/// Converge the kernel peer set onto `desired` without touching the
	/// interface.
	#[instrument(skip(self, desired))]
	pub async fn reconcile_peers(&self, desired: &[PeerSpec]) -> Result<PeerChanges> {
		let current = self.kernel_peers().await?;
		let current_by_key: HashMap<WgPublicKey, &KernelPeer> =
			current.iter().map(|p| (p.public_key, p)).collect();

		let mut changes = PeerChanges::default();

		for peer in desired {
			let desired_allowed: Vec<String> =
				peer.allowed_ips.iter().map(|n| n.to_string()).collect();

			match current_by_key.get(&peer.public_key) {
				Some(existing)
					if existing.allowed_ips == desired_allowed
						&& existing.endpoint == peer.endpoint
						&& existing.persistent_keepalive == peer.persistent_keepalive =>
				{
					continue;
				}
				Some(_) => changes.updated += 1,
				None => changes.added += 1,
			}

			self.set_peer(peer, &desired_allowed).await?;
		}

		let desired_keys: HashMap<WgPublicKey, ()> =
			desired.iter().map(|p| (p.public_key, ())).collect();
		for peer in &current {
			if !desired_keys.contains_key(&peer.public_key) {
				let key = peer.public_key.to_base64();
				self.runner
					.run_checked("wg", &["set", &self.interface, "peer", &key, "remove"], None)
					.await?;
				changes.removed += 1;
			}
		}

		if !changes.is_noop() {
			debug!(?changes, "reconciled peers");
		}
		Ok(changes)
	}

	async fn set_peer(&self, peer: &PeerSpec, allowed: &[String]) -> Result<()> {
		let key = peer.public_key.to_base64();
		let allowed_ips = allowed.join(",");

		let mut args: Vec<String> = vec![
			"set".into(),
			self.interface.clone(),
			"peer".into(),
			key,
			"allowed-ips".into(),
			allowed_ips,
		];
		if let Some(ref endpoint) = peer.endpoint {
			args.push("endpoint".into());
			args.push(endpoint.clone());
		}
		if let Some(keepalive) = peer.persistent_keepalive {
			args.push("persistent-keepalive".into());
			args.push(keepalive.to_string());
		}

		let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
		self.runner.run_checked("wg", &arg_refs, None).await?;
		Ok(())
	}

	/// Whether the interface's own parameters differ from the desired
	/// spec, in which case `ensure_interface` must run again.
	pub fn interface_changed(last_applied: Option<&InterfaceSpec>, desired: &InterfaceSpec) -> bool {
		match last_applied {
			None => true,
			Some(last) => {
				last.address != desired.address || last.listen_port != desired.listen_port
			}
		}
	}

	/// Remove the interface entirely. Used by isolate and shutdown.
	#[instrument(skip(self))]
	pub async fn teardown(&self) -> Result<()> {
		let output = self
			.runner
			.run("ip", &["link", "del", &self.interface], None)
			.await?;
		if output.success {
			info!(interface = %self.interface, "interface removed");
		}
		Ok(())
	}
}

/// Parse `wg show <iface> dump`: one interface line, then one line per
/// peer with `pubkey psk endpoint allowed-ips handshake rx tx keepalive`.
fn parse_wg_dump(dump: &str) -> Vec<KernelPeer> {
	dump.lines()
		.skip(1)
		.filter_map(|line| {
			let fields: Vec<&str> = line.split('\t').collect();
			if fields.len() < 8 {
				return None;
			}
			let public_key = WgPublicKey::from_base64(fields[0]).ok()?;
			let endpoint = match fields[2] {
				"(none)" | "" => None,
				value => Some(value.to_string()),
			};
			let allowed_ips = if fields[3].is_empty() || fields[3] == "(none)" {
				Vec::new()
			} else {
				fields[3].split(',').map(str::to_string).collect()
			};
			let persistent_keepalive = match fields[7] {
				"off" | "" => None,
				value => value.parse().ok(),
			};
			Some(KernelPeer {
				public_key,
				endpoint,
				allowed_ips,
				persistent_keepalive,
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::commands::testing::RecordingRunner;
	use trellis_common_wg::WgKeyPair;

	fn peer(key: &WgPublicKey, allowed: &str, endpoint: Option<&str>) -> PeerSpec {
		PeerSpec {
			public_key: *key,
			endpoint: endpoint.map(str::to_string),
			allowed_ips: vec![allowed.parse().unwrap()],
			persistent_keepalive: Some(25),
		}
	}

	fn dump_line(key: &WgPublicKey, endpoint: &str, allowed: &str, keepalive: &str) -> String {
		format!(
			"{}\t(none)\t{}\t{}\t0\t0\t0\t{}",
			key.to_base64(),
			endpoint,
			allowed,
			keepalive
		)
	}

	fn dump(peers: &[String]) -> String {
		let mut out = String::from("PRIVKEY\tPUBKEY\t51820\toff\n");
		for line in peers {
			out.push_str(line);
			out.push('\n');
		}
		out
	}

	#[tokio::test]
	async fn test_adds_missing_peer() {
		let runner = Arc::new(RecordingRunner::new());
		let hub = *WgKeyPair::generate().public_key();

		runner.respond_ok("wg", &dump(&[]));

		let reconciler = WgReconciler::new(runner.clone(), "wg0");
		let changes = reconciler
			.reconcile_peers(&[peer(&hub, "10.10.0.0/24", Some("198.51.100.7:51820"))])
			.await
			.unwrap();

		assert_eq!(changes.added, 1);
		let set_calls = runner.calls_for("wg");
		// One dump read plus one peer set.
		assert_eq!(set_calls.len(), 2);
		assert!(set_calls[1].args.contains(&"allowed-ips".to_string()));
		assert!(set_calls[1].args.contains(&"10.10.0.0/24".to_string()));
	}

	#[tokio::test]
	async fn test_unchanged_peer_is_left_alone() {
		let runner = Arc::new(RecordingRunner::new());
		let hub = *WgKeyPair::generate().public_key();

		runner.respond_ok(
			"wg",
			&dump(&[dump_line(&hub, "198.51.100.7:51820", "10.10.0.0/24", "25")]),
		);

		let reconciler = WgReconciler::new(runner.clone(), "wg0");
		let changes = reconciler
			.reconcile_peers(&[peer(&hub, "10.10.0.0/24", Some("198.51.100.7:51820"))])
			.await
			.unwrap();

		assert!(changes.is_noop());
		// Only the dump read happened.
		assert_eq!(runner.calls_for("wg").len(), 1);
	}

	#[tokio::test]
	async fn test_removes_undesired_peer() {
		let runner = Arc::new(RecordingRunner::new());
		let stale = *WgKeyPair::generate().public_key();

		runner.respond_ok(
			"wg",
			&dump(&[dump_line(&stale, "(none)", "10.10.0.9/32", "off")]),
		);

		let reconciler = WgReconciler::new(runner.clone(), "wg0");
		let changes = reconciler.reconcile_peers(&[]).await.unwrap();

		assert_eq!(changes.removed, 1);
		let calls = runner.calls_for("wg");
		assert!(calls[1].args.contains(&"remove".to_string()));
		assert!(calls[1].args.contains(&stale.to_base64()));
	}

	#[tokio::test]
	async fn test_updates_changed_allowed_ips() {
		let runner = Arc::new(RecordingRunner::new());
		let key = *WgKeyPair::generate().public_key();

		runner.respond_ok(
			"wg",
			&dump(&[dump_line(&key, "(none)", "10.10.0.9/32", "25")]),
		);

		let reconciler = WgReconciler::new(runner.clone(), "wg0");
		let changes = reconciler
			.reconcile_peers(&[peer(&key, "10.10.0.10/32", None)])
			.await
			.unwrap();

		assert_eq!(changes.updated, 1);
		assert_eq!(changes.added, 0);
		assert_eq!(changes.removed, 0);
	}

	#[test]
	fn test_interface_changed() {
		let desired = InterfaceSpec {
			address: "10.10.0.2/24".parse().unwrap(),
			listen_port: Some(51820),
			dns: None,
			private_key: None,
		};
		assert!(WgReconciler::interface_changed(None, &desired));
		assert!(!WgReconciler::interface_changed(Some(&desired), &desired));

		let mut moved = desired.clone();
		moved.address = "10.10.0.3/24".parse().unwrap();
		assert!(WgReconciler::interface_changed(Some(&desired), &moved));
	}

	#[test]
	fn test_parse_dump_skips_malformed_lines() {
		let key = *WgKeyPair::generate().public_key();
		let text = format!(
			"PRIV\tPUB\t51820\toff\n{}\ngarbage line\n",
			dump_line(&key, "(none)", "10.10.0.2/32,10.10.0.3/32", "off")
		);
		let peers = parse_wg_dump(&text);
		assert_eq!(peers.len(), 1);
		assert_eq!(peers[0].allowed_ips.len(), 2);
		assert_eq!(peers[0].endpoint, None);
		assert_eq!(peers[0].persistent_keepalive, None);
	}
}
