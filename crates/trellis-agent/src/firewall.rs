// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The dedicated ZT_ACL chain.
//!
//! The chain hangs off `INPUT -i <overlay-iface>` and is rebuilt through
//! a single `iptables-restore --noflush` commit: flush and repopulate
//! happen in one kernel transaction, so there is never an observable
//! moment where the overlay interface is default-allow. The chain always
//! ends in DROP, preceded by exactly one ESTABLISHED,RELATED acceptor.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::commands::CommandRunner;
use crate::error::{AgentError, Result};
use trellis_common_wg::{FirewallAction, FirewallRuleSpec, Protocol};

pub const CHAIN_NAME: &str = "ZT_ACL";

pub struct FirewallManager {
	runner: Arc<dyn CommandRunner>,
	interface: String,
}

impl FirewallManager {
	pub fn new(runner: Arc<dyn CommandRunner>, interface: impl Into<String>) -> Self {
		Self {
			runner,
			interface: interface.into(),
		}
	}

	/// Verify the netfilter facility exists. The agent refuses to start
	/// without it: no chain means no default deny.
	#[instrument(skip(self))]
	pub async fn check_available(&self) -> Result<()> {
		let output = self.runner.run("iptables", &["--version"], None).await;
		match output {
			Ok(out) if out.success => Ok(()),
			Ok(out) => Err(AgentError::FirewallUnavailable(out.stderr)),
			Err(e) => Err(AgentError::FirewallUnavailable(e.to_string())),
		}
	}

	/// Create the chain and hook it from INPUT if not already present.
	/// The chain starts closed: its initial contents are the conntrack
	/// acceptor and the trailing DROP.
	#[instrument(skip(self))]
	pub async fn ensure_chain(&self) -> Result<()> {
		let exists = self
			.runner
			.run("iptables", &["-n", "-L", CHAIN_NAME], None)
			.await?
			.success;
		if !exists {
			self.runner
				.run_checked("iptables", &["-N", CHAIN_NAME], None)
				.await?;
			// Closed posture from the first instant.
			self.apply_rules(&[]).await?;
			info!(chain = CHAIN_NAME, "created firewall chain");
		}

		let jump_args = ["-C", "INPUT", "-i", &self.interface, "-j", CHAIN_NAME];
		let hooked = self.runner.run("iptables", &jump_args, None).await?.success;
		if !hooked {
			self.runner
				.run_checked(
					"iptables",
					&["-I", "INPUT", "-i", &self.interface, "-j", CHAIN_NAME],
					None,
				)
				.await?;
			info!(chain = CHAIN_NAME, interface = %self.interface, "hooked chain from INPUT");
		}

		Ok(())
	}

	/// Atomically replace the chain contents with the compiled rules.
	#[instrument(skip(self, rules), fields(rule_count = rules.len()))]
	pub async fn apply_rules(&self, rules: &[FirewallRuleSpec]) -> Result<()> {
		let payload = render_restore_payload(rules);
		self.runner
			.run_checked("iptables-restore", &["--noflush"], Some(&payload))
			.await?;
		Ok(())
	}

	/// Unhook and delete the chain.
	#[instrument(skip(self))]
	pub async fn remove_chain(&self) -> Result<()> {
		// Best effort: partial teardown must not abort shutdown.
		let _ = self
			.runner
			.run(
				"iptables",
				&["-D", "INPUT", "-i", &self.interface, "-j", CHAIN_NAME],
				None,
			)
			.await;
		let _ = self.runner.run("iptables", &["-F", CHAIN_NAME], None).await;
		let _ = self.runner.run("iptables", &["-X", CHAIN_NAME], None).await;
		info!(chain = CHAIN_NAME, "removed firewall chain");
		Ok(())
	}
}

/// Render the `iptables-restore --noflush` payload: flush the chain and
/// rebuild it inside one commit.
fn render_restore_payload(rules: &[FirewallRuleSpec]) -> String {
	let mut out = String::from("*filter\n");
	out.push_str(&format!(":{CHAIN_NAME} - [0:0]\n"));
	out.push_str(&format!("-F {CHAIN_NAME}\n"));

	// Exactly one stateful acceptor, ahead of the compiled rules.
	out.push_str(&format!(
		"-A {CHAIN_NAME} -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT\n"
	));

	for rule in rules {
		// The compiled plan's own trailing deny is expressed by the final
		// unconditional DROP below.
		if rule.action == FirewallAction::Drop && rule.src.prefix_len() == 0 {
			continue;
		}
		out.push_str(&render_rule(rule));
	}

	out.push_str(&format!("-A {CHAIN_NAME} -j DROP\n"));
	out.push_str("COMMIT\n");
	out
}

fn render_rule(rule: &FirewallRuleSpec) -> String {
	let mut parts = vec![format!("-A {CHAIN_NAME}"), format!("-s {}", rule.src)];

	match rule.proto {
		Protocol::Any => {}
		proto => parts.push(format!("-p {}", proto.as_str())),
	}

	if let Some(port) = rule.port {
		// --dport needs a protocol; `any` with a port never leaves the
		// compiler, but guard anyway.
		if rule.proto == Protocol::Tcp || rule.proto == Protocol::Udp {
			if port.is_single() {
				parts.push(format!("--dport {}", port.start));
			} else {
				parts.push(format!("--dport {}:{}", port.start, port.end));
			}
		}
	}

	if let Some(ref comment) = rule.comment {
		let sanitized: String = comment
			.chars()
			.filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '>' | ' '))
			.take(250)
			.collect();
		parts.push(format!("-m comment --comment \"{sanitized}\""));
	}

	parts.push(format!(
		"-j {}",
		match rule.action {
			FirewallAction::Accept => "ACCEPT",
			FirewallAction::Drop => "DROP",
		}
	));

	let mut line = parts.join(" ");
	line.push('\n');
	line
}
