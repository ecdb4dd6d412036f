// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Plan assembly for sync responses.

use trellis_common_core::{NodeStatus, RiskLevel};
use trellis_common_wg::{Directive, NodePlan, PlanHash};
use trellis_server_db::models::Node;
use trellis_server_engine::synthesize_node_plan;

use crate::error::ServerResult;
use crate::state::AppState;

/// A compiled plan plus the directives that ride along with it.
pub struct PlanBundle {
	pub plan: NodePlan,
	pub hash: PlanHash,
	pub directives: Vec<Directive>,
}

impl AppState {
	/// Compile the current plan for a node.
	///
	/// Suspended nodes receive an isolation plan: no peers, deny-only
	/// rules, and the isolate directive. High-risk nodes are restricted
	/// to their Hub link, the narrowest connectivity that keeps them
	/// manageable.
	pub async fn plan_for_node(&self, node: &Node) -> ServerResult<PlanBundle> {
		let snapshot = self.load_snapshot().await?;
		let mut plan = synthesize_node_plan(&snapshot, node)?;
		let mut directives = Vec::new();

		match node.status {
			NodeStatus::Suspended => {
				plan.peers.clear();
				plan.firewall_rules
					.retain(|rule| rule.action == trellis_common_wg::FirewallAction::Drop);
				directives.push(Directive::Isolate);
			}
			_ if node.risk_level == RiskLevel::High => {
				let overlay = snapshot.overlay.network;
				plan.peers
					.retain(|peer| peer.allowed_ips.contains(&overlay));
			}
			_ => {}
		}

		let hash = plan.content_hash();
		Ok(PlanBundle {
			plan,
			hash,
			directives,
		})
	}
}
