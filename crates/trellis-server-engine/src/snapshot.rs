// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The projection slice the synthesizer compiles from.

use chrono::{DateTime, Utc};

use trellis_common_core::OverlaySettings;
use trellis_server_db::models::{ClientDevice, NetworkPolicy, Node};

/// Everything needed to compile plans, captured at one instant. Loading
/// the same snapshot twice yields byte-identical plans.
#[derive(Debug, Clone)]
pub struct CompileSnapshot {
	pub overlay: OverlaySettings,
	/// Public `host:port` of the Hub, for spoke and client peer entries.
	pub hub_endpoint: Option<String>,
	/// All nodes; the synthesizer considers only active ones.
	pub nodes: Vec<Node>,
	/// Client devices already filtered to active-and-unexpired.
	pub devices: Vec<ClientDevice>,
	pub network_policies: Vec<NetworkPolicy>,
	pub taken_at: DateTime<Utc>,
}

impl CompileSnapshot {
	/// Active nodes in deterministic (hostname) order.
	pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
		self.nodes.iter().filter(|n| n.is_active())
	}

	pub fn hub(&self) -> Option<&Node> {
		self.active_nodes()
			.find(|n| n.role == trellis_common_core::NodeRole::Hub)
	}
}
