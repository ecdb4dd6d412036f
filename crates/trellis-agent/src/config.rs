// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent configuration from the environment.

use std::path::PathBuf;

use crate::error::{AgentError, Result};
use trellis_common_core::NodeRole;

#[derive(Debug, Clone)]
pub struct AgentConfig {
	/// Base URL of the control plane, e.g. `https://hub.example.com:8080`.
	pub hub_url: String,
	pub hostname: String,
	pub role: NodeRole,
	/// Where the node key, bearer token, and applied plan live.
	pub state_dir: PathBuf,
	pub interface: String,
	pub sync_interval_secs: u64,
	pub agent_version: String,
}

fn detect_hostname() -> Option<String> {
	if let Ok(name) = std::env::var("HOSTNAME") {
		if !name.trim().is_empty() {
			return Some(name.trim().to_string());
		}
	}
	std::fs::read_to_string("/etc/hostname")
		.ok()
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
}

impl AgentConfig {
	pub fn from_env() -> Result<Self> {
		let hub_url = std::env::var("HUB_URL")
			.map_err(|_| AgentError::Config("HUB_URL is not set".into()))?
			.trim_end_matches('/')
			.to_string();

		let hostname = std::env::var("AGENT_HOSTNAME")
			.ok()
			.filter(|s| !s.trim().is_empty())
			.or_else(detect_hostname)
			.ok_or_else(|| AgentError::Config("cannot determine hostname".into()))?;

		let role: NodeRole = std::env::var("AGENT_ROLE")
			.map_err(|_| AgentError::Config("AGENT_ROLE is not set".into()))?
			.trim()
			.parse()
			.map_err(AgentError::Config)?;

		let state_dir = std::env::var("AGENT_STATE_DIR")
			.map(PathBuf::from)
			.unwrap_or_else(|_| PathBuf::from("/var/lib/trellis"));

		let interface =
			std::env::var("AGENT_WG_INTERFACE").unwrap_or_else(|_| "wg0".to_string());

		let sync_interval_secs = std::env::var("AGENT_SYNC_INTERVAL")
			.ok()
			.and_then(|s| s.trim().parse().ok())
			.unwrap_or(60);

		Ok(Self {
			hub_url,
			hostname,
			role,
			state_dir,
			interface,
			sync_interval_secs,
			agent_version: env!("CARGO_PKG_VERSION").to_string(),
		})
	}
}
