// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable agent state: identity, bearer token, and the last applied
//! plan. Everything lives under the state directory with mode 0600.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::Result;
use trellis_common_wg::{FirewallRuleSpec, InterfaceSpec, PeerSpec};

const IDENTITY_FILE: &str = "identity.json";
const TOKEN_FILE: &str = "token";
const APPLIED_FILE: &str = "applied.json";

/// Who this node is, as assigned at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
	pub node_id: String,
	pub hostname: String,
	pub overlay_ip: String,
}

/// The plan most recently applied to the kernel, for the three-way diff
/// and the unchanged-sync short-circuit across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedPlan {
	pub plan_hash: String,
	pub applied_at: chrono::DateTime<chrono::Utc>,
	pub interface: InterfaceSpec,
	pub peers: Vec<PeerSpec>,
	pub firewall_rules: Vec<FirewallRuleSpec>,
}

pub struct StateFiles {
	dir: PathBuf,
}

impl StateFiles {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	async fn write_private(&self, name: &str, content: &[u8]) -> Result<()> {
		fs::create_dir_all(&self.dir).await?;
		let path = self.dir.join(name);

		#[cfg(unix)]
		{
			use tokio::fs::OpenOptions;
			use tokio::io::AsyncWriteExt;

			let mut file = OpenOptions::new()
				.write(true)
				.create(true)
				.truncate(true)
				.mode(0o600)
				.open(&path)
				.await?;
			file.write_all(content).await?;
		}

		#[cfg(not(unix))]
		{
			fs::write(&path, content).await?;
		}

		Ok(())
	}

	async fn read_optional(&self, name: &str) -> Result<Option<String>> {
		let path = self.dir.join(name);
		match fs::read_to_string(&path).await {
			Ok(content) => Ok(Some(content)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	pub async fn load_identity(&self) -> Result<Option<Identity>> {
		match self.read_optional(IDENTITY_FILE).await? {
			Some(content) => Ok(Some(serde_json::from_str(&content)?)),
			None => Ok(None),
		}
	}

	pub async fn save_identity(&self, identity: &Identity) -> Result<()> {
		self.write_private(IDENTITY_FILE, serde_json::to_string_pretty(identity)?.as_bytes())
			.await
	}

	pub async fn load_token(&self) -> Result<Option<String>> {
		Ok(self
			.read_optional(TOKEN_FILE)
			.await?
			.map(|t| t.trim().to_string())
			.filter(|t| !t.is_empty()))
	}

	pub async fn save_token(&self, token: &str) -> Result<()> {
		self.write_private(TOKEN_FILE, format!("{token}\n").as_bytes())
			.await
	}

	pub async fn load_applied(&self) -> Result<Option<AppliedPlan>> {
		match self.read_optional(APPLIED_FILE).await? {
			Some(content) => Ok(Some(serde_json::from_str(&content)?)),
			None => Ok(None),
		}
	}

	pub async fn save_applied(&self, applied: &AppliedPlan) -> Result<()> {
		self.write_private(APPLIED_FILE, serde_json::to_string_pretty(applied)?.as_bytes())
			.await
	}

	/// Forget only the applied plan, forcing a full reapply on the next
	/// sync.
	pub async fn clear_applied(&self) -> Result<()> {
		match fs::remove_file(self.dir.join(APPLIED_FILE)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Forget identity, token, and applied plan; the node key survives.
	pub async fn clear_enrollment(&self) -> Result<()> {
		for name in [IDENTITY_FILE, TOKEN_FILE, APPLIED_FILE] {
			let path = self.dir.join(name);
			match fs::remove_file(&path).await {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}
}
