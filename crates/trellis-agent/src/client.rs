// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client for the control plane.
//!
//! Transient failures retry with jittered exponential backoff capped at
//! 60 seconds; 4xx rejections do not retry. The event stream is a single
//! long-running response of newline-delimited JSON frames.

use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use trellis_common_core::{NodeRole, NodeStatus};
use trellis_common_wg::{Directive, FirewallRuleSpec, InterfaceSpec, PeerSpec, WgPublicKey};

const BACKOFF_CAP: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
	hostname: &'a str,
	role: NodeRole,
	public_key: &'a WgPublicKey,
	#[serde(skip_serializing_if = "Option::is_none")]
	real_ip: Option<Ipv4Addr>,
	agent_version: &'a str,
	os_info: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
	pub node_id: String,
	pub status: NodeStatus,
	pub overlay_ip: Option<Ipv4Addr>,
	pub hub_public_key: Option<WgPublicKey>,
	pub hub_endpoint: Option<String>,
	#[serde(default)]
	pub agent_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
	pub plan_hash: String,
	pub interface: InterfaceSpec,
	pub peers: Vec<PeerSpec>,
	pub firewall_rules: Vec<FirewallRuleSpec>,
	#[serde(default)]
	pub directives: Vec<Directive>,
}

/// Result of a sync call: either the plan is unchanged, or a new one.
#[derive(Debug)]
pub enum SyncOutcome {
	Unchanged,
	Plan(Box<SyncResponse>),
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatResponse {
	pub ack: bool,
	pub next_interval: u64,
}

/// Metrics reported with each heartbeat. Field names are the wire
/// contract with the trust engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentMetrics {
	pub cpu_percent: f64,
	pub memory_percent: f64,
	pub disk_percent: f64,
	pub suspicious_processes: u32,
	pub connections_total: u32,
	pub connections_time_wait: u32,
	pub ssh_failures: u32,
	pub firewall_violations: u32,
}

#[derive(Clone)]
pub struct HubClient {
	http: reqwest::Client,
	base_url: String,
	token: Option<String>,
}

impl HubClient {
	pub fn new(config: &AgentConfig) -> Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()?;
		Ok(Self {
			http,
			base_url: config.hub_url.clone(),
			token: None,
		})
	}

	pub fn set_token(&mut self, token: Option<String>) {
		self.token = token;
	}

	pub fn has_token(&self) -> bool {
		self.token.is_some()
	}

	fn url(&self, path: &str) -> String {
		format!("{}{path}", self.base_url)
	}

	fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match self.token {
			Some(ref token) => builder.bearer_auth(token),
			None => builder,
		}
	}

	async fn reject(response: reqwest::Response) -> AgentError {
		let status = response.status().as_u16();
		let message = response.text().await.unwrap_or_default();
		if status == 403 && message.contains("pending") {
			return AgentError::NotApproved;
		}
		AgentError::Rejected { status, message }
	}

	/// One register attempt. Idempotent server-side on
	/// `(hostname, public_key)`.
	pub async fn register(
		&self,
		config: &AgentConfig,
		public_key: &WgPublicKey,
		real_ip: Option<Ipv4Addr>,
		os_info: &str,
	) -> Result<RegisterResponse> {
		let request = RegisterRequest {
			hostname: &config.hostname,
			role: config.role,
			public_key,
			real_ip,
			agent_version: &config.agent_version,
			os_info,
		};

		let response = self
			.http
			.post(self.url("/api/v1/agent/register"))
			.json(&request)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(Self::reject(response).await);
		}
		Ok(response.json().await?)
	}

	/// Poll register with backoff until the node is approved and a token
	/// is in hand.
	pub async fn register_until_active(
		&mut self,
		config: &AgentConfig,
		public_key: &WgPublicKey,
		real_ip: Option<Ipv4Addr>,
		os_info: &str,
	) -> Result<RegisterResponse> {
		let mut attempt: u32 = 0;
		loop {
			match self.register(config, public_key, real_ip, os_info).await {
				Ok(response) if response.status == NodeStatus::Active => {
					if let Some(ref token) = response.agent_token {
						self.token = Some(token.clone());
					}
					if self.token.is_none() {
						return Err(AgentError::Config(
							"node is active but its token was already claimed; \
							 revoke and re-enroll"
								.into(),
						));
					}
					info!(node_id = %response.node_id, "registered and approved");
					return Ok(response);
				}
				Ok(response) => {
					debug!(status = ?response.status, "awaiting approval");
				}
				Err(e) if e.is_retryable() => {
					warn!(error = %e, "register attempt failed");
				}
				Err(e) => return Err(e),
			}

			attempt = attempt.saturating_add(1);
			tokio::time::sleep(backoff_delay(attempt)).await;
		}
	}

	/// Fetch the plan, short-circuiting on an unchanged hash.
	pub async fn sync(&self, node_id: &str, last_hash: Option<&str>) -> Result<SyncOutcome> {
		let mut builder = self
			.http
			.post(self.url("/api/v1/agent/sync"))
			.json(&serde_json::json!({ "node_id": node_id }));
		builder = self.authorized(builder);
		if let Some(hash) = last_hash {
			builder = builder.header(reqwest::header::IF_NONE_MATCH, format!("\"{hash}\""));
		}

		let response = builder.send().await?;
		if response.status() == reqwest::StatusCode::NOT_MODIFIED {
			return Ok(SyncOutcome::Unchanged);
		}
		if !response.status().is_success() {
			return Err(Self::reject(response).await);
		}
		Ok(SyncOutcome::Plan(Box::new(response.json().await?)))
	}

	pub async fn heartbeat(
		&self,
		node_id: &str,
		metrics: &AgentMetrics,
	) -> Result<HeartbeatResponse> {
		let builder = self
			.http
			.post(self.url("/api/v1/agent/heartbeat"))
			.json(&serde_json::json!({ "node_id": node_id, "metrics": metrics }));

		let response = self.authorized(builder).send().await?;
		if !response.status().is_success() {
			return Err(Self::reject(response).await);
		}
		Ok(response.json().await?)
	}

	/// Open the event stream and forward a unit on `notify` for every
	/// frame that is not a keepalive ping. Returns when the stream ends.
	pub async fn follow_events(&self, notify: tokio::sync::mpsc::Sender<()>) -> Result<()> {
		let builder = self.http.get(self.url("/api/v1/events"));
		let response = self.authorized(builder).send().await?;
		if !response.status().is_success() {
			return Err(Self::reject(response).await);
		}

		let mut stream = response.bytes_stream();
		let mut buffer: Vec<u8> = Vec::new();

		while let Some(chunk) = stream.next().await {
			let chunk = chunk?;
			buffer.extend_from_slice(&chunk);

			while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
				let line: Vec<u8> = buffer.drain(..=newline).collect();
				let Ok(frame) = serde_json::from_slice::<serde_json::Value>(&line) else {
					continue;
				};
				if frame.get("type").and_then(|t| t.as_str()) == Some("ping") {
					continue;
				}
				debug!(event = %frame["type"], "plan-affecting event received");
				if notify.send(()).await.is_err() {
					return Ok(());
				}
			}
		}

		Ok(())
	}
}

/// Jittered exponential backoff capped at 60 seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
	let base = Duration::from_secs(1)
		.saturating_mul(2u32.saturating_pow(attempt.min(6)))
		.min(BACKOFF_CAP);
	let jitter_ms = rand::thread_rng().gen_range(0..=500);
	(base + Duration::from_millis(jitter_ms)).min(BACKOFF_CAP)
}
