// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The enforcement loop.
//!
//! Single writer for the tunnel and the chain. Each pass syncs against
//! the control plane with the last applied plan hash, applies the diff in
//! place when something changed, and heartbeats. A push on the event
//! stream wakes the loop early; a plan arriving mid-apply waits for the
//! current atomic swap and is picked up by the immediately following
//! sync, so the kernel is never left in a mixed state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::client::{HubClient, SyncOutcome, SyncResponse};
use crate::collectors::Collectors;
use crate::commands::CommandRunner;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::firewall::FirewallManager;
use crate::state_file::{AppliedPlan, Identity, StateFiles};
use crate::wireguard::WgReconciler;
use trellis_common_wg::keys_file::get_or_create_node_key;
use trellis_common_wg::{Directive, WgKeyPair};

/// Isolation must complete inside this deadline.
const ISOLATE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AgentDaemon {
	config: AgentConfig,
	client: HubClient,
	wg: WgReconciler,
	firewall: FirewallManager,
	collectors: Collectors,
	state: StateFiles,
	keypair: Option<WgKeyPair>,
	identity: Option<Identity>,
	applied: Option<AppliedPlan>,
	tunnel_up: bool,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl AgentDaemon {
	pub fn new(config: AgentConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
		let client = HubClient::new(&config)?;
		let wg = WgReconciler::new(runner.clone(), config.interface.clone());
		let firewall = FirewallManager::new(runner.clone(), config.interface.clone());
		let collectors = Collectors::new(runner);
		let state = StateFiles::new(config.state_dir.clone());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Ok(Self {
			config,
			client,
			wg,
			firewall,
			collectors,
			state,
			keypair: None,
			identity: None,
			applied: None,
			tunnel_up: false,
			shutdown_tx,
			shutdown_rx,
		})
	}

	pub fn shutdown_handle(&self) -> watch::Sender<bool> {
		self.shutdown_tx.clone()
	}

	#[instrument(skip(self), fields(hostname = %self.config.hostname))]
	pub async fn run(&mut self) -> Result<()> {
		// No packet filter, no agent: starting without the chain facility
		// would mean running without default deny.
		self.firewall.check_available().await?;

		let keypair = get_or_create_node_key(self.state.dir()).await?;
		self.keypair = Some(keypair);

		self.identity = self.state.load_identity().await?;
		self.client.set_token(self.state.load_token().await?);
		self.applied = self.state.load_applied().await?;

		if self.identity.is_none() || !self.client.has_token() {
			self.enroll().await?;
		}

		// Closed chain before the first peer ever comes up.
		self.firewall.ensure_chain().await?;

		info!("enforcement loop starting");

		let (notify_tx, mut notify_rx) = mpsc::channel::<()>(8);
		let stream_client = self.client.clone();
		let mut stream_shutdown = self.shutdown_rx.clone();
		tokio::spawn(async move {
			let mut attempt: u32 = 0;
			loop {
				if *stream_shutdown.borrow() {
					return;
				}
				match stream_client.follow_events(notify_tx.clone()).await {
					Ok(()) => attempt = 0,
					Err(e) => {
						debug!(error = %e, "event stream disconnected");
						attempt = attempt.saturating_add(1);
					}
				}
				let delay = crate::client::backoff_delay(attempt);
				tokio::select! {
					_ = stream_shutdown.changed() => return,
					_ = tokio::time::sleep(delay) => {}
				}
			}
		});

		let mut ticker =
			tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs));
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		let mut shutdown_rx = self.shutdown_rx.clone();

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						info!("shutdown signal received");
						break;
					}
				}

				_ = notify_rx.recv() => {
					// Drain the burst: one sync covers every queued event.
					while notify_rx.try_recv().is_ok() {}
					if let Err(e) = self.tick().await {
						warn!(error = %e, "pushed sync failed");
					}
				}

				_ = ticker.tick() => {
					if let Err(e) = self.tick().await {
						warn!(error = %e, "scheduled sync failed");
					}
				}
			}
		}

		info!("tearing down enforcement");
		let _ = self.firewall.remove_chain().await;
		let _ = self.wg.teardown().await;
		Ok(())
	}

	/// Poll register until approval, then persist the identity and token.
	async fn enroll(&mut self) -> Result<()> {
		let keypair = self.keypair.as_ref().expect("key loaded before enroll");
		let public_key = *keypair.public_key();
		let os_info = os_release();

		let response = self
			.client
			.register_until_active(&self.config, &public_key, None, &os_info)
			.await?;

		let identity = Identity {
			node_id: response.node_id.clone(),
			hostname: self.config.hostname.clone(),
			overlay_ip: response
				.overlay_ip
				.map(|ip| ip.to_string())
				.unwrap_or_default(),
		};
		self.state.save_identity(&identity).await?;
		if let Some(ref token) = response.agent_token {
			self.state.save_token(token).await?;
		}
		self.identity = Some(identity);
		Ok(())
	}

	/// One pass: sync, apply if changed, heartbeat.
	async fn tick(&mut self) -> Result<()> {
		match self.sync_and_apply().await {
			Ok(()) => {}
			Err(AgentError::NotApproved) => {
				warn!("approval was rescinded; returning to register polling");
				self.isolate().await;
				self.enroll().await?;
				return Ok(());
			}
			Err(AgentError::Rejected { status: 401, .. }) => {
				warn!("token rejected; clearing enrollment");
				self.isolate().await;
				self.state.clear_enrollment().await?;
				self.client.set_token(None);
				self.enroll().await?;
				return Ok(());
			}
			Err(e) => return Err(e),
		}

		self.heartbeat().await;
		Ok(())
	}

	async fn sync_and_apply(&mut self) -> Result<()> {
		let node_id = self
			.identity
			.as_ref()
			.map(|i| i.node_id.clone())
			.expect("enrolled before sync");
		let last_hash = self.applied.as_ref().map(|a| a.plan_hash.clone());

		let outcome = self.client.sync(&node_id, last_hash.as_deref()).await?;
		let response = match outcome {
			SyncOutcome::Unchanged => {
				debug!("plan unchanged");
				return Ok(());
			}
			SyncOutcome::Plan(response) => *response,
		};

		// Directives that preempt plan application.
		for directive in &response.directives {
			match directive {
				Directive::Isolate => {
					warn!("isolate directive received");
					self.isolate().await;
					return Ok(());
				}
				Directive::Shutdown => {
					warn!("shutdown directive received");
					self.isolate().await;
					let _ = self.shutdown_tx.send(true);
					return Ok(());
				}
				Directive::Reenroll => {
					warn!("reenroll directive received");
					self.isolate().await;
					self.state.clear_enrollment().await?;
					self.client.set_token(None);
					self.enroll().await?;
					return Ok(());
				}
				Directive::RotateKeyBy { deadline } => {
					// Rotation needs the operator to revoke and re-enroll;
					// surfaced loudly until then.
					warn!(%deadline, "key rotation requested by control plane");
				}
			}
		}

		self.apply_plan(&response).await
	}

	/// Apply the three-way diff: desired plan vs kernel state vs last
	/// applied plan.
	async fn apply_plan(&mut self, response: &SyncResponse) -> Result<()> {
		let keypair = self.keypair.as_ref().expect("key loaded before apply");

		// The interface is only reconfigured when its own parameters
		// changed; peer churn alone never touches it.
		let last_interface = self.applied.as_ref().map(|a| &a.interface);
		if !self.tunnel_up
			|| WgReconciler::interface_changed(last_interface, &response.interface)
		{
			self.wg
				.ensure_interface(
					&keypair.private_key().expose_base64(),
					response.interface.address,
					response.interface.listen_port,
				)
				.await?;
			self.tunnel_up = true;
		}

		let changes = self.wg.reconcile_peers(&response.peers).await?;

		// Chain contents swap atomically; the jump is re-asserted in case
		// an operator flushed INPUT.
		self.firewall.ensure_chain().await?;
		self.firewall.apply_rules(&response.firewall_rules).await?;

		let applied = AppliedPlan {
			plan_hash: response.plan_hash.clone(),
			applied_at: chrono::Utc::now(),
			interface: response.interface.clone(),
			peers: response.peers.clone(),
			firewall_rules: response.firewall_rules.clone(),
		};
		self.state.save_applied(&applied).await?;
		self.applied = Some(applied);

		info!(
			plan_hash = %response.plan_hash,
			added = changes.added,
			updated = changes.updated,
			removed = changes.removed,
			rules = response.firewall_rules.len(),
			"plan applied"
		);
		Ok(())
	}

	/// Tear down the tunnel and the chain inside the isolation deadline.
	async fn isolate(&mut self) {
		let work = async {
			let _ = self.wg.teardown().await;
			let _ = self.firewall.remove_chain().await;
		};
		if tokio::time::timeout(ISOLATE_TIMEOUT, work).await.is_err() {
			error!("isolation did not complete within the deadline");
		}
		self.tunnel_up = false;
		// Identity and token survive isolation; only the applied plan is
		// forgotten so a resume reapplies from scratch.
		self.applied = None;
		let _ = self.state.clear_applied().await;
	}

	async fn heartbeat(&mut self) {
		let Some(node_id) = self.identity.as_ref().map(|i| i.node_id.clone()) else {
			return;
		};
		let metrics = self.collectors.collect().await;
		match self.client.heartbeat(&node_id, &metrics).await {
			Ok(response) => {
				debug!(next_interval = response.next_interval, ack = response.ack, "heartbeat");
			}
			Err(e) => warn!(error = %e, "heartbeat failed"),
		}
	}
}

fn os_release() -> String {
	std::fs::read_to_string("/etc/os-release")
		.ok()
		.and_then(|content| {
			content.lines().find_map(|line| {
				line.strip_prefix("PRETTY_NAME=")
					.map(|v| v.trim_matches('"').to_string())
			})
		})
		.unwrap_or_else(|| std::env::consts::OS.to_string())
}
