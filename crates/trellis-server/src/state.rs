// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared application state: one event store, one bus, one projection,
//! with explicit construction from the server bootstrap. No process-wide
//! defaults.

use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePool;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::secrets::SecretBox;
use trellis_common_core::PoolKind;
use trellis_server_db::devices::DeviceRepository;
use trellis_server_db::identity::IdentityRepository;
use trellis_server_db::ipam::IpamRepository;
use trellis_server_db::nodes::NodeRepository;
use trellis_server_db::policies::PolicyRepository;
use trellis_server_db::trust::TrustHistoryRepository;
use trellis_server_db::{EventStore, NewEvent};
use trellis_server_engine::{CompileSnapshot, IpamService, TrustEngine};
use trellis_server_events::{AggregateType, DomainEvent, EventBus};

/// Minimum spacing between `ipam_exhausted` events.
const EXHAUSTION_ALARM_INTERVAL_SECS: u64 = 3600;

#[derive(Clone)]
pub struct AppState {
	pub config: Arc<ServerConfig>,
	pub store: EventStore,
	pub nodes: NodeRepository,
	pub identity: IdentityRepository,
	pub policies: PolicyRepository,
	pub devices: DeviceRepository,
	pub trust_history: TrustHistoryRepository,
	pub ipam_repo: IpamRepository,
	pub ipam: IpamService,
	pub trust: TrustEngine,
	pub secrets: SecretBox,
	ipam_alarm: Arc<Mutex<Option<Instant>>>,
}

/// Wire the state together over an initialized pool.
pub async fn create_app_state(pool: SqlitePool, config: ServerConfig) -> AppState {
	let bus = EventBus::default();
	let store = EventStore::new(pool.clone(), bus);
	let ipam = IpamService::new(config.overlay.clone());
	let secrets = SecretBox::from_master_secret(&config.secret_key);

	AppState {
		config: Arc::new(config),
		store,
		nodes: NodeRepository::new(pool.clone()),
		identity: IdentityRepository::new(pool.clone()),
		policies: PolicyRepository::new(pool.clone()),
		devices: DeviceRepository::new(pool.clone()),
		trust_history: TrustHistoryRepository::new(pool.clone()),
		ipam_repo: IpamRepository::new(pool),
		ipam,
		trust: TrustEngine::new(),
		secrets,
		ipam_alarm: Arc::new(Mutex::new(None)),
	}
}

impl AppState {
	pub fn bus(&self) -> &EventBus {
		self.store.bus()
	}

	/// Capture the projection slice the compiler needs.
	pub async fn load_snapshot(&self) -> ServerResult<CompileSnapshot> {
		let now = Utc::now();
		Ok(CompileSnapshot {
			overlay: self.config.overlay.clone(),
			hub_endpoint: self.hub_endpoint().await?,
			nodes: self.nodes.list().await?,
			devices: self.devices.list_active(now).await?,
			network_policies: self.policies.list_network_policies().await?,
			taken_at: now,
		})
	}

	/// The Hub's public WireGuard endpoint: fixed by configuration, or
	/// derived from the Hub node's registered real IP.
	pub async fn hub_endpoint(&self) -> ServerResult<Option<String>> {
		if let Some(ref endpoint) = self.config.hub_endpoint {
			return Ok(Some(endpoint.clone()));
		}
		let hub = self.nodes.hub().await?;
		Ok(hub.and_then(|hub| {
			hub.real_ip
				.map(|ip| format!("{ip}:{}", self.config.overlay.wg_port))
		}))
	}

	/// Append an event, retrying exactly once on a version conflict after
	/// re-reading the current version.
	pub async fn append_event(
		&self,
		aggregate_type: AggregateType,
		aggregate_id: String,
		event: DomainEvent,
		actor: String,
		client_request_id: Option<String>,
	) -> ServerResult<trellis_server_events::EventRecord> {
		let version = self
			.store
			.current_version(aggregate_type, &aggregate_id)
			.await?;

		let first = self
			.store
			.append(NewEvent {
				aggregate_type,
				aggregate_id: aggregate_id.clone(),
				expected_version: version,
				event: event.clone(),
				actor: actor.clone(),
				client_request_id: client_request_id.clone(),
			})
			.await;

		match first {
			Ok(record) => Ok(record),
			Err(err) if err.is_conflict() => {
				tracing::warn!(%aggregate_id, "version conflict on append, retrying once");
				let version = self
					.store
					.current_version(aggregate_type, &aggregate_id)
					.await?;
				Ok(self
					.store
					.append(NewEvent {
						aggregate_type,
						aggregate_id,
						expected_version: version,
						event,
						actor,
						client_request_id,
					})
					.await?)
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Allocate the lowest free address in a pool and commit the
	/// allocation to the log.
	pub async fn allocate_address(
		&self,
		pool: PoolKind,
		owner: String,
		actor: String,
	) -> ServerResult<Ipv4Addr> {
		let now = Utc::now();
		let cooldown = Duration::hours(self.config.ip_cooldown_hours);

		// Two passes: a concurrent allocation of the same address shows up
		// as a version conflict, and the re-read skips it.
		for attempt in 0..2 {
			let in_use = self.ipam_repo.in_use(pool).await?;
			let cooling = self.ipam_repo.cooling_down(pool, now, cooldown).await?;

			let addr = match self.ipam.allocate(pool, &in_use, &cooling) {
				Ok(addr) => addr,
				Err(err) => {
					self.raise_exhaustion_alarm(pool).await?;
					return Err(err.into());
				}
			};

			let version = self.ipam_repo.event_version(addr).await?;
			let result = self
				.store
				.append(NewEvent {
					aggregate_type: AggregateType::Ipam,
					aggregate_id: addr.to_string(),
					expected_version: version,
					event: DomainEvent::IpAllocated {
						addr,
						pool,
						owner: owner.clone(),
					},
					actor: actor.clone(),
					client_request_id: None,
				})
				.await;

			match result {
				Ok(_) => return Ok(addr),
				Err(err) if err.is_conflict() && attempt == 0 => continue,
				Err(err) => return Err(err.into()),
			}
		}

		Err(ServerError::conflict("address allocation raced twice"))
	}

	/// The Hub does not draw from a pool: it owns the reserved first host
	/// address of the overlay.
	pub async fn allocate_hub_address(
		&self,
		owner: String,
		actor: String,
	) -> ServerResult<Ipv4Addr> {
		let addr = self.config.overlay.hub_addr;
		if let Some(existing) = self.ipam_repo.get(addr).await? {
			if existing.released_at.is_none() {
				if existing.owner.as_deref() == Some(owner.as_str()) {
					return Ok(addr);
				}
				return Err(ServerError::conflict(format!(
					"hub address {addr} is already assigned"
				)));
			}
		}

		let version = self.ipam_repo.event_version(addr).await?;
		self.store
			.append(NewEvent {
				aggregate_type: AggregateType::Ipam,
				aggregate_id: addr.to_string(),
				expected_version: version,
				event: DomainEvent::IpAllocated {
					addr,
					pool: PoolKind::Node,
					owner,
				},
				actor,
				client_request_id: None,
			})
			.await?;
		Ok(addr)
	}

	/// Release an address back to its pool; reuse is blocked for the
	/// cool-down window.
	pub async fn release_address(&self, addr: Ipv4Addr, actor: String) -> ServerResult<()> {
		let pool = self
			.config
			.overlay
			.pool_of(addr)
			.unwrap_or(PoolKind::Node);
		let version = self.ipam_repo.event_version(addr).await?;
		self.store
			.append(NewEvent {
				aggregate_type: AggregateType::Ipam,
				aggregate_id: addr.to_string(),
				expected_version: version,
				event: DomainEvent::IpReleased { addr, pool },
				actor,
				client_request_id: None,
			})
			.await?;
		Ok(())
	}

	/// Emit `ipam_exhausted` at most once per hour.
	async fn raise_exhaustion_alarm(&self, pool: PoolKind) -> ServerResult<()> {
		let mut last = self.ipam_alarm.lock().await;
		let due = last
			.map(|at| at.elapsed().as_secs() >= EXHAUSTION_ALARM_INTERVAL_SECS)
			.unwrap_or(true);
		if !due {
			return Ok(());
		}
		*last = Some(Instant::now());
		drop(last);

		let now_key = Utc::now().format("%Y%m%d%H").to_string();
		self.append_event(
			AggregateType::Ipam,
			format!("exhaustion:{}", pool.as_str()),
			DomainEvent::IpamExhausted { pool },
			"system".to_string(),
			Some(now_key),
		)
		.await?;
		Ok(())
	}
}
