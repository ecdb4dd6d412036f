// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read side of the client-device projection.
//!
//! Expiry is enforced at read time: every "active" query carries an
//! `expires_at > now` guard, so an expired device disappears from peer
//! lists and admin views before the sweep job has written its
//! `device_revoked` event.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::error::DbError;
use crate::models::{ClientDevice, ClientDeviceRow};
use trellis_common_core::{DeviceId, UserId};

const DEVICE_COLUMNS: &str = "id, user_id, name, device_type, tunnel_mode, overlay_ip, \
	 public_key, private_key_enc, status, expires_at, config_token_hash, config_claimed_at, \
	 created_at";

#[derive(Clone)]
pub struct DeviceRepository {
	pool: SqlitePool,
}

impl DeviceRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: DeviceId) -> Result<Option<ClientDevice>, DbError> {
		let row: Option<ClientDeviceRow> = sqlx::query_as(&format!(
			"SELECT {DEVICE_COLUMNS} FROM client_devices WHERE id = ?"
		))
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await?;
		row.map(ClientDevice::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<ClientDevice>, DbError> {
		let rows: Vec<ClientDeviceRow> = sqlx::query_as(&format!(
			"SELECT {DEVICE_COLUMNS} FROM client_devices ORDER BY created_at DESC"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(ClientDevice::try_from).collect()
	}

	#[tracing::instrument(skip(self), fields(%user_id))]
	pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<ClientDevice>, DbError> {
		let rows: Vec<ClientDeviceRow> = sqlx::query_as(&format!(
			"SELECT {DEVICE_COLUMNS} FROM client_devices
			 WHERE user_id = ? ORDER BY created_at DESC"
		))
		.bind(user_id.to_string())
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(ClientDevice::try_from).collect()
	}

	/// Devices that belong in the Hub's peer set right now.
	#[tracing::instrument(skip(self))]
	pub async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<ClientDevice>, DbError> {
		let rows: Vec<ClientDeviceRow> = sqlx::query_as(&format!(
			"SELECT {DEVICE_COLUMNS} FROM client_devices
			 WHERE status = 'active' AND expires_at > ?
			 ORDER BY created_at ASC"
		))
		.bind(now)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(ClientDevice::try_from).collect()
	}

	#[tracing::instrument(skip(self), fields(%user_id))]
	pub async fn count_active_for_user(
		&self,
		user_id: UserId,
		now: DateTime<Utc>,
	) -> Result<i64, DbError> {
		let (count,): (i64,) = sqlx::query_as(
			"SELECT COUNT(*) FROM client_devices
			 WHERE user_id = ? AND status = 'active' AND expires_at > ?",
		)
		.bind(user_id.to_string())
		.bind(now)
		.fetch_one(&self.pool)
		.await?;
		Ok(count)
	}

	/// Devices past expiry but not yet revoked in the log; input for the
	/// expiry sweep.
	#[tracing::instrument(skip(self))]
	pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ClientDevice>, DbError> {
		let rows: Vec<ClientDeviceRow> = sqlx::query_as(&format!(
			"SELECT {DEVICE_COLUMNS} FROM client_devices
			 WHERE status = 'active' AND expires_at <= ?
			 ORDER BY expires_at ASC"
		))
		.bind(now)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(ClientDevice::try_from).collect()
	}

	/// Resolve an unclaimed, unexpired config token by its hash.
	#[tracing::instrument(skip_all)]
	pub async fn get_by_token_hash(
		&self,
		token_hash: &str,
		now: DateTime<Utc>,
	) -> Result<Option<ClientDevice>, DbError> {
		let row: Option<ClientDeviceRow> = sqlx::query_as(&format!(
			"SELECT {DEVICE_COLUMNS} FROM client_devices
			 WHERE config_token_hash = ? AND status = 'active' AND expires_at > ?"
		))
		.bind(token_hash)
		.bind(now)
		.fetch_optional(&self.pool)
		.await?;
		row.map(ClientDevice::try_from).transpose()
	}

	/// Record the first config retrieval without burning the token; used
	/// when tokens are time-bounded rather than single-use.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn record_config_claimed(
		&self,
		id: DeviceId,
		at: DateTime<Utc>,
	) -> Result<u64, DbError> {
		let result = sqlx::query(
			"UPDATE client_devices SET config_claimed_at = ?
			 WHERE id = ? AND config_claimed_at IS NULL",
		)
		.bind(at)
		.bind(id.to_string())
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}

	/// Burn a single-use config token on first retrieval. Operational
	/// metadata, like heartbeats: not part of the domain history.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn mark_config_claimed(
		&self,
		id: DeviceId,
		at: DateTime<Utc>,
	) -> Result<u64, DbError> {
		let result = sqlx::query(
			"UPDATE client_devices SET config_token_hash = NULL, config_claimed_at = ?
			 WHERE id = ? AND config_token_hash IS NOT NULL",
		)
		.bind(at)
		.bind(id.to_string())
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_store::{EventStore, NewEvent};
	use crate::testing::create_test_store;
	use chrono::Duration;
	use trellis_common_core::TunnelMode;
	use trellis_server_events::{AggregateType, DomainEvent};
	use trellis_common_wg::WgKeyPair;

	async fn provision(
		store: &EventStore,
		user_id: UserId,
		name: &str,
		overlay_ip: &str,
		expires_at: DateTime<Utc>,
		token_hash: &str,
	) -> DeviceId {
		let device_id = DeviceId::new();
		store
			.append(NewEvent {
				aggregate_type: AggregateType::ClientDevice,
				aggregate_id: device_id.to_string(),
				expected_version: 0,
				event: DomainEvent::DeviceProvisioned {
					device_id,
					user_id,
					name: name.to_string(),
					device_type: "laptop".to_string(),
					tunnel_mode: TunnelMode::Full,
					overlay_ip: overlay_ip.parse().unwrap(),
					public_key: *WgKeyPair::generate().public_key(),
					private_key_enc: "ciphertext".to_string(),
					expires_at,
					config_token_hash: token_hash.to_string(),
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();
		device_id
	}

	#[tokio::test]
	async fn test_expired_devices_drop_out_of_active_views() {
		let store = create_test_store().await;
		let repo = DeviceRepository::new(store.pool().clone());
		let user = UserId::new();
		let now = Utc::now();

		let live = provision(&store, user, "phone", "10.10.0.100", now + Duration::days(1), "h1")
			.await;
		let expired =
			provision(&store, user, "old", "10.10.0.101", now - Duration::hours(1), "h2").await;

		let active = repo.list_active(now).await.unwrap();
		assert_eq!(active.len(), 1);
		assert_eq!(active[0].id, live);

		let stale = repo.list_expired(now).await.unwrap();
		assert_eq!(stale.len(), 1);
		assert_eq!(stale[0].id, expired);

		assert_eq!(repo.count_active_for_user(user, now).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn test_config_token_single_use() {
		let store = create_test_store().await;
		let repo = DeviceRepository::new(store.pool().clone());
		let now = Utc::now();

		let device = provision(
			&store,
			UserId::new(),
			"phone",
			"10.10.0.100",
			now + chrono::Duration::days(1),
			"tokenhash",
		)
		.await;

		let found = repo.get_by_token_hash("tokenhash", now).await.unwrap();
		assert_eq!(found.unwrap().id, device);

		assert_eq!(repo.mark_config_claimed(device, now).await.unwrap(), 1);
		assert!(repo
			.get_by_token_hash("tokenhash", now)
			.await
			.unwrap()
			.is_none());
		// A second claim is a no-op.
		assert_eq!(repo.mark_config_claimed(device, now).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_revocation_clears_overlay_ip() {
		let store = create_test_store().await;
		let repo = DeviceRepository::new(store.pool().clone());
		let now = Utc::now();

		let device = provision(
			&store,
			UserId::new(),
			"phone",
			"10.10.0.100",
			now + chrono::Duration::days(1),
			"h",
		)
		.await;

		store
			.append(NewEvent {
				aggregate_type: AggregateType::ClientDevice,
				aggregate_id: device.to_string(),
				expected_version: 1,
				event: DomainEvent::DeviceRevoked {
					device_id: device,
					reason: "lost".to_string(),
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		let revoked = repo.get(device).await.unwrap().unwrap();
		assert_eq!(revoked.status, trellis_common_core::DeviceStatus::Revoked);
		assert_eq!(revoked.overlay_ip, None);
		assert!(repo.list_active(now).await.unwrap().is_empty());
	}
}
