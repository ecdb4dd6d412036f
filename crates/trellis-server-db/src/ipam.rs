// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read side of the IPAM projection: which addresses are in use, and
//! which are parked in the post-release cool-down window.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::DbError;
use crate::models::{IpamAllocation, IpamAllocationRow};
use trellis_common_core::PoolKind;

const IPAM_COLUMNS: &str = "addr, pool, owner, allocated_at, released_at";

#[derive(Clone)]
pub struct IpamRepository {
	pool: SqlitePool,
}

impl IpamRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self))]
	pub async fn get(&self, addr: Ipv4Addr) -> Result<Option<IpamAllocation>, DbError> {
		let row: Option<IpamAllocationRow> = sqlx::query_as(&format!(
			"SELECT {IPAM_COLUMNS} FROM ipam_allocations WHERE addr = ?"
		))
		.bind(addr.to_string())
		.fetch_optional(&self.pool)
		.await?;
		row.map(IpamAllocation::try_from).transpose()
	}

	/// Addresses currently held by a live owner.
	#[tracing::instrument(skip(self))]
	pub async fn in_use(&self, pool_kind: PoolKind) -> Result<BTreeSet<Ipv4Addr>, DbError> {
		let rows: Vec<(String,)> = sqlx::query_as(
			"SELECT addr FROM ipam_allocations WHERE pool = ? AND released_at IS NULL",
		)
		.bind(pool_kind.as_str())
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter()
			.map(|(addr,)| {
				addr.parse()
					.map_err(|e| DbError::Corrupt(format!("ipam_allocations.addr: {e}")))
			})
			.collect()
	}

	/// Addresses released less than `cooldown` ago; ineligible for reuse
	/// until the window passes.
	#[tracing::instrument(skip(self))]
	pub async fn cooling_down(
		&self,
		pool_kind: PoolKind,
		now: DateTime<Utc>,
		cooldown: Duration,
	) -> Result<BTreeSet<Ipv4Addr>, DbError> {
		let cutoff = now - cooldown;
		let rows: Vec<(String,)> = sqlx::query_as(
			"SELECT addr FROM ipam_allocations
			 WHERE pool = ? AND released_at IS NOT NULL AND released_at > ?",
		)
		.bind(pool_kind.as_str())
		.bind(cutoff)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter()
			.map(|(addr,)| {
				addr.parse()
					.map_err(|e| DbError::Corrupt(format!("ipam_allocations.addr: {e}")))
			})
			.collect()
	}

	/// How often an address has been allocated or released, which is its
	/// aggregate version in the event store.
	#[tracing::instrument(skip(self))]
	pub async fn event_version(&self, addr: Ipv4Addr) -> Result<i64, DbError> {
		let (version,): (i64,) = sqlx::query_as(
			"SELECT COALESCE(MAX(aggregate_version), 0) FROM event_store
			 WHERE aggregate_type = 'ipam' AND aggregate_id = ?",
		)
		.bind(addr.to_string())
		.fetch_one(&self.pool)
		.await?;
		Ok(version)
	}

	#[tracing::instrument(skip(self))]
	pub async fn count_in_use(&self, pool_kind: PoolKind) -> Result<i64, DbError> {
		let (count,): (i64,) = sqlx::query_as(
			"SELECT COUNT(*) FROM ipam_allocations WHERE pool = ? AND released_at IS NULL",
		)
		.bind(pool_kind.as_str())
		.fetch_one(&self.pool)
		.await?;
		Ok(count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_store::NewEvent;
	use crate::testing::create_test_store;
	use trellis_server_events::{AggregateType, DomainEvent};

	#[tokio::test]
	async fn test_allocation_release_and_cooldown() {
		let store = create_test_store().await;
		let repo = IpamRepository::new(store.pool().clone());
		let addr: Ipv4Addr = "10.10.0.2".parse().unwrap();

		store
			.append(NewEvent {
				aggregate_type: AggregateType::Ipam,
				aggregate_id: addr.to_string(),
				expected_version: 0,
				event: DomainEvent::IpAllocated {
					addr,
					pool: PoolKind::Node,
					owner: "node-1".to_string(),
				},
				actor: "system".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		let in_use = repo.in_use(PoolKind::Node).await.unwrap();
		assert!(in_use.contains(&addr));
		assert_eq!(repo.event_version(addr).await.unwrap(), 1);

		store
			.append(NewEvent {
				aggregate_type: AggregateType::Ipam,
				aggregate_id: addr.to_string(),
				expected_version: 1,
				event: DomainEvent::IpReleased {
					addr,
					pool: PoolKind::Node,
				},
				actor: "system".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		let now = Utc::now();
		assert!(repo.in_use(PoolKind::Node).await.unwrap().is_empty());

		// Freshly released: inside the 24h cool-down.
		let cooling = repo
			.cooling_down(PoolKind::Node, now, Duration::hours(24))
			.await
			.unwrap();
		assert!(cooling.contains(&addr));

		// Once the window has passed, it is reusable.
		let later = now + Duration::hours(25);
		let cooling = repo
			.cooling_down(PoolKind::Node, later, Duration::hours(24))
			.await
			.unwrap();
		assert!(cooling.is_empty());
	}
}
