// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The append-only event store.
//!
//! Appends are optimistic: the caller states the aggregate version it
//! observed, and the store rejects the write if another event got there
//! first. The projection update runs inside the same transaction as the
//! insert, so a crash can never leave the read models ahead of or behind
//! the log; a torn commit is simply absent from both.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::instrument;

use crate::error::DbError;
use crate::projection;
use trellis_server_events::{AggregateType, DomainEvent, EventBus, EventRecord};

/// An event submitted for appending, before the store assigns id/version.
#[derive(Debug, Clone)]
pub struct NewEvent {
	pub aggregate_type: AggregateType,
	pub aggregate_id: String,
	/// The aggregate version the caller observed; 0 when creating.
	pub expected_version: i64,
	pub event: DomainEvent,
	pub actor: String,
	/// Idempotency key: a resubmission with the same key returns the
	/// previously committed event without re-applying.
	pub client_request_id: Option<String>,
}

#[derive(Debug, FromRow)]
struct EventRow {
	id: i64,
	aggregate_type: String,
	aggregate_id: String,
	aggregate_version: i64,
	payload: String,
	actor: String,
	created_at: chrono::DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
	type Error = DbError;

	fn try_from(row: EventRow) -> Result<Self, Self::Error> {
		let aggregate_type: AggregateType = row
			.aggregate_type
			.parse()
			.map_err(|e: String| DbError::Corrupt(e))?;
		let event: DomainEvent = serde_json::from_str(&row.payload)?;
		Ok(EventRecord {
			id: row.id,
			aggregate_type,
			aggregate_id: row.aggregate_id,
			aggregate_version: row.aggregate_version,
			event,
			actor: row.actor,
			created_at: row.created_at,
		})
	}
}

const SELECT_COLUMNS: &str =
	"id, aggregate_type, aggregate_id, aggregate_version, payload, actor, created_at";

#[derive(Clone)]
pub struct EventStore {
	pool: SqlitePool,
	bus: EventBus,
}

impl EventStore {
	pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
		Self { pool, bus }
	}

	pub fn bus(&self) -> &EventBus {
		&self.bus
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	/// Append one event, applying its projection in the same transaction
	/// and publishing it on the bus after commit.
	#[instrument(skip(self, new), fields(
		aggregate = %new.aggregate_id,
		event_type = new.event.event_type(),
		expected_version = new.expected_version,
	))]
	pub async fn append(&self, new: NewEvent) -> Result<EventRecord, DbError> {
		let mut tx = self.pool.begin().await?;

		if let Some(ref request_id) = new.client_request_id {
			let existing: Option<EventRow> = sqlx::query_as(&format!(
				"SELECT {SELECT_COLUMNS} FROM event_store
				 WHERE aggregate_id = ? AND client_request_id = ?"
			))
			.bind(&new.aggregate_id)
			.bind(request_id)
			.fetch_optional(&mut *tx)
			.await?;

			if let Some(row) = existing {
				tx.rollback().await?;
				return row.try_into();
			}
		}

		let current: (i64,) = sqlx::query_as(
			"SELECT COALESCE(MAX(aggregate_version), 0) FROM event_store
			 WHERE aggregate_type = ? AND aggregate_id = ?",
		)
		.bind(new.aggregate_type.as_str())
		.bind(&new.aggregate_id)
		.fetch_one(&mut *tx)
		.await?;

		if current.0 != new.expected_version {
			tx.rollback().await?;
			return Err(DbError::VersionConflict {
				aggregate_id: new.aggregate_id,
				expected: new.expected_version,
				actual: current.0,
			});
		}

		let version = current.0 + 1;
		let created_at = Utc::now();
		let payload = serde_json::to_string(&new.event)?;

		let (id,): (i64,) = sqlx::query_as(
			r#"
			INSERT INTO event_store
				(aggregate_type, aggregate_id, aggregate_version, event_type,
				 payload, actor, client_request_id, created_at)
			VALUES (?, ?, ?, ?, ?, ?, ?, ?)
			RETURNING id
			"#,
		)
		.bind(new.aggregate_type.as_str())
		.bind(&new.aggregate_id)
		.bind(version)
		.bind(new.event.event_type())
		.bind(&payload)
		.bind(&new.actor)
		.bind(&new.client_request_id)
		.bind(created_at)
		.fetch_one(&mut *tx)
		.await?;

		let record = EventRecord {
			id,
			aggregate_type: new.aggregate_type,
			aggregate_id: new.aggregate_id,
			aggregate_version: version,
			event: new.event,
			actor: new.actor,
			created_at,
		};

		projection::apply(&mut tx, &record).await?;

		tx.commit().await?;
		self.bus.publish(record.clone());

		Ok(record)
	}

	/// Current version of an aggregate; 0 if it has never been written.
	pub async fn current_version(
		&self,
		aggregate_type: AggregateType,
		aggregate_id: &str,
	) -> Result<i64, DbError> {
		let (version,): (i64,) = sqlx::query_as(
			"SELECT COALESCE(MAX(aggregate_version), 0) FROM event_store
			 WHERE aggregate_type = ? AND aggregate_id = ?",
		)
		.bind(aggregate_type.as_str())
		.bind(aggregate_id)
		.fetch_one(&self.pool)
		.await?;
		Ok(version)
	}

	/// Highest committed event id; 0 on an empty log.
	pub async fn head_id(&self) -> Result<i64, DbError> {
		let (id,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM event_store")
			.fetch_one(&self.pool)
			.await?;
		Ok(id)
	}

	/// Events with id greater than `after_id`, ascending, up to `limit`.
	#[instrument(skip(self))]
	pub async fn read_since(&self, after_id: i64, limit: i64) -> Result<Vec<EventRecord>, DbError> {
		let rows: Vec<EventRow> = sqlx::query_as(&format!(
			"SELECT {SELECT_COLUMNS} FROM event_store
			 WHERE id > ? ORDER BY id ASC LIMIT ?"
		))
		.bind(after_id)
		.bind(limit)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(EventRecord::try_from).collect()
	}

	/// Full history of one aggregate in version order.
	#[instrument(skip(self))]
	pub async fn read_aggregate(
		&self,
		aggregate_type: AggregateType,
		aggregate_id: &str,
	) -> Result<Vec<EventRecord>, DbError> {
		let rows: Vec<EventRow> = sqlx::query_as(&format!(
			"SELECT {SELECT_COLUMNS} FROM event_store
			 WHERE aggregate_type = ? AND aggregate_id = ?
			 ORDER BY aggregate_version ASC"
		))
		.bind(aggregate_type.as_str())
		.bind(aggregate_id)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(EventRecord::try_from).collect()
	}
}
