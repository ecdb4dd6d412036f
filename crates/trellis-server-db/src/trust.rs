// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read side of the trust-history projection.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::error::DbError;
use crate::models::TrustHistoryEntry;
use trellis_common_core::NodeId;

const TRUST_COLUMNS: &str = "id, node_id, score, previous_score, risk_level, action_taken, \
	 role_score, device_health_score, behavior_score, security_score, inputs, calculated_at";

#[derive(Clone)]
pub struct TrustHistoryRepository {
	pool: SqlitePool,
}

impl TrustHistoryRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// History for one node since a point in time, newest first.
	#[tracing::instrument(skip(self), fields(%node_id))]
	pub async fn list_for_node(
		&self,
		node_id: NodeId,
		since: DateTime<Utc>,
		limit: i64,
	) -> Result<Vec<TrustHistoryEntry>, DbError> {
		let rows: Vec<TrustHistoryEntry> = sqlx::query_as(&format!(
			"SELECT {TRUST_COLUMNS} FROM trust_history
			 WHERE node_id = ? AND calculated_at >= ?
			 ORDER BY calculated_at DESC LIMIT ?"
		))
		.bind(node_id.to_string())
		.bind(since)
		.bind(limit)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	#[tracing::instrument(skip(self), fields(%node_id))]
	pub async fn latest(&self, node_id: NodeId) -> Result<Option<TrustHistoryEntry>, DbError> {
		let row: Option<TrustHistoryEntry> = sqlx::query_as(&format!(
			"SELECT {TRUST_COLUMNS} FROM trust_history
			 WHERE node_id = ? ORDER BY calculated_at DESC, id DESC LIMIT 1"
		))
		.bind(node_id.to_string())
		.fetch_optional(&self.pool)
		.await?;
		Ok(row)
	}
}
