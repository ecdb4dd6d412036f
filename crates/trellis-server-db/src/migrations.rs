// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Forward-only schema migrations.
//!
//! Each applied migration is recorded both in `schema_migrations` and as a
//! `schema_migrated` event in the event store, so the log carries the full
//! history of the database shape alongside the domain history.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::{info, instrument};

use crate::error::DbError;
use trellis_server_events::{AggregateType, DomainEvent};

struct Migration {
	version: i64,
	name: &'static str,
	statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[Migration {
	version: 1,
	name: "initial_schema",
	statements: &[
		r#"
		CREATE TABLE IF NOT EXISTS event_store (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			aggregate_type TEXT NOT NULL,
			aggregate_id TEXT NOT NULL,
			aggregate_version INTEGER NOT NULL,
			event_type TEXT NOT NULL,
			payload TEXT NOT NULL,
			actor TEXT NOT NULL,
			client_request_id TEXT,
			created_at TEXT NOT NULL,
			UNIQUE (aggregate_type, aggregate_id, aggregate_version)
		)
		"#,
		r#"
		CREATE UNIQUE INDEX IF NOT EXISTS idx_event_store_request
			ON event_store (aggregate_id, client_request_id)
			WHERE client_request_id IS NOT NULL
		"#,
		r#"
		CREATE TABLE IF NOT EXISTS nodes (
			id TEXT PRIMARY KEY,
			hostname TEXT NOT NULL,
			role TEXT NOT NULL,
			public_key TEXT NOT NULL,
			real_ip TEXT,
			overlay_ip TEXT,
			status TEXT NOT NULL,
			trust_score INTEGER NOT NULL DEFAULT 100,
			risk_level TEXT NOT NULL DEFAULT 'low',
			token_hash TEXT,
			token_enc TEXT,
			last_heartbeat_at TEXT,
			agent_version TEXT NOT NULL,
			os_info TEXT NOT NULL,
			created_at TEXT NOT NULL,
			approved_by TEXT
		)
		"#,
		r#"
		CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_hostname_live
			ON nodes (hostname)
			WHERE status != 'revoked'
		"#,
		r#"
		CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_overlay_ip
			ON nodes (overlay_ip)
			WHERE overlay_ip IS NOT NULL
		"#,
		"CREATE INDEX IF NOT EXISTS idx_nodes_role ON nodes (role, status)",
		"CREATE INDEX IF NOT EXISTS idx_nodes_token ON nodes (token_hash)",
		r#"
		CREATE TABLE IF NOT EXISTS users (
			id TEXT PRIMARY KEY,
			external_id TEXT NOT NULL UNIQUE,
			email TEXT NOT NULL UNIQUE,
			display_name TEXT NOT NULL,
			department TEXT,
			status TEXT NOT NULL,
			created_at TEXT NOT NULL,
			updated_at TEXT NOT NULL
		)
		"#,
		r#"
		CREATE TABLE IF NOT EXISTS groups (
			id TEXT PRIMARY KEY,
			name TEXT NOT NULL UNIQUE,
			description TEXT,
			created_at TEXT NOT NULL
		)
		"#,
		r#"
		CREATE TABLE IF NOT EXISTS group_members (
			group_id TEXT NOT NULL,
			user_id TEXT NOT NULL,
			added_at TEXT NOT NULL,
			PRIMARY KEY (group_id, user_id)
		)
		"#,
		"CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members (user_id)",
		r#"
		CREATE TABLE IF NOT EXISTS policies (
			id TEXT PRIMARY KEY,
			name TEXT NOT NULL,
			subject_type TEXT NOT NULL,
			subject_id TEXT NOT NULL,
			resource TEXT NOT NULL,
			action TEXT NOT NULL,
			priority INTEGER NOT NULL,
			enabled INTEGER NOT NULL,
			created_at TEXT NOT NULL
		)
		"#,
		"CREATE INDEX IF NOT EXISTS idx_policies_subject ON policies (subject_type, subject_id)",
		r#"
		CREATE TABLE IF NOT EXISTS network_policies (
			id TEXT PRIMARY KEY,
			src_role TEXT NOT NULL,
			dst_role TEXT NOT NULL,
			proto TEXT NOT NULL,
			port TEXT,
			action TEXT NOT NULL,
			priority INTEGER NOT NULL,
			position INTEGER NOT NULL,
			created_at TEXT NOT NULL
		)
		"#,
		"CREATE INDEX IF NOT EXISTS idx_network_policies_dst ON network_policies (dst_role)",
		r#"
		CREATE TABLE IF NOT EXISTS client_devices (
			id TEXT PRIMARY KEY,
			user_id TEXT NOT NULL,
			name TEXT NOT NULL,
			device_type TEXT NOT NULL,
			tunnel_mode TEXT NOT NULL,
			overlay_ip TEXT,
			public_key TEXT NOT NULL,
			private_key_enc TEXT NOT NULL,
			status TEXT NOT NULL,
			expires_at TEXT NOT NULL,
			config_token_hash TEXT,
			config_claimed_at TEXT,
			created_at TEXT NOT NULL
		)
		"#,
		"CREATE INDEX IF NOT EXISTS idx_client_devices_user ON client_devices (user_id)",
		r#"
		CREATE UNIQUE INDEX IF NOT EXISTS idx_client_devices_overlay_ip
			ON client_devices (overlay_ip)
			WHERE overlay_ip IS NOT NULL
		"#,
		"CREATE INDEX IF NOT EXISTS idx_client_devices_token ON client_devices (config_token_hash)",
		r#"
		CREATE TABLE IF NOT EXISTS trust_history (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			node_id TEXT NOT NULL,
			score INTEGER NOT NULL,
			previous_score INTEGER NOT NULL,
			risk_level TEXT NOT NULL,
			action_taken TEXT NOT NULL,
			role_score INTEGER NOT NULL,
			device_health_score INTEGER NOT NULL,
			behavior_score INTEGER NOT NULL,
			security_score INTEGER NOT NULL,
			inputs TEXT NOT NULL,
			calculated_at TEXT NOT NULL
		)
		"#,
		"CREATE INDEX IF NOT EXISTS idx_trust_history_node ON trust_history (node_id, calculated_at)",
		r#"
		CREATE TABLE IF NOT EXISTS ipam_allocations (
			addr TEXT PRIMARY KEY,
			pool TEXT NOT NULL,
			owner TEXT,
			allocated_at TEXT NOT NULL,
			released_at TEXT
		)
		"#,
		r#"
		CREATE TABLE IF NOT EXISTS blacklisted_keys (
			public_key TEXT PRIMARY KEY,
			node_id TEXT NOT NULL,
			created_at TEXT NOT NULL
		)
		"#,
	],
}];

/// Apply all pending migrations. Forward-only; already-applied versions
/// are skipped.
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS schema_migrations (
			version INTEGER PRIMARY KEY,
			name TEXT NOT NULL,
			applied_at TEXT NOT NULL
		)
		"#,
	)
	.execute(pool)
	.await?;

	for migration in MIGRATIONS {
		let applied: Option<(i64,)> =
			sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
				.bind(migration.version)
				.fetch_optional(pool)
				.await?;
		if applied.is_some() {
			continue;
		}

		let mut tx = pool.begin().await?;
		for statement in migration.statements {
			sqlx::query(statement).execute(&mut *tx).await?;
		}

		let now = Utc::now();
		sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
			.bind(migration.version)
			.bind(migration.name)
			.bind(now)
			.execute(&mut *tx)
			.await?;

		// The migration is itself an event.
		let event = DomainEvent::SchemaMigrated {
			version: migration.version,
			name: migration.name.to_string(),
		};
		sqlx::query(
			r#"
			INSERT INTO event_store
				(aggregate_type, aggregate_id, aggregate_version, event_type, payload, actor, created_at)
			VALUES (?, ?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(AggregateType::Schema.as_str())
		.bind("schema")
		.bind(migration.version)
		.bind(event.event_type())
		.bind(serde_json::to_string(&event)?)
		.bind("system")
		.bind(now)
		.execute(&mut *tx)
		.await?;

		tx.commit().await?;
		info!(version = migration.version, name = migration.name, "applied migration");
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::create_test_pool;

	#[tokio::test]
	async fn test_migrations_are_idempotent() {
		let pool = create_test_pool().await;
		// testing::create_test_pool already ran them once.
		run_migrations(&pool).await.unwrap();

		let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
			.fetch_one(&pool)
			.await
			.unwrap();
		assert_eq!(count.0, MIGRATIONS.len() as i64);

		let events: (i64,) = sqlx::query_as(
			"SELECT COUNT(*) FROM event_store WHERE aggregate_type = 'schema'",
		)
		.fetch_one(&pool)
		.await
		.unwrap();
		assert_eq!(events.0, MIGRATIONS.len() as i64);
	}
}
