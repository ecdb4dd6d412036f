// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared helpers for database tests: in-memory pools with the full
//! schema applied.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::event_store::EventStore;
use crate::migrations::run_migrations;
use trellis_server_events::EventBus;

/// An in-memory pool with migrations applied. Single connection: each
/// SQLite `:memory:` connection is its own database.
pub async fn create_test_pool() -> SqlitePool {
	let options = SqliteConnectOptions::from_str(":memory:")
		.expect("valid connection string")
		.create_if_missing(true);

	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect_with(options)
		.await
		.expect("failed to create test pool");

	run_migrations(&pool).await.expect("migrations apply");
	pool
}

/// A ready-to-use event store over a fresh in-memory database.
pub async fn create_test_store() -> EventStore {
	EventStore::new(create_test_pool().await, EventBus::default())
}
