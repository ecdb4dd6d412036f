// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use trellis_common_core::{CoreError, ErrorKind};

/// Errors from the persistence layer.
#[derive(Error, Debug)]
pub enum DbError {
	#[error("database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("version conflict on {aggregate_id}: expected {expected}, found {actual}")]
	VersionConflict {
		aggregate_id: String,
		expected: i64,
		actual: i64,
	},

	#[error("not found: {0}")]
	NotFound(String),

	#[error("corrupt record: {0}")]
	Corrupt(String),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl DbError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			DbError::VersionConflict { .. } => ErrorKind::Conflict,
			DbError::NotFound(_) => ErrorKind::NotFound,
			DbError::Corrupt(_) => ErrorKind::InvariantViolated,
			DbError::Sqlx(e) if is_unique_violation_sqlx(e) => ErrorKind::Conflict,
			DbError::Sqlx(_) | DbError::Serialization(_) | DbError::Internal(_) => {
				ErrorKind::Transient
			}
		}
	}

	/// Whether the failure is a unique-index violation, which surfaces
	/// concurrent-writer races (two registers for one hostname) as
	/// conflicts rather than transient errors.
	pub fn is_unique_violation(&self) -> bool {
		matches!(self, DbError::Sqlx(e) if is_unique_violation_sqlx(e))
	}

	pub fn is_conflict(&self) -> bool {
		matches!(self, DbError::VersionConflict { .. }) || self.is_unique_violation()
	}
}

fn is_unique_violation_sqlx(err: &sqlx::Error) -> bool {
	matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl From<DbError> for CoreError {
	fn from(err: DbError) -> Self {
		match err.kind() {
			ErrorKind::Conflict => CoreError::Conflict(err.to_string()),
			ErrorKind::NotFound => CoreError::NotFound(err.to_string()),
			ErrorKind::InvariantViolated => CoreError::InvariantViolated(err.to_string()),
			_ => CoreError::Transient(err.to_string()),
		}
	}
}
