// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP error mapping.
//!
//! Every handler failure resolves to a [`ServerError`] and from there to a
//! status code. Unauthorized responses are deliberately uniform: a missing
//! token and a wrong token are indistinguishable to the caller.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use trellis_common_core::{CoreError, ErrorKind};
use trellis_server_db::DbError;
use trellis_server_engine::EngineError;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
	#[error(transparent)]
	Core(#[from] CoreError),

	#[error(transparent)]
	Db(#[from] DbError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl From<EngineError> for ServerError {
	fn from(err: EngineError) -> Self {
		ServerError::Core(err.into())
	}
}

impl ServerError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			ServerError::Core(err) => err.kind(),
			ServerError::Db(err) => err.kind(),
			ServerError::Internal(_) => ErrorKind::Transient,
		}
	}

	pub fn invalid(msg: impl Into<String>) -> Self {
		ServerError::Core(CoreError::InvalidArgument(msg.into()))
	}

	pub fn conflict(msg: impl Into<String>) -> Self {
		ServerError::Core(CoreError::Conflict(msg.into()))
	}

	pub fn not_found(msg: impl Into<String>) -> Self {
		ServerError::Core(CoreError::NotFound(msg.into()))
	}

	pub fn unauthorized() -> Self {
		ServerError::Core(CoreError::Unauthorized)
	}
}

impl IntoResponse for ServerError {
	fn into_response(self) -> Response {
		let kind = self.kind();
		match kind {
			ErrorKind::InvalidArgument => (
				StatusCode::BAD_REQUEST,
				Json(json!({"error": "invalid_argument", "message": self.to_string()})),
			)
				.into_response(),
			ErrorKind::Conflict => (
				StatusCode::CONFLICT,
				Json(json!({"error": "conflict", "message": self.to_string()})),
			)
				.into_response(),
			ErrorKind::NotFound => (
				StatusCode::NOT_FOUND,
				Json(json!({"error": "not_found", "message": self.to_string()})),
			)
				.into_response(),
			// Missing and wrong credentials produce the same body.
			ErrorKind::Unauthorized => (
				StatusCode::UNAUTHORIZED,
				Json(json!({"error": "unauthorized"})),
			)
				.into_response(),
			ErrorKind::NotApproved => (
				StatusCode::FORBIDDEN,
				Json(json!({"status": "pending"})),
			)
				.into_response(),
			ErrorKind::PoolExhausted => (
				StatusCode::SERVICE_UNAVAILABLE,
				[(header::RETRY_AFTER, "3600")],
				Json(json!({"error": "pool_exhausted", "message": self.to_string()})),
			)
				.into_response(),
			ErrorKind::Transient => {
				tracing::error!(error = %self, "transient failure");
				(
					StatusCode::SERVICE_UNAVAILABLE,
					[(header::RETRY_AFTER, "5")],
					Json(json!({"error": "transient", "message": self.to_string()})),
				)
					.into_response()
			}
			ErrorKind::InvariantViolated => {
				// Refuse the write, flush logs, and bring the process down;
				// recovery is operator replay of the event log.
				tracing::error!(error = %self, "invariant violated; shutting down for replay");
				tokio::spawn(async {
					tokio::time::sleep(std::time::Duration::from_millis(200)).await;
					std::process::exit(trellis_common_core::exit_code::INVARIANT);
				});
				(
					StatusCode::INTERNAL_SERVER_ERROR,
					Json(json!({"error": "invariant_violated", "message": self.to_string()})),
				)
					.into_response()
			}
		}
	}
}
