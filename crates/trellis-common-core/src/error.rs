// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error kinds shared across the control plane and agent.
//!
//! Every fallible operation in the system resolves to one of these kinds;
//! the HTTP layer maps them onto status codes and the agent decides from
//! them whether a retry is worthwhile.

use thiserror::Error;

/// Classification of a failure, independent of where it occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Malformed input: bad hostname, wrong key length, unknown role. 400, no retry.
	InvalidArgument,
	/// Hostname taken, duplicate key, version mismatch on append. 409.
	Conflict,
	/// Aggregate does not exist. 404.
	NotFound,
	/// Missing or wrong credentials. 401, indistinguishable on purpose.
	Unauthorized,
	/// Agent called a gated operation while still pending approval. 403.
	NotApproved,
	/// No free address in the requested pool. 503 with Retry-After.
	PoolExhausted,
	/// Storage or downstream IO failure. Retried by the caller with backoff.
	Transient,
	/// A committed-state invariant no longer holds. The process refuses the
	/// write and exits non-zero after flushing logs.
	InvariantViolated,
}

impl ErrorKind {
	/// Whether the caller should retry the operation.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ErrorKind::Transient | ErrorKind::PoolExhausted)
	}
}

/// Top-level domain error carrying its [`ErrorKind`].
#[derive(Error, Debug)]
pub enum CoreError {
	#[error("invalid argument: {0}")]
	InvalidArgument(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("unauthorized")]
	Unauthorized,

	#[error("node is not approved")]
	NotApproved,

	#[error("address pool exhausted: {0}")]
	PoolExhausted(String),

	#[error("transient failure: {0}")]
	Transient(String),

	#[error("invariant violated: {0}")]
	InvariantViolated(String),
}

impl CoreError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			CoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
			CoreError::Conflict(_) => ErrorKind::Conflict,
			CoreError::NotFound(_) => ErrorKind::NotFound,
			CoreError::Unauthorized => ErrorKind::Unauthorized,
			CoreError::NotApproved => ErrorKind::NotApproved,
			CoreError::PoolExhausted(_) => ErrorKind::PoolExhausted,
			CoreError::Transient(_) => ErrorKind::Transient,
			CoreError::InvariantViolated(_) => ErrorKind::InvariantViolated,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_retryable_kinds() {
		assert!(ErrorKind::Transient.is_retryable());
		assert!(ErrorKind::PoolExhausted.is_retryable());
		assert!(!ErrorKind::InvalidArgument.is_retryable());
		assert!(!ErrorKind::Conflict.is_retryable());
		assert!(!ErrorKind::Unauthorized.is_retryable());
	}

	#[test]
	fn test_kind_mapping() {
		assert_eq!(
			CoreError::Conflict("hostname taken".into()).kind(),
			ErrorKind::Conflict
		);
		assert_eq!(CoreError::Unauthorized.kind(), ErrorKind::Unauthorized);
	}
}
