// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use trellis_common_core::{CoreError, PoolKind};

#[derive(Error, Debug)]
pub enum EngineError {
	#[error("{0} pool exhausted")]
	PoolExhausted(PoolKind),

	#[error("{0} has no overlay address")]
	MissingOverlayIp(String),
}

impl From<EngineError> for CoreError {
	fn from(err: EngineError) -> Self {
		match err {
			EngineError::PoolExhausted(pool) => {
				CoreError::PoolExhausted(format!("{} pool", pool.as_str()))
			}
			EngineError::MissingOverlayIp(_) => CoreError::InvariantViolated(err.to_string()),
		}
	}
}
