// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
	#[error("configuration error: {0}")]
	Config(String),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	/// 4xx from the control plane; retrying will not help.
	#[error("rejected by control plane ({status}): {message}")]
	Rejected { status: u16, message: String },

	#[error("node is not approved yet")]
	NotApproved,

	#[error("command {command:?} failed: {stderr}")]
	Command { command: String, stderr: String },

	#[error("the packet filter facility is unavailable: {0}")]
	FirewallUnavailable(String),

	#[error("key error: {0}")]
	Key(#[from] trellis_common_wg::keys::KeyError),

	#[error("key file error: {0}")]
	KeyFile(#[from] trellis_common_wg::keys_file::KeyFileError),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl AgentError {
	/// Transient failures are retried with backoff; permanent rejections
	/// are not.
	pub fn is_retryable(&self) -> bool {
		match self {
			AgentError::Http(_) | AgentError::Io(_) | AgentError::NotApproved => true,
			AgentError::Rejected { status, .. } => *status >= 500,
			_ => false,
		}
	}
}
