// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Token issuance and request authentication.
//!
//! Two credentials exist: the long-lived admin secret in `X-Admin-Token`,
//! compared in constant time, and per-node bearer tokens issued at
//! approval. Tokens are 128 bits of OS entropy; only their SHA-256 is
//! persisted.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::ServerError;
use crate::state::AppState;
use trellis_common_core::NodeStatus;
use trellis_server_db::models::Node;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Prefix for node agent tokens.
pub const NODE_TOKEN_PREFIX: &str = "nt";

/// Prefix for client device config tokens.
pub const CONFIG_TOKEN_PREFIX: &str = "ct";

/// Generate a 128-bit URL-safe token with the given prefix. Returns the
/// plaintext (shown exactly once) and its stored hash.
pub fn generate_token(prefix: &str) -> (String, String) {
	let mut bytes = [0u8; 16];
	rand::rngs::OsRng.fill_bytes(&mut bytes);
	let token = format!("{prefix}_{}", URL_SAFE_NO_PAD.encode(bytes));
	let hash = hash_token(&token);
	(token, hash)
}

pub fn hash_token(token: &str) -> String {
	let digest = Sha256::digest(token.as_bytes());
	format!("{digest:x}")
}

fn constant_time_eq(a: &str, b: &str) -> bool {
	let a = a.as_bytes();
	let b = b.as_bytes();
	if a.len() != b.len() {
		return false;
	}
	a.ct_eq(b).into()
}

/// Middleware gating the admin surface behind `X-Admin-Token`.
pub async fn admin_auth_middleware(
	State(state): State<AppState>,
	request: Request,
	next: Next,
) -> Result<Response, ServerError> {
	let presented = request
		.headers()
		.get(ADMIN_TOKEN_HEADER)
		.and_then(|h| h.to_str().ok());

	let Some(presented) = presented else {
		warn!("admin auth failed: missing token header");
		return Err(ServerError::unauthorized());
	};

	if constant_time_eq(presented, &state.config.admin_secret) {
		Ok(next.run(request).await)
	} else {
		warn!("admin auth failed: invalid token");
		Err(ServerError::unauthorized())
	}
}

/// Whether the request carries a valid admin token. Used by the routes
/// that accept either credential.
pub fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
	headers
		.get(ADMIN_TOKEN_HEADER)
		.and_then(|h| h.to_str().ok())
		.map(|token| constant_time_eq(token, &state.config.admin_secret))
		.unwrap_or(false)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
	headers
		.get(AUTHORIZATION)
		.and_then(|h| h.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
		.map(|token| token.trim().to_string())
}

/// Resolve the bearer token to its node. Suspended nodes still
/// authenticate (their next sync carries the isolate directive); revoked
/// nodes lost their token hash at revocation and fall out here.
pub async fn authenticate_node(
	state: &AppState,
	headers: &HeaderMap,
) -> Result<Node, ServerError> {
	let Some(token) = bearer_token(headers) else {
		return Err(ServerError::unauthorized());
	};

	let node = state
		.nodes
		.get_by_token_hash(&hash_token(&token))
		.await?
		.ok_or_else(ServerError::unauthorized)?;

	if node.status == NodeStatus::Revoked {
		return Err(ServerError::unauthorized());
	}

	Ok(node)
}
