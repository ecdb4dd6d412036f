// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistence of the node's private key on disk, mode 0600.

use crate::keys::{WgKeyPair, WgPrivateKey};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::instrument;

pub const KEY_FILENAME: &str = "node.key";

#[derive(Error, Debug)]
pub enum KeyFileError {
	#[error("failed to read key file: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid key format: {0}")]
	InvalidFormat(#[from] crate::keys::KeyError),
}

pub type Result<T> = std::result::Result<T, KeyFileError>;

#[instrument(skip_all, fields(path = %path.as_ref().display()))]
pub async fn load_key_file(path: impl AsRef<Path>) -> Result<WgKeyPair> {
	let content = fs::read_to_string(path.as_ref()).await?;
	let private = WgPrivateKey::from_base64(content.trim())?;
	Ok(WgKeyPair::from_private_key(private))
}

#[instrument(skip(key), fields(path = %path.as_ref().display()))]
pub async fn save_key_file(key: &WgKeyPair, path: impl AsRef<Path>) -> Result<()> {
	let path = path.as_ref();

	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}

	let content = format!("{}\n", key.private_key().expose_base64());

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;
		use tokio::io::AsyncWriteExt;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(0o600)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content).await?;
	}

	Ok(())
}

/// Load the key from `<state_dir>/node.key`, generating and persisting a
/// fresh one on first run.
#[instrument(skip(state_dir))]
pub async fn get_or_create_node_key(state_dir: impl AsRef<Path>) -> Result<WgKeyPair> {
	let key_path = state_dir.as_ref().join(KEY_FILENAME);

	if key_path.exists() {
		return load_key_file(&key_path).await;
	}

	let keypair = WgKeyPair::generate();
	save_key_file(&keypair, &key_path).await?;
	Ok(keypair)
}
