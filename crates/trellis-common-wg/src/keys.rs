// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! X25519 key material in the WireGuard wire encoding (padded base64).
//!
//! Private keys never appear in Debug, Display, or Serialize output; the
//! only way to read one out is [`WgPrivateKey::expose_base64`], used at the
//! two places a key legitimately leaves the process (writing the agent key
//! file, rendering a one-shot client profile).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode32(s: &str) -> Result<[u8; 32]> {
	let bytes = STANDARD.decode(s)?;
	if bytes.len() != 32 {
		return Err(KeyError::InvalidLength(bytes.len()));
	}
	let mut arr = [0u8; 32];
	arr.copy_from_slice(&bytes);
	Ok(arr)
}

/// A WireGuard private key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; 32],
}

impl WgPrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
		}
	}

	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode32(s.trim())?,
		})
	}

	/// The padded-base64 encoding WireGuard tools expect. Handle with care.
	pub fn expose_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn expose_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		let public = PublicKey::from(&secret);
		WgPublicKey {
			bytes: *public.as_bytes(),
		}
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

impl fmt::Display for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("[REDACTED]")
	}
}

impl Serialize for WgPrivateKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str("[REDACTED]")
	}
}

/// A WireGuard public key, comparable and hashable for peer-set diffing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey {
	bytes: [u8; 32],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		Ok(Self {
			bytes: decode32(s.trim())?,
		})
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.bytes
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = self.to_base64();
		f.debug_struct("WgPublicKey")
			.field("prefix", &format!("{}...", &b64[..8]))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// A private/public key pair.
#[derive(Clone)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		let private = WgPrivateKey::generate();
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

impl fmt::Debug for WgKeyPair {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgKeyPair")
			.field("public", &self.public)
			.finish()
	}
}
