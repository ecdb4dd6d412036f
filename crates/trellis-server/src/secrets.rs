// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! At-rest encryption for client device private keys.
//!
//! AES-256-GCM under a key derived from the `SECRET_KEY` environment
//! secret. The stored form is base64(nonce || ciphertext); the nonce is
//! fresh per encryption and the same (key, nonce) pair is never reused.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::ServerError;

const NONCE_SIZE: usize = 12;

#[derive(Clone)]
pub struct SecretBox {
	key: [u8; 32],
}

impl SecretBox {
	/// Derive the data key from the deployment master secret.
	pub fn from_master_secret(master: &str) -> Self {
		let digest = Sha256::digest(master.as_bytes());
		let mut key = [0u8; 32];
		key.copy_from_slice(&digest);
		Self { key }
	}

	pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, ServerError> {
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

		let mut nonce_bytes = [0u8; NONCE_SIZE];
		rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
		let nonce = Nonce::from_slice(&nonce_bytes);

		let ciphertext = cipher
			.encrypt(nonce, plaintext)
			.map_err(|e| ServerError::Internal(format!("encryption failed: {e}")))?;

		let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
		combined.extend_from_slice(&nonce_bytes);
		combined.extend_from_slice(&ciphertext);
		Ok(STANDARD.encode(combined))
	}

	pub fn decrypt(&self, stored: &str) -> Result<Zeroizing<Vec<u8>>, ServerError> {
		let combined = STANDARD
			.decode(stored)
			.map_err(|e| ServerError::Internal(format!("corrupt ciphertext: {e}")))?;
		if combined.len() < NONCE_SIZE {
			return Err(ServerError::Internal("corrupt ciphertext: too short".into()));
		}

		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
		let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
		let nonce = Nonce::from_slice(nonce_bytes);

		let plaintext = cipher
			.decrypt(nonce, ciphertext)
			.map_err(|e| ServerError::Internal(format!("decryption failed: {e}")))?;
		Ok(Zeroizing::new(plaintext))
	}
}

impl std::fmt::Debug for SecretBox {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecretBox").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_round_trip() {
		let secrets = SecretBox::from_master_secret("master");
		let stored = secrets.encrypt(b"private key material").unwrap();
		let recovered = secrets.decrypt(&stored).unwrap();
		assert_eq!(recovered.as_slice(), b"private key material");
	}

	#[test]
	fn test_nonces_differ() {
		let secrets = SecretBox::from_master_secret("master");
		let a = secrets.encrypt(b"same input").unwrap();
		let b = secrets.encrypt(b"same input").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn test_wrong_key_fails() {
		let stored = SecretBox::from_master_secret("one")
			.encrypt(b"secret")
			.unwrap();
		assert!(SecretBox::from_master_secret("two").decrypt(&stored).is_err());
	}

	#[test]
	fn test_tampered_ciphertext_fails() {
		let secrets = SecretBox::from_master_secret("master");
		let stored = secrets.encrypt(b"secret").unwrap();
		let mut bytes = STANDARD.decode(&stored).unwrap();
		let last = bytes.len() - 1;
		bytes[last] ^= 0xff;
		let tampered = STANDARD.encode(bytes);
		assert!(secrets.decrypt(&tampered).is_err());
	}
}
