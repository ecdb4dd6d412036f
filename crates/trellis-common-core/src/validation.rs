// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Input validation for agent-supplied identifiers.

use crate::error::CoreError;

/// Maximum hostname length, per RFC 1123 label rules.
pub const MAX_HOSTNAME_LEN: usize = 63;

/// Normalize and validate a hostname: lowercase, `[a-z0-9-]` only, no
/// leading or trailing hyphen, at most 63 characters. Dots and underscores
/// are folded to hyphens before validation so `db_01.internal` registers
/// as `db-01-internal`.
pub fn normalize_hostname(raw: &str) -> Result<String, CoreError> {
	let folded: String = raw
		.trim()
		.to_ascii_lowercase()
		.chars()
		.map(|c| match c {
			'.' | '_' => '-',
			other => other,
		})
		.collect();

	if folded.is_empty() {
		return Err(CoreError::InvalidArgument("hostname is empty".into()));
	}
	if folded.len() > MAX_HOSTNAME_LEN {
		return Err(CoreError::InvalidArgument(format!(
			"hostname exceeds {MAX_HOSTNAME_LEN} characters"
		)));
	}
	if folded.starts_with('-') || folded.ends_with('-') {
		return Err(CoreError::InvalidArgument(
			"hostname may not start or end with a hyphen".into(),
		));
	}
	if let Some(bad) = folded.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
		return Err(CoreError::InvalidArgument(format!(
			"hostname contains invalid character {bad:?}"
		)));
	}

	Ok(folded)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_normalizes_case_and_separators() {
		assert_eq!(normalize_hostname("DB-01").unwrap(), "db-01");
		assert_eq!(normalize_hostname("db_01.internal").unwrap(), "db-01-internal");
		assert_eq!(normalize_hostname("  app-2  ").unwrap(), "app-2");
	}

	#[test]
	fn test_rejects_empty_and_too_long() {
		assert!(normalize_hostname("").is_err());
		assert!(normalize_hostname("   ").is_err());
		let long = "a".repeat(64);
		assert!(normalize_hostname(&long).is_err());
		let ok = "a".repeat(63);
		assert!(normalize_hostname(&ok).is_ok());
	}

	#[test]
	fn test_rejects_bad_characters() {
		assert!(normalize_hostname("db 01").is_err());
		assert!(normalize_hostname("db/01").is_err());
		assert!(normalize_hostname("-db01").is_err());
		assert!(normalize_hostname("db01-").is_err());
	}
}
