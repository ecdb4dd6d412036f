// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Projection of committed events onto the relational read models.
//!
//! [`apply`] runs inside the append transaction; [`rebuild`] truncates
//! every read model and replays the full log, which is the recovery path
//! after a crash or a reported invariant violation. Replay is
//! deterministic: the same prefix of the log always produces the same
//! tables.

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, instrument};

use crate::error::DbError;
use trellis_server_events::{DomainEvent, EventRecord};

/// Apply one committed event to the read models.
pub async fn apply(tx: &mut Transaction<'_, Sqlite>, record: &EventRecord) -> Result<(), DbError> {
	match &record.event {
		DomainEvent::NodeRegistered {
			node_id,
			hostname,
			role,
			public_key,
			real_ip,
			overlay_ip,
			agent_version,
			os_info,
		} => {
			sqlx::query(
				r#"
				INSERT INTO nodes
					(id, hostname, role, public_key, real_ip, overlay_ip, status,
					 trust_score, risk_level, agent_version, os_info, created_at)
				VALUES (?, ?, ?, ?, ?, ?, 'pending', 100, 'low', ?, ?, ?)
				"#,
			)
			.bind(node_id.to_string())
			.bind(hostname)
			.bind(role.as_str())
			.bind(public_key.to_base64())
			.bind(real_ip.map(|ip| ip.to_string()))
			.bind(overlay_ip.to_string())
			.bind(agent_version)
			.bind(os_info)
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::NodeApproved {
			node_id,
			approved_by,
			token_hash,
			token_enc,
		} => {
			sqlx::query(
				"UPDATE nodes SET status = 'active', approved_by = ?, token_hash = ?,
				 token_enc = ? WHERE id = ?",
			)
			.bind(approved_by)
			.bind(token_hash)
			.bind(token_enc)
			.bind(node_id.to_string())
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::NodeSuspended { node_id, .. } => {
			sqlx::query("UPDATE nodes SET status = 'suspended' WHERE id = ?")
				.bind(node_id.to_string())
				.execute(&mut **tx)
				.await?;
		}
		DomainEvent::NodeResumed { node_id } => {
			sqlx::query("UPDATE nodes SET status = 'active' WHERE id = ?")
				.bind(node_id.to_string())
				.execute(&mut **tx)
				.await?;
		}
		DomainEvent::NodeRevoked {
			node_id,
			public_key,
			..
		} => {
			sqlx::query(
				"UPDATE nodes SET status = 'revoked', token_hash = NULL, token_enc = NULL,
				 overlay_ip = NULL WHERE id = ?",
			)
			.bind(node_id.to_string())
			.execute(&mut **tx)
			.await?;
			sqlx::query(
				"INSERT OR IGNORE INTO blacklisted_keys (public_key, node_id, created_at)
				 VALUES (?, ?, ?)",
			)
			.bind(public_key.to_base64())
			.bind(node_id.to_string())
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::TrustScoreChanged {
			node_id,
			score,
			previous_score,
			risk_level,
			action,
			role_score,
			device_health_score,
			behavior_score,
			security_score,
			inputs,
		} => {
			sqlx::query("UPDATE nodes SET trust_score = ?, risk_level = ? WHERE id = ?")
				.bind(*score as i64)
				.bind(risk_level.as_str())
				.bind(node_id.to_string())
				.execute(&mut **tx)
				.await?;
			sqlx::query(
				r#"
				INSERT INTO trust_history
					(node_id, score, previous_score, risk_level, action_taken,
					 role_score, device_health_score, behavior_score, security_score,
					 inputs, calculated_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
				"#,
			)
			.bind(node_id.to_string())
			.bind(*score as i64)
			.bind(*previous_score as i64)
			.bind(risk_level.as_str())
			.bind(action.as_str())
			.bind(*role_score as i64)
			.bind(*device_health_score as i64)
			.bind(*behavior_score as i64)
			.bind(*security_score as i64)
			.bind(inputs.to_string())
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}

		DomainEvent::IpAllocated { addr, pool, owner } => {
			sqlx::query(
				r#"
				INSERT INTO ipam_allocations (addr, pool, owner, allocated_at, released_at)
				VALUES (?, ?, ?, ?, NULL)
				ON CONFLICT (addr) DO UPDATE SET
					pool = excluded.pool,
					owner = excluded.owner,
					allocated_at = excluded.allocated_at,
					released_at = NULL
				"#,
			)
			.bind(addr.to_string())
			.bind(pool.as_str())
			.bind(owner)
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::IpReleased { addr, .. } => {
			sqlx::query(
				"UPDATE ipam_allocations SET owner = NULL, released_at = ? WHERE addr = ?",
			)
			.bind(record.created_at)
			.bind(addr.to_string())
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::IpamExhausted { .. } => {}

		DomainEvent::UserCreated {
			user_id,
			external_id,
			email,
			display_name,
			department,
		} => {
			sqlx::query(
				r#"
				INSERT INTO users
					(id, external_id, email, display_name, department, status, created_at, updated_at)
				VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
				"#,
			)
			.bind(user_id.to_string())
			.bind(external_id)
			.bind(email)
			.bind(display_name)
			.bind(department)
			.bind(record.created_at)
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::UserUpdated {
			user_id,
			email,
			display_name,
			department,
			status,
		} => {
			sqlx::query(
				r#"
				UPDATE users SET
					email = COALESCE(?, email),
					display_name = COALESCE(?, display_name),
					department = COALESCE(?, department),
					status = COALESCE(?, status),
					updated_at = ?
				WHERE id = ?
				"#,
			)
			.bind(email)
			.bind(display_name)
			.bind(department)
			.bind(status.map(|s| s.as_str()))
			.bind(record.created_at)
			.bind(user_id.to_string())
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::UserDeleted { user_id } => {
			sqlx::query("DELETE FROM group_members WHERE user_id = ?")
				.bind(user_id.to_string())
				.execute(&mut **tx)
				.await?;
			sqlx::query("DELETE FROM users WHERE id = ?")
				.bind(user_id.to_string())
				.execute(&mut **tx)
				.await?;
		}
		DomainEvent::GroupCreated {
			group_id,
			name,
			description,
		} => {
			sqlx::query(
				"INSERT INTO groups (id, name, description, created_at) VALUES (?, ?, ?, ?)",
			)
			.bind(group_id.to_string())
			.bind(name)
			.bind(description)
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::GroupDeleted { group_id } => {
			sqlx::query("DELETE FROM group_members WHERE group_id = ?")
				.bind(group_id.to_string())
				.execute(&mut **tx)
				.await?;
			sqlx::query("DELETE FROM groups WHERE id = ?")
				.bind(group_id.to_string())
				.execute(&mut **tx)
				.await?;
		}
		DomainEvent::GroupMemberAdded { group_id, user_id } => {
			sqlx::query(
				"INSERT OR IGNORE INTO group_members (group_id, user_id, added_at) VALUES (?, ?, ?)",
			)
			.bind(group_id.to_string())
			.bind(user_id.to_string())
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::GroupMemberRemoved { group_id, user_id } => {
			sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
				.bind(group_id.to_string())
				.bind(user_id.to_string())
				.execute(&mut **tx)
				.await?;
		}

		DomainEvent::AccessPolicyCreated {
			policy_id,
			name,
			subject,
			resource,
			action,
			priority,
			enabled,
		} => {
			let (subject_type, subject_id) = match subject {
				trellis_common_core::Subject::User { id } => ("user", id.to_string()),
				trellis_common_core::Subject::Group { id } => ("group", id.to_string()),
			};
			sqlx::query(
				r#"
				INSERT INTO policies
					(id, name, subject_type, subject_id, resource, action, priority, enabled, created_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
				"#,
			)
			.bind(policy_id.to_string())
			.bind(name)
			.bind(subject_type)
			.bind(subject_id)
			.bind(serde_json::to_string(resource)?)
			.bind(action.as_str())
			.bind(*priority as i64)
			.bind(*enabled as i64)
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::AccessPolicyUpdated {
			policy_id,
			action,
			priority,
			enabled,
		} => {
			sqlx::query(
				r#"
				UPDATE policies SET
					action = COALESCE(?, action),
					priority = COALESCE(?, priority),
					enabled = COALESCE(?, enabled)
				WHERE id = ?
				"#,
			)
			.bind(action.map(|a| a.as_str()))
			.bind(priority.map(|p| p as i64))
			.bind(enabled.map(|e| e as i64))
			.bind(policy_id.to_string())
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::AccessPolicyDeleted { policy_id } => {
			sqlx::query("DELETE FROM policies WHERE id = ?")
				.bind(policy_id.to_string())
				.execute(&mut **tx)
				.await?;
		}

		DomainEvent::NetworkPolicyCreated {
			policy_id,
			src_role,
			dst_role,
			proto,
			port,
			action,
			priority,
		} => {
			// The global event id doubles as the insertion-order tiebreaker.
			sqlx::query(
				r#"
				INSERT INTO network_policies
					(id, src_role, dst_role, proto, port, action, priority, position, created_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
				"#,
			)
			.bind(policy_id.to_string())
			.bind(src_role.as_str())
			.bind(dst_role.as_str())
			.bind(proto.as_str())
			.bind(port.map(|p| p.to_string()))
			.bind(action.as_str())
			.bind(*priority as i64)
			.bind(record.id)
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::NetworkPolicyDeleted { policy_id } => {
			sqlx::query("DELETE FROM network_policies WHERE id = ?")
				.bind(policy_id.to_string())
				.execute(&mut **tx)
				.await?;
		}

		DomainEvent::DeviceProvisioned {
			device_id,
			user_id,
			name,
			device_type,
			tunnel_mode,
			overlay_ip,
			public_key,
			private_key_enc,
			expires_at,
			config_token_hash,
		} => {
			sqlx::query(
				r#"
				INSERT INTO client_devices
					(id, user_id, name, device_type, tunnel_mode, overlay_ip, public_key,
					 private_key_enc, status, expires_at, config_token_hash, created_at)
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)
				"#,
			)
			.bind(device_id.to_string())
			.bind(user_id.to_string())
			.bind(name)
			.bind(device_type)
			.bind(tunnel_mode.as_str())
			.bind(overlay_ip.to_string())
			.bind(public_key.to_base64())
			.bind(private_key_enc)
			.bind(expires_at)
			.bind(config_token_hash)
			.bind(record.created_at)
			.execute(&mut **tx)
			.await?;
		}
		DomainEvent::DeviceRevoked { device_id, .. } => {
			sqlx::query(
				"UPDATE client_devices SET status = 'revoked', overlay_ip = NULL,
				 config_token_hash = NULL WHERE id = ?",
			)
			.bind(device_id.to_string())
			.execute(&mut **tx)
			.await?;
		}

		DomainEvent::SchemaMigrated { .. } => {}
	}

	Ok(())
}

const PROJECTED_TABLES: &[&str] = &[
	"nodes",
	"users",
	"groups",
	"group_members",
	"policies",
	"network_policies",
	"client_devices",
	"trust_history",
	"ipam_allocations",
	"blacklisted_keys",
];

/// Rebuild every read model from the log. O(N) in the number of events.
#[instrument(skip(pool))]
pub async fn rebuild(pool: &SqlitePool) -> Result<u64, DbError> {
	let mut tx = pool.begin().await?;

	for table in PROJECTED_TABLES {
		sqlx::query(&format!("DELETE FROM {table}"))
			.execute(&mut *tx)
			.await?;
	}

	let mut applied: u64 = 0;
	let mut after_id: i64 = 0;
	loop {
		let rows: Vec<(i64, String, String, i64, String, String, chrono::DateTime<chrono::Utc>)> =
			sqlx::query_as(
				"SELECT id, aggregate_type, aggregate_id, aggregate_version, payload, actor, created_at
				 FROM event_store WHERE id > ? ORDER BY id ASC LIMIT 500",
			)
			.bind(after_id)
			.fetch_all(&mut *tx)
			.await?;

		if rows.is_empty() {
			break;
		}

		for (id, aggregate_type, aggregate_id, aggregate_version, payload, actor, created_at) in
			rows
		{
			after_id = id;
			let record = trellis_server_events::EventRecord {
				id,
				aggregate_type: aggregate_type
					.parse()
					.map_err(|e: String| DbError::Corrupt(e))?,
				aggregate_id,
				aggregate_version,
				event: serde_json::from_str(&payload)?,
				actor,
				created_at,
			};
			apply(&mut tx, &record).await?;
			applied += 1;
		}
	}

	tx.commit().await?;
	info!(applied, "projection rebuilt from event log");
	Ok(applied)
}
