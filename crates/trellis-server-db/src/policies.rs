// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read side of the access-policy and network-policy projections.

use sqlx::sqlite::SqlitePool;

use crate::error::DbError;
use crate::models::{AccessPolicy, AccessPolicyRow, NetworkPolicy, NetworkPolicyRow};
use trellis_common_core::{GroupId, PolicyId, UserId};

const ACCESS_COLUMNS: &str =
	"id, name, subject_type, subject_id, resource, action, priority, enabled, created_at";
const NETWORK_COLUMNS: &str =
	"id, src_role, dst_role, proto, port, action, priority, position, created_at";

#[derive(Clone)]
pub struct PolicyRepository {
	pool: SqlitePool,
}

impl PolicyRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	// =========================================================================
	// Access plane
	// =========================================================================

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_access_policy(&self, id: PolicyId) -> Result<Option<AccessPolicy>, DbError> {
		let row: Option<AccessPolicyRow> = sqlx::query_as(&format!(
			"SELECT {ACCESS_COLUMNS} FROM policies WHERE id = ?"
		))
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await?;
		row.map(AccessPolicy::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_access_policies(&self) -> Result<Vec<AccessPolicy>, DbError> {
		let rows: Vec<AccessPolicyRow> = sqlx::query_as(&format!(
			"SELECT {ACCESS_COLUMNS} FROM policies ORDER BY priority DESC, created_at ASC"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(AccessPolicy::try_from).collect()
	}

	/// Enabled policies whose subject resolves to the user, directly or
	/// through one of its groups. Highest priority first.
	#[tracing::instrument(skip(self, group_ids), fields(%user_id))]
	pub async fn list_enabled_for_user(
		&self,
		user_id: UserId,
		group_ids: &[GroupId],
	) -> Result<Vec<AccessPolicy>, DbError> {
		// SQLite has no array binds; the subject set is small, so build the
		// placeholder list by hand the way the teacher's SCIM filter does.
		let mut sql = format!(
			"SELECT {ACCESS_COLUMNS} FROM policies
			 WHERE enabled = 1 AND (
				(subject_type = 'user' AND subject_id = ?)"
		);
		if !group_ids.is_empty() {
			let placeholders = vec!["?"; group_ids.len()].join(", ");
			sql.push_str(&format!(
				" OR (subject_type = 'group' AND subject_id IN ({placeholders}))"
			));
		}
		sql.push_str(") ORDER BY priority DESC, created_at ASC");

		let mut query = sqlx::query_as::<_, AccessPolicyRow>(&sql).bind(user_id.to_string());
		for group_id in group_ids {
			query = query.bind(group_id.to_string());
		}

		let rows = query.fetch_all(&self.pool).await?;
		rows.into_iter().map(AccessPolicy::try_from).collect()
	}

	// =========================================================================
	// Network plane
	// =========================================================================

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_network_policy(
		&self,
		id: PolicyId,
	) -> Result<Option<NetworkPolicy>, DbError> {
		let row: Option<NetworkPolicyRow> = sqlx::query_as(&format!(
			"SELECT {NETWORK_COLUMNS} FROM network_policies WHERE id = ?"
		))
		.bind(id.to_string())
		.fetch_optional(&self.pool)
		.await?;
		row.map(NetworkPolicy::try_from).transpose()
	}

	/// All network policies in insertion order; the compiler applies the
	/// priority/specificity ordering on top.
	#[tracing::instrument(skip(self))]
	pub async fn list_network_policies(&self) -> Result<Vec<NetworkPolicy>, DbError> {
		let rows: Vec<NetworkPolicyRow> = sqlx::query_as(&format!(
			"SELECT {NETWORK_COLUMNS} FROM network_policies ORDER BY position ASC"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(NetworkPolicy::try_from).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_store::{EventStore, NewEvent};
	use crate::testing::create_test_store;
	use trellis_common_core::{PolicyAction, Resource, Subject};
	use trellis_server_events::{AggregateType, DomainEvent};

	async fn create_policy(
		store: &EventStore,
		name: &str,
		subject: Subject,
		priority: i32,
		enabled: bool,
	) -> PolicyId {
		let policy_id = PolicyId::new();
		store
			.append(NewEvent {
				aggregate_type: AggregateType::AccessPolicy,
				aggregate_id: policy_id.to_string(),
				expected_version: 0,
				event: DomainEvent::AccessPolicyCreated {
					policy_id,
					name: name.to_string(),
					subject,
					resource: Resource::Domain {
						pattern: "*.internal.example.com".to_string(),
					},
					action: PolicyAction::Allow,
					priority,
					enabled,
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();
		policy_id
	}

	#[tokio::test]
	async fn test_subject_scoped_listing() {
		let store = create_test_store().await;
		let repo = PolicyRepository::new(store.pool().clone());

		let user = UserId::new();
		let other_user = UserId::new();
		let group = GroupId::new();

		create_policy(&store, "direct", Subject::User { id: user }, 50, true).await;
		create_policy(&store, "via-group", Subject::Group { id: group }, 100, true).await;
		create_policy(
			&store,
			"other",
			Subject::User { id: other_user },
			10,
			true,
		)
		.await;
		create_policy(&store, "disabled", Subject::User { id: user }, 200, false).await;

		let for_user = repo
			.list_enabled_for_user(user, &[group])
			.await
			.unwrap();
		let names: Vec<&str> = for_user.iter().map(|p| p.name.as_str()).collect();
		// Highest priority first, disabled and foreign policies excluded.
		assert_eq!(names, vec!["via-group", "direct"]);

		let without_group = repo.list_enabled_for_user(user, &[]).await.unwrap();
		let names: Vec<&str> = without_group.iter().map(|p| p.name.as_str()).collect();
		assert_eq!(names, vec!["direct"]);
	}

	#[tokio::test]
	async fn test_network_policies_keep_insertion_order() {
		let store = create_test_store().await;
		let repo = PolicyRepository::new(store.pool().clone());

		for (src, dst, port) in [("app", "db", 5432u16), ("ops", "db", 22), ("app", "db", 6432)] {
			let policy_id = PolicyId::new();
			store
				.append(NewEvent {
					aggregate_type: AggregateType::NetworkPolicy,
					aggregate_id: policy_id.to_string(),
					expected_version: 0,
					event: DomainEvent::NetworkPolicyCreated {
						policy_id,
						src_role: src.parse().unwrap(),
						dst_role: dst.parse().unwrap(),
						proto: trellis_common_core::Protocol::Tcp,
						port: Some(trellis_common_core::PortRange::single(port)),
						action: trellis_common_wg::FirewallAction::Accept,
						priority: 100,
					},
					actor: "admin".to_string(),
					client_request_id: None,
				})
				.await
				.unwrap();
		}

		let policies = repo.list_network_policies().await.unwrap();
		assert_eq!(policies.len(), 3);
		let ports: Vec<u16> = policies.iter().map(|p| p.port.unwrap().start).collect();
		assert_eq!(ports, vec![5432, 22, 6432]);
		assert!(policies.windows(2).all(|w| w[0].position < w[1].position));
	}
}
