// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read side of the user, group, and membership projections.

use sqlx::sqlite::SqlitePool;

use crate::error::DbError;
use crate::models::{Group, GroupRow, User, UserRow};
use trellis_common_core::{GroupId, UserId};

const USER_COLUMNS: &str =
	"id, external_id, email, display_name, department, status, created_at, updated_at";
const GROUP_COLUMNS: &str = "id, name, description, created_at";

#[derive(Clone)]
pub struct IdentityRepository {
	pool: SqlitePool,
}

impl IdentityRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	// =========================================================================
	// Users
	// =========================================================================

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_user(&self, id: UserId) -> Result<Option<User>, DbError> {
		let row: Option<UserRow> =
			sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(&self.pool)
				.await?;
		row.map(User::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_user_by_external_id(
		&self,
		external_id: &str,
	) -> Result<Option<User>, DbError> {
		let row: Option<UserRow> = sqlx::query_as(&format!(
			"SELECT {USER_COLUMNS} FROM users WHERE external_id = ?"
		))
		.bind(external_id)
		.fetch_optional(&self.pool)
		.await?;
		row.map(User::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DbError> {
		let row: Option<UserRow> =
			sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
				.bind(email)
				.fetch_optional(&self.pool)
				.await?;
		row.map(User::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_users(&self) -> Result<Vec<User>, DbError> {
		let rows: Vec<UserRow> = sqlx::query_as(&format!(
			"SELECT {USER_COLUMNS} FROM users ORDER BY external_id ASC"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(User::try_from).collect()
	}

	// =========================================================================
	// Groups
	// =========================================================================

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get_group(&self, id: GroupId) -> Result<Option<Group>, DbError> {
		let row: Option<GroupRow> =
			sqlx::query_as(&format!("SELECT {GROUP_COLUMNS} FROM groups WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(&self.pool)
				.await?;
		row.map(Group::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>, DbError> {
		let row: Option<GroupRow> =
			sqlx::query_as(&format!("SELECT {GROUP_COLUMNS} FROM groups WHERE name = ?"))
				.bind(name)
				.fetch_optional(&self.pool)
				.await?;
		row.map(Group::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_groups(&self) -> Result<Vec<Group>, DbError> {
		let rows: Vec<GroupRow> = sqlx::query_as(&format!(
			"SELECT {GROUP_COLUMNS} FROM groups ORDER BY name ASC"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(Group::try_from).collect()
	}

	// =========================================================================
	// Memberships
	// =========================================================================

	#[tracing::instrument(skip(self), fields(%group_id))]
	pub async fn group_members(&self, group_id: GroupId) -> Result<Vec<User>, DbError> {
		let rows: Vec<UserRow> = sqlx::query_as(&format!(
			"SELECT u.id, u.external_id, u.email, u.display_name, u.department, u.status,
				u.created_at, u.updated_at
			 FROM users u
			 INNER JOIN group_members gm ON gm.user_id = u.id
			 WHERE gm.group_id = ?
			 ORDER BY u.external_id ASC"
		))
		.bind(group_id.to_string())
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(User::try_from).collect()
	}

	/// Ids of every group the user belongs to, for subject resolution.
	#[tracing::instrument(skip(self), fields(%user_id))]
	pub async fn group_ids_of(&self, user_id: UserId) -> Result<Vec<GroupId>, DbError> {
		let rows: Vec<(String,)> =
			sqlx::query_as("SELECT group_id FROM group_members WHERE user_id = ?")
				.bind(user_id.to_string())
				.fetch_all(&self.pool)
				.await?;
		rows.into_iter()
			.map(|(id,)| {
				id.parse()
					.map_err(|e| DbError::Corrupt(format!("group_members.group_id: {e}")))
			})
			.collect()
	}

	#[tracing::instrument(skip(self), fields(%user_id, %group_id))]
	pub async fn is_member(&self, user_id: UserId, group_id: GroupId) -> Result<bool, DbError> {
		let row: Option<(String,)> = sqlx::query_as(
			"SELECT user_id FROM group_members WHERE user_id = ? AND group_id = ?",
		)
		.bind(user_id.to_string())
		.bind(group_id.to_string())
		.fetch_optional(&self.pool)
		.await?;
		Ok(row.is_some())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_store::{EventStore, NewEvent};
	use crate::testing::create_test_store;
	use trellis_server_events::{AggregateType, DomainEvent};

	async fn create_user(store: &EventStore, external_id: &str, email: &str) -> UserId {
		let user_id = UserId::new();
		store
			.append(NewEvent {
				aggregate_type: AggregateType::User,
				aggregate_id: user_id.to_string(),
				expected_version: 0,
				event: DomainEvent::UserCreated {
					user_id,
					external_id: external_id.to_string(),
					email: email.to_string(),
					display_name: external_id.to_string(),
					department: None,
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();
		user_id
	}

	async fn create_group(store: &EventStore, name: &str) -> GroupId {
		let group_id = GroupId::new();
		store
			.append(NewEvent {
				aggregate_type: AggregateType::Group,
				aggregate_id: group_id.to_string(),
				expected_version: 0,
				event: DomainEvent::GroupCreated {
					group_id,
					name: name.to_string(),
					description: None,
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();
		group_id
	}

	#[tokio::test]
	async fn test_membership_resolution() {
		let store = create_test_store().await;
		let repo = IdentityRepository::new(store.pool().clone());

		let user = create_user(&store, "u1", "u1@example.com").await;
		let group = create_group(&store, "eng").await;

		store
			.append(NewEvent {
				aggregate_type: AggregateType::Group,
				aggregate_id: group.to_string(),
				expected_version: 1,
				event: DomainEvent::GroupMemberAdded {
					group_id: group,
					user_id: user,
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		assert!(repo.is_member(user, group).await.unwrap());
		assert_eq!(repo.group_ids_of(user).await.unwrap(), vec![group]);
		let members = repo.group_members(group).await.unwrap();
		assert_eq!(members.len(), 1);
		assert_eq!(members[0].external_id, "u1");

		store
			.append(NewEvent {
				aggregate_type: AggregateType::Group,
				aggregate_id: group.to_string(),
				expected_version: 2,
				event: DomainEvent::GroupMemberRemoved {
					group_id: group,
					user_id: user,
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		assert!(!repo.is_member(user, group).await.unwrap());
		assert!(repo.group_ids_of(user).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_user_lookup_and_update() {
		let store = create_test_store().await;
		let repo = IdentityRepository::new(store.pool().clone());

		let user = create_user(&store, "u1", "u1@example.com").await;
		assert!(repo
			.get_user_by_external_id("u1")
			.await
			.unwrap()
			.is_some());
		assert!(repo
			.get_user_by_email("u1@example.com")
			.await
			.unwrap()
			.is_some());

		store
			.append(NewEvent {
				aggregate_type: AggregateType::User,
				aggregate_id: user.to_string(),
				expected_version: 1,
				event: DomainEvent::UserUpdated {
					user_id: user,
					email: None,
					display_name: Some("User One".to_string()),
					department: Some("engineering".to_string()),
					status: None,
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		let updated = repo.get_user(user).await.unwrap().unwrap();
		assert_eq!(updated.display_name, "User One");
		assert_eq!(updated.department.as_deref(), Some("engineering"));
		assert_eq!(updated.email, "u1@example.com");
	}
}
