// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identity and access-policy handlers: the evaluate RPC plus CRUD for
//! users, groups, and access policies. Every mutation is exactly one
//! domain event.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use crate::auth::{authenticate_node, is_admin};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use trellis_common_core::{
	GroupId, PolicyAction, PolicyId, Resource, Subject, UserId, UserStatus,
};
use trellis_server_db::models::{AccessPolicy, Group, User};
use trellis_server_engine::{evaluate_access, AccessDecision};
use trellis_server_events::{AggregateType, DomainEvent};

const ADMIN_ACTOR: &str = "admin";

// =============================================================================
// Evaluate
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
	/// The subject's external user id.
	pub user: String,
	/// Hostname, overlay address, `proto:port`, or role name.
	pub resource: String,
}

/// POST /api/v1/access/evaluate (admin or node token).
///
/// A pure function over the projection: unknown or disabled users fall
/// through to deny, like everything else without a matching allow.
pub async fn evaluate(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(request): Json<EvaluateRequest>,
) -> ServerResult<Json<AccessDecision>> {
	if !is_admin(&state, &headers) {
		authenticate_node(&state, &headers).await?;
	}

	let Some(user) = state.identity.get_user_by_external_id(&request.user).await? else {
		return Ok(Json(AccessDecision::deny("unknown user")));
	};
	if user.status != UserStatus::Active {
		return Ok(Json(AccessDecision::deny("user is not active")));
	}

	let group_ids = state.identity.group_ids_of(user.id).await?;
	let policies = state
		.policies
		.list_enabled_for_user(user.id, &group_ids)
		.await?;

	Ok(Json(evaluate_access(user.id, &policies, &request.resource)))
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
	pub external_id: String,
	pub email: String,
	#[serde(default)]
	pub display_name: Option<String>,
	#[serde(default)]
	pub department: Option<String>,
}

pub async fn create_user(
	State(state): State<AppState>,
	Json(request): Json<CreateUserRequest>,
) -> ServerResult<(StatusCode, Json<User>)> {
	if request.external_id.trim().is_empty() {
		return Err(ServerError::invalid("external_id is empty"));
	}
	if !request.email.contains('@') {
		return Err(ServerError::invalid("email is malformed"));
	}
	if state
		.identity
		.get_user_by_external_id(&request.external_id)
		.await?
		.is_some()
	{
		return Err(ServerError::conflict(format!(
			"user {} already exists",
			request.external_id
		)));
	}
	if state
		.identity
		.get_user_by_email(&request.email)
		.await?
		.is_some()
	{
		return Err(ServerError::conflict(format!(
			"email {} already in use",
			request.email
		)));
	}

	let user_id = UserId::new();
	state
		.append_event(
			AggregateType::User,
			user_id.to_string(),
			DomainEvent::UserCreated {
				user_id,
				external_id: request.external_id.trim().to_string(),
				email: request.email.trim().to_string(),
				display_name: request
					.display_name
					.unwrap_or_else(|| request.external_id.trim().to_string()),
				department: request.department,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;

	let user = state
		.identity
		.get_user(user_id)
		.await?
		.ok_or_else(|| ServerError::Internal("created user vanished".into()))?;
	Ok((StatusCode::CREATED, Json(user)))
}

pub async fn list_users(State(state): State<AppState>) -> ServerResult<Json<Vec<User>>> {
	Ok(Json(state.identity.list_users().await?))
}

pub async fn get_user(
	State(state): State<AppState>,
	Path(id): Path<UserId>,
) -> ServerResult<Json<User>> {
	state
		.identity
		.get_user(id)
		.await?
		.map(Json)
		.ok_or_else(|| ServerError::not_found(format!("user {id}")))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
	#[serde(default)]
	pub email: Option<String>,
	#[serde(default)]
	pub display_name: Option<String>,
	#[serde(default)]
	pub department: Option<String>,
	#[serde(default)]
	pub status: Option<UserStatus>,
}

pub async fn update_user(
	State(state): State<AppState>,
	Path(id): Path<UserId>,
	Json(request): Json<UpdateUserRequest>,
) -> ServerResult<Json<User>> {
	if state.identity.get_user(id).await?.is_none() {
		return Err(ServerError::not_found(format!("user {id}")));
	}

	state
		.append_event(
			AggregateType::User,
			id.to_string(),
			DomainEvent::UserUpdated {
				user_id: id,
				email: request.email,
				display_name: request.display_name,
				department: request.department,
				status: request.status,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;

	state
		.identity
		.get_user(id)
		.await?
		.map(Json)
		.ok_or_else(|| ServerError::Internal("updated user vanished".into()))
}

pub async fn delete_user(
	State(state): State<AppState>,
	Path(id): Path<UserId>,
) -> ServerResult<StatusCode> {
	if state.identity.get_user(id).await?.is_none() {
		return Err(ServerError::not_found(format!("user {id}")));
	}

	state
		.append_event(
			AggregateType::User,
			id.to_string(),
			DomainEvent::UserDeleted { user_id: id },
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Groups
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
	pub name: String,
	#[serde(default)]
	pub description: Option<String>,
}

pub async fn create_group(
	State(state): State<AppState>,
	Json(request): Json<CreateGroupRequest>,
) -> ServerResult<(StatusCode, Json<Group>)> {
	let name = request.name.trim().to_string();
	if name.is_empty() {
		return Err(ServerError::invalid("group name is empty"));
	}
	if state.identity.get_group_by_name(&name).await?.is_some() {
		return Err(ServerError::conflict(format!("group {name} already exists")));
	}

	let group_id = GroupId::new();
	state
		.append_event(
			AggregateType::Group,
			group_id.to_string(),
			DomainEvent::GroupCreated {
				group_id,
				name,
				description: request.description,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;

	let group = state
		.identity
		.get_group(group_id)
		.await?
		.ok_or_else(|| ServerError::Internal("created group vanished".into()))?;
	Ok((StatusCode::CREATED, Json(group)))
}

pub async fn list_groups(State(state): State<AppState>) -> ServerResult<Json<Vec<Group>>> {
	Ok(Json(state.identity.list_groups().await?))
}

pub async fn get_group(
	State(state): State<AppState>,
	Path(id): Path<GroupId>,
) -> ServerResult<Json<Group>> {
	state
		.identity
		.get_group(id)
		.await?
		.map(Json)
		.ok_or_else(|| ServerError::not_found(format!("group {id}")))
}

pub async fn delete_group(
	State(state): State<AppState>,
	Path(id): Path<GroupId>,
) -> ServerResult<StatusCode> {
	if state.identity.get_group(id).await?.is_none() {
		return Err(ServerError::not_found(format!("group {id}")));
	}

	state
		.append_event(
			AggregateType::Group,
			id.to_string(),
			DomainEvent::GroupDeleted { group_id: id },
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
	pub user_id: UserId,
}

pub async fn add_group_member(
	State(state): State<AppState>,
	Path(id): Path<GroupId>,
	Json(request): Json<AddMemberRequest>,
) -> ServerResult<StatusCode> {
	if state.identity.get_group(id).await?.is_none() {
		return Err(ServerError::not_found(format!("group {id}")));
	}
	if state.identity.get_user(request.user_id).await?.is_none() {
		return Err(ServerError::not_found(format!("user {}", request.user_id)));
	}
	if state.identity.is_member(request.user_id, id).await? {
		return Ok(StatusCode::NO_CONTENT);
	}

	state
		.append_event(
			AggregateType::Group,
			id.to_string(),
			DomainEvent::GroupMemberAdded {
				group_id: id,
				user_id: request.user_id,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn list_group_members(
	State(state): State<AppState>,
	Path(id): Path<GroupId>,
) -> ServerResult<Json<Vec<User>>> {
	if state.identity.get_group(id).await?.is_none() {
		return Err(ServerError::not_found(format!("group {id}")));
	}
	Ok(Json(state.identity.group_members(id).await?))
}

pub async fn remove_group_member(
	State(state): State<AppState>,
	Path((id, user_id)): Path<(GroupId, UserId)>,
) -> ServerResult<StatusCode> {
	if !state.identity.is_member(user_id, id).await? {
		return Err(ServerError::not_found(format!(
			"user {user_id} in group {id}"
		)));
	}

	state
		.append_event(
			AggregateType::Group,
			id.to_string(),
			DomainEvent::GroupMemberRemoved {
				group_id: id,
				user_id,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Access policies
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
	pub name: String,
	pub subject: Subject,
	pub resource: Resource,
	pub action: PolicyAction,
	#[serde(default = "default_priority")]
	pub priority: i32,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
}

fn default_priority() -> i32 {
	100
}

fn default_enabled() -> bool {
	true
}

pub async fn create_policy(
	State(state): State<AppState>,
	Json(request): Json<CreatePolicyRequest>,
) -> ServerResult<(StatusCode, Json<AccessPolicy>)> {
	if request.name.trim().is_empty() {
		return Err(ServerError::invalid("policy name is empty"));
	}
	match request.subject {
		Subject::User { id } => {
			if state.identity.get_user(id).await?.is_none() {
				return Err(ServerError::not_found(format!("user {id}")));
			}
		}
		Subject::Group { id } => {
			if state.identity.get_group(id).await?.is_none() {
				return Err(ServerError::not_found(format!("group {id}")));
			}
		}
	}
	if let Resource::Domain { ref pattern } = request.resource {
		if pattern.trim().is_empty() {
			return Err(ServerError::invalid("domain pattern is empty"));
		}
	}

	let policy_id = PolicyId::new();
	state
		.append_event(
			AggregateType::AccessPolicy,
			policy_id.to_string(),
			DomainEvent::AccessPolicyCreated {
				policy_id,
				name: request.name.trim().to_string(),
				subject: request.subject,
				resource: request.resource,
				action: request.action,
				priority: request.priority,
				enabled: request.enabled,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;

	let policy = state
		.policies
		.get_access_policy(policy_id)
		.await?
		.ok_or_else(|| ServerError::Internal("created policy vanished".into()))?;
	Ok((StatusCode::CREATED, Json(policy)))
}

pub async fn list_policies(
	State(state): State<AppState>,
) -> ServerResult<Json<Vec<AccessPolicy>>> {
	Ok(Json(state.policies.list_access_policies().await?))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePolicyRequest {
	#[serde(default)]
	pub action: Option<PolicyAction>,
	#[serde(default)]
	pub priority: Option<i32>,
	#[serde(default)]
	pub enabled: Option<bool>,
}

pub async fn update_policy(
	State(state): State<AppState>,
	Path(id): Path<PolicyId>,
	Json(request): Json<UpdatePolicyRequest>,
) -> ServerResult<Json<AccessPolicy>> {
	if state.policies.get_access_policy(id).await?.is_none() {
		return Err(ServerError::not_found(format!("policy {id}")));
	}

	state
		.append_event(
			AggregateType::AccessPolicy,
			id.to_string(),
			DomainEvent::AccessPolicyUpdated {
				policy_id: id,
				action: request.action,
				priority: request.priority,
				enabled: request.enabled,
			},
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;

	state
		.policies
		.get_access_policy(id)
		.await?
		.map(Json)
		.ok_or_else(|| ServerError::Internal("updated policy vanished".into()))
}

pub async fn delete_policy(
	State(state): State<AppState>,
	Path(id): Path<PolicyId>,
) -> ServerResult<StatusCode> {
	if state.policies.get_access_policy(id).await?.is_none() {
		return Err(ServerError::not_found(format!("policy {id}")));
	}

	state
		.append_event(
			AggregateType::AccessPolicy,
			id.to_string(),
			DomainEvent::AccessPolicyDeleted { policy_id: id },
			ADMIN_ACTOR.to_string(),
			None,
		)
		.await?;
	Ok(StatusCode::NO_CONTENT)
}
