// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP surface assembly.
//!
//! Three auth postures: the agent endpoints authenticate inside their
//! handlers (register is open, sync/heartbeat take the node bearer
//! token), the admin surface sits behind the `X-Admin-Token` middleware,
//! and the client config endpoints authenticate by config token alone.

pub mod access;
pub mod admin;
pub mod agent;
pub mod client;
pub mod events;
pub mod health;

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::auth::admin_auth_middleware;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
	let admin_routes = Router::new()
		.route("/api/v1/admin/nodes", get(admin::list_nodes))
		.route("/api/v1/admin/nodes/:id", get(admin::get_node))
		.route("/api/v1/admin/nodes/:id/approve", post(admin::approve_node))
		.route("/api/v1/admin/nodes/:id/suspend", post(admin::suspend_node))
		.route("/api/v1/admin/nodes/:id/resume", post(admin::resume_node))
		.route("/api/v1/admin/nodes/:id/revoke", post(admin::revoke_node))
		.route("/api/v1/admin/nodes/:id/trust", get(admin::trust_trend))
		.route("/api/v1/admin/ipam/stats", get(admin::ipam_stats))
		.route(
			"/api/v1/admin/network-policies",
			get(admin::list_network_policies).post(admin::create_network_policy),
		)
		.route(
			"/api/v1/admin/network-policies/:id",
			delete(admin::delete_network_policy),
		)
		.route(
			"/api/v1/access/users",
			get(access::list_users).post(access::create_user),
		)
		.route(
			"/api/v1/access/users/:id",
			get(access::get_user)
				.patch(access::update_user)
				.delete(access::delete_user),
		)
		.route(
			"/api/v1/access/groups",
			get(access::list_groups).post(access::create_group),
		)
		.route(
			"/api/v1/access/groups/:id",
			get(access::get_group).delete(access::delete_group),
		)
		.route(
			"/api/v1/access/groups/:id/members",
			get(access::list_group_members).post(access::add_group_member),
		)
		.route(
			"/api/v1/access/groups/:id/members/:user_id",
			delete(access::remove_group_member),
		)
		.route(
			"/api/v1/access/policies",
			get(access::list_policies).post(access::create_policy),
		)
		.route(
			"/api/v1/access/policies/:id",
			patch(access::update_policy).delete(access::delete_policy),
		)
		.route(
			"/api/v1/client/devices",
			get(client::list_devices).post(client::create_device),
		)
		.route(
			"/api/v1/client/devices/:id/revoke",
			post(client::revoke_device),
		)
		.layer(from_fn_with_state(state.clone(), admin_auth_middleware));

	Router::new()
		.route("/health", get(health::health_check))
		.route("/api/v1/agent/register", post(agent::register))
		.route("/api/v1/agent/sync", post(agent::sync))
		.route("/api/v1/agent/heartbeat", post(agent::heartbeat))
		.route("/api/v1/access/evaluate", post(access::evaluate))
		.route("/api/v1/events", get(events::stream))
		.route("/api/v1/client/config/:token", get(client::config_json))
		.route("/api/v1/client/config/:token/raw", get(client::config_raw))
		.route("/api/v1/client/config/:token/qr", get(client::config_qr))
		.merge(admin_routes)
		.with_state(state)
}
