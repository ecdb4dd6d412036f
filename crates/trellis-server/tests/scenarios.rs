// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end scenarios over the full control-plane stack: event store,
//! projection, engines, and services wired exactly as the server runs
//! them, against an in-memory database.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{Duration, Utc};

use trellis_common_core::{
	DeviceId, DeviceStatus, NodeId, NodeRole, NodeStatus, PolicyAction, PolicyId, Resource,
	RiskLevel, Subject, TunnelMode, UserId,
};
use trellis_common_wg::{Directive, FirewallAction, WgKeyPair, WgPublicKey};
use trellis_server::auth::ADMIN_TOKEN_HEADER;
use trellis_server::config::ServerConfigLayer;
use trellis_server::devices::ProvisionRequest;
use trellis_server::nodes::{RegisterRequest, RegisterResponse};
use trellis_server::routes::access;
use trellis_server::{create_app_state, AppState};
use trellis_server_db::testing::create_test_pool;
use trellis_server_engine::HeartbeatMetrics;
use trellis_server_events::{AggregateType, DomainEvent};

const ADMIN_SECRET: &str = "test-admin-secret";

async fn test_state() -> AppState {
	let pool = create_test_pool().await;
	let config = ServerConfigLayer {
		admin_secret: Some(ADMIN_SECRET.to_string()),
		secret_key: Some("test-master-key".to_string()),
		hub_endpoint: Some("hub.example.com:51820".to_string()),
		..Default::default()
	}
	.finalize()
	.expect("test config is valid");
	create_app_state(pool, config).await
}

fn admin_headers() -> HeaderMap {
	let mut headers = HeaderMap::new();
	headers.insert(ADMIN_TOKEN_HEADER, ADMIN_SECRET.parse().unwrap());
	headers
}

fn register_request(hostname: &str, role: NodeRole, key: &WgPublicKey) -> RegisterRequest {
	serde_json::from_value(serde_json::json!({
		"hostname": hostname,
		"role": role,
		"public_key": key.to_base64(),
		"real_ip": "198.51.100.7",
		"agent_version": "0.4.0",
		"os_info": "linux",
	}))
	.unwrap()
}

async fn register_and_approve(
	state: &AppState,
	hostname: &str,
	role: NodeRole,
) -> (NodeId, WgPublicKey, RegisterResponse) {
	let key = *WgKeyPair::generate().public_key();
	let response = state
		.register_node(register_request(hostname, role, &key))
		.await
		.unwrap();
	state
		.approve_node(response.node_id, "admin".to_string())
		.await
		.unwrap();
	(response.node_id, key, response)
}

async fn count_events(state: &AppState, event_type: &str) -> usize {
	state
		.store
		.read_since(0, 10_000)
		.await
		.unwrap()
		.iter()
		.filter(|r| r.event.event_type() == event_type)
		.count()
}

async fn create_user(state: &AppState, external_id: &str) -> UserId {
	let user_id = UserId::new();
	state
		.append_event(
			AggregateType::User,
			user_id.to_string(),
			DomainEvent::UserCreated {
				user_id,
				external_id: external_id.to_string(),
				email: format!("{external_id}@example.com"),
				display_name: external_id.to_string(),
				department: None,
			},
			"admin".to_string(),
			None,
		)
		.await
		.unwrap();
	user_id
}

// =============================================================================
// Scenario 1: approve and sync
// =============================================================================

#[tokio::test]
async fn approve_and_sync() {
	let state = test_state().await;

	register_and_approve(&state, "hub-01", NodeRole::Hub).await;

	let key = *WgKeyPair::generate().public_key();
	let response = state
		.register_node(register_request("db-01", NodeRole::Db, &key))
		.await
		.unwrap();
	assert_eq!(response.status, NodeStatus::Pending);
	assert_eq!(
		response.overlay_ip,
		Some("10.10.0.2".parse().unwrap()),
		"first node-pool address"
	);

	// Pending nodes are excluded from ACL computation.
	state
		.approve_node(response.node_id, "admin".to_string())
		.await
		.unwrap();

	let node = state.nodes.get(response.node_id).await.unwrap().unwrap();
	assert_eq!(node.status, NodeStatus::Active);

	let bundle = state.plan_for_node(&node).await.unwrap();
	// Hub is the only peer, carrying the whole overlay.
	assert_eq!(bundle.plan.peers.len(), 1);
	assert_eq!(
		bundle.plan.peers[0].allowed_ips,
		vec!["10.10.0.0/24".parse().unwrap()]
	);
	// No allow rules yet: the chain is conntrack acceptor plus drop, and
	// the compiled table carries only the default deny.
	assert_eq!(bundle.plan.firewall_rules.len(), 1);
	assert_eq!(bundle.plan.firewall_rules[0].action, FirewallAction::Drop);

	// Hash stable on re-sync.
	let again = state.plan_for_node(&node).await.unwrap();
	assert_eq!(bundle.hash, again.hash);
}

// =============================================================================
// Scenario 2: group-scoped access
// =============================================================================

#[tokio::test]
async fn group_scoped_access() {
	let state = test_state().await;
	let headers = admin_headers();

	let user_id = create_user(&state, "u1").await;

	let group_id = trellis_common_core::GroupId::new();
	state
		.append_event(
			AggregateType::Group,
			group_id.to_string(),
			DomainEvent::GroupCreated {
				group_id,
				name: "eng".to_string(),
				description: None,
			},
			"admin".to_string(),
			None,
		)
		.await
		.unwrap();
	state
		.append_event(
			AggregateType::Group,
			group_id.to_string(),
			DomainEvent::GroupMemberAdded { group_id, user_id },
			"admin".to_string(),
			None,
		)
		.await
		.unwrap();

	let policy_id = PolicyId::new();
	state
		.append_event(
			AggregateType::AccessPolicy,
			policy_id.to_string(),
			DomainEvent::AccessPolicyCreated {
				policy_id,
				name: "eng-internal".to_string(),
				subject: Subject::Group { id: group_id },
				resource: Resource::Domain {
					pattern: "*.internal.example.com".to_string(),
				},
				action: PolicyAction::Allow,
				priority: 100,
				enabled: true,
			},
			"admin".to_string(),
			None,
		)
		.await
		.unwrap();

	let evaluate = |user: &str, resource: &str| {
		let state = state.clone();
		let headers = headers.clone();
		let user = user.to_string();
		let resource = resource.to_string();
		async move {
			let Json(decision) = access::evaluate(
				State(state),
				headers,
				Json(serde_json::from_value(serde_json::json!({
					"user": user,
					"resource": resource,
				}))
				.unwrap()),
			)
			.await
			.unwrap();
			decision
		}
	};

	let allowed = evaluate("u1", "api.internal.example.com").await;
	assert!(allowed.allowed);
	assert_eq!(allowed.matched_policy_id, Some(policy_id));

	let denied = evaluate("u1", "api.external.example.com").await;
	assert!(!denied.allowed);
	assert_eq!(denied.matched_policy_id, None);

	let unknown = evaluate("nobody", "api.internal.example.com").await;
	assert!(!unknown.allowed);
}

// =============================================================================
// Scenario 3: role-to-role firewall
// =============================================================================

#[tokio::test]
async fn role_to_role_firewall() {
	let state = test_state().await;

	register_and_approve(&state, "hub-01", NodeRole::Hub).await;
	let (db_id, _, db_reg) = register_and_approve(&state, "db-01", NodeRole::Db).await;
	let (_, _, app_reg) = register_and_approve(&state, "app-01", NodeRole::App).await;

	assert_eq!(db_reg.overlay_ip, Some("10.10.0.2".parse().unwrap()));
	assert_eq!(app_reg.overlay_ip, Some("10.10.0.3".parse().unwrap()));

	let policy_id = PolicyId::new();
	state
		.append_event(
			AggregateType::NetworkPolicy,
			policy_id.to_string(),
			DomainEvent::NetworkPolicyCreated {
				policy_id,
				src_role: NodeRole::App,
				dst_role: NodeRole::Db,
				proto: trellis_common_core::Protocol::Tcp,
				port: Some(trellis_common_core::PortRange::single(5432)),
				action: FirewallAction::Accept,
				priority: 100,
			},
			"admin".to_string(),
			None,
		)
		.await
		.unwrap();

	let db = state.nodes.get(db_id).await.unwrap().unwrap();
	let bundle = state.plan_for_node(&db).await.unwrap();

	// Exactly one allow rule plus the implicit deny.
	assert_eq!(bundle.plan.firewall_rules.len(), 2);
	let allow = &bundle.plan.firewall_rules[0];
	assert_eq!(allow.src, "10.10.0.3/32".parse().unwrap());
	assert_eq!(allow.proto, trellis_common_core::Protocol::Tcp);
	assert_eq!(
		allow.port,
		Some(trellis_common_core::PortRange::single(5432))
	);
	assert_eq!(allow.action, FirewallAction::Accept);
	assert_eq!(
		bundle.plan.firewall_rules[1].action,
		FirewallAction::Drop
	);
}

// =============================================================================
// Scenario 4: client provisioning and revocation
// =============================================================================

#[tokio::test]
async fn client_provisioning() {
	let state = test_state().await;

	let (hub_id, _, _) = register_and_approve(&state, "hub-01", NodeRole::Hub).await;
	create_user(&state, "u1").await;

	let request: ProvisionRequest = serde_json::from_value(serde_json::json!({
		"user": "u1",
		"name": "laptop",
		"tunnel_mode": "full",
		"expires_days": 1,
	}))
	.unwrap();
	let provisioned = state
		.provision_device(request, "admin".to_string())
		.await
		.unwrap();

	// First client-pool address, a token, and the one-shot private key.
	assert_eq!(provisioned.overlay_ip, "10.10.0.100".parse::<std::net::Ipv4Addr>().unwrap());
	assert!(provisioned.config_token.starts_with("ct_"));
	assert_eq!(provisioned.private_key.len(), 44);
	assert!(provisioned.profile.contains("[Interface]"));
	assert!(provisioned.profile.contains("AllowedIPs = 0.0.0.0/0"));

	// Token exchange returns the same profile.
	let (device, plan) = state
		.claim_device_config(&provisioned.config_token)
		.await
		.unwrap();
	assert_eq!(device.id, provisioned.device_id);
	assert_eq!(
		plan.interface.private_key.as_deref(),
		Some(provisioned.private_key.as_str())
	);

	// The device is a Hub peer while active.
	let hub = state.nodes.get(hub_id).await.unwrap().unwrap();
	let bundle = state.plan_for_node(&hub).await.unwrap();
	assert!(bundle
		.plan
		.peers
		.iter()
		.any(|p| p.allowed_ips == vec!["10.10.0.100/32".parse().unwrap()]));

	// Revocation removes it on the next compile.
	state
		.revoke_device(provisioned.device_id, "lost".to_string(), "admin".to_string())
		.await
		.unwrap();
	let bundle = state.plan_for_node(&hub).await.unwrap();
	assert!(!bundle
		.plan
		.peers
		.iter()
		.any(|p| p.allowed_ips == vec!["10.10.0.100/32".parse().unwrap()]));
	let wrong_token = state.claim_device_config(&provisioned.config_token).await;
	assert!(wrong_token.is_err());
}

#[tokio::test]
async fn expired_device_is_swept_and_dropped_from_hub() {
	let state = test_state().await;

	let (hub_id, _, _) = register_and_approve(&state, "hub-01", NodeRole::Hub).await;
	let user_id = create_user(&state, "u1").await;

	// A device already past its expiry, as if provisioned yesterday.
	let device_id = DeviceId::new();
	state
		.append_event(
			AggregateType::ClientDevice,
			device_id.to_string(),
			DomainEvent::DeviceProvisioned {
				device_id,
				user_id,
				name: "old-phone".to_string(),
				device_type: "mobile".to_string(),
				tunnel_mode: TunnelMode::Split,
				overlay_ip: "10.10.0.101".parse().unwrap(),
				public_key: *WgKeyPair::generate().public_key(),
				private_key_enc: state.secrets.encrypt(b"key").unwrap(),
				expires_at: Utc::now() - Duration::hours(1),
				config_token_hash: "stale".to_string(),
			},
			"admin".to_string(),
			None,
		)
		.await
		.unwrap();

	// Expiry shows through reads even before the sweep runs.
	let hub = state.nodes.get(hub_id).await.unwrap().unwrap();
	let bundle = state.plan_for_node(&hub).await.unwrap();
	assert!(bundle.plan.peers.is_empty());

	let swept = state.sweep_expired_devices().await.unwrap();
	assert_eq!(swept, 1);

	let device = state.devices.get(device_id).await.unwrap().unwrap();
	assert_eq!(device.status, DeviceStatus::Revoked);
	assert_eq!(count_events(&state, "device_revoked").await, 1);

	// The sweep is idempotent.
	assert_eq!(state.sweep_expired_devices().await.unwrap(), 0);
}

// =============================================================================
// Scenario 5: trust demotion to isolation
// =============================================================================

#[tokio::test]
async fn trust_demotion_forces_suspension() {
	let state = test_state().await;

	register_and_approve(&state, "hub-01", NodeRole::Hub).await;
	let (node_id, _, _) = register_and_approve(&state, "db-01", NodeRole::Db).await;

	let bad = HeartbeatMetrics {
		ssh_failures: 50,
		firewall_violations: 20,
		..Default::default()
	};

	// An hour of hostile heartbeats drives the score under the critical
	// threshold well before the hour is up.
	let mut suspended = false;
	for _ in 0..60 {
		let node = state.nodes.get(node_id).await.unwrap().unwrap();
		if node.status == NodeStatus::Suspended {
			suspended = true;
			break;
		}
		state.process_heartbeat(&node, &bad).await.unwrap();
	}
	assert!(suspended, "node never reached suspension");

	let node = state.nodes.get(node_id).await.unwrap().unwrap();
	assert!(node.trust_score < 40);
	assert_eq!(node.risk_level, RiskLevel::Critical);

	// The automatic suspension is its own event.
	assert_eq!(count_events(&state, "node_suspended").await, 1);

	// Next sync carries the isolate directive and an empty peer set.
	let bundle = state.plan_for_node(&node).await.unwrap();
	assert_eq!(bundle.directives, vec![Directive::Isolate]);
	assert!(bundle.plan.peers.is_empty());
	assert!(bundle
		.plan
		.firewall_rules
		.iter()
		.all(|r| r.action == FirewallAction::Drop));

	// Suspended nodes are out of everyone else's plans.
	let history = state.store.read_since(0, 10_000).await.unwrap();
	assert!(history
		.iter()
		.any(|r| r.event.event_type() == "trust_score_changed"));
}

#[tokio::test]
async fn identical_scores_suppress_trust_events() {
	let state = test_state().await;

	register_and_approve(&state, "hub-01", NodeRole::Hub).await;
	let (node_id, _, _) = register_and_approve(&state, "db-01", NodeRole::Db).await;

	let clean = HeartbeatMetrics {
		cpu_percent: 10.0,
		memory_percent: 30.0,
		disk_percent: 40.0,
		..Default::default()
	};

	for _ in 0..5 {
		let node = state.nodes.get(node_id).await.unwrap().unwrap();
		state.process_heartbeat(&node, &clean).await.unwrap();
	}

	// The score settles after the first change; repeats emit nothing.
	assert_eq!(count_events(&state, "trust_score_changed").await, 1);
}

// =============================================================================
// Scenario 6: idempotent registration
// =============================================================================

#[tokio::test]
async fn idempotent_register() {
	let state = test_state().await;
	let key = *WgKeyPair::generate().public_key();

	let first = state
		.register_node(register_request("db-01", NodeRole::Db, &key))
		.await
		.unwrap();
	let second = state
		.register_node(register_request("db-01", NodeRole::Db, &key))
		.await
		.unwrap();

	assert_eq!(first.node_id, second.node_id);
	assert_eq!(first.overlay_ip, second.overlay_ip);
	assert_eq!(count_events(&state, "node_registered").await, 1);

	// Same payload submitted concurrently also resolves to one node.
	let key2 = *WgKeyPair::generate().public_key();
	let (a, b) = tokio::join!(
		state.register_node(register_request("app-01", NodeRole::App, &key2)),
		state.register_node(register_request("app-01", NodeRole::App, &key2)),
	);
	let a = a.unwrap();
	let b = b.unwrap();
	assert_eq!(a.node_id, b.node_id);
	assert_eq!(
		count_events(&state, "node_registered").await,
		2,
		"exactly one event per hostname"
	);
}

#[tokio::test]
async fn register_key_change_rejected_until_revoked() {
	let state = test_state().await;
	let key = *WgKeyPair::generate().public_key();

	let first = state
		.register_node(register_request("db-01", NodeRole::Db, &key))
		.await
		.unwrap();

	// A different key for a live hostname is a conflict.
	let other = *WgKeyPair::generate().public_key();
	let err = state
		.register_node(register_request("db-01", NodeRole::Db, &other))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), trellis_common_core::ErrorKind::Conflict);

	// After revocation the hostname is free again, but the old key is
	// blacklisted for good.
	state
		.revoke_node(first.node_id, "decommissioned".to_string(), "admin".to_string())
		.await
		.unwrap();

	let reborn = state
		.register_node(register_request("db-01", NodeRole::Db, &other))
		.await
		.unwrap();
	assert_ne!(reborn.node_id, first.node_id);

	let blacklisted = state
		.register_node(register_request("db-02", NodeRole::Db, &key))
		.await
		.unwrap_err();
	assert_eq!(
		blacklisted.kind(),
		trellis_common_core::ErrorKind::Unauthorized
	);
}

// =============================================================================
// Revocation erases reachability
// =============================================================================

#[tokio::test]
async fn revocation_erases_reachability() {
	let state = test_state().await;

	let (hub_id, _, _) = register_and_approve(&state, "hub-01", NodeRole::Hub).await;
	let (db_id, _, _) = register_and_approve(&state, "db-01", NodeRole::Db).await;
	let (app_id, app_key, app_reg) =
		register_and_approve(&state, "app-01", NodeRole::App).await;

	let policy_id = PolicyId::new();
	state
		.append_event(
			AggregateType::NetworkPolicy,
			policy_id.to_string(),
			DomainEvent::NetworkPolicyCreated {
				policy_id,
				src_role: NodeRole::App,
				dst_role: NodeRole::Db,
				proto: trellis_common_core::Protocol::Tcp,
				port: Some(trellis_common_core::PortRange::single(5432)),
				action: FirewallAction::Accept,
				priority: 100,
			},
			"admin".to_string(),
			None,
		)
		.await
		.unwrap();

	let db = state.nodes.get(db_id).await.unwrap().unwrap();
	let before = state.plan_for_node(&db).await.unwrap();
	assert!(before.plan.peers.iter().any(|p| p.public_key == app_key));

	state
		.revoke_node(app_id, "compromised".to_string(), "admin".to_string())
		.await
		.unwrap();

	// Neither a peer nor a firewall source anywhere.
	let db_after = state.plan_for_node(&db).await.unwrap();
	assert!(!db_after.plan.peers.iter().any(|p| p.public_key == app_key));
	let app_src: ipnet::Ipv4Net = format!("{}/32", app_reg.overlay_ip.unwrap())
		.parse()
		.unwrap();
	assert!(!db_after
		.plan
		.firewall_rules
		.iter()
		.any(|r| r.src == app_src));
	assert_ne!(before.hash, db_after.hash);

	let hub = state.nodes.get(hub_id).await.unwrap().unwrap();
	let hub_plan = state.plan_for_node(&hub).await.unwrap();
	assert!(!hub_plan.plan.peers.iter().any(|p| p.public_key == app_key));
}

// =============================================================================
// Register poll delivers the token exactly once
// =============================================================================

#[tokio::test]
async fn token_delivered_once_after_approval() {
	let state = test_state().await;
	let key = *WgKeyPair::generate().public_key();

	let pending = state
		.register_node(register_request("db-01", NodeRole::Db, &key))
		.await
		.unwrap();
	assert_eq!(pending.agent_token, None);

	state
		.approve_node(pending.node_id, "admin".to_string())
		.await
		.unwrap();

	let first_poll = state
		.register_node(register_request("db-01", NodeRole::Db, &key))
		.await
		.unwrap();
	let token = first_poll.agent_token.expect("token on first poll");
	assert!(token.starts_with("nt_"));

	let second_poll = state
		.register_node(register_request("db-01", NodeRole::Db, &key))
		.await
		.unwrap();
	assert_eq!(second_poll.agent_token, None);

	// The delivered token authenticates by hash.
	let node = state
		.nodes
		.get_by_token_hash(&trellis_server::auth::hash_token(&token))
		.await
		.unwrap()
		.unwrap();
	assert_eq!(node.id, pending.node_id);
}

// =============================================================================
// Replay determinism over the full scenario history
// =============================================================================

#[tokio::test]
async fn replay_reproduces_projection() {
	let state = test_state().await;

	register_and_approve(&state, "hub-01", NodeRole::Hub).await;
	let (db_id, _, _) = register_and_approve(&state, "db-01", NodeRole::Db).await;
	create_user(&state, "u1").await;
	state
		.suspend_node(db_id, "maintenance".to_string(), "admin".to_string())
		.await
		.unwrap();

	let nodes_before = state.nodes.list().await.unwrap();
	let users_before = state.identity.list_users().await.unwrap();

	trellis_server_db::projection::rebuild(state.store.pool())
		.await
		.unwrap();

	let nodes_after = state.nodes.list().await.unwrap();
	assert_eq!(nodes_after.len(), nodes_before.len());
	for (before, after) in nodes_before.iter().zip(nodes_after.iter()) {
		assert_eq!(before.id, after.id);
		assert_eq!(before.status, after.status);
		assert_eq!(before.overlay_ip, after.overlay_ip);
		assert_eq!(before.token_hash, after.token_hash);
	}
	assert_eq!(
		state.identity.list_users().await.unwrap().len(),
		users_before.len()
	);
}
