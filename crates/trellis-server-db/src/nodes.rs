// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read side of the node projection.
//!
//! All writes to `nodes` happen in the projector; the only direct updates
//! here are operational metadata (heartbeat timestamps) that is not part
//! of the domain history.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;

use crate::error::DbError;
use crate::models::{Node, NodeRow};
use trellis_common_core::{NodeId, NodeRole};
use trellis_common_wg::WgPublicKey;

const NODE_COLUMNS: &str = "id, hostname, role, public_key, real_ip, overlay_ip, status, \
	 trust_score, risk_level, token_hash, token_enc, last_heartbeat_at, agent_version, os_info, \
	 created_at, approved_by";

#[derive(Clone)]
pub struct NodeRepository {
	pool: SqlitePool,
}

impl NodeRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn get(&self, id: NodeId) -> Result<Option<Node>, DbError> {
		let row: Option<NodeRow> =
			sqlx::query_as(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?"))
				.bind(id.to_string())
				.fetch_optional(&self.pool)
				.await?;
		row.map(Node::try_from).transpose()
	}

	/// Lookup by hostname among live (non-revoked) nodes.
	#[tracing::instrument(skip(self))]
	pub async fn get_by_hostname(&self, hostname: &str) -> Result<Option<Node>, DbError> {
		let row: Option<NodeRow> = sqlx::query_as(&format!(
			"SELECT {NODE_COLUMNS} FROM nodes WHERE hostname = ? AND status != 'revoked'"
		))
		.bind(hostname)
		.fetch_optional(&self.pool)
		.await?;
		row.map(Node::try_from).transpose()
	}

	#[tracing::instrument(skip(self, public_key))]
	pub async fn get_by_public_key(
		&self,
		public_key: &WgPublicKey,
	) -> Result<Option<Node>, DbError> {
		let row: Option<NodeRow> = sqlx::query_as(&format!(
			"SELECT {NODE_COLUMNS} FROM nodes WHERE public_key = ? AND status != 'revoked'"
		))
		.bind(public_key.to_base64())
		.fetch_optional(&self.pool)
		.await?;
		row.map(Node::try_from).transpose()
	}

	/// Resolve an agent bearer token (by its hash) to the owning node.
	#[tracing::instrument(skip_all)]
	pub async fn get_by_token_hash(&self, token_hash: &str) -> Result<Option<Node>, DbError> {
		let row: Option<NodeRow> = sqlx::query_as(&format!(
			"SELECT {NODE_COLUMNS} FROM nodes WHERE token_hash = ?"
		))
		.bind(token_hash)
		.fetch_optional(&self.pool)
		.await?;
		row.map(Node::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list(&self) -> Result<Vec<Node>, DbError> {
		let rows: Vec<NodeRow> = sqlx::query_as(&format!(
			"SELECT {NODE_COLUMNS} FROM nodes ORDER BY hostname ASC"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(Node::try_from).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_active(&self) -> Result<Vec<Node>, DbError> {
		let rows: Vec<NodeRow> = sqlx::query_as(&format!(
			"SELECT {NODE_COLUMNS} FROM nodes WHERE status = 'active' ORDER BY hostname ASC"
		))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(Node::try_from).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_by_role(&self, role: NodeRole) -> Result<Vec<Node>, DbError> {
		let rows: Vec<NodeRow> = sqlx::query_as(&format!(
			"SELECT {NODE_COLUMNS} FROM nodes WHERE role = ? ORDER BY hostname ASC"
		))
		.bind(role.as_str())
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(Node::try_from).collect()
	}

	/// The active Hub, if one has been approved.
	#[tracing::instrument(skip(self))]
	pub async fn hub(&self) -> Result<Option<Node>, DbError> {
		let row: Option<NodeRow> = sqlx::query_as(&format!(
			"SELECT {NODE_COLUMNS} FROM nodes WHERE role = 'hub' AND status = 'active'
			 ORDER BY created_at ASC LIMIT 1"
		))
		.fetch_optional(&self.pool)
		.await?;
		row.map(Node::try_from).transpose()
	}

	/// Clear the encrypted token copy after its one-shot delivery on the
	/// agent's register poll. Operational metadata, not domain history.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn claim_agent_token(&self, id: NodeId) -> Result<u64, DbError> {
		let result = sqlx::query(
			"UPDATE nodes SET token_enc = NULL WHERE id = ? AND token_enc IS NOT NULL",
		)
		.bind(id.to_string())
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}

	/// Heartbeat timestamps are operational metadata, not domain history;
	/// they bypass the event log.
	#[tracing::instrument(skip(self), fields(%id))]
	pub async fn touch_heartbeat(&self, id: NodeId, at: DateTime<Utc>) -> Result<u64, DbError> {
		let result = sqlx::query("UPDATE nodes SET last_heartbeat_at = ? WHERE id = ?")
			.bind(at)
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}

	#[tracing::instrument(skip(self, public_key))]
	pub async fn is_key_blacklisted(&self, public_key: &WgPublicKey) -> Result<bool, DbError> {
		let row: Option<(String,)> =
			sqlx::query_as("SELECT public_key FROM blacklisted_keys WHERE public_key = ?")
				.bind(public_key.to_base64())
				.fetch_optional(&self.pool)
				.await?;
		Ok(row.is_some())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event_store::NewEvent;
	use crate::testing::create_test_store;
	use trellis_common_core::NodeStatus;
	use trellis_server_events::{AggregateType, DomainEvent};
	use trellis_common_wg::WgKeyPair;

	async fn register(
		store: &crate::event_store::EventStore,
		hostname: &str,
		role: NodeRole,
		overlay_ip: &str,
	) -> (NodeId, WgPublicKey) {
		let node_id = NodeId::new();
		let key = *WgKeyPair::generate().public_key();
		store
			.append(NewEvent {
				aggregate_type: AggregateType::Node,
				aggregate_id: node_id.to_string(),
				expected_version: 0,
				event: DomainEvent::NodeRegistered {
					node_id,
					hostname: hostname.to_string(),
					role,
					public_key: key,
					real_ip: None,
					overlay_ip: overlay_ip.parse().unwrap(),
					agent_version: "0.4.0".to_string(),
					os_info: "linux".to_string(),
				},
				actor: format!("agent:{hostname}"),
				client_request_id: None,
			})
			.await
			.unwrap();
		(node_id, key)
	}

	#[tokio::test]
	async fn test_lookup_by_hostname_and_key() {
		let store = create_test_store().await;
		let repo = NodeRepository::new(store.pool().clone());
		let (node_id, key) = register(&store, "db-01", NodeRole::Db, "10.10.0.2").await;

		let by_hostname = repo.get_by_hostname("db-01").await.unwrap().unwrap();
		assert_eq!(by_hostname.id, node_id);
		assert_eq!(by_hostname.status, NodeStatus::Pending);

		let by_key = repo.get_by_public_key(&key).await.unwrap().unwrap();
		assert_eq!(by_key.id, node_id);

		assert!(repo.get_by_hostname("db-02").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_revoked_node_invisible_to_live_lookups() {
		let store = create_test_store().await;
		let repo = NodeRepository::new(store.pool().clone());
		let (node_id, key) = register(&store, "db-01", NodeRole::Db, "10.10.0.2").await;

		store
			.append(NewEvent {
				aggregate_type: AggregateType::Node,
				aggregate_id: node_id.to_string(),
				expected_version: 1,
				event: DomainEvent::NodeRevoked {
					node_id,
					reason: "compromised".to_string(),
					public_key: key,
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		assert!(repo.get_by_hostname("db-01").await.unwrap().is_none());
		assert!(repo.get_by_public_key(&key).await.unwrap().is_none());
		assert!(repo.is_key_blacklisted(&key).await.unwrap());

		// Direct get still sees the terminal record.
		let node = repo.get(node_id).await.unwrap().unwrap();
		assert_eq!(node.status, NodeStatus::Revoked);
		assert_eq!(node.overlay_ip, None);
		assert_eq!(node.token_hash, None);
	}

	#[tokio::test]
	async fn test_list_active_and_hub() {
		let store = create_test_store().await;
		let repo = NodeRepository::new(store.pool().clone());

		let (hub_id, _) = register(&store, "hub-01", NodeRole::Hub, "10.10.0.1").await;
		register(&store, "db-01", NodeRole::Db, "10.10.0.2").await;

		assert!(repo.hub().await.unwrap().is_none());
		assert!(repo.list_active().await.unwrap().is_empty());

		store
			.append(NewEvent {
				aggregate_type: AggregateType::Node,
				aggregate_id: hub_id.to_string(),
				expected_version: 1,
				event: DomainEvent::NodeApproved {
					node_id: hub_id,
					approved_by: "admin".to_string(),
					token_hash: "hubtoken".to_string(),
					token_enc: "enc".to_string(),
				},
				actor: "admin".to_string(),
				client_request_id: None,
			})
			.await
			.unwrap();

		let hub = repo.hub().await.unwrap().unwrap();
		assert_eq!(hub.id, hub_id);
		assert_eq!(repo.list_active().await.unwrap().len(), 1);
		assert_eq!(repo.list().await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn test_touch_heartbeat() {
		let store = create_test_store().await;
		let repo = NodeRepository::new(store.pool().clone());
		let (node_id, _) = register(&store, "db-01", NodeRole::Db, "10.10.0.2").await;

		let now = Utc::now();
		assert_eq!(repo.touch_heartbeat(node_id, now).await.unwrap(), 1);

		let node = repo.get(node_id).await.unwrap().unwrap();
		assert_eq!(node.last_heartbeat_at, Some(now));
	}
}
