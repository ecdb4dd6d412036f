// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client device provisioning and one-shot profile delivery.
//!
//! A device is born with an address from the client pool, a server-side
//! X25519 keypair, and a config token. The private key is delivered once
//! inside the rendered profile and otherwise lives only as AES-GCM
//! ciphertext. Expiry revokes the device on the sweep; revocation removes
//! it from the Hub's peer set on the next compile.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::auth::{generate_token, hash_token, CONFIG_TOKEN_PREFIX};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use trellis_common_core::{DeviceId, PoolKind, TunnelMode, UserId};
use trellis_common_wg::{render_profile, NodePlan, WgKeyPair};
use trellis_server_db::models::ClientDevice;
use trellis_server_engine::synthesize_client_profile;
use trellis_server_events::{AggregateType, DomainEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
	/// The owning user's external id.
	pub user: String,
	pub name: String,
	#[serde(default = "default_device_type")]
	pub device_type: String,
	#[serde(default = "default_tunnel_mode")]
	pub tunnel_mode: TunnelMode,
	#[serde(default)]
	pub expires_days: Option<i64>,
}

fn default_device_type() -> String {
	"laptop".to_string()
}

fn default_tunnel_mode() -> TunnelMode {
	TunnelMode::Full
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
	pub device_id: DeviceId,
	pub user_id: UserId,
	pub name: String,
	pub overlay_ip: Ipv4Addr,
	pub tunnel_mode: TunnelMode,
	pub expires_at: DateTime<Utc>,
	/// Shown once. Exchange it at `/api/v1/client/config/{token}`.
	pub config_token: String,
	/// Shown once; never retrievable again in the clear.
	pub private_key: String,
	pub profile: String,
}

impl AppState {
	#[tracing::instrument(skip(self, request), fields(user = %request.user, device = %request.name))]
	pub async fn provision_device(
		&self,
		request: ProvisionRequest,
		actor: String,
	) -> ServerResult<ProvisionResponse> {
		let user = self
			.identity
			.get_user_by_external_id(&request.user)
			.await?
			.ok_or_else(|| ServerError::not_found(format!("user {}", request.user)))?;

		let now = Utc::now();
		let active = self.devices.count_active_for_user(user.id, now).await?;
		if active >= self.config.client_max_devices_per_user {
			return Err(ServerError::conflict(format!(
				"user {} already has {active} active devices",
				request.user
			)));
		}

		let expires_days = request
			.expires_days
			.unwrap_or(self.config.client_default_expires_days);
		if expires_days <= 0 {
			return Err(ServerError::invalid("expires_days must be positive"));
		}
		let expires_at = now + Duration::days(expires_days);

		let device_id = DeviceId::new();
		let overlay_ip = self
			.allocate_address(
				PoolKind::Client,
				format!("device:{device_id}"),
				actor.clone(),
			)
			.await?;

		let keypair = WgKeyPair::generate();
		let private_key = keypair.private_key().expose_base64();
		let private_key_enc = self.secrets.encrypt(private_key.as_bytes())?;

		let (config_token, config_token_hash) = generate_token(CONFIG_TOKEN_PREFIX);

		self.append_event(
			AggregateType::ClientDevice,
			device_id.to_string(),
			DomainEvent::DeviceProvisioned {
				device_id,
				user_id: user.id,
				name: request.name.clone(),
				device_type: request.device_type,
				tunnel_mode: request.tunnel_mode,
				overlay_ip,
				public_key: *keypair.public_key(),
				private_key_enc,
				expires_at,
				config_token_hash,
			},
			actor,
			None,
		)
		.await?;

		let device = self
			.devices
			.get(device_id)
			.await?
			.ok_or_else(|| ServerError::Internal("provisioned device vanished".into()))?;
		let plan = self.client_profile_plan(&device, private_key.clone()).await?;

		Ok(ProvisionResponse {
			device_id,
			user_id: user.id,
			name: request.name,
			overlay_ip,
			tunnel_mode: device.tunnel_mode,
			expires_at,
			config_token,
			private_key,
			profile: render_profile(&plan),
		})
	}

	async fn client_profile_plan(
		&self,
		device: &ClientDevice,
		private_key: String,
	) -> ServerResult<NodePlan> {
		let hub = self.nodes.hub().await?;
		let hub_public_key = hub
			.as_ref()
			.map(|h| h.public_key)
			.ok_or_else(|| ServerError::conflict("no active hub to terminate the tunnel"))?;
		let hub_endpoint = self.hub_endpoint().await?;

		Ok(synthesize_client_profile(
			&self.config.overlay,
			hub_public_key,
			hub_endpoint.as_deref(),
			device,
			private_key,
		)?)
	}

	/// Exchange a config token for the device's tunnel plan. Burns the
	/// token when single-use delivery is configured.
	#[tracing::instrument(skip_all)]
	pub async fn claim_device_config(
		&self,
		token: &str,
	) -> ServerResult<(ClientDevice, NodePlan)> {
		let now = Utc::now();
		let device = self
			.devices
			.get_by_token_hash(&hash_token(token), now)
			.await?
			.ok_or_else(ServerError::unauthorized)?;

		let private_key = self.secrets.decrypt(&device.private_key_enc)?;
		let private_key = String::from_utf8(private_key.to_vec())
			.map_err(|_| ServerError::Internal("corrupt stored device key".into()))?;

		let plan = self.client_profile_plan(&device, private_key).await?;

		if self.config.client_config_single_use {
			self.devices.mark_config_claimed(device.id, now).await?;
		} else {
			self.devices.record_config_claimed(device.id, now).await?;
		}

		Ok((device, plan))
	}

	#[tracing::instrument(skip(self), fields(%device_id))]
	pub async fn revoke_device(
		&self,
		device_id: DeviceId,
		reason: String,
		actor: String,
	) -> ServerResult<ClientDevice> {
		let device = self
			.devices
			.get(device_id)
			.await?
			.ok_or_else(|| ServerError::not_found(format!("device {device_id}")))?;
		if device.status == trellis_common_core::DeviceStatus::Revoked {
			return Ok(device);
		}
		let released = device.overlay_ip;

		self.append_event(
			AggregateType::ClientDevice,
			device_id.to_string(),
			DomainEvent::DeviceRevoked { device_id, reason },
			actor.clone(),
			None,
		)
		.await?;

		if let Some(addr) = released {
			self.release_address(addr, actor).await?;
		}

		self.devices
			.get(device_id)
			.await?
			.ok_or_else(|| ServerError::Internal("revoked device vanished".into()))
	}

	/// Revoke every device past its expiry. Invoked by the background
	/// sweep; returns how many devices were revoked.
	#[tracing::instrument(skip(self))]
	pub async fn sweep_expired_devices(&self) -> ServerResult<usize> {
		let now = Utc::now();
		let expired = self.devices.list_expired(now).await?;
		let count = expired.len();

		for device in expired {
			self.revoke_device(device.id, "expired".to_string(), "system".to_string())
				.await?;
		}

		if count > 0 {
			tracing::info!(count, "revoked expired client devices");
		}
		Ok(count)
	}
}
