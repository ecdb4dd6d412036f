// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client device handlers: provisioning (admin) and one-shot config
//! delivery (config token), in JSON, plain wg-quick text, and QR form.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use qrcode::render::svg;
use qrcode::QrCode;
use serde::Serialize;

use crate::devices::{ProvisionRequest, ProvisionResponse};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;
use trellis_common_core::DeviceId;
use trellis_common_wg::render_profile;
use trellis_server_db::models::ClientDevice;

const ADMIN_ACTOR: &str = "admin";

/// POST /api/v1/client/devices (admin).
pub async fn create_device(
	State(state): State<AppState>,
	Json(request): Json<ProvisionRequest>,
) -> ServerResult<(StatusCode, Json<ProvisionResponse>)> {
	let response = state
		.provision_device(request, ADMIN_ACTOR.to_string())
		.await?;
	Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/v1/client/devices (admin).
pub async fn list_devices(
	State(state): State<AppState>,
) -> ServerResult<Json<Vec<ClientDevice>>> {
	let now = chrono::Utc::now();
	let mut devices = state.devices.list().await?;
	// Expiry shows through before the sweep has written its event.
	for device in &mut devices {
		if !device.is_active(now) {
			device.status = trellis_common_core::DeviceStatus::Revoked;
		}
	}
	Ok(Json(devices))
}

/// POST /api/v1/client/devices/{id}/revoke (admin).
pub async fn revoke_device(
	State(state): State<AppState>,
	Path(id): Path<DeviceId>,
) -> ServerResult<Json<ClientDevice>> {
	Ok(Json(
		state
			.revoke_device(id, "revoked by operator".to_string(), ADMIN_ACTOR.to_string())
			.await?,
	))
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
	pub device_name: String,
	pub tunnel_mode: trellis_common_core::TunnelMode,
	pub expires_at: chrono::DateTime<chrono::Utc>,
	pub profile: String,
}

/// GET /api/v1/client/config/{token}
pub async fn config_json(
	State(state): State<AppState>,
	Path(token): Path<String>,
) -> ServerResult<Json<ConfigResponse>> {
	let (device, plan) = state.claim_device_config(&token).await?;
	Ok(Json(ConfigResponse {
		device_name: device.name,
		tunnel_mode: device.tunnel_mode,
		expires_at: device.expires_at,
		profile: render_profile(&plan),
	}))
}

/// GET /api/v1/client/config/{token}/raw
pub async fn config_raw(
	State(state): State<AppState>,
	Path(token): Path<String>,
) -> ServerResult<Response> {
	let (_, plan) = state.claim_device_config(&token).await?;
	Ok((
		[(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
		render_profile(&plan),
	)
		.into_response())
}

/// GET /api/v1/client/config/{token}/qr
///
/// The profile text encoded as an SVG QR image, scannable straight into
/// the WireGuard mobile apps.
pub async fn config_qr(
	State(state): State<AppState>,
	Path(token): Path<String>,
) -> ServerResult<Response> {
	let (_, plan) = state.claim_device_config(&token).await?;
	let profile = render_profile(&plan);

	let code = QrCode::new(profile.as_bytes())
		.map_err(|e| ServerError::Internal(format!("QR encoding failed: {e}")))?;
	let image = code
		.render::<svg::Color>()
		.min_dimensions(320, 320)
		.build();

	Ok((
		[(header::CONTENT_TYPE, "image/svg+xml")],
		image,
	)
		.into_response())
}
