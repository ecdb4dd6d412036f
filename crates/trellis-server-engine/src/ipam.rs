// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Lowest-free address allocation over the disjoint node and client pools.
//!
//! The allocator itself is pure: the caller supplies the in-use and
//! cooling-down sets from the projection, and commits the returned address
//! by appending an `ip_allocated` event. The Hub address is outside both
//! pools and can never be handed out.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::EngineError;
use serde::Serialize;
use trellis_common_core::{OverlaySettings, PoolKind};

#[derive(Debug, Clone)]
pub struct IpamService {
	overlay: OverlaySettings,
}

/// Admin-facing pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct IpamStats {
	pub network: String,
	pub hub_addr: Ipv4Addr,
	pub pool: PoolKind,
	pub total: u32,
	pub in_use: u32,
	pub cooling_down: u32,
	pub available: u32,
	pub utilization_percent: f64,
}

impl IpamService {
	pub fn new(overlay: OverlaySettings) -> Self {
		Self { overlay }
	}

	pub fn overlay(&self) -> &OverlaySettings {
		&self.overlay
	}

	/// Pick the lowest free address in the pool, skipping everything in
	/// use and everything still inside the release cool-down window.
	#[tracing::instrument(skip(self, in_use, cooling_down))]
	pub fn allocate(
		&self,
		pool: PoolKind,
		in_use: &BTreeSet<Ipv4Addr>,
		cooling_down: &BTreeSet<Ipv4Addr>,
	) -> Result<Ipv4Addr, EngineError> {
		self.overlay
			.pool_addrs(pool)
			.find(|addr| !in_use.contains(addr) && !cooling_down.contains(addr))
			.ok_or(EngineError::PoolExhausted(pool))
	}

	pub fn stats(&self, pool: PoolKind, in_use: u32, cooling_down: u32) -> IpamStats {
		let total = self.overlay.pool_size(pool);
		let available = total.saturating_sub(in_use).saturating_sub(cooling_down);
		let utilization_percent = if total > 0 {
			(in_use as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
		} else {
			0.0
		};
		IpamStats {
			network: self.overlay.network.to_string(),
			hub_addr: self.overlay.hub_addr,
			pool,
			total,
			in_use,
			cooling_down,
			available,
			utilization_percent,
		}
	}
}
