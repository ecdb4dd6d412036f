// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Overlay network layout: the CIDR, the Hub address, and the two disjoint
//! allocation pools carved out of it.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::error::CoreError;

/// Which allocation pool an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
	Node,
	Client,
}

impl PoolKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			PoolKind::Node => "node",
			PoolKind::Client => "client",
		}
	}
}

impl std::fmt::Display for PoolKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Resolved overlay layout. The Hub reserves the first host address; the
/// node and client pools are disjoint host ranges within the CIDR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySettings {
	pub network: Ipv4Net,
	pub hub_addr: Ipv4Addr,
	pub node_pool_start: Ipv4Addr,
	pub node_pool_end: Ipv4Addr,
	pub client_pool_start: Ipv4Addr,
	pub client_pool_end: Ipv4Addr,
	pub wg_port: u16,
}

impl OverlaySettings {
	/// Build the default layout for a CIDR: hub at the first host, nodes
	/// from the second host up to `.99`-equivalent, clients from `.100` to
	/// `.250`-equivalent offsets.
	pub fn for_network(network: Ipv4Net, wg_port: u16) -> Result<Self, CoreError> {
		if network.prefix_len() > 24 {
			return Err(CoreError::InvalidArgument(format!(
				"overlay network {network} too small: need at least a /24"
			)));
		}
		let base = u32::from(network.network());
		let settings = Self {
			network,
			hub_addr: Ipv4Addr::from(base + 1),
			node_pool_start: Ipv4Addr::from(base + 2),
			node_pool_end: Ipv4Addr::from(base + 99),
			client_pool_start: Ipv4Addr::from(base + 100),
			client_pool_end: Ipv4Addr::from(base + 250),
			wg_port,
		};
		Ok(settings)
	}

	/// Override the client pool bounds, keeping pools disjoint.
	pub fn with_client_pool(
		mut self,
		start: Ipv4Addr,
		end: Ipv4Addr,
	) -> Result<Self, CoreError> {
		if !self.network.contains(&start) || !self.network.contains(&end) {
			return Err(CoreError::InvalidArgument(format!(
				"client pool {start}-{end} outside overlay network {}",
				self.network
			)));
		}
		if start > end {
			return Err(CoreError::InvalidArgument(format!(
				"client pool start {start} after end {end}"
			)));
		}
		if start <= self.node_pool_end {
			return Err(CoreError::InvalidArgument(format!(
				"client pool start {start} overlaps node pool ending at {}",
				self.node_pool_end
			)));
		}
		self.client_pool_start = start;
		self.client_pool_end = end;
		Ok(self)
	}

	/// Inclusive bounds of a pool.
	pub fn pool_range(&self, pool: PoolKind) -> (Ipv4Addr, Ipv4Addr) {
		match pool {
			PoolKind::Node => (self.node_pool_start, self.node_pool_end),
			PoolKind::Client => (self.client_pool_start, self.client_pool_end),
		}
	}

	/// Number of addresses in a pool.
	pub fn pool_size(&self, pool: PoolKind) -> u32 {
		let (start, end) = self.pool_range(pool);
		u32::from(end) - u32::from(start) + 1
	}

	/// Which pool, if any, an address falls into. The Hub address belongs
	/// to neither.
	pub fn pool_of(&self, addr: Ipv4Addr) -> Option<PoolKind> {
		if addr >= self.node_pool_start && addr <= self.node_pool_end {
			Some(PoolKind::Node)
		} else if addr >= self.client_pool_start && addr <= self.client_pool_end {
			Some(PoolKind::Client)
		} else {
			None
		}
	}

	/// Ascending iterator over a pool's addresses.
	pub fn pool_addrs(&self, pool: PoolKind) -> impl Iterator<Item = Ipv4Addr> {
		let (start, end) = self.pool_range(pool);
		(u32::from(start)..=u32::from(end)).map(Ipv4Addr::from)
	}
}

impl Default for OverlaySettings {
	fn default() -> Self {
		Self::for_network("10.10.0.0/24".parse().expect("valid default network"), 51820)
			.expect("default layout fits a /24")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_layout() {
		let settings = OverlaySettings::default();
		assert_eq!(settings.hub_addr, Ipv4Addr::new(10, 10, 0, 1));
		assert_eq!(settings.node_pool_start, Ipv4Addr::new(10, 10, 0, 2));
		assert_eq!(settings.node_pool_end, Ipv4Addr::new(10, 10, 0, 99));
		assert_eq!(settings.client_pool_start, Ipv4Addr::new(10, 10, 0, 100));
		assert_eq!(settings.client_pool_end, Ipv4Addr::new(10, 10, 0, 250));
	}

	#[test]
	fn test_pool_membership() {
		let settings = OverlaySettings::default();
		assert_eq!(settings.pool_of(Ipv4Addr::new(10, 10, 0, 1)), None);
		assert_eq!(
			settings.pool_of(Ipv4Addr::new(10, 10, 0, 2)),
			Some(PoolKind::Node)
		);
		assert_eq!(
			settings.pool_of(Ipv4Addr::new(10, 10, 0, 99)),
			Some(PoolKind::Node)
		);
		assert_eq!(
			settings.pool_of(Ipv4Addr::new(10, 10, 0, 100)),
			Some(PoolKind::Client)
		);
		assert_eq!(
			settings.pool_of(Ipv4Addr::new(10, 10, 0, 250)),
			Some(PoolKind::Client)
		);
		assert_eq!(settings.pool_of(Ipv4Addr::new(10, 10, 0, 251)), None);
		assert_eq!(settings.pool_of(Ipv4Addr::new(192, 168, 1, 5)), None);
	}

	#[test]
	fn test_pool_sizes() {
		let settings = OverlaySettings::default();
		assert_eq!(settings.pool_size(PoolKind::Node), 98);
		assert_eq!(settings.pool_size(PoolKind::Client), 151);
	}

	#[test]
	fn test_pool_addrs_ascend() {
		let settings = OverlaySettings::default();
		let first: Vec<Ipv4Addr> = settings.pool_addrs(PoolKind::Node).take(3).collect();
		assert_eq!(
			first,
			vec![
				Ipv4Addr::new(10, 10, 0, 2),
				Ipv4Addr::new(10, 10, 0, 3),
				Ipv4Addr::new(10, 10, 0, 4),
			]
		);
	}

	#[test]
	fn test_client_pool_override_rejects_overlap() {
		let settings = OverlaySettings::default();
		let err = settings
			.clone()
			.with_client_pool(Ipv4Addr::new(10, 10, 0, 50), Ipv4Addr::new(10, 10, 0, 200));
		assert!(err.is_err());

		let ok = settings
			.with_client_pool(Ipv4Addr::new(10, 10, 0, 120), Ipv4Addr::new(10, 10, 0, 240));
		assert!(ok.is_ok());
	}

	#[test]
	fn test_too_small_network_rejected() {
		let net: Ipv4Net = "10.10.0.0/28".parse().unwrap();
		assert!(OverlaySettings::for_network(net, 51820).is_err());
	}
}
