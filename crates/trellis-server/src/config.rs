// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Server configuration: defaults overlaid by environment variables.
//!
//! The layer struct carries every value as an `Option`; `finalize`
//! resolves defaults and rejects inconsistencies. Secrets are required:
//! the server refuses to start without `ADMIN_SECRET` and `SECRET_KEY`.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;
use thiserror::Error;
use trellis_common_core::OverlaySettings;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("missing required environment variable {0}")]
	MissingVar(&'static str),

	#[error("invalid value for {var}: {message}")]
	InvalidVar { var: &'static str, message: String },
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub bind_addr: IpAddr,
	pub api_port: u16,
	pub database_url: String,
	pub admin_secret: String,
	pub secret_key: String,
	pub overlay: OverlaySettings,
	/// Public `host:port` of the Hub's WireGuard endpoint, if fixed by
	/// deployment; otherwise derived from the Hub node's real IP.
	pub hub_endpoint: Option<String>,
	pub auto_approve: bool,
	pub heartbeat_interval_secs: u64,
	pub ip_cooldown_hours: i64,
	pub client_default_expires_days: i64,
	pub client_max_devices_per_user: i64,
	/// Burn config tokens on first retrieval instead of letting them live
	/// until device expiry.
	pub client_config_single_use: bool,
}

/// Partial configuration, merged from environment.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigLayer {
	pub bind_addr: Option<IpAddr>,
	pub api_port: Option<u16>,
	pub database_url: Option<String>,
	pub admin_secret: Option<String>,
	pub secret_key: Option<String>,
	pub overlay_network: Option<Ipv4Net>,
	pub wg_port: Option<u16>,
	pub client_pool_start: Option<Ipv4Addr>,
	pub client_pool_end: Option<Ipv4Addr>,
	pub hub_endpoint: Option<String>,
	pub auto_approve: Option<bool>,
	pub heartbeat_interval_secs: Option<u64>,
	pub ip_cooldown_hours: Option<i64>,
	pub client_default_expires_days: Option<i64>,
	pub client_max_devices_per_user: Option<i64>,
	pub client_config_single_use: Option<bool>,
}

fn parse_var<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
	T::Err: std::fmt::Display,
{
	match std::env::var(var) {
		Ok(value) => value
			.trim()
			.parse()
			.map(Some)
			.map_err(|e: T::Err| ConfigError::InvalidVar {
				var,
				message: e.to_string(),
			}),
		Err(_) => Ok(None),
	}
}

fn parse_bool_var(var: &'static str) -> Result<Option<bool>, ConfigError> {
	match std::env::var(var) {
		Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => Ok(Some(true)),
			"0" | "false" | "no" | "off" => Ok(Some(false)),
			other => Err(ConfigError::InvalidVar {
				var,
				message: format!("expected boolean, got {other:?}"),
			}),
		},
		Err(_) => Ok(None),
	}
}

impl ServerConfigLayer {
	pub fn from_env() -> Result<Self, ConfigError> {
		Ok(Self {
			bind_addr: parse_var("HUB_API_BIND")?,
			api_port: parse_var("HUB_API_PORT")?,
			database_url: std::env::var("DATABASE_URL").ok(),
			admin_secret: std::env::var("ADMIN_SECRET").ok(),
			secret_key: std::env::var("SECRET_KEY").ok(),
			overlay_network: parse_var("OVERLAY_NETWORK")?,
			wg_port: parse_var("WG_PORT")?,
			client_pool_start: parse_var("CLIENT_IP_POOL_START")?,
			client_pool_end: parse_var("CLIENT_IP_POOL_END")?,
			hub_endpoint: std::env::var("HUB_ENDPOINT").ok(),
			auto_approve: parse_bool_var("NODE_AUTO_APPROVE")?,
			heartbeat_interval_secs: parse_var("HEARTBEAT_INTERVAL_SECS")?,
			ip_cooldown_hours: parse_var("IP_COOLDOWN_HOURS")?,
			client_default_expires_days: parse_var("CLIENT_DEFAULT_EXPIRES_DAYS")?,
			client_max_devices_per_user: parse_var("CLIENT_MAX_DEVICES_PER_USER")?,
			client_config_single_use: parse_bool_var("CLIENT_CONFIG_SINGLE_USE")?,
		})
	}

	pub fn merge(&mut self, other: ServerConfigLayer) {
		macro_rules! take {
			($($field:ident),* $(,)?) => {
				$(if other.$field.is_some() {
					self.$field = other.$field;
				})*
			};
		}
		take!(
			bind_addr,
			api_port,
			database_url,
			admin_secret,
			secret_key,
			overlay_network,
			wg_port,
			client_pool_start,
			client_pool_end,
			hub_endpoint,
			auto_approve,
			heartbeat_interval_secs,
			ip_cooldown_hours,
			client_default_expires_days,
			client_max_devices_per_user,
			client_config_single_use,
		);
	}

	pub fn finalize(self) -> Result<ServerConfig, ConfigError> {
		let admin_secret = self
			.admin_secret
			.filter(|s| !s.is_empty())
			.ok_or(ConfigError::MissingVar("ADMIN_SECRET"))?;
		let secret_key = self
			.secret_key
			.filter(|s| !s.is_empty())
			.ok_or(ConfigError::MissingVar("SECRET_KEY"))?;

		let network = self
			.overlay_network
			.unwrap_or_else(|| "10.10.0.0/24".parse().expect("valid default network"));
		let wg_port = self.wg_port.unwrap_or(51820);

		let mut overlay = OverlaySettings::for_network(network, wg_port).map_err(|e| {
			ConfigError::InvalidVar {
				var: "OVERLAY_NETWORK",
				message: e.to_string(),
			}
		})?;
		if let (Some(start), Some(end)) = (self.client_pool_start, self.client_pool_end) {
			overlay = overlay
				.with_client_pool(start, end)
				.map_err(|e| ConfigError::InvalidVar {
					var: "CLIENT_IP_POOL_START",
					message: e.to_string(),
				})?;
		}

		Ok(ServerConfig {
			bind_addr: self
				.bind_addr
				.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
			api_port: self.api_port.unwrap_or(8080),
			database_url: self
				.database_url
				.unwrap_or_else(|| "sqlite:./trellis.db".to_string()),
			admin_secret,
			secret_key,
			overlay,
			hub_endpoint: self.hub_endpoint,
			auto_approve: self.auto_approve.unwrap_or(false),
			heartbeat_interval_secs: self.heartbeat_interval_secs.unwrap_or(60),
			ip_cooldown_hours: self.ip_cooldown_hours.unwrap_or(24),
			client_default_expires_days: self.client_default_expires_days.unwrap_or(7),
			client_max_devices_per_user: self.client_max_devices_per_user.unwrap_or(5),
			client_config_single_use: self.client_config_single_use.unwrap_or(false),
		})
	}
}

/// Load configuration from the environment.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
	ServerConfigLayer::from_env()?.finalize()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_layer() -> ServerConfigLayer {
		ServerConfigLayer {
			admin_secret: Some("admin-secret".to_string()),
			secret_key: Some("master-key".to_string()),
			..Default::default()
		}
	}

	#[test]
	fn test_defaults() {
		let config = base_layer().finalize().unwrap();
		assert_eq!(config.api_port, 8080);
		assert_eq!(config.overlay.network.to_string(), "10.10.0.0/24");
		assert_eq!(config.overlay.wg_port, 51820);
		assert_eq!(config.heartbeat_interval_secs, 60);
		assert_eq!(config.ip_cooldown_hours, 24);
		assert!(!config.auto_approve);
	}

	#[test]
	fn test_missing_secrets_rejected() {
		let err = ServerConfigLayer::default().finalize().unwrap_err();
		assert!(matches!(err, ConfigError::MissingVar("ADMIN_SECRET")));

		let mut layer = ServerConfigLayer::default();
		layer.admin_secret = Some("x".to_string());
		let err = layer.finalize().unwrap_err();
		assert!(matches!(err, ConfigError::MissingVar("SECRET_KEY")));
	}

	#[test]
	fn test_client_pool_override() {
		let mut layer = base_layer();
		layer.client_pool_start = Some("10.10.0.150".parse().unwrap());
		layer.client_pool_end = Some("10.10.0.200".parse().unwrap());
		let config = layer.finalize().unwrap();
		assert_eq!(
			config.overlay.client_pool_start,
			"10.10.0.150".parse::<Ipv4Addr>().unwrap()
		);
	}

	#[test]
	fn test_merge_prefers_other() {
		let mut base = base_layer();
		base.api_port = Some(8080);
		let mut other = ServerConfigLayer::default();
		other.api_port = Some(9000);
		base.merge(other);
		assert_eq!(base.api_port, Some(9000));
	}
}
