// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Dynamic trust scoring.
//!
//! ```text
//! score = 0.30 * role_weight
//!       + 0.25 * device_health
//!       + 0.25 * behavior
//!       + 0.20 * security_events
//! ```
//!
//! Each factor is normalized to [0, 100]. While a security incident is
//! active the score additionally ratchets downward from its previous
//! value, so sustained abuse reaches the critical band even though the
//! weighted sum alone would plateau; a clean report restores the
//! instantaneous score on the next heartbeat.

use serde::{Deserialize, Serialize};

use trellis_common_core::{NodeRole, RiskLevel, TrustAction};

/// Metrics reported with a heartbeat, feeding the factor sub-scores.
/// Everything defaults to zero so partial agent payloads degrade softly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
	#[serde(default)]
	pub cpu_percent: f64,
	#[serde(default)]
	pub memory_percent: f64,
	#[serde(default)]
	pub disk_percent: f64,
	#[serde(default)]
	pub suspicious_processes: u32,
	#[serde(default)]
	pub connections_total: u32,
	#[serde(default)]
	pub connections_time_wait: u32,
	#[serde(default)]
	pub handshake_latency_ms: Option<u32>,
	#[serde(default)]
	pub ssh_failures: u32,
	#[serde(default)]
	pub firewall_violations: u32,
	#[serde(default)]
	pub port_scans: u32,
}

/// The outcome of one scoring pass.
#[derive(Debug, Clone, Serialize)]
pub struct TrustAssessment {
	pub score: u8,
	pub previous_score: u8,
	pub risk_level: RiskLevel,
	pub action: TrustAction,
	pub role_score: u8,
	pub device_health_score: u8,
	pub behavior_score: u8,
	pub security_score: u8,
}

impl TrustAssessment {
	/// Identical consecutive scores suppress event emission.
	pub fn changed(&self) -> bool {
		self.score != self.previous_score
	}
}

/// Downward ratchet applied per assessment while an incident is active.
const INCIDENT_RATCHET: u8 = 15;

/// A security factor below this marks an active incident.
const INCIDENT_THRESHOLD: u8 = 50;

#[derive(Debug, Clone, Default)]
pub struct TrustEngine;

impl TrustEngine {
	pub fn new() -> Self {
		Self
	}

	/// Static per-role base weight: operators above infrastructure above
	/// end-user devices.
	pub fn role_weight(role: NodeRole) -> u8 {
		match role {
			NodeRole::Ops => 100,
			NodeRole::Hub => 95,
			NodeRole::Db => 85,
			NodeRole::App => 80,
			NodeRole::Monitor => 75,
			NodeRole::Gateway => 70,
			NodeRole::Client => 60,
		}
	}

	fn device_health(metrics: &HeartbeatMetrics) -> u8 {
		let mut score: i32 = 100;

		if metrics.cpu_percent > 95.0 {
			score -= 40;
		} else if metrics.cpu_percent > 85.0 {
			score -= 20;
		} else if metrics.cpu_percent > 70.0 {
			score -= 10;
		}

		if metrics.memory_percent > 95.0 {
			score -= 30;
		} else if metrics.memory_percent > 85.0 {
			score -= 15;
		} else if metrics.memory_percent > 75.0 {
			score -= 5;
		}

		if metrics.disk_percent > 95.0 {
			score -= 30;
		} else if metrics.disk_percent > 90.0 {
			score -= 15;
		}

		if metrics.suspicious_processes > 0 {
			score -= 50;
		}

		score.clamp(0, 100) as u8
	}

	fn behavior(heartbeat_gap_secs: Option<i64>, metrics: &HeartbeatMetrics) -> u8 {
		let mut score: i32 = 100;

		match heartbeat_gap_secs {
			Some(gap) if gap > 300 => score -= 20,
			Some(gap) if gap > 180 => score -= 10,
			_ => {}
		}

		if metrics.connections_total > 500 {
			score -= 30;
		} else if metrics.connections_total > 200 {
			score -= 10;
		}

		if metrics.connections_time_wait > 100 {
			score -= 20;
		} else if metrics.connections_time_wait > 50 {
			score -= 10;
		}

		if let Some(latency) = metrics.handshake_latency_ms {
			if latency > 2000 {
				score -= 20;
			} else if latency > 500 {
				score -= 10;
			}
		}

		score.clamp(0, 100) as u8
	}

	fn security(metrics: &HeartbeatMetrics) -> u8 {
		let mut score: i32 = 100;

		if metrics.ssh_failures >= 50 {
			score -= 40;
		} else if metrics.ssh_failures >= 10 {
			score -= 15;
		}

		if metrics.firewall_violations >= 20 {
			score -= 30;
		} else if metrics.firewall_violations >= 5 {
			score -= 10;
		}

		if metrics.port_scans > 0 {
			score -= 30;
		}

		score.clamp(0, 100) as u8
	}

	/// Score one node from its latest heartbeat.
	///
	/// `heartbeat_gap_secs` is the time since the previous heartbeat, if
	/// one was ever seen.
	#[tracing::instrument(skip(self, metrics))]
	pub fn assess(
		&self,
		role: NodeRole,
		previous_score: u8,
		heartbeat_gap_secs: Option<i64>,
		metrics: &HeartbeatMetrics,
	) -> TrustAssessment {
		let role_score = Self::role_weight(role);
		let device_health_score = Self::device_health(metrics);
		let behavior_score = Self::behavior(heartbeat_gap_secs, metrics);
		let security_score = Self::security(metrics);

		let weighted = 0.30 * f64::from(role_score)
			+ 0.25 * f64::from(device_health_score)
			+ 0.25 * f64::from(behavior_score)
			+ 0.20 * f64::from(security_score);
		let instantaneous = weighted.round().clamp(0.0, 100.0) as u8;

		let score = if security_score < INCIDENT_THRESHOLD {
			instantaneous.min(previous_score.saturating_sub(INCIDENT_RATCHET))
		} else {
			instantaneous
		};

		let risk_level = RiskLevel::from_score(score);
		let action = TrustAction::for_risk(risk_level);

		TrustAssessment {
			score,
			previous_score,
			risk_level,
			action,
			role_score,
			device_health_score,
			behavior_score,
			security_score,
		}
	}
}
