// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Best-effort host metrics for the heartbeat.
//!
//! Everything here degrades to zero rather than failing the heartbeat: a
//! missing /proc file or an absent journalctl must never take the
//! enforcement loop down.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::AgentMetrics;
use crate::commands::CommandRunner;
use crate::firewall::CHAIN_NAME;

/// Cumulative (busy, total) jiffies from /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuSample {
	busy: u64,
	total: u64,
}

pub struct Collectors {
	runner: Arc<dyn CommandRunner>,
	last_cpu: Mutex<Option<CpuSample>>,
	last_drop_packets: Mutex<Option<u64>>,
}

impl Collectors {
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self {
			runner,
			last_cpu: Mutex::new(None),
			last_drop_packets: Mutex::new(None),
		}
	}

	pub async fn collect(&self) -> AgentMetrics {
		let (connections_total, connections_time_wait) = read_connection_counts().await;

		AgentMetrics {
			cpu_percent: self.cpu_percent().await,
			memory_percent: read_memory_percent().await,
			disk_percent: self.disk_percent().await,
			suspicious_processes: 0,
			connections_total,
			connections_time_wait,
			ssh_failures: self.ssh_failures().await,
			firewall_violations: self.firewall_violations().await,
		}
	}

	/// Busy fraction between this sample and the previous one.
	async fn cpu_percent(&self) -> f64 {
		let Some(sample) = read_cpu_sample().await else {
			return 0.0;
		};
		let mut last = self.last_cpu.lock().await;
		let previous = last.replace(sample);

		match previous {
			Some(prev) if sample.total > prev.total => {
				let busy = sample.busy.saturating_sub(prev.busy) as f64;
				let total = (sample.total - prev.total) as f64;
				(busy / total * 100.0).clamp(0.0, 100.0)
			}
			// First sample of the process lifetime.
			_ => 0.0,
		}
	}

	async fn disk_percent(&self) -> f64 {
		let Ok(output) = self.runner.run("df", &["-P", "/"], None).await else {
			return 0.0;
		};
		if !output.success {
			return 0.0;
		}
		parse_df_use_percent(&output.stdout).unwrap_or(0.0)
	}

	/// Failed SSH logins in the last ten minutes, from the journal.
	async fn ssh_failures(&self) -> u32 {
		let result = self
			.runner
			.run(
				"journalctl",
				&[
					"-u",
					"ssh",
					"-u",
					"sshd",
					"--since",
					"-10m",
					"--no-pager",
					"-g",
					"Failed password",
				],
				None,
			)
			.await;

		match result {
			Ok(output) if output.success => output
				.stdout
				.lines()
				.filter(|l| l.contains("Failed password"))
				.count() as u32,
			_ => 0,
		}
	}

	/// Packets newly dropped by the ZT_ACL trailing DROP since the last
	/// sample.
	async fn firewall_violations(&self) -> u32 {
		let result = self
			.runner
			.run("iptables", &["-nvxL", CHAIN_NAME], None)
			.await;
		let Ok(output) = result else {
			return 0;
		};
		if !output.success {
			return 0;
		}
		let Some(current) = parse_drop_packets(&output.stdout) else {
			return 0;
		};

		let mut last = self.last_drop_packets.lock().await;
		let previous = last.replace(current);
		match previous {
			Some(prev) if current >= prev => (current - prev).min(u32::MAX as u64) as u32,
			// Counter reset (chain rebuilt) or first sample.
			_ => 0,
		}
	}
}

async fn read_cpu_sample() -> Option<CpuSample> {
	let stat = tokio::fs::read_to_string("/proc/stat").await.ok()?;
	let line = stat.lines().next()?;
	let values: Vec<u64> = line
		.split_whitespace()
		.skip(1)
		.filter_map(|v| v.parse().ok())
		.collect();
	if values.len() < 4 {
		return None;
	}
	let total: u64 = values.iter().sum();
	let idle = values[3] + values.get(4).copied().unwrap_or(0);
	Some(CpuSample {
		busy: total.saturating_sub(idle),
		total,
	})
}

async fn read_memory_percent() -> f64 {
	let Ok(meminfo) = tokio::fs::read_to_string("/proc/meminfo").await else {
		return 0.0;
	};

	let mut total: Option<f64> = None;
	let mut available: Option<f64> = None;
	for line in meminfo.lines() {
		if let Some(rest) = line.strip_prefix("MemTotal:") {
			total = rest.split_whitespace().next().and_then(|v| v.parse().ok());
		} else if let Some(rest) = line.strip_prefix("MemAvailable:") {
			available = rest.split_whitespace().next().and_then(|v| v.parse().ok());
		}
	}

	match (total, available) {
		(Some(total), Some(available)) if total > 0.0 => {
			((total - available) / total * 100.0).clamp(0.0, 100.0)
		}
		_ => 0.0,
	}
}

/// Socket counts from /proc/net/tcp and tcp6. TIME_WAIT is state 06.
async fn read_connection_counts() -> (u32, u32) {
	let mut total: u32 = 0;
	let mut time_wait: u32 = 0;

	for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
		let Ok(content) = tokio::fs::read_to_string(path).await else {
			continue;
		};
		for line in content.lines().skip(1) {
			let Some(state) = line.split_whitespace().nth(3) else {
				continue;
			};
			total += 1;
			if state == "06" {
				time_wait += 1;
			}
		}
	}

	(total, time_wait)
}

fn parse_df_use_percent(stdout: &str) -> Option<f64> {
	let line = stdout.lines().nth(1)?;
	let field = line.split_whitespace().nth(4)?;
	field.trim_end_matches('%').parse().ok()
}

/// The packet counter on the chain's unconditional DROP row.
fn parse_drop_packets(stdout: &str) -> Option<u64> {
	for line in stdout.lines().rev() {
		let fields: Vec<&str> = line.split_whitespace().collect();
		// pkts bytes target prot opt in out source destination
		if fields.get(2) == Some(&"DROP")
			&& fields.get(7) == Some(&"0.0.0.0/0")
			&& fields.get(8) == Some(&"0.0.0.0/0")
		{
			return fields[0].parse().ok();
		}
	}
	None
}
