// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Trellis node agent binary.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trellis_agent::commands::SystemRunner;
use trellis_agent::{AgentConfig, AgentDaemon, AgentError};
use trellis_common_core::exit_code;

/// Trellis node agent - enforces the overlay plan on this host.
#[derive(Parser, Debug)]
#[command(name = "trellis-agent", about = "Trellis overlay network node agent", version)]
struct Args {
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the enforcement loop (default).
	Run,
}

fn exit_code_for(err: &AgentError) -> i32 {
	match err {
		AgentError::Config(_) | AgentError::FirewallUnavailable(_) => exit_code::CONFIG,
		AgentError::Rejected { status: 401, .. } | AgentError::Rejected { status: 403, .. } => {
			exit_code::AUTH
		}
		AgentError::Rejected { status: 409, .. } => exit_code::CONFLICT,
		AgentError::Http(_) => exit_code::NETWORK,
		_ => exit_code::FAILURE,
	}
}

#[tokio::main]
async fn main() {
	let _args = Args::parse();

	dotenvy::dotenv().ok();

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let config = match AgentConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			tracing::error!(error = %e, "configuration error");
			std::process::exit(exit_code::CONFIG);
		}
	};

	tracing::info!(
		hub = %config.hub_url,
		hostname = %config.hostname,
		role = %config.role,
		interface = %config.interface,
		"starting trellis-agent"
	);

	let mut daemon = match AgentDaemon::new(config, Arc::new(SystemRunner)) {
		Ok(daemon) => daemon,
		Err(e) => {
			tracing::error!(error = %e, "failed to initialize agent");
			std::process::exit(exit_code_for(&e));
		}
	};

	let shutdown = daemon.shutdown_handle();
	tokio::spawn(async move {
		let _ = tokio::signal::ctrl_c().await;
		tracing::info!("interrupt received");
		let _ = shutdown.send(true);
	});

	if let Err(e) = daemon.run().await {
		tracing::error!(error = %e, "agent failed");
		std::process::exit(exit_code_for(&e));
	}

	tracing::info!("trellis-agent stopped");
}
