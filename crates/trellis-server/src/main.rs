// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Trellis control plane server binary.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trellis_common_core::exit_code;
use trellis_server::{create_app_state, load_config};

/// Trellis control plane - Zero Trust overlay network controller.
#[derive(Parser, Debug)]
#[command(name = "trellis-server", about = "Trellis overlay network control plane", version)]
struct Args {
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the control plane (default).
	Serve,
	/// Rebuild the projection tables from the event log and exit.
	Rebuild,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();

	dotenvy::dotenv().ok();

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let config = match load_config() {
		Ok(config) => config,
		Err(e) => {
			tracing::error!(error = %e, "configuration error");
			std::process::exit(exit_code::CONFIG);
		}
	};

	let pool = match trellis_server_db::create_pool(&config.database_url).await {
		Ok(pool) => pool,
		Err(e) => {
			tracing::error!(error = %e, database = %config.database_url, "failed to open database");
			std::process::exit(exit_code::FAILURE);
		}
	};

	if let Err(e) = trellis_server_db::migrations::run_migrations(&pool).await {
		tracing::error!(error = %e, "migrations failed");
		std::process::exit(exit_code::FAILURE);
	}

	if let Some(Command::Rebuild) = args.command {
		match trellis_server_db::projection::rebuild(&pool).await {
			Ok(applied) => {
				tracing::info!(applied, "projection rebuilt");
				return;
			}
			Err(e) => {
				tracing::error!(error = %e, "projection rebuild failed");
				std::process::exit(exit_code::FAILURE);
			}
		}
	}

	tracing::info!(
		bind = %config.bind_addr,
		port = config.api_port,
		overlay = %config.overlay.network,
		database = %config.database_url,
		"starting trellis-server"
	);

	let addr = SocketAddr::new(config.bind_addr, config.api_port);
	let state = create_app_state(pool, config).await;

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	let sweep = trellis_server::jobs::spawn_device_expiry_sweep(state.clone(), shutdown_rx);

	let app = trellis_server::routes::router(state)
		.layer(TraceLayer::new_for_http())
		.layer(
			CorsLayer::new()
				.allow_methods(Any)
				.allow_headers(Any)
				.allow_origin(Any),
		);

	let listener = match tokio::net::TcpListener::bind(addr).await {
		Ok(listener) => listener,
		Err(e) => {
			tracing::error!(error = %e, %addr, "failed to bind");
			std::process::exit(exit_code::NETWORK);
		}
	};

	tracing::info!(%addr, "listening");

	let serve = axum::serve(listener, app).with_graceful_shutdown(async {
		let _ = tokio::signal::ctrl_c().await;
		tracing::info!("shutdown signal received");
	});

	if let Err(e) = serve.await {
		tracing::error!(error = %e, "server error");
		let _ = shutdown_tx.send(true);
		std::process::exit(exit_code::FAILURE);
	}

	let _ = shutdown_tx.send(true);
	let _ = sweep.await;
	tracing::info!("trellis-server stopped");
}
