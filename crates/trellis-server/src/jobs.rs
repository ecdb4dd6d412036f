// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Background jobs, started from the server bootstrap and stopped through
//! the shared shutdown signal.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::state::AppState;

const DEVICE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically revoke expired client devices.
pub fn spawn_device_expiry_sweep(
	state: AppState,
	mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(DEVICE_SWEEP_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						info!("device expiry sweep stopping");
						break;
					}
				}

				_ = ticker.tick() => {
					if let Err(e) = state.sweep_expired_devices().await {
						error!(error = %e, "device expiry sweep failed");
					}
				}
			}
		}
	})
}
