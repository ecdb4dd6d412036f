// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The server-push event stream: one long-running response carrying
//! newline-delimited JSON frames, shared by agents and dashboards.
//!
//! A subscriber attaches to the bus first, then catches up from the
//! store, so no event between cursor and head can be missed. If the
//! subscriber falls behind the bus buffer it re-reads the store from its
//! cursor instead of dropping events: at-least-once, in id order.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::auth::{authenticate_node, is_admin};
use crate::error::ServerResult;
use crate::state::AppState;
use trellis_server_events::EventRecord;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const CATCHUP_BATCH: i64 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
	#[serde(default)]
	pub since_id: Option<i64>,
}

/// One newline-terminated JSON frame.
fn to_frame(record: &EventRecord) -> Vec<u8> {
	let mut frame = serde_json::to_vec(record).expect("event serialization is infallible");
	frame.push(b'\n');
	frame
}

/// GET /api/v1/events?since_id=N (node token or admin).
///
/// Agents see only the events that can affect their plan; admin
/// subscribers see everything.
pub async fn stream(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<StreamQuery>,
) -> ServerResult<Response> {
	let admin = is_admin(&state, &headers);
	if !admin {
		authenticate_node(&state, &headers).await?;
	}

	// Attach to the bus before reading the head so nothing commits into
	// the gap between catch-up and live delivery.
	let mut bus_rx = state.bus().subscribe();
	let mut cursor = match query.since_id {
		Some(id) => id,
		None => state.store.head_id().await?,
	};
	let store = state.store.clone();

	let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, Infallible>>(64);

	tokio::spawn(async move {
		let wants = |record: &EventRecord| admin || record.event.affects_plans();

		// Catch up from the store before draining live deliveries.
		loop {
			let batch = match store.read_since(cursor, CATCHUP_BATCH).await {
				Ok(batch) => batch,
				Err(e) => {
					debug!(error = %e, "event stream catch-up failed");
					return;
				}
			};
			if batch.is_empty() {
				break;
			}
			for record in batch {
				cursor = record.id;
				if wants(&record) && tx.send(Ok(to_frame(&record))).await.is_err() {
					return;
				}
			}
		}

		let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
		keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				received = bus_rx.recv() => match received {
					Ok(record) => {
						// Already delivered during catch-up.
						if record.id <= cursor {
							continue;
						}
						cursor = record.id;
						if wants(&record) && tx.send(Ok(to_frame(&record))).await.is_err() {
							return;
						}
					}
					Err(RecvError::Lagged(missed)) => {
						// Fell behind the bus buffer: recover from the store.
						debug!(missed, "event stream lagged, re-reading store");
						loop {
							let batch = match store.read_since(cursor, CATCHUP_BATCH).await {
								Ok(batch) => batch,
								Err(_) => return,
							};
							if batch.is_empty() {
								break;
							}
							for record in batch {
								cursor = record.id;
								if wants(&record)
									&& tx.send(Ok(to_frame(&record))).await.is_err()
								{
									return;
								}
							}
						}
					}
					Err(RecvError::Closed) => return,
				},

				_ = keepalive.tick() => {
					if tx.send(Ok(b"{\"type\":\"ping\"}\n".to_vec())).await.is_err() {
						return;
					}
				}
			}
		}
	});

	let body = Body::from_stream(ReceiverStream::new(rx));
	Ok((
		[
			(header::CONTENT_TYPE, "application/x-ndjson"),
			(header::CACHE_CONTROL, "no-cache"),
		],
		body,
	)
		.into_response())
}
