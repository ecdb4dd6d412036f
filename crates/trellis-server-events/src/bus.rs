// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process fan-out of committed events.
//!
//! Delivery is at-least-once in id order per subscriber, with a bounded
//! buffer. A subscriber that falls more than the buffer behind observes
//! `RecvError::Lagged` and must resume by re-reading the event store from
//! its last seen id before re-attaching; the stream route does exactly
//! that.

use tokio::sync::broadcast;
use tracing::instrument;

use crate::event::EventRecord;

/// Per-subscriber buffer depth before a slow consumer is marked lagging
/// and dropped from live delivery.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
	tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		Self { tx }
	}

	/// Publish a committed event to all live subscribers. Lagging or absent
	/// subscribers are not an error; they recover through the store.
	#[instrument(skip(self, record), fields(event_id = record.id, event_type = record.event.event_type()))]
	pub fn publish(&self, record: EventRecord) {
		let _ = self.tx.send(record);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
		self.tx.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.tx.receiver_count()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(DEFAULT_BUS_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::{AggregateType, DomainEvent};
	use trellis_common_core::NodeId;

	fn record(id: i64) -> EventRecord {
		let node_id = NodeId::new();
		EventRecord {
			id,
			aggregate_type: AggregateType::Node,
			aggregate_id: node_id.to_string(),
			aggregate_version: 1,
			event: DomainEvent::NodeResumed { node_id },
			actor: "test".to_string(),
			created_at: chrono::Utc::now(),
		}
	}

	#[tokio::test]
	async fn test_subscribers_receive_in_order() {
		let bus = EventBus::default();
		let mut rx = bus.subscribe();

		bus.publish(record(1));
		bus.publish(record(2));

		assert_eq!(rx.recv().await.unwrap().id, 1);
		assert_eq!(rx.recv().await.unwrap().id, 2);
	}

	#[tokio::test]
	async fn test_publish_without_subscribers_is_fine() {
		let bus = EventBus::default();
		bus.publish(record(1));
		assert_eq!(bus.subscriber_count(), 0);
	}

	#[tokio::test]
	async fn test_slow_subscriber_observes_lag() {
		let bus = EventBus::new(4);
		let mut rx = bus.subscribe();

		for id in 0..16 {
			bus.publish(record(id));
		}

		match rx.recv().await {
			Err(broadcast::error::RecvError::Lagged(missed)) => {
				assert!(missed > 0);
			}
			other => panic!("expected lag, got {other:?}"),
		}
	}
}
