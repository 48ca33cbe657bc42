// Copyright 2025 itscheems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use tracing::debug;
use verdict_sdk::{BalanceView, Outcome, PositionView, RejectReason};

use crate::types::{Order, Trade};

/// How a balance changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceUpdateKind {
	Lock,
	Unlock,
	TradeBuy,
	TradeSell,
	Set,
	Add,
}

/// How a share position changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionUpdateKind {
	Lock,
	Unlock,
	TradeBuy,
	TradeSell,
	Set,
}

/// What happened to the book at a price level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookUpdateKind {
	Add,
	Remove,
	Trade,
}

/// Domain events produced by the core for external consumers
///
/// This stream is the engine's only outward surface besides the read API:
/// market-data publishers, websocket fanout and follow-up persistence all
/// hang off it. Events are emitted in processing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DomainEvent {
	OrderSequenced {
		order: Order,
	},
	OrderRejected {
		#[serde(skip_serializing_if = "Option::is_none")]
		order_id: Option<String>,
		user_id: String,
		reason: RejectReason,
		message: String,
	},
	Trade {
		trade: Trade,
	},
	OrderBookUpdate {
		market_id: String,
		outcome: Outcome,
		kind: BookUpdateKind,
		order_id: String,
		price: rust_decimal::Decimal,
		quantity: u64,
	},
	OrderFilled {
		order: Order,
	},
	OrderPartialFill {
		order: Order,
	},
	OrderCancelled {
		order: Order,
	},
	BalanceUpdated {
		user_id: String,
		kind: BalanceUpdateKind,
		balance: BalanceView,
	},
	PositionUpdated {
		user_id: String,
		kind: PositionUpdateKind,
		position: PositionView,
	},
}

/// Fan-out channel from the engine to its subscribers
///
/// Each subscriber gets its own bounded channel. Publishing never blocks
/// the engine: a consumer that cannot keep up has its messages dropped,
/// and a disconnected consumer is pruned on the next publish.
#[derive(Clone)]
pub struct EventBus {
	inner: Arc<Mutex<Vec<Sender<DomainEvent>>>>,
	capacity: usize,
}

impl EventBus {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Vec::new())),
			capacity,
		}
	}

	/// Register a new subscriber and return its receiving end
	pub fn subscribe(&self) -> Receiver<DomainEvent> {
		let (tx, rx) = bounded(self.capacity);
		if let Ok(mut subscribers) = self.inner.lock() {
			subscribers.push(tx);
		}
		rx
	}

	/// Deliver an event to every live subscriber
	pub fn publish(&self, event: DomainEvent) {
		let Ok(mut subscribers) = self.inner.lock() else {
			return;
		};
		subscribers.retain(|tx| match tx.try_send(event.clone()) {
			Ok(()) => true,
			Err(TrySendError::Full(_)) => {
				debug!(target: "events", "subscriber lagging, event dropped");
				true
			}
			Err(TrySendError::Disconnected(_)) => false,
		});
	}

	pub fn subscriber_count(&self) -> usize {
		self.inner.lock().map(|s| s.len()).unwrap_or(0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rust_decimal::Decimal;

	fn trade_event(id: &str) -> DomainEvent {
		DomainEvent::Trade {
			trade: Trade {
				id: id.to_string(),
				market_id: "mkt-1".to_string(),
				outcome: Outcome::Yes,
				buy_order_id: "b".to_string(),
				sell_order_id: "s".to_string(),
				buyer_id: "u1".to_string(),
				seller_id: "u2".to_string(),
				quantity: 1,
				price: Decimal::new(55, 2),
				total: Decimal::new(55, 2),
				executed_at: 1_000,
			},
		}
	}

	#[test]
	fn test_publish_reaches_all_subscribers() {
		let bus = EventBus::new(8);
		let rx1 = bus.subscribe();
		let rx2 = bus.subscribe();

		bus.publish(trade_event("TRD-1"));

		assert!(matches!(rx1.try_recv().unwrap(), DomainEvent::Trade { .. }));
		assert!(matches!(rx2.try_recv().unwrap(), DomainEvent::Trade { .. }));
	}

	#[test]
	fn test_slow_subscriber_drops_without_blocking() {
		let bus = EventBus::new(1);
		let rx = bus.subscribe();

		bus.publish(trade_event("TRD-1"));
		bus.publish(trade_event("TRD-2"));

		// Only the first fits; the second was dropped, not blocked on
		assert!(rx.try_recv().is_ok());
		assert!(rx.try_recv().is_err());
		assert_eq!(bus.subscriber_count(), 1);
	}

	#[test]
	fn test_disconnected_subscriber_pruned() {
		let bus = EventBus::new(8);
		let rx = bus.subscribe();
		drop(rx);

		bus.publish(trade_event("TRD-1"));
		assert_eq!(bus.subscriber_count(), 0);
	}
}
