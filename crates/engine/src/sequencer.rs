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

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use verdict_sdk::{CancelRejected, OrderStatus, RejectReason, SubmitOrderRequest};

use crate::events::{BookUpdateKind, DomainEvent, EventBus};
use crate::matching::MatchingCore;
use crate::persist::{EngineSnapshot, PersistenceManager, WalEventBody, WalRecord};
use crate::risk::RiskEngine;
use crate::types::{Order, now_millis, valid_price};

/// Buckets older than this are garbage-collected
const BUCKET_MAX_AGE_SECS: i64 = 60;

/// Reason string journaled with user-driven cancellations
pub const USER_CANCELLED: &str = "USER_CANCELLED";

/// Per-user, per-wall-second submission limiter
///
/// Callable from any submit thread; buckets live in a concurrent map and
/// stale ones are swept opportunistically once the map grows past the
/// threshold.
pub struct RateLimiter {
	buckets: DashMap<String, RateBucket>,
	max_per_second: u32,
	gc_threshold: usize,
}

struct RateBucket {
	second: i64,
	count: u32,
}

impl RateLimiter {
	pub fn new(max_per_second: u32) -> Self {
		Self {
			buckets: DashMap::new(),
			max_per_second,
			gc_threshold: 1_024,
		}
	}

	/// Count one submission; `false` means the user is over its budget
	pub fn allow(&self, user_id: &str) -> bool {
		let second = now_millis() / 1_000;
		let allowed = {
			let mut bucket = self
				.buckets
				.entry(user_id.to_string())
				.or_insert(RateBucket { second, count: 0 });
			if bucket.second != second {
				bucket.second = second;
				bucket.count = 0;
			}
			bucket.count += 1;
			bucket.count <= self.max_per_second
		};

		if self.buckets.len() > self.gc_threshold {
			self.buckets
				.retain(|_, bucket| second - bucket.second < BUCKET_MAX_AGE_SECS);
		}

		allowed
	}
}

/// Synchronous admission checks, performed before queueing
///
/// Side and outcome are enforced by the request types themselves; what is
/// left is presence, positivity and the price band.
pub fn validate(request: &SubmitOrderRequest) -> Result<(), String> {
	if request.user_id.trim().is_empty() {
		return Err("userId must be present".to_string());
	}
	if request.market_id.trim().is_empty() {
		return Err("marketId must be present".to_string());
	}
	if request.quantity == 0 {
		return Err("quantity must be a positive integer".to_string());
	}
	if !valid_price(request.price) {
		return Err(format!(
			"price {} must be a two-decimal value in [0.01, 0.99]",
			request.price
		));
	}
	Ok(())
}

/// Single-writer order pipeline
///
/// Owns the matching core and the risk engine; one instance lives on the
/// engine thread and processes orders strictly in sequence order. Every
/// state change past sequence-number assignment is journaled before the
/// next step runs.
pub struct Sequencer {
	matching: MatchingCore,
	risk: RiskEngine,
	persistence: Arc<PersistenceManager>,
	events: EventBus,
	next_sequence: u64,
}

impl Sequencer {
	pub fn new(
		matching: MatchingCore,
		risk: RiskEngine,
		persistence: Arc<PersistenceManager>,
		events: EventBus,
	) -> Self {
		Self {
			matching,
			risk,
			persistence,
			events,
			next_sequence: 0,
		}
	}

	pub fn last_sequence(&self) -> u64 {
		self.next_sequence
	}

	pub fn set_last_sequence(&mut self, sequence: u64) {
		self.next_sequence = sequence;
	}

	pub fn matching(&self) -> &MatchingCore {
		&self.matching
	}

	pub fn risk(&self) -> &RiskEngine {
		&self.risk
	}

	pub fn risk_mut(&mut self) -> &mut RiskEngine {
		&mut self.risk
	}

	/// Run one order through sequencing, risk, journaling and matching
	pub fn process(&mut self, mut order: Order) {
		self.next_sequence += 1;
		order.sequence = Some(self.next_sequence);
		order.sequenced_at = Some(now_millis());
		order.status = OrderStatus::Open;

		if let Err(risk_err) = self.risk.check(&order) {
			debug!(
				target: "sequencer",
				order_id = %order.id,
				reason = %risk_err.reject_reason(),
				"order failed risk check"
			);
			self.reject(&order, risk_err.reject_reason(), risk_err.to_string());
			return;
		}

		if let Err(risk_err) = self.risk.lock(&order) {
			self.reject(&order, risk_err.reject_reason(), risk_err.to_string());
			return;
		}

		if let Err(e) = self
			.persistence
			.log_event(WalEventBody::OrderSequenced {
				order: order.clone(),
			}) {
			error!(target: "sequencer", order_id = %order.id, error = %e, "failed to journal sequenced order");
			self.unwind(order, format!("failed to journal order: {}", e));
			return;
		}
		self.events.publish(DomainEvent::OrderSequenced {
			order: order.clone(),
		});

		let outcome = self.matching.process(&mut order);

		for fill in &outcome.fills {
			// A trade must never outlive a failed ledger change
			if let Err(e) = self.risk.settle(&fill.trade, fill.buy_limit) {
				error!(
					target: "sequencer",
					order_id = %order.id,
					trade_id = %fill.trade.id,
					error = %e,
					"settlement failed"
				);
				self.unwind(order, format!("settlement failed: {}", e));
				return;
			}
			if let Err(e) = self.persistence.log_event(WalEventBody::Trade {
				trade: fill.trade.clone(),
				buyer_limit: fill.buy_limit,
			}) {
				self.unwind(order, format!("failed to journal trade: {}", e));
				return;
			}
			self.events.publish(DomainEvent::Trade {
				trade: fill.trade.clone(),
			});
			self.events.publish(DomainEvent::OrderBookUpdate {
				market_id: order.market_id.clone(),
				outcome: order.outcome,
				kind: BookUpdateKind::Trade,
				order_id: fill.maker.id.clone(),
				price: fill.trade.price,
				quantity: fill.trade.quantity,
			});

			let maker_body = if fill.maker_fully_filled {
				WalEventBody::OrderFilled {
					order: fill.maker.clone(),
				}
			} else {
				WalEventBody::OrderPartialFill {
					order: fill.maker.clone(),
				}
			};
			if let Err(e) = self.persistence.log_event(maker_body) {
				self.unwind(order, format!("failed to journal maker fill: {}", e));
				return;
			}
			if fill.maker_fully_filled {
				self.events.publish(DomainEvent::OrderFilled {
					order: fill.maker.clone(),
				});
			} else {
				self.events.publish(DomainEvent::OrderPartialFill {
					order: fill.maker.clone(),
				});
			}
		}

		if order.remaining == 0 {
			info!(
				target: "sequencer",
				order_id = %order.id,
				seq = self.next_sequence,
				trades = outcome.fills.len(),
				"order fully filled"
			);
			if let Err(e) = self.persistence.log_event(WalEventBody::OrderFilled {
				order: order.clone(),
			}) {
				error!(target: "sequencer", order_id = %order.id, error = %e, "failed to journal fill");
			}
			self.events.publish(DomainEvent::OrderFilled { order });
			return;
		}

		if !outcome.fills.is_empty() {
			if let Err(e) = self.persistence.log_event(WalEventBody::OrderPartialFill {
				order: order.clone(),
			}) {
				error!(target: "sequencer", order_id = %order.id, error = %e, "failed to journal partial fill");
			}
			self.events.publish(DomainEvent::OrderPartialFill {
				order: order.clone(),
			});
		}

		debug!(
			target: "sequencer",
			order_id = %order.id,
			seq = self.next_sequence,
			remaining = order.remaining,
			"order resting on book"
		);
		self.events.publish(DomainEvent::OrderBookUpdate {
			market_id: order.market_id.clone(),
			outcome: order.outcome,
			kind: BookUpdateKind::Add,
			order_id: order.id.clone(),
			price: order.price,
			quantity: order.remaining,
		});
	}

	/// Cancel an order resting on a book
	pub fn cancel_resting(
		&mut self,
		order_id: &str,
		user_id: &str,
	) -> Result<Order, CancelRejected> {
		let order = self.matching.cancel(order_id, user_id)?;
		if let Err(e) = self.risk.unlock(&order) {
			error!(target: "sequencer", order_id, error = %e, "unlock after cancel failed");
		}
		if let Err(e) = self.persistence.log_event(WalEventBody::OrderCancelled {
			order: order.clone(),
			reason: USER_CANCELLED.to_string(),
		}) {
			error!(target: "sequencer", order_id, error = %e, "failed to journal cancellation");
		}
		self.events.publish(DomainEvent::OrderCancelled {
			order: order.clone(),
		});
		self.events.publish(DomainEvent::OrderBookUpdate {
			market_id: order.market_id.clone(),
			outcome: order.outcome,
			kind: BookUpdateKind::Remove,
			order_id: order.id.clone(),
			price: order.price,
			quantity: order.remaining,
		});
		Ok(order)
	}

	/// Re-apply one journaled record during recovery
	///
	/// Records describe state changes, so replay touches the books and the
	/// ledger directly instead of re-running the matching scan.
	pub fn apply_record(&mut self, record: &WalRecord) {
		match &record.body {
			WalEventBody::OrderReceived { .. } => {
				// Intake only; the order owns no state until sequenced
			}
			WalEventBody::OrderSequenced { order } => {
				if let Some(sequence) = order.sequence {
					self.next_sequence = self.next_sequence.max(sequence);
				}
				if let Err(e) = self.risk.lock(order) {
					warn!(target: "sequencer", order_id = %order.id, error = %e, "replayed lock failed");
				}
				self.matching.insert_resting(order.clone());
			}
			WalEventBody::OrderRejected { order_id, .. } => {
				if let Some(order) = self.matching.remove_resting(order_id) {
					if let Err(e) = self.risk.unlock(&order) {
						warn!(target: "sequencer", order_id = %order.id, error = %e, "replayed unlock failed");
					}
				}
			}
			WalEventBody::OrderCancelled { order, .. } => {
				let target = self
					.matching
					.remove_resting(&order.id)
					.unwrap_or_else(|| order.clone());
				if let Err(e) = self.risk.unlock(&target) {
					warn!(target: "sequencer", order_id = %order.id, error = %e, "replayed unlock failed");
				}
			}
			WalEventBody::Trade { trade, buyer_limit } => {
				if let Err(e) = self.risk.settle(trade, *buyer_limit) {
					warn!(target: "sequencer", trade_id = %trade.id, error = %e, "replayed settlement failed");
				}
				self.matching.apply_trade(trade);
			}
			WalEventBody::OrderFilled { order } => {
				// Normally already removed by the trade replay
				let _ = self.matching.remove_resting(&order.id);
			}
			WalEventBody::OrderPartialFill { .. } => {
				// State already applied by the trade replay
			}
		}
	}

	/// Capture the complete core state for a snapshot
	pub fn snapshot_state(&self, order_counter: u64) -> EngineSnapshot {
		EngineSnapshot {
			last_event_number: self.persistence.last_event_number(),
			taken_at: now_millis(),
			last_sequence: self.next_sequence,
			trade_counter: self.matching.trade_counter(),
			order_counter,
			books: self.matching.books_state(),
			balances: self.risk.balances().clone(),
			positions: EngineSnapshot::positions_from_map(self.risk.positions()),
			locks: self.risk.locks().clone(),
		}
	}

	/// Restore the core from a snapshot
	pub fn restore_state(&mut self, snapshot: &EngineSnapshot) {
		self.matching.restore(snapshot.books.clone());
		self.matching.set_trade_counter(snapshot.trade_counter);
		self.risk.restore_balances(snapshot.balances.clone());
		self.risk.restore_positions(snapshot.positions_map());
		self.risk.restore_locks(snapshot.locks.clone());
		self.next_sequence = snapshot.last_sequence;
	}

	fn reject(&mut self, order: &Order, reason: RejectReason, message: String) {
		if let Err(e) = self.persistence.log_event(WalEventBody::OrderRejected {
			order_id: order.id.clone(),
			user_id: order.user_id.clone(),
			reason,
			message: message.clone(),
		}) {
			error!(target: "sequencer", order_id = %order.id, error = %e, "failed to journal rejection");
		}
		self.events.publish(DomainEvent::OrderRejected {
			order_id: Some(order.id.clone()),
			user_id: order.user_id.clone(),
			reason,
			message,
		});
	}

	/// Processing-error path: roll back whatever the order holds
	fn unwind(&mut self, mut order: Order, message: String) {
		let _ = self.matching.remove_resting(&order.id);
		if let Err(e) = self.risk.unlock(&order) {
			error!(target: "sequencer", order_id = %order.id, error = %e, "unwind unlock failed");
		}
		order.status = OrderStatus::Rejected;
		self.reject(&order, RejectReason::ProcessingError, message);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rust_decimal::Decimal;
	use rust_decimal_macros::dec;
	use verdict_sdk::{Outcome, Side};

	use crate::risk::RiskLimits;

	fn request(price: Decimal, quantity: u64) -> SubmitOrderRequest {
		SubmitOrderRequest {
			user_id: "u1".to_string(),
			market_id: "mkt-1".to_string(),
			side: Side::Buy,
			outcome: Outcome::Yes,
			quantity,
			price,
		}
	}

	#[test]
	fn test_validate_rejects_bad_fields() {
		assert!(validate(&request(dec!(0.50), 10)).is_ok());
		assert!(validate(&request(dec!(0.50), 0)).is_err());
		assert!(validate(&request(dec!(0.005), 10)).is_err());
		assert!(validate(&request(dec!(1.50), 10)).is_err());

		let mut r = request(dec!(0.50), 10);
		r.user_id = "  ".to_string();
		assert!(validate(&r).is_err());
		let mut r = request(dec!(0.50), 10);
		r.market_id = String::new();
		assert!(validate(&r).is_err());
	}

	#[test]
	fn test_rate_limiter_caps_per_second() {
		let limiter = RateLimiter::new(3);
		assert!(limiter.allow("u1"));
		assert!(limiter.allow("u1"));
		assert!(limiter.allow("u1"));
		assert!(!limiter.allow("u1"));
		// Other users have their own budget
		assert!(limiter.allow("u2"));
	}

	fn sequencer(dir: &tempfile::TempDir) -> (Sequencer, Arc<PersistenceManager>) {
		let persistence = Arc::new(
			PersistenceManager::open(
				&dir.path().join("wal"),
				&dir.path().join("snapshots"),
				1,
				1_000,
			)
			.unwrap(),
		);
		let events = EventBus::new(256);
		let risk = RiskEngine::new(RiskLimits::default(), events.clone());
		let seq = Sequencer::new(MatchingCore::new(), risk, persistence.clone(), events);
		(seq, persistence)
	}

	fn order(id: &str, user: &str, side: Side, price: Decimal, quantity: u64) -> Order {
		Order {
			id: id.to_string(),
			user_id: user.to_string(),
			market_id: "mkt-1".to_string(),
			outcome: Outcome::Yes,
			side,
			price,
			quantity,
			remaining: quantity,
			filled: 0,
			status: OrderStatus::Queued,
			received_at: 1_000,
			sequence: None,
			sequenced_at: None,
		}
	}

	#[test]
	fn test_pipeline_assigns_sequence_and_matches() {
		let dir = tempfile::tempdir().unwrap();
		let (mut seq, persistence) = sequencer(&dir);
		seq.risk_mut().set_balance("u1", dec!(1000));
		seq.risk_mut().set_balance("u2", dec!(1000));
		seq.risk_mut().set_position("u2", "mkt-1", Outcome::Yes, 100);

		seq.process(order("s1", "u2", Side::Sell, dec!(0.55), 10));
		seq.process(order("b1", "u1", Side::Buy, dec!(0.60), 10));
		assert_eq!(seq.last_sequence(), 2);

		// Both sides settled at the maker's price
		assert_eq!(seq.risk().balance_view("u1").available, dec!(994.50));
		assert_eq!(seq.risk().balance_view("u2").available, dec!(1005.50));

		// The journal saw sequencing, the trade and both fills
		persistence.flush().unwrap();
		let recovered = persistence.load_latest_state().unwrap();
		let kinds: Vec<&str> = recovered
			.tail
			.iter()
			.map(|r| match r.body {
				WalEventBody::OrderReceived { .. } => "received",
				WalEventBody::OrderSequenced { .. } => "sequenced",
				WalEventBody::OrderRejected { .. } => "rejected",
				WalEventBody::OrderCancelled { .. } => "cancelled",
				WalEventBody::Trade { .. } => "trade",
				WalEventBody::OrderFilled { .. } => "filled",
				WalEventBody::OrderPartialFill { .. } => "partial",
			})
			.collect();
		assert_eq!(
			kinds,
			vec!["sequenced", "sequenced", "trade", "filled", "filled"]
		);
	}

	#[test]
	fn test_risk_rejection_is_journaled() {
		let dir = tempfile::tempdir().unwrap();
		let (mut seq, persistence) = sequencer(&dir);
		// No funding at all
		seq.process(order("b1", "u1", Side::Buy, dec!(0.60), 10));

		persistence.flush().unwrap();
		let recovered = persistence.load_latest_state().unwrap();
		assert_eq!(recovered.tail.len(), 1);
		assert!(matches!(
			recovered.tail[0].body,
			WalEventBody::OrderRejected {
				reason: RejectReason::InsufficientBalance,
				..
			}
		));
		// Nothing stayed locked
		assert!(seq.risk().locks().is_empty());
	}

	#[test]
	fn test_cancel_resting_releases_lock() {
		let dir = tempfile::tempdir().unwrap();
		let (mut seq, _persistence) = sequencer(&dir);
		seq.risk_mut().set_balance("u1", dec!(100));

		seq.process(order("b1", "u1", Side::Buy, dec!(0.50), 10));
		assert_eq!(seq.risk().balance_view("u1").locked, dec!(5));

		let cancelled = seq.cancel_resting("b1", "u1").unwrap();
		assert_eq!(cancelled.status, OrderStatus::Cancelled);
		assert_eq!(seq.risk().balance_view("u1").locked, dec!(0));
		assert_eq!(seq.risk().balance_view("u1").available, dec!(100));
		assert!(seq.matching().resting_order("b1").is_none());
	}

	#[test]
	fn test_replay_rebuilds_state() {
		let dir = tempfile::tempdir().unwrap();
		let (mut seq, persistence) = sequencer(&dir);
		seq.risk_mut().set_balance("u1", dec!(1000));
		seq.risk_mut().set_position("u2", "mkt-1", Outcome::Yes, 30);

		seq.process(order("s1", "u2", Side::Sell, dec!(0.65), 30));
		seq.process(order("b1", "u1", Side::Buy, dec!(0.70), 50));
		persistence.flush().unwrap();

		// Fresh core fed the same journal, with the same starting funding
		let dir2 = tempfile::tempdir().unwrap();
		let (mut replayed, _p2) = sequencer(&dir2);
		replayed.risk_mut().set_balance("u1", dec!(1000));
		replayed.risk_mut().set_position("u2", "mkt-1", Outcome::Yes, 30);

		for record in persistence.load_latest_state().unwrap().tail {
			replayed.apply_record(&record);
		}

		assert_eq!(replayed.last_sequence(), seq.last_sequence());
		assert_eq!(
			replayed.risk().balance_view("u1"),
			seq.risk().balance_view("u1")
		);
		let original = seq.matching().book_snapshot("mkt-1", Outcome::Yes, 10);
		let rebuilt = replayed.matching().book_snapshot("mkt-1", Outcome::Yes, 10);
		assert_eq!(original.bids, rebuilt.bids);
		assert_eq!(original.asks, rebuilt.asks);
		assert_eq!(original.stats, rebuilt.stats);
	}
}
