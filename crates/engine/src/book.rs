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

use std::collections::{BTreeMap, HashMap, VecDeque};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use verdict_sdk::{BookLevel, BookSnapshot, BookStats, Outcome, OrderStatus, Side};

use crate::types::{Order, PricePoint};

/// One maker execution produced while crossing an incoming order
///
/// `order` is the maker's state after the fill was applied.
#[derive(Debug, Clone)]
pub struct MakerFill {
	pub order: Order,
	pub quantity: u64,
	pub price: Decimal,
	pub fully_filled: bool,
}

/// Serialized book state for snapshots
///
/// Carries every resting order in price-then-arrival order so the book can
/// be rebuilt exactly, not just its aggregate depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookState {
	pub market_id: String,
	pub outcome: Outcome,
	pub bids: Vec<Order>,
	pub asks: Vec<Order>,
	pub stats: BookStats,
}

/// Limit order book for one (market, outcome) pair
///
/// Both sides are ordered maps from price to a FIFO queue of resting
/// orders; time priority within a level is arrival order. A separate
/// order-id index gives O(log P) removal. The book is owned by the engine
/// thread, so no interior locking is needed.
#[derive(Debug)]
pub struct OrderBook {
	market_id: String,
	outcome: Outcome,
	/// Buy side; best bid is the greatest key
	bids: BTreeMap<PricePoint, VecDeque<Order>>,
	/// Sell side; best ask is the smallest key
	asks: BTreeMap<PricePoint, VecDeque<Order>>,
	/// Order ID -> (side, price level) for removal without scanning
	order_index: HashMap<String, (Side, PricePoint)>,
	total_bid_quantity: u64,
	total_ask_quantity: u64,
	trade_count: u64,
	total_volume: u64,
	last_price: Option<Decimal>,
	high_price: Option<Decimal>,
	low_price: Option<Decimal>,
}

impl OrderBook {
	pub fn new(market_id: String, outcome: Outcome) -> Self {
		Self {
			market_id,
			outcome,
			bids: BTreeMap::new(),
			asks: BTreeMap::new(),
			order_index: HashMap::new(),
			total_bid_quantity: 0,
			total_ask_quantity: 0,
			trade_count: 0,
			total_volume: 0,
			last_price: None,
			high_price: None,
			low_price: None,
		}
	}

	pub fn market_id(&self) -> &str {
		&self.market_id
	}

	pub fn outcome(&self) -> Outcome {
		self.outcome
	}

	pub fn order_count(&self) -> usize {
		self.order_index.len()
	}

	/// Add a resting order at the tail of its price level
	pub fn add(&mut self, order: Order) {
		let level = PricePoint::from_decimal(order.price);
		match order.side {
			Side::Buy => self.total_bid_quantity += order.remaining,
			Side::Sell => self.total_ask_quantity += order.remaining,
		}
		self.order_index
			.insert(order.id.clone(), (order.side, level));
		let side_map = match order.side {
			Side::Buy => &mut self.bids,
			Side::Sell => &mut self.asks,
		};
		side_map.entry(level).or_default().push_back(order);
	}

	/// Remove a resting order; empty levels are dropped
	pub fn remove(&mut self, order_id: &str) -> Option<Order> {
		let (side, level) = self.order_index.remove(order_id)?;
		let side_map = match side {
			Side::Buy => &mut self.bids,
			Side::Sell => &mut self.asks,
		};
		let queue = side_map.get_mut(&level)?;
		let pos = queue.iter().position(|o| o.id == order_id)?;
		let order = queue.remove(pos)?;
		if queue.is_empty() {
			side_map.remove(&level);
		}
		match side {
			Side::Buy => self.total_bid_quantity -= order.remaining,
			Side::Sell => self.total_ask_quantity -= order.remaining,
		}
		Some(order)
	}

	pub fn get(&self, order_id: &str) -> Option<&Order> {
		let (side, level) = self.order_index.get(order_id)?;
		let side_map = match side {
			Side::Buy => &self.bids,
			Side::Sell => &self.asks,
		};
		side_map.get(level)?.iter().find(|o| o.id == order_id)
	}

	pub fn contains(&self, order_id: &str) -> bool {
		self.order_index.contains_key(order_id)
	}

	pub fn best_bid(&self) -> Option<Decimal> {
		self.bids.keys().next_back().map(|p| p.to_decimal())
	}

	pub fn best_ask(&self) -> Option<Decimal> {
		self.asks.keys().next().map(|p| p.to_decimal())
	}

	pub fn spread(&self) -> Option<Decimal> {
		match (self.best_bid(), self.best_ask()) {
			(Some(bid), Some(ask)) => Some(ask - bid),
			_ => None,
		}
	}

	/// Cross an incoming order against the opposite side
	///
	/// Walks price levels from the best towards the taker's limit, FIFO
	/// within each level. Makers owned by the taker's user are skipped in
	/// place: they neither fill nor leave the book, and the scan moves on
	/// to the next maker in the same queue.
	///
	/// Mutates the taker's `remaining`/`filled` and the book; returns one
	/// `MakerFill` per execution, in scan order. Stats are not touched
	/// here — the matching engine records each trade it actually emits.
	pub fn match_incoming(&mut self, taker: &mut Order) -> Vec<MakerFill> {
		let mut fills = Vec::new();
		let limit = PricePoint::from_decimal(taker.price);

		let levels: Vec<PricePoint> = match taker.side {
			Side::Buy => self
				.asks
				.range(..=limit)
				.map(|(level, _)| *level)
				.collect(),
			Side::Sell => self
				.bids
				.range(limit..)
				.rev()
				.map(|(level, _)| *level)
				.collect(),
		};

		for level in levels {
			if taker.remaining == 0 {
				break;
			}
			let side_map = match taker.side {
				Side::Buy => &mut self.asks,
				Side::Sell => &mut self.bids,
			};
			let Some(queue) = side_map.get_mut(&level) else {
				continue;
			};

			let mut pos = 0;
			while pos < queue.len() && taker.remaining > 0 {
				if queue[pos].user_id == taker.user_id {
					// Self-trade prevention: leave the maker resting
					pos += 1;
					continue;
				}

				let maker = &mut queue[pos];
				let quantity = taker.remaining.min(maker.remaining);
				maker.remaining -= quantity;
				maker.filled += quantity;
				taker.remaining -= quantity;
				taker.filled += quantity;

				let price = maker.price;
				let fully_filled = maker.remaining == 0;
				maker.status = if fully_filled {
					OrderStatus::Filled
				} else {
					OrderStatus::Partial
				};

				let mut filled_order = maker.clone();
				if fully_filled {
					if let Some(order) = queue.remove(pos) {
						self.order_index.remove(&order.id);
						filled_order = order;
					}
				}

				match taker.side {
					Side::Buy => self.total_ask_quantity -= quantity,
					Side::Sell => self.total_bid_quantity -= quantity,
				}

				fills.push(MakerFill {
					order: filled_order,
					quantity,
					price,
					fully_filled,
				});
			}

			if queue.is_empty() {
				side_map.remove(&level);
			}
		}

		fills
	}

	/// Apply a fill to a resting order by id, removing it when exhausted
	///
	/// Used when replaying logged trades against a restored book; the live
	/// matching path applies fills inside `match_incoming`. Returns the
	/// order's post-fill state.
	pub fn apply_fill(&mut self, order_id: &str, quantity: u64) -> Option<Order> {
		let (side, level) = *self.order_index.get(order_id)?;
		let side_map = match side {
			Side::Buy => &mut self.bids,
			Side::Sell => &mut self.asks,
		};
		let queue = side_map.get_mut(&level)?;
		let pos = queue.iter().position(|o| o.id == order_id)?;

		let order = &mut queue[pos];
		let quantity = quantity.min(order.remaining);
		order.remaining -= quantity;
		order.filled += quantity;
		let fully_filled = order.remaining == 0;
		let result = if fully_filled {
			order.status = OrderStatus::Filled;
			queue.remove(pos)
		} else {
			order.status = OrderStatus::Partial;
			Some(order.clone())
		};
		let level_empty = queue.is_empty();

		if fully_filled {
			self.order_index.remove(order_id);
		}
		if level_empty {
			side_map.remove(&level);
		}
		match side {
			Side::Buy => self.total_bid_quantity -= quantity,
			Side::Sell => self.total_ask_quantity -= quantity,
		}
		result
	}

	/// Fold one execution into the running statistics
	pub fn record_trade(&mut self, price: Decimal, quantity: u64) {
		self.trade_count += 1;
		self.total_volume += quantity;
		self.last_price = Some(price);
		self.high_price = Some(self.high_price.map_or(price, |h| h.max(price)));
		self.low_price = Some(self.low_price.map_or(price, |l| l.min(price)));
	}

	pub fn stats(&self) -> BookStats {
		BookStats {
			total_bids: self.total_bid_quantity,
			total_asks: self.total_ask_quantity,
			total_volume: self.total_volume,
			trade_count: self.trade_count,
			last_price: self.last_price,
			high_price: self.high_price,
			low_price: self.low_price,
		}
	}

	/// Depth-limited aggregate view: top-N bids descending, asks ascending
	pub fn snapshot(&self, depth: usize) -> BookSnapshot {
		let bids = self
			.bids
			.iter()
			.rev()
			.take(depth)
			.map(|(level, queue)| aggregate_level(*level, queue))
			.collect();
		let asks = self
			.asks
			.iter()
			.take(depth)
			.map(|(level, queue)| aggregate_level(*level, queue))
			.collect();

		BookSnapshot {
			market_id: self.market_id.clone(),
			outcome: self.outcome,
			bids,
			asks,
			best_bid: self.best_bid(),
			best_ask: self.best_ask(),
			spread: self.spread(),
			stats: self.stats(),
		}
	}

	/// Full-fidelity state for persistence
	pub fn state(&self) -> BookState {
		BookState {
			market_id: self.market_id.clone(),
			outcome: self.outcome,
			bids: self
				.bids
				.values()
				.flat_map(|q| q.iter().cloned())
				.collect(),
			asks: self
				.asks
				.values()
				.flat_map(|q| q.iter().cloned())
				.collect(),
			stats: self.stats(),
		}
	}

	/// Rebuild a book from persisted state
	pub fn restore(state: BookState) -> Self {
		let mut book = OrderBook::new(state.market_id, state.outcome);
		for order in state.bids.into_iter().chain(state.asks) {
			book.add(order);
		}
		book.trade_count = state.stats.trade_count;
		book.total_volume = state.stats.total_volume;
		book.last_price = state.stats.last_price;
		book.high_price = state.stats.high_price;
		book.low_price = state.stats.low_price;
		book
	}

	/// All resting orders, for re-indexing after a restore
	pub fn resting_orders(&self) -> impl Iterator<Item = &Order> {
		self.bids
			.values()
			.chain(self.asks.values())
			.flat_map(|q| q.iter())
	}
}

fn aggregate_level(level: PricePoint, queue: &VecDeque<Order>) -> BookLevel {
	BookLevel {
		price: level.to_decimal(),
		quantity: queue.iter().map(|o| o.remaining).sum(),
		order_count: queue.len(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rust_decimal_macros::dec;

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
			status: OrderStatus::Open,
			received_at: 1_000,
			sequence: None,
			sequenced_at: None,
		}
	}

	#[test]
	fn test_add_and_remove() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("o1", "u1", Side::Buy, dec!(0.50), 10));
		assert!(book.contains("o1"));
		assert_eq!(book.stats().total_bids, 10);

		let removed = book.remove("o1").unwrap();
		assert_eq!(removed.id, "o1");
		assert!(!book.contains("o1"));
		assert_eq!(book.stats().total_bids, 0);
		assert_eq!(book.best_bid(), None);
	}

	#[test]
	fn test_best_prices_and_spread() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("b1", "u1", Side::Buy, dec!(0.40), 5));
		book.add(order("b2", "u2", Side::Buy, dec!(0.45), 5));
		book.add(order("a1", "u3", Side::Sell, dec!(0.55), 5));
		book.add(order("a2", "u4", Side::Sell, dec!(0.60), 5));

		assert_eq!(book.best_bid(), Some(dec!(0.45)));
		assert_eq!(book.best_ask(), Some(dec!(0.55)));
		assert_eq!(book.spread(), Some(dec!(0.10)));
	}

	#[test]
	fn test_match_walks_prices_then_time() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("a1", "u1", Side::Sell, dec!(0.60), 5));
		book.add(order("a2", "u2", Side::Sell, dec!(0.55), 5));
		book.add(order("a3", "u3", Side::Sell, dec!(0.55), 5));

		let mut taker = order("t1", "u4", Side::Buy, dec!(0.60), 12);
		let fills = book.match_incoming(&mut taker);

		// Better price first, then arrival order within 0.55
		assert_eq!(fills.len(), 3);
		assert_eq!(fills[0].order.id, "a2");
		assert_eq!(fills[0].price, dec!(0.55));
		assert_eq!(fills[1].order.id, "a3");
		assert_eq!(fills[2].order.id, "a1");
		assert_eq!(fills[2].quantity, 2);
		assert_eq!(taker.remaining, 0);
		assert_eq!(taker.filled, 12);

		// a1 keeps its residual 3 on the book
		assert!(book.contains("a1"));
		assert_eq!(book.get("a1").unwrap().remaining, 3);
		assert_eq!(book.stats().total_asks, 3);
	}

	#[test]
	fn test_match_respects_limit() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("a1", "u1", Side::Sell, dec!(0.55), 5));
		book.add(order("a2", "u2", Side::Sell, dec!(0.70), 5));

		let mut taker = order("t1", "u3", Side::Buy, dec!(0.60), 10);
		let fills = book.match_incoming(&mut taker);

		assert_eq!(fills.len(), 1);
		assert_eq!(fills[0].price, dec!(0.55));
		assert_eq!(taker.remaining, 5);
		assert!(book.contains("a2"));
	}

	#[test]
	fn test_self_trade_skipped_without_livelock() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("a1", "u1", Side::Sell, dec!(0.50), 5));
		book.add(order("a2", "u2", Side::Sell, dec!(0.50), 5));

		let mut taker = order("t1", "u1", Side::Buy, dec!(0.50), 5);
		let fills = book.match_incoming(&mut taker);

		// u1's own maker is skipped; the later maker at the level fills
		assert_eq!(fills.len(), 1);
		assert_eq!(fills[0].order.id, "a2");
		assert_eq!(taker.remaining, 0);
		assert!(book.contains("a1"));
		assert_eq!(book.get("a1").unwrap().remaining, 5);
	}

	#[test]
	fn test_sell_taker_scans_bids_descending() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("b1", "u1", Side::Buy, dec!(0.40), 5));
		book.add(order("b2", "u2", Side::Buy, dec!(0.45), 5));

		let mut taker = order("t1", "u3", Side::Sell, dec!(0.40), 8);
		let fills = book.match_incoming(&mut taker);

		assert_eq!(fills.len(), 2);
		assert_eq!(fills[0].price, dec!(0.45));
		assert_eq!(fills[1].price, dec!(0.40));
		assert_eq!(fills[1].quantity, 3);
		assert_eq!(book.get("b1").unwrap().remaining, 2);
	}

	#[test]
	fn test_stats_unset_until_first_trade() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		let stats = book.stats();
		assert_eq!(stats.last_price, None);
		assert_eq!(stats.high_price, None);
		assert_eq!(stats.low_price, None);

		book.record_trade(dec!(0.55), 10);
		book.record_trade(dec!(0.45), 5);
		let stats = book.stats();
		assert_eq!(stats.trade_count, 2);
		assert_eq!(stats.total_volume, 15);
		assert_eq!(stats.last_price, Some(dec!(0.45)));
		assert_eq!(stats.high_price, Some(dec!(0.55)));
		assert_eq!(stats.low_price, Some(dec!(0.45)));
	}

	#[test]
	fn test_snapshot_depth_and_aggregation() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("b1", "u1", Side::Buy, dec!(0.40), 5));
		book.add(order("b2", "u2", Side::Buy, dec!(0.40), 7));
		book.add(order("b3", "u3", Side::Buy, dec!(0.35), 3));
		book.add(order("a1", "u4", Side::Sell, dec!(0.55), 4));

		let snap = book.snapshot(1);
		assert_eq!(snap.bids.len(), 1);
		assert_eq!(snap.bids[0].price, dec!(0.40));
		assert_eq!(snap.bids[0].quantity, 12);
		assert_eq!(snap.bids[0].order_count, 2);
		assert_eq!(snap.asks.len(), 1);
		assert_eq!(snap.best_bid, Some(dec!(0.40)));
	}

	#[test]
	fn test_state_roundtrip_preserves_queue_order() {
		let mut book = OrderBook::new("mkt-1".to_string(), Outcome::Yes);
		book.add(order("b1", "u1", Side::Buy, dec!(0.40), 5));
		book.add(order("b2", "u2", Side::Buy, dec!(0.40), 7));
		book.record_trade(dec!(0.40), 2);

		let restored = OrderBook::restore(book.state());
		assert_eq!(restored.order_count(), 2);
		assert_eq!(restored.stats(), book.stats());

		// b1 keeps time priority at the level
		let ids: Vec<&str> = restored
			.resting_orders()
			.map(|o| o.id.as_str())
			.collect();
		assert_eq!(ids, vec!["b1", "b2"]);
	}
}
