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

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::debug;
use verdict_sdk::{
	BookSnapshot, BookStats, CancelRejectReason, CancelRejected, MarketStats, Outcome,
	OrderStatus, Side,
};

use crate::book::{BookState, OrderBook};
use crate::types::{BookId, Order, Trade, now_millis};

/// One trade produced while processing an aggressor, with the maker's
/// post-fill state and the buy side's limit (needed for settlement)
#[derive(Debug, Clone)]
pub struct TradeFill {
	pub trade: Trade,
	pub maker: Order,
	pub maker_fully_filled: bool,
	pub buy_limit: Decimal,
}

/// Result of processing one aggressor
#[derive(Debug)]
pub struct MatchOutcome {
	pub fills: Vec<TradeFill>,
	/// Whether a residual was added to the book
	pub rested: bool,
}

/// Owns every order book and applies deterministic price-time matching
///
/// One book exists per (market, outcome) pair, created lazily. A global
/// location index maps resting order ids to their book so cancellation
/// does not scan.
pub struct MatchingCore {
	books: HashMap<BookId, OrderBook>,
	locations: HashMap<String, BookId>,
	trade_counter: u64,
}

impl MatchingCore {
	pub fn new() -> Self {
		Self {
			books: HashMap::new(),
			locations: HashMap::new(),
			trade_counter: 0,
		}
	}

	/// Cross an aggressor against its book and rest any residual
	///
	/// Execution price is always the maker's; trades come back in scan
	/// order. The aggressor's status is left at `Filled`, `Partial` or
	/// `Open` depending on the outcome.
	pub fn process(&mut self, order: &mut Order) -> MatchOutcome {
		let book_id = order.book_id();
		let book = self
			.books
			.entry(book_id.clone())
			.or_insert_with(|| OrderBook::new(book_id.market_id.clone(), book_id.outcome));

		let maker_fills = book.match_incoming(order);
		let mut fills = Vec::with_capacity(maker_fills.len());

		for fill in maker_fills {
			self.trade_counter += 1;
			let (buy_order_id, sell_order_id, buyer_id, seller_id, buy_limit) = match order.side {
				Side::Buy => (
					order.id.clone(),
					fill.order.id.clone(),
					order.user_id.clone(),
					fill.order.user_id.clone(),
					order.price,
				),
				Side::Sell => (
					fill.order.id.clone(),
					order.id.clone(),
					fill.order.user_id.clone(),
					order.user_id.clone(),
					fill.order.price,
				),
			};

			let trade = Trade {
				id: trade_id(self.trade_counter),
				market_id: order.market_id.clone(),
				outcome: order.outcome,
				buy_order_id,
				sell_order_id,
				buyer_id,
				seller_id,
				quantity: fill.quantity,
				price: fill.price,
				total: fill.price * Decimal::from(fill.quantity),
				executed_at: now_millis(),
			};

			book.record_trade(fill.price, fill.quantity);
			if fill.fully_filled {
				self.locations.remove(&fill.order.id);
			}

			debug!(
				target: "matching",
				trade_id = %trade.id,
				maker = %fill.order.id,
				taker = %order.id,
				price = %fill.price,
				quantity = fill.quantity,
				"trade executed"
			);

			fills.push(TradeFill {
				trade,
				maker: fill.order,
				maker_fully_filled: fill.fully_filled,
				buy_limit,
			});
		}

		let rested = order.remaining > 0;
		if rested {
			order.status = if order.filled > 0 {
				OrderStatus::Partial
			} else {
				OrderStatus::Open
			};
			book.add(order.clone());
			self.locations.insert(order.id.clone(), book_id);
		} else {
			order.status = OrderStatus::Filled;
		}

		MatchOutcome { fills, rested }
	}

	/// Cancel a resting order on behalf of its owner
	pub fn cancel(&mut self, order_id: &str, user_id: &str) -> Result<Order, CancelRejected> {
		let Some(book_id) = self.locations.get(order_id) else {
			return Err(CancelRejected {
				reason: CancelRejectReason::NotFound,
				message: format!("order {} is not resting on any book", order_id),
			});
		};
		let Some(book) = self.books.get_mut(book_id) else {
			return Err(CancelRejected {
				reason: CancelRejectReason::NotFound,
				message: format!("order {} is not resting on any book", order_id),
			});
		};
		let owner_matches = book
			.get(order_id)
			.map(|order| order.user_id == user_id)
			.unwrap_or(false);
		if !owner_matches {
			if book.contains(order_id) {
				return Err(CancelRejected {
					reason: CancelRejectReason::Unauthorized,
					message: format!("order {} belongs to a different user", order_id),
				});
			}
			return Err(CancelRejected {
				reason: CancelRejectReason::NotFound,
				message: format!("order {} is not resting on any book", order_id),
			});
		}

		self.locations.remove(order_id);
		let mut order = match book.remove(order_id) {
			Some(order) => order,
			None => {
				return Err(CancelRejected {
					reason: CancelRejectReason::NotFound,
					message: format!("order {} is not resting on any book", order_id),
				});
			}
		};
		order.status = OrderStatus::Cancelled;
		Ok(order)
	}

	/// Pull a resting order regardless of owner (error unwind, replay)
	pub fn remove_resting(&mut self, order_id: &str) -> Option<Order> {
		let book_id = self.locations.remove(order_id)?;
		self.books.get_mut(&book_id)?.remove(order_id)
	}

	/// Put an order straight onto its book (restore/replay path)
	pub fn insert_resting(&mut self, order: Order) {
		let book_id = order.book_id();
		self.locations.insert(order.id.clone(), book_id.clone());
		self.books
			.entry(book_id.clone())
			.or_insert_with(|| OrderBook::new(book_id.market_id.clone(), book_id.outcome))
			.add(order);
	}

	/// Re-apply a logged trade to the books (replay path)
	///
	/// Decrements both participants in place, drops whichever fills
	/// completely, and folds the execution into the book statistics.
	pub fn apply_trade(&mut self, trade: &Trade) {
		let book_id = BookId {
			market_id: trade.market_id.clone(),
			outcome: trade.outcome,
		};
		let Some(book) = self.books.get_mut(&book_id) else {
			return;
		};
		for order_id in [&trade.buy_order_id, &trade.sell_order_id] {
			if let Some(after) = book.apply_fill(order_id, trade.quantity) {
				if after.remaining == 0 {
					self.locations.remove(order_id);
				}
			}
		}
		book.record_trade(trade.price, trade.quantity);
		if let Some(counter) = parse_trade_counter(&trade.id) {
			self.trade_counter = self.trade_counter.max(counter);
		}
	}

	/// Depth-limited snapshot; an absent book reads as empty
	pub fn book_snapshot(&self, market_id: &str, outcome: Outcome, depth: usize) -> BookSnapshot {
		let book_id = BookId {
			market_id: market_id.to_string(),
			outcome,
		};
		match self.books.get(&book_id) {
			Some(book) => book.snapshot(depth),
			None => BookSnapshot {
				market_id: market_id.to_string(),
				outcome,
				bids: Vec::new(),
				asks: Vec::new(),
				best_bid: None,
				best_ask: None,
				spread: None,
				stats: BookStats::default(),
			},
		}
	}

	pub fn market_stats(&self, market_id: &str) -> MarketStats {
		let stats_for = |outcome: Outcome| -> Option<BookStats> {
			self.books
				.get(&BookId {
					market_id: market_id.to_string(),
					outcome,
				})
				.map(|book| book.stats())
		};
		MarketStats {
			market_id: market_id.to_string(),
			yes: stats_for(Outcome::Yes),
			no: stats_for(Outcome::No),
		}
	}

	pub fn resting_order(&self, order_id: &str) -> Option<&Order> {
		let book_id = self.locations.get(order_id)?;
		self.books.get(book_id)?.get(order_id)
	}

	/// Serialized state of every book, for snapshots
	pub fn books_state(&self) -> Vec<BookState> {
		let mut states: Vec<BookState> = self.books.values().map(|b| b.state()).collect();
		states.sort_by(|a, b| {
			(&a.market_id, bool::from(a.outcome)).cmp(&(&b.market_id, bool::from(b.outcome)))
		});
		states
	}

	/// Rebuild every book from a snapshot, re-indexing all resting orders
	pub fn restore(&mut self, states: Vec<BookState>) {
		self.books.clear();
		self.locations.clear();
		for state in states {
			let book = OrderBook::restore(state);
			let book_id = BookId {
				market_id: book.market_id().to_string(),
				outcome: book.outcome(),
			};
			for order in book.resting_orders() {
				self.locations.insert(order.id.clone(), book_id.clone());
			}
			self.books.insert(book_id, book);
		}
	}

	pub fn trade_counter(&self) -> u64 {
		self.trade_counter
	}

	pub fn set_trade_counter(&mut self, counter: u64) {
		self.trade_counter = counter;
	}
}

impl Default for MatchingCore {
	fn default() -> Self {
		Self::new()
	}
}

fn trade_id(counter: u64) -> String {
	format!("TRD-{:012}", counter)
}

fn parse_trade_counter(id: &str) -> Option<u64> {
	id.strip_prefix("TRD-")?.parse().ok()
}
