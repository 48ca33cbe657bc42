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
use serde::{Deserialize, Serialize};
use thiserror::Error;
use verdict_sdk::{BalanceView, Outcome, PositionView, RejectReason, Side};

use crate::events::{BalanceUpdateKind, DomainEvent, EventBus, PositionUpdateKind};
use crate::types::{Order, Trade};

/// Per-user currency balance; `total = available + locked` is derived
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
	pub available: Decimal,
	pub locked: Decimal,
}

impl Balance {
	pub fn total(&self) -> Decimal {
		self.available + self.locked
	}

	fn view(&self) -> BalanceView {
		BalanceView {
			available: self.available,
			locked: self.locked,
			total: self.total(),
		}
	}
}

/// Per-(user, market, outcome) share position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
	pub available: u64,
	pub locked: u64,
}

/// Position table key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionKey {
	pub user_id: String,
	pub market_id: String,
	pub outcome: Outcome,
}

/// Exact amount reserved for one live order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockValue {
	/// Currency reserved for a BUY (limit price x quantity)
	Funds(Decimal),
	/// Shares reserved for a SELL
	Shares(u64),
}

/// Risk limits, lifted out of the engine settings
#[derive(Debug, Clone)]
pub struct RiskLimits {
	pub max_order_value: Decimal,
	pub max_position_size: u64,
	pub min_balance: Decimal,
}

impl Default for RiskLimits {
	fn default() -> Self {
		Self {
			max_order_value: Decimal::from(10_000),
			max_position_size: 100_000,
			min_balance: Decimal::ZERO,
		}
	}
}

#[derive(Debug, Error)]
pub enum RiskError {
	#[error("order value {notional} exceeds the per-order cap {cap}")]
	MaxOrderValueExceeded { notional: Decimal, cap: Decimal },
	#[error("resulting position {projected} would exceed the cap {cap}")]
	MaxPositionSizeExceeded { projected: u64, cap: u64 },
	#[error("insufficient balance: required {required}, available {available}")]
	InsufficientBalance {
		required: Decimal,
		available: Decimal,
	},
	#[error("insufficient shares: required {required}, available {available}")]
	InsufficientShares { required: u64, available: u64 },
	#[error("lock ledger inconsistency for order {order_id}: {detail}")]
	LedgerInconsistency { order_id: String, detail: String },
}

impl RiskError {
	/// Stable rejection code surfaced to submitters
	pub fn reject_reason(&self) -> RejectReason {
		match self {
			RiskError::MaxOrderValueExceeded { .. } => RejectReason::MaxOrderValueExceeded,
			RiskError::MaxPositionSizeExceeded { .. } => RejectReason::MaxPositionSizeExceeded,
			RiskError::InsufficientBalance { .. } => RejectReason::InsufficientBalance,
			RiskError::InsufficientShares { .. } => RejectReason::InsufficientShares,
			RiskError::LedgerInconsistency { .. } => RejectReason::ProcessingError,
		}
	}
}

/// Pre-trade checks, per-order reservations and trade settlement
///
/// All mutations run on the engine thread; invariants after every
/// operation: `available >= 0`, `locked >= 0`, and the lock ledger sums to
/// the locked columns.
pub struct RiskEngine {
	balances: HashMap<String, Balance>,
	positions: HashMap<PositionKey, Position>,
	locks: HashMap<String, LockValue>,
	limits: RiskLimits,
	events: EventBus,
}

impl RiskEngine {
	pub fn new(limits: RiskLimits, events: EventBus) -> Self {
		Self {
			balances: HashMap::new(),
			positions: HashMap::new(),
			locks: HashMap::new(),
			limits,
			events,
		}
	}

	fn position_key(&self, user_id: &str, market_id: &str, outcome: Outcome) -> PositionKey {
		PositionKey {
			user_id: user_id.to_string(),
			market_id: market_id.to_string(),
			outcome,
		}
	}

	/// Validate an order against limits and current holdings
	pub fn check(&self, order: &Order) -> Result<(), RiskError> {
		let notional = order.notional();
		if notional > self.limits.max_order_value {
			return Err(RiskError::MaxOrderValueExceeded {
				notional,
				cap: self.limits.max_order_value,
			});
		}

		match order.side {
			Side::Buy => {
				let key = self.position_key(&order.user_id, &order.market_id, order.outcome);
				let position = self.positions.get(&key).copied().unwrap_or_default();
				let projected = position.available + position.locked + order.quantity;
				if projected > self.limits.max_position_size {
					return Err(RiskError::MaxPositionSizeExceeded {
						projected,
						cap: self.limits.max_position_size,
					});
				}

				let available = self
					.balances
					.get(&order.user_id)
					.map(|b| b.available)
					.unwrap_or_default();
				if available - notional < self.limits.min_balance {
					return Err(RiskError::InsufficientBalance {
						required: notional,
						available,
					});
				}
			}
			Side::Sell => {
				let key = self.position_key(&order.user_id, &order.market_id, order.outcome);
				let available = self
					.positions
					.get(&key)
					.map(|p| p.available)
					.unwrap_or_default();
				if available < order.quantity {
					return Err(RiskError::InsufficientShares {
						required: order.quantity,
						available,
					});
				}
			}
		}

		Ok(())
	}

	/// Reserve funds (BUY) or shares (SELL) for an order
	pub fn lock(&mut self, order: &Order) -> Result<(), RiskError> {
		match order.side {
			Side::Buy => {
				let amount = order.notional();
				let balance = self.balances.entry(order.user_id.clone()).or_default();
				if balance.available < amount {
					return Err(RiskError::InsufficientBalance {
						required: amount,
						available: balance.available,
					});
				}
				balance.available -= amount;
				balance.locked += amount;
				let view = balance.view();
				self.locks.insert(order.id.clone(), LockValue::Funds(amount));
				self.emit_balance(&order.user_id, BalanceUpdateKind::Lock, view);
			}
			Side::Sell => {
				let key = self.position_key(&order.user_id, &order.market_id, order.outcome);
				let position = self.positions.entry(key).or_default();
				if position.available < order.quantity {
					return Err(RiskError::InsufficientShares {
						required: order.quantity,
						available: position.available,
					});
				}
				position.available -= order.quantity;
				position.locked += order.quantity;
				let snapshot = *position;
				self.locks
					.insert(order.id.clone(), LockValue::Shares(order.quantity));
				self.emit_position(
					&order.user_id,
					&order.market_id,
					order.outcome,
					PositionUpdateKind::Lock,
					snapshot,
				);
			}
		}
		Ok(())
	}

	/// Release whatever is still reserved for an order
	///
	/// No-op when no ledger entry exists (the order never locked, or was
	/// fully settled already).
	pub fn unlock(&mut self, order: &Order) -> Result<(), RiskError> {
		let Some(lock) = self.locks.remove(&order.id) else {
			return Ok(());
		};
		match lock {
			LockValue::Funds(amount) => {
				let balance = self.balances.entry(order.user_id.clone()).or_default();
				if balance.locked < amount {
					return Err(RiskError::LedgerInconsistency {
						order_id: order.id.clone(),
						detail: format!(
							"unlock of {} exceeds locked balance {}",
							amount, balance.locked
						),
					});
				}
				balance.locked -= amount;
				balance.available += amount;
				let view = balance.view();
				self.emit_balance(&order.user_id, BalanceUpdateKind::Unlock, view);
			}
			LockValue::Shares(quantity) => {
				let key = self.position_key(&order.user_id, &order.market_id, order.outcome);
				let position = self.positions.entry(key).or_default();
				if position.locked < quantity {
					return Err(RiskError::LedgerInconsistency {
						order_id: order.id.clone(),
						detail: format!(
							"unlock of {} shares exceeds locked {}",
							quantity, position.locked
						),
					});
				}
				position.locked -= quantity;
				position.available += quantity;
				let snapshot = *position;
				self.emit_position(
					&order.user_id,
					&order.market_id,
					order.outcome,
					PositionUpdateKind::Unlock,
					snapshot,
				);
			}
		}
		Ok(())
	}

	/// Apply one trade to both parties' balances and positions
	///
	/// Execution is at the maker's price; when the buy side's limit was
	/// better, `(buy_limit - price) x quantity` flows back from locked to
	/// available. Lock-ledger entries shrink by exactly what this slice
	/// consumed, so the ledger keeps matching the locked columns.
	pub fn settle(&mut self, trade: &Trade, buy_limit: Decimal) -> Result<(), RiskError> {
		let quantity = Decimal::from(trade.quantity);
		let consumed = buy_limit * quantity;
		let refund = consumed - trade.total;
		if refund < Decimal::ZERO {
			return Err(RiskError::LedgerInconsistency {
				order_id: trade.buy_order_id.clone(),
				detail: format!(
					"execution total {} exceeds reserved {} for the matched slice",
					trade.total, consumed
				),
			});
		}

		// Buyer pays from locked funds, improvement comes back
		let buyer_balance = self.balances.entry(trade.buyer_id.clone()).or_default();
		if buyer_balance.locked < consumed {
			return Err(RiskError::LedgerInconsistency {
				order_id: trade.buy_order_id.clone(),
				detail: format!(
					"settlement of {} exceeds locked balance {}",
					consumed, buyer_balance.locked
				),
			});
		}
		buyer_balance.locked -= consumed;
		buyer_balance.available += refund;
		let buyer_view = buyer_balance.view();
		self.consume_funds_lock(&trade.buy_order_id, consumed)?;
		self.emit_balance(&trade.buyer_id, BalanceUpdateKind::TradeBuy, buyer_view);

		// Buyer receives the shares
		let buyer_key = self.position_key(&trade.buyer_id, &trade.market_id, trade.outcome);
		let buyer_position = self.positions.entry(buyer_key).or_default();
		buyer_position.available += trade.quantity;
		let buyer_pos_snapshot = *buyer_position;
		self.emit_position(
			&trade.buyer_id,
			&trade.market_id,
			trade.outcome,
			PositionUpdateKind::TradeBuy,
			buyer_pos_snapshot,
		);

		// Seller delivers locked shares
		let seller_key = self.position_key(&trade.seller_id, &trade.market_id, trade.outcome);
		let seller_position = self.positions.entry(seller_key).or_default();
		if seller_position.locked < trade.quantity {
			return Err(RiskError::LedgerInconsistency {
				order_id: trade.sell_order_id.clone(),
				detail: format!(
					"settlement of {} shares exceeds locked {}",
					trade.quantity, seller_position.locked
				),
			});
		}
		seller_position.locked -= trade.quantity;
		let seller_pos_snapshot = *seller_position;
		self.consume_shares_lock(&trade.sell_order_id, trade.quantity)?;
		self.emit_position(
			&trade.seller_id,
			&trade.market_id,
			trade.outcome,
			PositionUpdateKind::TradeSell,
			seller_pos_snapshot,
		);

		// Seller is paid the execution total
		let seller_balance = self.balances.entry(trade.seller_id.clone()).or_default();
		seller_balance.available += trade.total;
		let seller_view = seller_balance.view();
		self.emit_balance(&trade.seller_id, BalanceUpdateKind::TradeSell, seller_view);

		Ok(())
	}

	fn consume_funds_lock(&mut self, order_id: &str, amount: Decimal) -> Result<(), RiskError> {
		match self.locks.get_mut(order_id) {
			Some(LockValue::Funds(remaining)) if *remaining >= amount => {
				*remaining -= amount;
				if remaining.is_zero() {
					self.locks.remove(order_id);
				}
				Ok(())
			}
			Some(LockValue::Funds(remaining)) => Err(RiskError::LedgerInconsistency {
				order_id: order_id.to_string(),
				detail: format!("ledger holds {} but slice consumed {}", remaining, amount),
			}),
			_ => Err(RiskError::LedgerInconsistency {
				order_id: order_id.to_string(),
				detail: "no funds lock for settled buy order".to_string(),
			}),
		}
	}

	fn consume_shares_lock(&mut self, order_id: &str, quantity: u64) -> Result<(), RiskError> {
		match self.locks.get_mut(order_id) {
			Some(LockValue::Shares(remaining)) if *remaining >= quantity => {
				*remaining -= quantity;
				if *remaining == 0 {
					self.locks.remove(order_id);
				}
				Ok(())
			}
			Some(LockValue::Shares(remaining)) => Err(RiskError::LedgerInconsistency {
				order_id: order_id.to_string(),
				detail: format!("ledger holds {} shares, slice consumed {}", remaining, quantity),
			}),
			_ => Err(RiskError::LedgerInconsistency {
				order_id: order_id.to_string(),
				detail: "no share lock for settled sell order".to_string(),
			}),
		}
	}

	// Administrative surface, driven by operator tooling and tests

	pub fn set_balance(&mut self, user_id: &str, amount: Decimal) {
		let balance = self.balances.entry(user_id.to_string()).or_default();
		balance.available = amount;
		let view = balance.view();
		self.emit_balance(user_id, BalanceUpdateKind::Set, view);
	}

	pub fn add_balance(&mut self, user_id: &str, amount: Decimal) {
		let balance = self.balances.entry(user_id.to_string()).or_default();
		balance.available += amount;
		let view = balance.view();
		self.emit_balance(user_id, BalanceUpdateKind::Add, view);
	}

	pub fn set_position(&mut self, user_id: &str, market_id: &str, outcome: Outcome, quantity: u64) {
		let key = self.position_key(user_id, market_id, outcome);
		let position = self.positions.entry(key).or_default();
		position.available = quantity;
		let snapshot = *position;
		self.emit_position(user_id, market_id, outcome, PositionUpdateKind::Set, snapshot);
	}

	// Read surface

	pub fn balance_view(&self, user_id: &str) -> BalanceView {
		self.balances
			.get(user_id)
			.cloned()
			.unwrap_or_default()
			.view()
	}

	pub fn position_views(&self, user_id: &str) -> Vec<PositionView> {
		self.positions
			.iter()
			.filter(|(key, _)| key.user_id == user_id)
			.map(|(key, position)| PositionView {
				market_id: key.market_id.clone(),
				outcome: key.outcome,
				available: position.available,
				locked: position.locked,
			})
			.collect()
	}

	// Recovery surface

	pub fn balances(&self) -> &HashMap<String, Balance> {
		&self.balances
	}

	pub fn positions(&self) -> &HashMap<PositionKey, Position> {
		&self.positions
	}

	pub fn locks(&self) -> &HashMap<String, LockValue> {
		&self.locks
	}

	pub fn restore_balances(&mut self, balances: HashMap<String, Balance>) {
		self.balances = balances;
	}

	pub fn restore_positions(&mut self, positions: HashMap<PositionKey, Position>) {
		self.positions = positions;
	}

	pub fn restore_locks(&mut self, locks: HashMap<String, LockValue>) {
		self.locks = locks;
	}

	fn emit_balance(&self, user_id: &str, kind: BalanceUpdateKind, balance: BalanceView) {
		self.events.publish(DomainEvent::BalanceUpdated {
			user_id: user_id.to_string(),
			kind,
			balance,
		});
	}

	fn emit_position(
		&self,
		user_id: &str,
		market_id: &str,
		outcome: Outcome,
		kind: PositionUpdateKind,
		position: Position,
	) {
		self.events.publish(DomainEvent::PositionUpdated {
			user_id: user_id.to_string(),
			kind,
			position: PositionView {
				market_id: market_id.to_string(),
				outcome,
				available: position.available,
				locked: position.locked,
			},
		});
	}
}
