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

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use verdict_sdk::{Outcome, OrderStatus, Side};

/// Internal order representation
///
/// Created by the sequencer at admission; mutated only by the matching
/// phase (remaining, filled, status) and the cancellation path.
/// `filled + remaining == quantity` holds at all times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
	/// Unique order ID, minted from a monotonic counter
	pub id: String,
	/// Owning user
	pub user_id: String,
	/// Market identifier (opaque to the engine)
	pub market_id: String,
	/// Which binary outcome this order trades
	pub outcome: Outcome,
	pub side: Side,
	/// Limit price, two-decimal value in [0.01, 0.99]
	pub price: Decimal,
	/// Original quantity
	pub quantity: u64,
	pub remaining: u64,
	pub filled: u64,
	pub status: OrderStatus,
	/// Wall-clock milliseconds at admission
	pub received_at: i64,
	/// Sequence number, assigned when the order leaves the intake queue
	pub sequence: Option<u64>,
	pub sequenced_at: Option<i64>,
}

impl Order {
	/// Notional value of the full order at its limit price
	pub fn notional(&self) -> Decimal {
		self.price * Decimal::from(self.quantity)
	}

	pub fn book_id(&self) -> BookId {
		BookId {
			market_id: self.market_id.clone(),
			outcome: self.outcome,
		}
	}
}

/// Immutable record of one execution
///
/// The execution price is always the resting (maker) order's price; the
/// aggressor's price improvement is refunded at settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
	/// Unique trade ID, minted from a monotonic counter
	pub id: String,
	pub market_id: String,
	pub outcome: Outcome,
	pub buy_order_id: String,
	pub sell_order_id: String,
	pub buyer_id: String,
	pub seller_id: String,
	pub quantity: u64,
	pub price: Decimal,
	/// `quantity * price`
	pub total: Decimal,
	pub executed_at: i64,
}

/// Identity of one order book: a (market, outcome) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookId {
	pub market_id: String,
	pub outcome: Outcome,
}

impl std::fmt::Display for BookId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.market_id, self.outcome)
	}
}

/// Book key with exact integer comparison
///
/// Prices are two-decimal values; keying the book on hundredths avoids any
/// dependence on `Decimal` normalization when levels are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PricePoint(i64);

impl PricePoint {
	pub fn from_decimal(price: Decimal) -> Self {
		let scaled = (price * Decimal::from(100)).trunc();
		PricePoint(i64::try_from(scaled.mantissa() / 10i128.pow(scaled.scale())).unwrap_or(0))
	}

	pub fn to_decimal(self) -> Decimal {
		Decimal::new(self.0, 2)
	}

	pub fn raw(self) -> i64 {
		self.0
	}
}

/// Current wall-clock time in milliseconds
pub fn now_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

/// Check that a price is a two-decimal value inside the valid band
pub fn valid_price(price: Decimal) -> bool {
	let min = Decimal::new(1, 2);
	let max = Decimal::new(99, 2);
	if price < min || price > max {
		return false;
	}
	(price * Decimal::from(100)).fract().is_zero()
}

#[cfg(test)]
mod tests {
	use super::*;
	use rust_decimal_macros::dec;

	fn sample_order() -> Order {
		Order {
			id: "ORD-000000000001".to_string(),
			user_id: "u1".to_string(),
			market_id: "mkt-1".to_string(),
			outcome: Outcome::Yes,
			side: Side::Buy,
			price: dec!(0.55),
			quantity: 10,
			remaining: 10,
			filled: 0,
			status: OrderStatus::Queued,
			received_at: 1_700_000_000_000,
			sequence: None,
			sequenced_at: None,
		}
	}

	#[test]
	fn test_notional() {
		assert_eq!(sample_order().notional(), dec!(5.50));
	}

	#[test]
	fn test_price_point_roundtrip() {
		let p = PricePoint::from_decimal(dec!(0.55));
		assert_eq!(p.raw(), 55);
		assert_eq!(p.to_decimal(), dec!(0.55));
	}

	#[test]
	fn test_price_point_ordering() {
		assert!(PricePoint::from_decimal(dec!(0.40)) < PricePoint::from_decimal(dec!(0.41)));
	}

	#[test]
	fn test_valid_price_band() {
		assert!(valid_price(dec!(0.01)));
		assert!(valid_price(dec!(0.99)));
		assert!(valid_price(dec!(0.50)));
		assert!(!valid_price(dec!(0.00)));
		assert!(!valid_price(dec!(1.00)));
		assert!(!valid_price(dec!(0.005)));
		assert!(!valid_price(dec!(0.555)));
	}
}
