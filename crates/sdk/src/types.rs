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

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
	Buy,
	Sell,
}

impl std::fmt::Display for Side {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Side::Buy => write!(f, "BUY"),
			Side::Sell => write!(f, "SELL"),
		}
	}
}

/// Binary market outcome
///
/// Every market has exactly two books, one per outcome. On the wire the
/// outcome is a plain boolean (`true` = YES), matching the submission
/// surface; internally the enum keeps match arms explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "bool", into = "bool")]
pub enum Outcome {
	Yes,
	No,
}

impl From<bool> for Outcome {
	fn from(v: bool) -> Self {
		if v { Outcome::Yes } else { Outcome::No }
	}
}

impl From<Outcome> for bool {
	fn from(o: Outcome) -> bool {
		matches!(o, Outcome::Yes)
	}
}

impl std::fmt::Display for Outcome {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Outcome::Yes => write!(f, "YES"),
			Outcome::No => write!(f, "NO"),
		}
	}
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
	/// Accepted by the sequencer, waiting in the intake queue
	Queued,
	/// Resting on the book, no fills yet
	Open,
	/// Resting on the book with at least one fill
	Partial,
	/// Fully filled and removed from the book
	Filled,
	/// Cancelled and removed from the book (or the queue)
	Cancelled,
	/// Rejected by validation or risk checks
	Rejected,
}

/// Stable machine-readable rejection reasons for submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
	ValidationError,
	RateLimitExceeded,
	MaxOrderValueExceeded,
	MaxPositionSizeExceeded,
	InsufficientBalance,
	InsufficientShares,
	ProcessingError,
}

impl std::fmt::Display for RejectReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			RejectReason::ValidationError => "VALIDATION_ERROR",
			RejectReason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
			RejectReason::MaxOrderValueExceeded => "MAX_ORDER_VALUE_EXCEEDED",
			RejectReason::MaxPositionSizeExceeded => "MAX_POSITION_SIZE_EXCEEDED",
			RejectReason::InsufficientBalance => "INSUFFICIENT_BALANCE",
			RejectReason::InsufficientShares => "INSUFFICIENT_SHARES",
			RejectReason::ProcessingError => "PROCESSING_ERROR",
		};
		write!(f, "{}", s)
	}
}

/// Rejection reasons for cancellations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelRejectReason {
	NotFound,
	Unauthorized,
}

/// Request to submit a limit order
///
/// `side` is serialized as `type` to match the submission surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOrderRequest {
	pub user_id: String,
	pub market_id: String,
	#[serde(rename = "type")]
	pub side: Side,
	pub outcome: Outcome,
	pub quantity: u64,
	pub price: Decimal,
}

/// Successful submission: the order is queued for sequencing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAccepted {
	pub order_id: String,
	/// Position in the intake queue at admission time
	#[serde(rename = "position")]
	pub queue_position: usize,
	/// Rough milliseconds until the order reaches the matching phase
	#[serde(rename = "estimatedProcessingTime")]
	pub estimated_processing_ms: u64,
}

/// Rejected submission
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{reason}: {message}")]
pub struct SubmitRejected {
	/// Present when the order was minted before the rejection fired
	#[serde(skip_serializing_if = "Option::is_none")]
	pub order_id: Option<String>,
	pub reason: RejectReason,
	pub message: String,
}

/// Rejected cancellation
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{reason:?}: {message}")]
pub struct CancelRejected {
	pub reason: CancelRejectReason,
	pub message: String,
}

/// One aggregated price level of a book snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLevel {
	pub price: Decimal,
	pub quantity: u64,
	pub order_count: usize,
}

/// Running statistics of a single (market, outcome) book
///
/// `last_price`/`high_price`/`low_price` are absent until the first trade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookStats {
	pub total_bids: u64,
	pub total_asks: u64,
	pub total_volume: u64,
	pub trade_count: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_price: Option<Decimal>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub high_price: Option<Decimal>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub low_price: Option<Decimal>,
}

/// Depth-limited view of one side of the book plus aggregates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapshot {
	pub market_id: String,
	pub outcome: Outcome,
	/// Bids in descending price order
	pub bids: Vec<BookLevel>,
	/// Asks in ascending price order
	pub asks: Vec<BookLevel>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub best_bid: Option<Decimal>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub best_ask: Option<Decimal>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub spread: Option<Decimal>,
	pub stats: BookStats,
}

/// Per-user currency balance view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
	pub available: Decimal,
	pub locked: Decimal,
	pub total: Decimal,
}

/// Per-(market, outcome) share position view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
	pub market_id: String,
	pub outcome: Outcome,
	pub available: u64,
	pub locked: u64,
}

impl PositionView {
	/// Map key used by the positions read surface: `"{marketId}:{outcome}"`
	pub fn key(&self) -> String {
		format!("{}:{}", self.market_id, bool::from(self.outcome))
	}
}

/// Combined per-market statistics, one entry per outcome book
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketStats {
	pub market_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub yes: Option<BookStats>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub no: Option<BookStats>,
}
