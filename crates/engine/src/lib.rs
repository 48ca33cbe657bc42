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

//! Verdict Matching Engine
//!
//! A crash-safe central limit order book for binary prediction markets.
//! Each (market, outcome) pair has an in-memory book with price-time
//! priority; every state change is journaled to a write-ahead log with
//! periodic snapshots so the books, balances and positions can be rebuilt
//! after a crash.
//!
//! Architecture:
//! - Single-threaded critical path: sequencing, risk, matching and book
//!   mutation all run on one engine thread for deterministic replay
//! - Event sourcing: the journal plus the newest snapshot reconstruct all
//!   core state
//! - Per-order risk locks: funds (BUY) or shares (SELL) are reserved at
//!   sequencing time and settled trade by trade
//! - MPSC intake queue between submitters and the engine thread
//! - Non-blocking fan-out of domain events to subscribers

pub mod book;
pub mod config;
pub mod core;
pub mod events;
pub mod matching;
pub mod persist;
pub mod risk;
pub mod sequencer;
pub mod types;

pub use book::{BookState, OrderBook};
pub use config::EngineSettings;
pub use core::{Engine, EngineError};
pub use events::{
	BalanceUpdateKind, BookUpdateKind, DomainEvent, EventBus, PositionUpdateKind,
};
pub use matching::{MatchOutcome, MatchingCore, TradeFill};
pub use persist::{
	EngineSnapshot, PersistenceManager, RecoveredState, SnapshotStore, Wal, WalError,
	WalEventBody, WalRecord,
};
pub use risk::{Balance, LockValue, Position, PositionKey, RiskEngine, RiskError, RiskLimits};
pub use sequencer::{RateLimiter, Sequencer};
pub use types::{BookId, Order, PricePoint, Trade};
