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

use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine configuration
///
/// Every knob has a production default; deployments override through a
/// config file or `VERDICT_`-prefixed environment variables. The camelCase
/// aliases accept config files written for the legacy deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
	/// Directory for write-ahead log files
	#[serde(alias = "walPath")]
	pub wal_path: PathBuf,
	/// Directory for snapshot files
	#[serde(alias = "snapshotPath")]
	pub snapshot_path: PathBuf,
	/// Take a snapshot every this many logged events
	#[serde(alias = "snapshotInterval")]
	pub snapshot_interval: u64,
	/// Buffered log entries before an inline flush
	#[serde(alias = "bufferSize")]
	pub buffer_size: usize,
	/// Background flush period in milliseconds
	#[serde(alias = "flushInterval")]
	pub flush_interval_ms: u64,
	/// Orders drained from the intake queue per batch
	#[serde(alias = "batchSize")]
	pub batch_size: usize,
	/// Drain period in milliseconds when the queue is idle
	#[serde(alias = "batchTimeout")]
	pub batch_timeout_ms: u64,
	/// Per-user accepted submissions per wall-clock second
	#[serde(alias = "maxOrdersPerSecond")]
	pub max_orders_per_second: u32,
	/// Per-order notional cap
	#[serde(alias = "maxOrderValue")]
	pub max_order_value: Decimal,
	/// Cap on a user's resulting position per (market, outcome)
	#[serde(alias = "maxPositionSize")]
	pub max_position_size: u64,
	/// Balance floor a BUY may not dip under
	#[serde(alias = "minBalance")]
	pub min_balance: Decimal,
	/// Intake queue capacity
	#[serde(alias = "queueCapacity")]
	pub queue_capacity: usize,
	/// Per-subscriber event buffer capacity
	#[serde(alias = "eventBusCapacity")]
	pub event_bus_capacity: usize,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			wal_path: PathBuf::from("./data/wal"),
			snapshot_path: PathBuf::from("./data/snapshots"),
			snapshot_interval: 10_000,
			buffer_size: 100,
			flush_interval_ms: 100,
			batch_size: 100,
			batch_timeout_ms: 1,
			max_orders_per_second: 10_000,
			max_order_value: Decimal::from(10_000),
			max_position_size: 100_000,
			min_balance: Decimal::ZERO,
			queue_capacity: 10_000,
			event_bus_capacity: 1_024,
		}
	}
}

impl EngineSettings {
	/// Load configuration from environment variables
	pub fn from_env() -> Result<Self, config::ConfigError> {
		let cfg = config::Config::builder()
			.add_source(config::Environment::with_prefix("VERDICT"))
			.build()?;

		cfg.try_deserialize()
	}

	/// Load configuration from file
	pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
		let cfg = config::Config::builder()
			.add_source(config::File::with_name(path))
			.add_source(config::Environment::with_prefix("VERDICT"))
			.build()?;

		cfg.try_deserialize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults_match_documentation() {
		let settings = EngineSettings::default();
		assert_eq!(settings.wal_path, PathBuf::from("./data/wal"));
		assert_eq!(settings.snapshot_interval, 10_000);
		assert_eq!(settings.buffer_size, 100);
		assert_eq!(settings.flush_interval_ms, 100);
		assert_eq!(settings.batch_size, 100);
		assert_eq!(settings.batch_timeout_ms, 1);
		assert_eq!(settings.max_orders_per_second, 10_000);
		assert_eq!(settings.max_order_value, Decimal::from(10_000));
		assert_eq!(settings.max_position_size, 100_000);
		assert_eq!(settings.min_balance, Decimal::ZERO);
	}
}
