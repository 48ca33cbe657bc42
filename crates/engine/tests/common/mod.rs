#![allow(dead_code)]

use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tempfile::TempDir;
use verdict_engine::{Engine, EngineSettings};
use verdict_sdk::{Outcome, Side, SubmitAccepted, SubmitOrderRequest, SubmitRejected};

pub const MARKET: &str = "mkt-test";

/// An engine wired to throwaway directories
pub struct TestHarness {
	pub engine: Engine,
	pub wal_dir: TempDir,
	pub snapshot_dir: TempDir,
}

pub fn start_engine() -> TestHarness {
	start_engine_with(|settings| settings)
}

pub fn start_engine_with(adjust: impl FnOnce(EngineSettings) -> EngineSettings) -> TestHarness {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
	let wal_dir = tempfile::tempdir().unwrap();
	let snapshot_dir = tempfile::tempdir().unwrap();
	let settings = EngineSettings {
		wal_path: wal_dir.path().to_path_buf(),
		snapshot_path: snapshot_dir.path().to_path_buf(),
		batch_timeout_ms: 1,
		flush_interval_ms: 10,
		..EngineSettings::default()
	};
	let engine = Engine::start(adjust(settings)).unwrap();
	TestHarness {
		engine,
		wal_dir,
		snapshot_dir,
	}
}

impl TestHarness {
	/// Stop the engine and start a fresh one over the same directories
	pub fn restart(self) -> TestHarness {
		let TestHarness {
			engine,
			wal_dir,
			snapshot_dir,
		} = self;
		engine.stop().unwrap();
		let settings = EngineSettings {
			wal_path: wal_dir.path().to_path_buf(),
			snapshot_path: snapshot_dir.path().to_path_buf(),
			batch_timeout_ms: 1,
			flush_interval_ms: 10,
			..EngineSettings::default()
		};
		TestHarness {
			engine: Engine::start(settings).unwrap(),
			wal_dir,
			snapshot_dir,
		}
	}
}

pub fn request(
	user: &str,
	side: Side,
	outcome: Outcome,
	quantity: u64,
	price: Decimal,
) -> SubmitOrderRequest {
	SubmitOrderRequest {
		user_id: user.to_string(),
		market_id: MARKET.to_string(),
		side,
		outcome,
		quantity,
		price,
	}
}

pub fn submit(
	engine: &Engine,
	user: &str,
	side: Side,
	quantity: u64,
	price: Decimal,
) -> Result<SubmitAccepted, SubmitRejected> {
	engine.submit(request(user, side, Outcome::Yes, quantity, price))
}

/// Poll until the condition holds; panics after five seconds
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while Instant::now() < deadline {
		if condition() {
			return;
		}
		std::thread::sleep(Duration::from_millis(5));
	}
	panic!("timed out waiting for {}", what);
}
