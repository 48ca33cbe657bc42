//! Determinism and priority properties
//!
//! The same ordered submit stream against a fresh engine must produce the
//! same trades (ids, prices, quantities, order) and the same final books.

mod common;

use common::{MARKET, request, start_engine, wait_for};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use verdict_engine::DomainEvent;
use verdict_sdk::{Outcome, Side, SubmitOrderRequest};

fn scripted_stream() -> Vec<SubmitOrderRequest> {
	vec![
		request("u2", Side::Sell, Outcome::Yes, 30, dec!(0.55)),
		request("u3", Side::Sell, Outcome::Yes, 20, dec!(0.55)),
		request("u2", Side::Sell, Outcome::Yes, 10, dec!(0.60)),
		request("u1", Side::Buy, Outcome::Yes, 45, dec!(0.60)),
		request("u3", Side::Buy, Outcome::Yes, 10, dec!(0.50)),
		request("u1", Side::Sell, Outcome::Yes, 5, dec!(0.50)),
	]
}

fn run_stream(stream: &[SubmitOrderRequest], expected_trades: usize) -> (Vec<(String, String, String, Decimal, u64)>, verdict_sdk::BookSnapshot) {
	let harness = start_engine();
	let engine = &harness.engine;
	for user in ["u1", "u2", "u3"] {
		engine.set_balance(user, dec!(1000)).unwrap();
		engine.set_position(user, MARKET, Outcome::Yes, 100).unwrap();
	}

	let events = engine.subscribe();
	for request in stream {
		engine.submit(request.clone()).unwrap();
	}

	wait_for("all trades", || {
		engine
			.book_snapshot(MARKET, Outcome::Yes, 10)
			.map(|b| b.stats.trade_count as usize >= expected_trades)
			.unwrap_or(false)
	});

	let trades: Vec<_> = events
		.try_iter()
		.filter_map(|event| match event {
			DomainEvent::Trade { trade } => Some((
				trade.id,
				trade.buy_order_id,
				trade.sell_order_id,
				trade.price,
				trade.quantity,
			)),
			_ => None,
		})
		.collect();
	let book = engine.book_snapshot(MARKET, Outcome::Yes, 10).unwrap();
	harness.engine.stop().unwrap();
	(trades, book)
}

#[test]
fn test_same_stream_same_trades_and_books() {
	let stream = scripted_stream();
	let (trades_a, book_a) = run_stream(&stream, 3);
	let (trades_b, book_b) = run_stream(&stream, 3);

	assert_eq!(trades_a, trades_b);
	assert_eq!(book_a.bids, book_b.bids);
	assert_eq!(book_a.asks, book_b.asks);
	assert_eq!(book_a.stats, book_b.stats);
}

#[test]
fn test_price_time_priority_across_levels() {
	let harness = start_engine();
	let engine = &harness.engine;
	for user in ["u1", "u2", "u3", "u4"] {
		engine.set_balance(user, dec!(1000)).unwrap();
		engine.set_position(user, MARKET, Outcome::Yes, 100).unwrap();
	}

	let events = engine.subscribe();
	// Same level: u2 before u3; better level 0.50 added last
	engine
		.submit(request("u2", Side::Sell, Outcome::Yes, 10, dec!(0.55)))
		.unwrap();
	engine
		.submit(request("u3", Side::Sell, Outcome::Yes, 10, dec!(0.55)))
		.unwrap();
	engine
		.submit(request("u4", Side::Sell, Outcome::Yes, 10, dec!(0.50)))
		.unwrap();
	engine
		.submit(request("u1", Side::Buy, Outcome::Yes, 25, dec!(0.55)))
		.unwrap();

	wait_for("sweep to finish", || {
		engine
			.book_snapshot(MARKET, Outcome::Yes, 10)
			.map(|b| b.stats.trade_count == 3)
			.unwrap_or(false)
	});

	let trades: Vec<(Decimal, String)> = events
		.try_iter()
		.filter_map(|event| match event {
			DomainEvent::Trade { trade } => Some((trade.price, trade.seller_id)),
			_ => None,
		})
		.collect();

	// Best price first, then arrival order within the 0.55 level
	assert_eq!(
		trades,
		vec![
			(dec!(0.50), "u4".to_string()),
			(dec!(0.55), "u2".to_string()),
			(dec!(0.55), "u3".to_string()),
		]
	);

	harness.engine.stop().unwrap();
}

#[test]
fn test_no_trade_ever_self_crosses() {
	let harness = start_engine();
	let engine = &harness.engine;
	for user in ["u1", "u2"] {
		engine.set_balance(user, dec!(1000)).unwrap();
		engine.set_position(user, MARKET, Outcome::Yes, 100).unwrap();
	}

	let events = engine.subscribe();
	engine
		.submit(request("u1", Side::Sell, Outcome::Yes, 10, dec!(0.50)))
		.unwrap();
	engine
		.submit(request("u2", Side::Sell, Outcome::Yes, 10, dec!(0.50)))
		.unwrap();
	// u1 crosses its own ask; only u2's may fill
	engine
		.submit(request("u1", Side::Buy, Outcome::Yes, 20, dec!(0.50)))
		.unwrap();

	wait_for("fill against the other user", || {
		engine
			.book_snapshot(MARKET, Outcome::Yes, 10)
			.map(|b| b.stats.trade_count == 1)
			.unwrap_or(false)
	});

	let trades: Vec<_> = events
		.try_iter()
		.filter_map(|event| match event {
			DomainEvent::Trade { trade } => Some(trade),
			_ => None,
		})
		.collect();
	assert_eq!(trades.len(), 1);
	for trade in &trades {
		assert_ne!(trade.buyer_id, trade.seller_id);
	}

	// u1's own ask still rests, u1's residual buy rests
	let book = engine.book_snapshot(MARKET, Outcome::Yes, 10).unwrap();
	assert_eq!(book.asks[0].quantity, 10);
	assert_eq!(book.bids[0].quantity, 10);

	harness.engine.stop().unwrap();
}
