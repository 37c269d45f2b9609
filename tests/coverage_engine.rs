//! Coverage engine scenarios: initial backfill, tail refresh, gap fill,
//! inception probing, and concurrent-caller dedup.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    d, daily_bars, days_ago, harness, harness_with, today, wait_until, weekday_bars, MockProvider,
};
use pricevault::config::Config;
use pricevault::model::EventType;
use pricevault::provider::{ActionFeed, CashAction};
use pricevault::store::events::EventFilter;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn initial_backfill_fetches_full_window() {
    let h = harness();
    let from = days_ago(5);
    let to = days_ago(1);
    h.provider.set_bars("AAPL", daily_bars(from, to, 100.0));

    let outcome = h
        .coverage
        .ensure_coverage("AAPL", from, to, false)
        .await
        .unwrap();

    assert_eq!(h.provider.calls_for("AAPL"), vec![(from, to)]);
    assert_eq!(outcome.rows_written(), 5);
    assert_eq!(h.prices.row_count("AAPL").await.unwrap(), 5);

    // the symbol row was auto-created with correct bounds
    let record = h.symbols.get("AAPL").await.unwrap().unwrap();
    assert_eq!(record.first_date, Some(from));
    assert_eq!(record.last_date, Some(to));
}

#[tokio::test]
async fn tail_refresh_starts_at_last_date_minus_n() {
    let h = harness();
    // stored weekday history ending ~10 days ago
    let seeded = weekday_bars(days_ago(40), days_ago(10), 100.0);
    let from = seeded.first().unwrap().date;
    let last = seeded.last().unwrap().date;
    h.prices.upsert_bars("AAPL", &seeded, "mock").await.unwrap();

    let to = today();
    h.provider
        .set_bars("AAPL", daily_bars(days_ago(20), to, 101.0));

    h.coverage
        .ensure_coverage("AAPL", from, to, false)
        .await
        .unwrap();

    // exactly one upstream call, starting at last_date − refetch_days
    let expected_start = last - chrono::Duration::days(h.config.refetch_days);
    assert_eq!(h.provider.calls_for("AAPL"), vec![(expected_start, to)]);

    // a second identical call finds fresh data and fetches nothing
    h.coverage
        .ensure_coverage("AAPL", from, to, false)
        .await
        .unwrap();
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn gap_fill_fetches_from_first_missing_weekday() {
    let h = harness();
    // weekday coverage with one weekday knocked out in the middle
    let full = weekday_bars(d("2024-01-02"), d("2024-01-19"), 100.0);
    let hole = d("2024-01-10");
    let seeded: Vec<_> = full.iter().copied().filter(|b| b.date != hole).collect();
    h.prices.upsert_bars("MSFT", &seeded, "mock").await.unwrap();
    h.provider.set_bars("MSFT", full);

    // request ends before stored history ends, so only the gap fires
    h.coverage
        .ensure_coverage("MSFT", d("2024-01-02"), d("2024-01-17"), false)
        .await
        .unwrap();

    assert_eq!(h.provider.calls_for("MSFT"), vec![(hole, d("2024-01-17"))]);
    assert_eq!(
        h.prices.row_count("MSFT").await.unwrap(),
        seeded.len() + 1,
        "the hole is filled"
    );
}

#[tokio::test]
async fn concurrent_callers_fetch_upstream_once() {
    let h = harness();
    let from = days_ago(4);
    let to = today();
    h.provider.set_bars("MSFT", daily_bars(from, to, 100.0));

    let a = {
        let coverage = Arc::clone(&h.coverage);
        tokio::spawn(async move { coverage.ensure_coverage("MSFT", from, to, false).await })
    };
    let b = {
        let coverage = Arc::clone(&h.coverage);
        tokio::spawn(async move { coverage.ensure_coverage("MSFT", from, to, false).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    // the second caller re-read coverage inside the lock and found no work
    assert_eq!(h.provider.call_count(), 1);
    assert_eq!(h.prices.row_count("MSFT").await.unwrap(), 5);
}

#[tokio::test]
async fn cancellation_stops_at_the_next_range_boundary() {
    let gate = Arc::new(Semaphore::new(0));
    let provider = MockProvider::gated(gate.clone());
    provider.set_bars("IBM", weekday_bars(d("2024-01-02"), d("2024-03-01"), 180.0));
    let h = harness_with(Config::default(), provider);

    // stored history starts 2024-02-05 with a hole on Tue 2024-02-20; a
    // request reaching back to January plans two disjoint ranges: the head
    // extension and the gap fill
    let seeded: Vec<_> = weekday_bars(d("2024-02-05"), d("2024-03-01"), 180.0)
        .into_iter()
        .filter(|b| b.date != d("2024-02-20"))
        .collect();
    h.prices.upsert_bars("IBM", &seeded, "mock").await.unwrap();

    let cancel = CancellationToken::new();
    let task = {
        let coverage = Arc::clone(&h.coverage);
        let token = cancel.clone();
        tokio::spawn(async move {
            coverage
                .ensure_coverage_with_cancel("IBM", d("2024-01-02"), d("2024-02-28"), false, &token)
                .await
        })
    };

    // first range (the head extension) is in flight, blocked at the gate
    let provider_handle = h.provider.clone();
    assert!(
        wait_until(
            || {
                let provider = provider_handle.clone();
                async move { provider.call_count() == 1 }
            },
            Duration::from_secs(5),
        )
        .await
    );
    cancel.cancel();
    gate.add_permits(8);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.segments.len(), 1);
    // the in-flight range finished and its rows stayed; the gap-fill range
    // was never fetched
    assert_eq!(
        outcome.segments[0].fetched_ranges,
        vec![(d("2024-01-02"), d("2024-02-05"))]
    );
    assert_eq!(
        outcome.notes(),
        vec!["cancelled before remaining ranges"]
    );
    assert_eq!(h.provider.call_count(), 1);
    assert_eq!(
        h.prices
            .coverage("IBM", d("2024-01-02"), d("2024-02-28"))
            .await
            .unwrap()
            .first_missing_weekday,
        Some(d("2024-02-20")),
        "the hole is still there"
    );
}

#[tokio::test]
async fn inception_probe_skips_windows_before_provider_history() {
    let h = harness();
    // provider history begins 2004-11-18
    h.provider
        .set_bars("GLD", daily_bars(d("2004-11-18"), d("2012-12-31"), 45.0));

    let outcome = h
        .coverage
        .ensure_coverage("GLD", d("1990-01-01"), d("2001-01-01"), false)
        .await
        .unwrap();

    assert_eq!(outcome.rows_written(), 0);
    assert_eq!(h.prices.row_count("GLD").await.unwrap(), 0);
    assert_eq!(
        outcome.notes(),
        vec!["no data available before 2004-11-18"]
    );

    // anchors 2000 and 2010 probed, then one refinement call; no data fetch
    let calls = h.provider.calls_for("GLD");
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].0, d("2000-01-01"));
    assert_eq!(calls[1].0, d("2010-01-01"));
}

#[tokio::test]
async fn inception_probe_adjusts_start_when_window_reaches_history() {
    let h = harness();
    h.provider
        .set_bars("GLD", daily_bars(d("2004-11-18"), d("2010-06-30"), 45.0));

    let outcome = h
        .coverage
        .ensure_coverage("GLD", d("2001-01-01"), d("2005-06-30"), false)
        .await
        .unwrap();

    assert_eq!(outcome.notes(), vec!["start adjusted to 2004-11-18"]);
    assert!(outcome.rows_written() > 0);
    // stored data starts exactly at inception
    let record = h.symbols.get("GLD").await.unwrap().unwrap();
    assert_eq!(record.first_date, Some(d("2004-11-18")));
}

#[tokio::test]
async fn provider_actions_are_recorded_as_events() {
    let h = harness();
    let from = days_ago(5);
    let to = days_ago(1);
    h.provider.set_bars("KO", daily_bars(from, to, 100.0));
    h.provider.set_actions(
        "KO",
        ActionFeed {
            dividends: vec![CashAction {
                date: days_ago(3),
                amount: 0.485,
            }],
            ..ActionFeed::default()
        },
    );

    h.coverage
        .ensure_coverage("KO", from, to, false)
        .await
        .unwrap();
    // a second pass dedups on the natural key
    h.coverage
        .ensure_coverage("KO", from, to, true)
        .await
        .unwrap();

    let events = h
        .events
        .list(&EventFilter {
            symbol: Some("KO".into()),
            ..EventFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Dividend);
    assert_eq!(events[0].event_date, days_ago(3));
    assert_eq!(events[0].amount, Some(0.485));
}

#[tokio::test]
async fn rename_splits_coverage_across_storage_symbols() {
    let h = harness();
    h.symbols
        .insert_change(&pricevault::model::SymbolChange {
            old_symbol: "FB".into(),
            new_symbol: "META".into(),
            change_date: d("2022-06-09"),
            reason: None,
        })
        .await
        .unwrap();
    h.provider
        .set_bars("FB", daily_bars(d("2022-06-01"), d("2022-06-08"), 196.0));
    h.provider
        .set_bars("META", daily_bars(d("2022-06-09"), d("2022-06-30"), 196.0));

    let outcome = h
        .coverage
        .ensure_coverage("META", d("2022-06-01"), d("2022-06-30"), false)
        .await
        .unwrap();

    assert_eq!(outcome.segments.len(), 2);
    assert_eq!(outcome.segments[0].storage_symbol, "FB");
    assert_eq!(outcome.segments[1].storage_symbol, "META");
    assert_eq!(h.prices.row_count("FB").await.unwrap(), 8);
    assert_eq!(h.prices.row_count("META").await.unwrap(), 22);
}
