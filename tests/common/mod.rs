#![allow(dead_code)]

//! Shared fixtures: an in-memory service harness and a programmable mock
//! provider. The mock can be gated on a semaphore so tests control exactly
//! when each upstream call completes.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Days, NaiveDate, Weekday};
use tokio::sync::Semaphore;

use pricevault::config::Config;
use pricevault::coverage::CoverageService;
use pricevault::db::Db;
use pricevault::locks::SymbolLocks;
use pricevault::model::DailyBar;
use pricevault::provider::{ActionFeed, History, ProviderError, UpstreamProvider};
use pricevault::store::events::EventStore;
use pricevault::store::jobs::JobStore;
use pricevault::store::prices::PriceStore;
use pricevault::store::symbols::SymbolStore;

pub fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

/// One synthetic bar with a plausible OHLC envelope around `close`.
pub fn bar(date: NaiveDate, close: f64) -> DailyBar {
    DailyBar {
        date,
        open: close * 0.995,
        high: close * 1.01,
        low: close * 0.99,
        close,
        volume: 1_000,
    }
}

/// Weekday bars over `[from, to]` at a flat close.
pub fn weekday_bars(from: NaiveDate, to: NaiveDate, close: f64) -> Vec<DailyBar> {
    let mut bars = Vec::new();
    let mut day = from;
    while day <= to {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            bars.push(bar(day, close));
        }
        day = day.succ_opt().unwrap();
    }
    bars
}

/// Calendar-day bars over `[from, to]` (weekends included; keeps tests
/// independent of which weekday "today" lands on).
pub fn daily_bars(from: NaiveDate, to: NaiveDate, close: f64) -> Vec<DailyBar> {
    let mut bars = Vec::new();
    let mut day = from;
    while day <= to {
        bars.push(bar(day, close));
        day = day.succ_opt().unwrap();
    }
    bars
}

/// Programmable provider: per-symbol bar sets and action feeds, a call log,
/// an optional gate, and a failure list.
#[derive(Default)]
pub struct MockProvider {
    data: Mutex<BTreeMap<String, Vec<DailyBar>>>,
    actions: Mutex<BTreeMap<String, ActionFeed>>,
    valid: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    call_log: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `daily_history` call must first win a gate permit; tests add
    /// permits to let calls through one at a time.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<DailyBar>) {
        self.data.lock().unwrap().insert(symbol.to_string(), bars);
    }

    pub fn set_actions(&self, symbol: &str, actions: ActionFeed) {
        self.actions
            .lock()
            .unwrap()
            .insert(symbol.to_string(), actions);
    }

    /// Mark a symbol as valid upstream even without bar data.
    pub fn set_valid(&self, symbol: &str) {
        self.valid.lock().unwrap().insert(symbol.to_string());
    }

    /// Make every call for this symbol fail with a 500.
    pub fn set_failing(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, symbol: &str) -> Vec<(NaiveDate, NaiveDate)> {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| s == symbol)
            .map(|(_, from, to)| (*from, *to))
            .collect()
    }
}

#[async_trait]
impl UpstreamProvider for MockProvider {
    async fn daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<History, ProviderError> {
        // log before the gate so tests can observe in-flight calls
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_log
            .lock()
            .unwrap()
            .push((symbol.to_string(), start, end));
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.failing.lock().unwrap().contains(symbol) {
            return Err(ProviderError::Status {
                status: 500,
                url: format!("mock://{symbol}"),
            });
        }

        let bars: Vec<DailyBar> = self
            .data
            .lock()
            .unwrap()
            .get(symbol)
            .map(|all| {
                all.iter()
                    .filter(|b| b.date >= start && b.date <= end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        let feed = self.actions.lock().unwrap().get(symbol).cloned();
        let actions = feed
            .map(|feed| ActionFeed {
                splits: feed
                    .splits
                    .into_iter()
                    .filter(|s| s.date >= start && s.date <= end)
                    .collect(),
                dividends: feed
                    .dividends
                    .into_iter()
                    .filter(|v| v.date >= start && v.date <= end)
                    .collect(),
                capital_gains: feed
                    .capital_gains
                    .into_iter()
                    .filter(|c| c.date >= start && c.date <= end)
                    .collect(),
            })
            .unwrap_or_default();

        Ok(History { bars, actions })
    }

    async fn validate_symbol(&self, symbol: &str) -> Result<bool, ProviderError> {
        Ok(self.valid.lock().unwrap().contains(symbol)
            || self.data.lock().unwrap().contains_key(symbol))
    }

    fn source_name(&self) -> &'static str {
        "mock"
    }
}

/// Fully wired in-memory service stack over a mock provider.
pub struct Harness {
    pub config: Config,
    pub db: Db,
    pub prices: PriceStore,
    pub symbols: SymbolStore,
    pub events: EventStore,
    pub jobs: JobStore,
    pub provider: Arc<MockProvider>,
    pub locks: Arc<SymbolLocks>,
    pub coverage: Arc<CoverageService>,
}

pub fn harness() -> Harness {
    harness_with(Config::default(), MockProvider::new())
}

pub fn harness_with(config: Config, provider: MockProvider) -> Harness {
    let db = Db::in_memory().unwrap();
    let prices = PriceStore::new(db.clone());
    let symbols = SymbolStore::new(db.clone());
    let events = EventStore::new(db.clone());
    let jobs = JobStore::new(db.clone(), &config);
    let provider = Arc::new(provider);
    let locks = Arc::new(SymbolLocks::new());
    let coverage = Arc::new(CoverageService::new(
        prices.clone(),
        symbols.clone(),
        events.clone(),
        provider.clone(),
        locks.clone(),
        config.refetch_days,
    ));
    Harness {
        config,
        db,
        prices,
        symbols,
        events,
        jobs,
        provider,
        locks,
        coverage,
    }
}

pub fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

pub fn days_ago(n: u64) -> NaiveDate {
    today().checked_sub_days(Days::new(n)).unwrap()
}

/// Poll `check` until it returns true or the timeout lapses.
pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
