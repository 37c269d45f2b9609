//! Upstream market-data provider contract.
//!
//! The coverage engine, detector, and registry talk to this trait only; the
//! concrete Yahoo implementation lives in [`yahoo`]. Test suites plug mock
//! implementations.

pub mod ratelimit;
pub mod yahoo;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rand::Rng;
use thiserror::Error;

use crate::model::DailyBar;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream rate limited")]
    RateLimited,

    #[error("upstream request timed out")]
    Timeout,

    #[error("unexpected response status {status} at {url}")]
    Status { status: u16, url: String },

    #[error("no data for {0} in the requested window")]
    NoData(String),

    #[error("invalid or unknown symbol: {0}")]
    InvalidSymbol(String),

    #[error("malformed upstream payload: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Transient errors are retried with backoff; the rest surface at once.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited | ProviderError::Timeout => true,
            ProviderError::Status { status, .. } => *status >= 500,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::NoData(_) | ProviderError::InvalidSymbol(_) | ProviderError::Decode(_) => {
                false
            }
        }
    }
}

/// A split event: `numerator`-for-`denominator` (4:1 split → 4/1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitAction {
    pub date: NaiveDate,
    pub numerator: u32,
    pub denominator: u32,
}

impl SplitAction {
    /// Share multiplication factor; `< 1` means a reverse split.
    pub fn factor(&self) -> f64 {
        if self.denominator == 0 {
            1.0
        } else {
            f64::from(self.numerator) / f64::from(self.denominator)
        }
    }
}

/// A cash distribution (dividend or capital gain) on an ex-date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CashAction {
    pub date: NaiveDate,
    pub amount: f64,
}

/// Corporate actions reported alongside a price window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionFeed {
    pub splits: Vec<SplitAction>,
    pub dividends: Vec<CashAction>,
    pub capital_gains: Vec<CashAction>,
}

impl ActionFeed {
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty() && self.dividends.is_empty() && self.capital_gains.is_empty()
    }
}

/// Adjusted daily bars plus the action feed for the same window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub bars: Vec<DailyBar>,
    pub actions: ActionFeed,
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Fetch adjusted daily bars and corporate actions for the **inclusive**
    /// range `[start, end]`. Empty results are legal (pre-IPO or delisted
    /// windows); bars come back sorted by date and deduplicated.
    async fn daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<History, ProviderError>;

    /// Cheap existence probe used by auto-registration. `Ok(false)` means the
    /// provider answered and knows no such symbol.
    async fn validate_symbol(&self, symbol: &str) -> Result<bool, ProviderError>;

    /// Identifier stamped into `prices.source`.
    fn source_name(&self) -> &'static str;
}

/// Exponential backoff with ±20 % jitter, capped per sleep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max.as_secs_f64());
        let jitter = rand::rng().random_range(0.8..=1.2);
        Duration::from_secs_f64(capped * jitter)
    }
}
