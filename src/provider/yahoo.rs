//! Yahoo Finance chart-API provider.
//!
//! Talks to the v8 chart endpoint and parses the JSON envelope into typed
//! bars at the boundary. Key behavior:
//!
//! - **Adjusted bars**: raw OHLC is scaled by `adjclose / close` per row so
//!   every returned bar reflects later splits and dividends.
//! - **Inclusive range**: the endpoint treats `period2` as exclusive; one
//!   day is added internally so the trait contract stays inclusive.
//! - **Rate control**: a token bucket gates every outbound attempt and a
//!   process-wide semaphore bounds concurrent calls.
//! - **Retry**: transient failures (timeouts, resets, 429, 5xx) back off
//!   exponentially with jitter up to a configured attempt limit; definitive
//!   answers ("no data", invalid symbol) surface immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Duration};

use super::ratelimit::TokenBucket;
use super::{
    ActionFeed, BackoffPolicy, CashAction, History, ProviderError, SplitAction, UpstreamProvider,
};
use crate::config::Config;
use crate::model::DailyBar;

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";
const SOURCE_NAME: &str = "yahoo-chart-v8";
const VALIDATE_PROBE_DAYS: u64 = 30;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Option<ChartNode>,
}

#[derive(Debug, Deserialize)]
struct ChartNode {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
    #[serde(default)]
    events: Option<Events>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteBlock>,
    #[serde(default)]
    adjclose: Vec<AdjCloseBlock>,
}

#[derive(Debug, Deserialize)]
struct QuoteBlock {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseBlock {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize, Default)]
struct Events {
    #[serde(default)]
    dividends: Option<BTreeMap<String, CashEventWire>>,
    #[serde(default)]
    splits: Option<BTreeMap<String, SplitEventWire>>,
    #[serde(default, rename = "capitalGains")]
    capital_gains: Option<BTreeMap<String, CashEventWire>>,
}

#[derive(Debug, Deserialize)]
struct CashEventWire {
    amount: Option<f64>,
    date: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SplitEventWire {
    numerator: Option<f64>,
    denominator: Option<f64>,
    date: Option<i64>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct YahooProvider {
    http: reqwest::Client,
    base_url: String,
    bucket: TokenBucket,
    semaphore: Arc<Semaphore>,
    backoff: BackoffPolicy,
    rate_limit_backoff: BackoffPolicy,
    max_retries: u32,
    validate_timeout: Duration,
}

impl YahooProvider {
    pub fn new(config: &Config) -> Result<Self, ProviderError> {
        Self::with_base_url(config, DEFAULT_BASE_URL)
    }

    /// Point the provider at an alternate endpoint; tests use this against a
    /// local mock server.
    pub fn with_base_url(config: &Config, base_url: &str) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent("pricevault/0.1")
            .build()?;
        let backoff_base = Duration::from_millis(500);
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: TokenBucket::new(
                config.rate_limit_requests_per_second,
                config.rate_limit_burst_size,
            ),
            semaphore: Arc::new(Semaphore::new(config.upstream_concurrency.max(1))),
            backoff: BackoffPolicy {
                base: backoff_base,
                multiplier: 2.0,
                max: config.fetch_backoff_max,
            },
            rate_limit_backoff: BackoffPolicy {
                base: backoff_base,
                multiplier: 2.0,
                max: config.rate_limit_max_backoff,
            },
            max_retries: config.fetch_max_retries,
            validate_timeout: config.validate_timeout,
        })
    }

    async fn fetch_envelope(
        &self,
        symbol: &str,
        period1: i64,
        period2: i64,
    ) -> Result<ChartEnvelope, ProviderError> {
        let url = format!("{}/v8/finance/chart/{symbol}", self.base_url);
        let params = [
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
            ("interval", "1d".to_string()),
            ("events", "div|split|capitalGains".to_string()),
            ("includePrePost", "false".to_string()),
        ];

        let mut last_err: Option<ProviderError> = None;
        for attempt in 0..=self.max_retries {
            self.bucket.acquire().await;

            let outcome = match self.http.get(&url).query(&params).send().await {
                Ok(resp) => classify_response(symbol, &url, resp).await,
                Err(e) if e.is_timeout() => Err(ProviderError::Timeout),
                Err(e) => Err(ProviderError::Http(e)),
            };

            match outcome {
                Ok(body) => return decode_envelope(symbol, &body),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = if matches!(e, ProviderError::RateLimited) {
                        self.rate_limit_backoff.delay(attempt)
                    } else {
                        self.backoff.delay(attempt)
                    };
                    tracing::warn!(
                        %symbol,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        "upstream error, retrying in {:?}: {e}",
                        delay
                    );
                    last_err = Some(e);
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ProviderError::RateLimited))
    }
}

/// Turn an HTTP response into either a body to decode or a typed error.
async fn classify_response(
    symbol: &str,
    url: &str,
    resp: reqwest::Response,
) -> Result<String, ProviderError> {
    let status = resp.status().as_u16();
    if status == 429 {
        return Err(ProviderError::RateLimited);
    }
    if status == 404 {
        return Err(ProviderError::InvalidSymbol(symbol.to_string()));
    }
    if status >= 400 {
        return Err(ProviderError::Status {
            status,
            url: url.to_string(),
        });
    }
    resp.text().await.map_err(ProviderError::Http)
}

fn decode_envelope(symbol: &str, body: &str) -> Result<ChartEnvelope, ProviderError> {
    let envelope: ChartEnvelope =
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    if let Some(error) = envelope.chart.as_ref().and_then(|c| c.error.as_ref()) {
        if error.code.eq_ignore_ascii_case("not found") {
            return Err(ProviderError::InvalidSymbol(symbol.to_string()));
        }
        return Err(ProviderError::NoData(format!(
            "{symbol}: {} - {}",
            error.code, error.description
        )));
    }
    Ok(envelope)
}

/// Assemble cleaned, adjusted bars plus the action feed from one chart result.
///
/// Rows missing any of O/H/L/C, or with a non-positive price, or with a
/// negative volume, are dropped. Output is sorted by date with last-wins
/// deduplication.
fn assemble_history(
    envelope: ChartEnvelope,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<History, ProviderError> {
    let result = envelope
        .chart
        .and_then(|c| c.result)
        .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) });

    let Some(result) = result else {
        return Ok(History::default());
    };

    let ts = result.timestamp.unwrap_or_default();
    let quote = result.indicators.quote.into_iter().next();
    let adjclose = result
        .indicators
        .adjclose
        .into_iter()
        .next()
        .map(|a| a.adjclose)
        .unwrap_or_default();

    let mut bars: BTreeMap<NaiveDate, DailyBar> = BTreeMap::new();
    if let Some(quote) = quote {
        for (i, &t) in ts.iter().enumerate() {
            let Some(date) = DateTime::from_timestamp(t, 0).map(|dt| dt.date_naive()) else {
                continue;
            };
            if date < start || date > end {
                continue;
            }
            let (Some(open), Some(high), Some(low), Some(close)) = (
                get_opt(&quote.open, i),
                get_opt(&quote.high, i),
                get_opt(&quote.low, i),
                get_opt(&quote.close, i),
            ) else {
                continue;
            };
            if open <= 0.0 || high <= 0.0 || low <= 0.0 || close <= 0.0 {
                continue;
            }
            let volume = match quote.volume.get(i).copied().flatten() {
                Some(v) if v < 0 => continue,
                Some(v) => v,
                None => 0,
            };
            // scale raw OHLC into adjusted terms
            let factor = match get_opt(&adjclose, i) {
                Some(adj) if close > 0.0 => adj / close,
                _ => 1.0,
            };
            bars.insert(
                date,
                DailyBar {
                    date,
                    open: open * factor,
                    high: high * factor,
                    low: low * factor,
                    close: close * factor,
                    volume,
                },
            );
        }
    }

    let mut actions = ActionFeed::default();
    if let Some(events) = result.events {
        for ev in events.dividends.unwrap_or_default().into_values() {
            if let (Some(date), Some(amount)) = (epoch_date(ev.date), ev.amount) {
                actions.dividends.push(CashAction { date, amount });
            }
        }
        for ev in events.capital_gains.unwrap_or_default().into_values() {
            if let (Some(date), Some(amount)) = (epoch_date(ev.date), ev.amount) {
                actions.capital_gains.push(CashAction { date, amount });
            }
        }
        for ev in events.splits.unwrap_or_default().into_values() {
            let (Some(date), Some(num), Some(den)) =
                (epoch_date(ev.date), ev.numerator, ev.denominator)
            else {
                continue;
            };
            if num <= 0.0 || den <= 0.0 {
                continue;
            }
            actions.splits.push(SplitAction {
                date,
                numerator: num.round() as u32,
                denominator: den.round() as u32,
            });
        }
        actions.splits.sort_by_key(|s| s.date);
        actions.dividends.sort_by_key(|d| d.date);
        actions.capital_gains.sort_by_key(|c| c.date);
    }

    Ok(History {
        bars: bars.into_values().collect(),
        actions,
    })
}

fn get_opt(v: &[Option<f64>], i: usize) -> Option<f64> {
    v.get(i).copied().flatten()
}

fn epoch_date(ts: Option<i64>) -> Option<NaiveDate> {
    ts.and_then(|t| DateTime::from_timestamp(t, 0))
        .map(|dt| dt.date_naive())
}

fn date_epoch(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

#[async_trait::async_trait]
impl UpstreamProvider for YahooProvider {
    async fn daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<History, ProviderError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("upstream semaphore is never closed");

        let period1 = date_epoch(start);
        // provider treats period2 as exclusive; widen by one day to keep the
        // trait contract inclusive
        let period2 = date_epoch(end.checked_add_days(Days::new(1)).unwrap_or(end));

        let envelope = self.fetch_envelope(symbol, period1, period2).await?;
        assemble_history(envelope, start, end)
    }

    async fn validate_symbol(&self, symbol: &str) -> Result<bool, ProviderError> {
        let end = Utc::now().date_naive();
        let start = end
            .checked_sub_days(Days::new(VALIDATE_PROBE_DAYS))
            .unwrap_or(end);
        match timeout(self.validate_timeout, self.daily_history(symbol, start, end)).await {
            Ok(Ok(history)) => Ok(!history.bars.is_empty()),
            Ok(Err(ProviderError::InvalidSymbol(_) | ProviderError::NoData(_))) => Ok(false),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    fn source_name(&self) -> &'static str {
        SOURCE_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn envelope_from(body: &str) -> ChartEnvelope {
        decode_envelope("TEST", body).unwrap()
    }

    // Jan 2 2024 00:00 UTC = 1704153600; Jan 3 = 1704240000; Jan 4 = 1704326400
    const CHART_BODY: &str = r#"{
      "chart": {
        "result": [{
          "timestamp": [1704153600, 1704240000, 1704326400],
          "indicators": {
            "quote": [{
              "open":   [100.0, 102.0, null],
              "high":   [105.0, 104.0, 108.0],
              "low":    [ 99.0, 101.0, 103.0],
              "close":  [104.0, 103.0, 107.0],
              "volume": [10000, -5, 12000]
            }],
            "adjclose": [{"adjclose": [52.0, 51.5, 53.5]}]
          },
          "events": {
            "dividends": {"1704240000": {"amount": 0.24, "date": 1704240000}},
            "splits": {"1704153600": {"numerator": 2, "denominator": 1, "date": 1704153600}}
          }
        }],
        "error": null
      }
    }"#;

    #[test]
    fn assembles_adjusted_sorted_bars() {
        let history =
            assemble_history(envelope_from(CHART_BODY), d("2024-01-01"), d("2024-01-31")).unwrap();

        // row 2 has null open, row 1 has negative volume: both dropped
        assert_eq!(history.bars.len(), 1);
        let bar = history.bars[0];
        assert_eq!(bar.date, d("2024-01-02"));
        // factor = 52/104 = 0.5
        assert!((bar.open - 50.0).abs() < 1e-9);
        assert!((bar.high - 52.5).abs() < 1e-9);
        assert!((bar.low - 49.5).abs() < 1e-9);
        assert!((bar.close - 52.0).abs() < 1e-9);
        assert_eq!(bar.volume, 10000);
        assert!(bar.is_valid());

        assert_eq!(history.actions.splits.len(), 1);
        assert_eq!(history.actions.splits[0].numerator, 2);
        assert_eq!(history.actions.dividends.len(), 1);
        assert!((history.actions.dividends[0].amount - 0.24).abs() < 1e-9);
    }

    #[test]
    fn window_filter_applies() {
        let history =
            assemble_history(envelope_from(CHART_BODY), d("2024-01-05"), d("2024-01-31")).unwrap();
        assert!(history.bars.is_empty());
    }

    #[test]
    fn chart_error_maps_to_invalid_symbol() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        match decode_envelope("NOPE", body) {
            Err(ProviderError::InvalidSymbol(s)) => assert_eq!(s, "NOPE"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_result_is_legal() {
        let body = r#"{"chart":{"result":[{"timestamp":null,"indicators":{"quote":[],"adjclose":[]}}],"error":null}}"#;
        let history =
            assemble_history(envelope_from(body), d("2024-01-01"), d("2024-01-31")).unwrap();
        assert!(history.bars.is_empty());
        assert!(history.actions.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_retries_until_exhaustion() {
        let server = httpmock::MockServer::start_async().await;
        let limited = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/v8/finance/chart/AAPL");
                then.status(429);
            })
            .await;

        let mut config = Config {
            fetch_max_retries: 2,
            rate_limit_requests_per_second: 0.0,
            fetch_backoff_max: Duration::from_millis(10),
            rate_limit_max_backoff: Duration::from_millis(10),
            ..Config::default()
        };
        config.fetch_timeout = Duration::from_secs(2);

        let provider = YahooProvider::with_base_url(&config, &server.base_url()).unwrap();
        let err = provider
            .daily_history("AAPL", d("2024-01-01"), d("2024-01-05"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited));
        // initial attempt + 2 retries
        limited.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn http_fetch_decodes_bars() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/v8/finance/chart/AAPL");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(CHART_BODY);
            })
            .await;

        let config = Config {
            rate_limit_requests_per_second: 0.0,
            ..Config::default()
        };
        let provider = YahooProvider::with_base_url(&config, &server.base_url()).unwrap();
        let history = provider
            .daily_history("AAPL", d("2024-01-01"), d("2024-01-31"))
            .await
            .unwrap();
        assert_eq!(history.bars.len(), 1);
        assert_eq!(provider.source_name(), "yahoo-chart-v8");
    }
}
