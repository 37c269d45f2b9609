//! Corporate-action drift detector.
//!
//! Compares a sample of stored closes against the provider's current adjusted
//! closes. A stored price that no longer matches means a corporate action
//! happened after storage and history needs re-adjustment. Comparisons use
//! fixed-precision decimals; the classification thresholds are heuristics
//! held in named constants, not part of any wire contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::config::Config;
use crate::error::ServiceError;
use crate::model::{EventType, NewEvent, Severity};
use crate::provider::{ActionFeed, ProviderError, UpstreamProvider};
use crate::store::events::EventStore;
use crate::store::prices::PriceStore;
use crate::store::symbols::SymbolStore;

use super::fixer::AdjustmentFixer;

/// Below this percentage a difference is floating-point noise, never an event.
const NOISE_FLOOR_PCT: f64 = 0.0001;
/// At or above this, with splits reported after the sample, it is a split.
const SPLIT_PCT: f64 = 10.0;
/// At or above this with no splits reported, suspect a spinoff.
const SPINOFF_PCT: f64 = 15.0;
/// Dividend drift at or above this with an outsized payout is a special
/// dividend.
const SPECIAL_DIVIDEND_PCT: f64 = 2.0;

/// One sampled comparison between a stored close and the provider's.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleCheck {
    pub date: NaiveDate,
    pub stored_close: f64,
    pub provider_close: f64,
    pub diff_pct: f64,
    pub significant: bool,
    pub classification: Option<(EventType, Severity)>,
}

/// Per-symbol detection result.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolAdjustmentReport {
    pub symbol: String,
    pub needs_refresh: bool,
    pub max_pct_diff: f64,
    pub samples: Vec<SampleCheck>,
    /// Set when the symbol was skipped (for example "insufficient data").
    pub skipped: Option<String>,
}

/// Aggregate over a scan of many symbols.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub scanned: usize,
    pub flagged: Vec<String>,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub failed: Vec<(String, String)>,
    pub fixed: Vec<String>,
}

pub struct AdjustmentDetector {
    prices: PriceStore,
    symbols: SymbolStore,
    events: EventStore,
    provider: Arc<dyn UpstreamProvider>,
    enabled: bool,
    threshold_pct: f64,
    sample_points: usize,
    min_age_days: i64,
}

impl AdjustmentDetector {
    pub fn new(
        prices: PriceStore,
        symbols: SymbolStore,
        events: EventStore,
        provider: Arc<dyn UpstreamProvider>,
        config: &Config,
    ) -> Self {
        Self {
            prices,
            symbols,
            events,
            provider,
            enabled: config.adjustment_check_enabled,
            threshold_pct: config.adjustment_min_threshold_pct,
            sample_points: config.adjustment_sample_points.max(2),
            min_age_days: config.adjustment_min_data_age_days,
        }
    }

    /// Detect drift for one symbol and record any classified events.
    pub async fn detect(&self, symbol: &str) -> Result<SymbolAdjustmentReport, ServiceError> {
        if !self.enabled {
            return Err(ServiceError::AdjustmentCheckDisabled);
        }

        let cutoff = Utc::now().date_naive() - Duration::days(self.min_age_days);
        let stored = self.prices.closes_through(symbol, cutoff).await?;
        if stored.len() < 2 {
            return Ok(SymbolAdjustmentReport {
                symbol: symbol.to_string(),
                needs_refresh: false,
                max_pct_diff: 0.0,
                samples: Vec::new(),
                skipped: Some("insufficient data".into()),
            });
        }

        let samples = sample_indices(stored.len(), self.sample_points)
            .into_iter()
            .map(|i| stored[i])
            .collect::<Vec<_>>();
        let span_from = samples[0].0;
        // the span runs through today so actions dated after the samples
        // (the very thing classification keys on) are in the feed
        let span_to = Utc::now().date_naive();

        // one upstream call covering every sample
        let history = match self.provider.daily_history(symbol, span_from, span_to).await {
            Ok(h) => h,
            Err(ProviderError::NoData(_)) => {
                return Ok(SymbolAdjustmentReport {
                    symbol: symbol.to_string(),
                    needs_refresh: false,
                    max_pct_diff: 0.0,
                    samples: Vec::new(),
                    skipped: Some("provider returned no data for sample window".into()),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let provider_closes: BTreeMap<NaiveDate, f64> =
            history.bars.iter().map(|b| (b.date, b.close)).collect();

        let mut checks = Vec::with_capacity(samples.len());
        let mut max_pct_diff: f64 = 0.0;
        for (date, stored_close) in samples {
            let Some(&provider_close) = provider_closes.get(&date) else {
                continue;
            };
            let Some(diff_pct) = diff_percent(stored_close, provider_close) else {
                continue;
            };
            max_pct_diff = max_pct_diff.max(diff_pct);

            let significant = diff_pct >= self.threshold_pct.max(NOISE_FLOOR_PCT);
            let classification = if significant {
                Some(classify(diff_pct, date, &history.actions))
            } else {
                None
            };
            if let Some((event_type, severity)) = classification {
                let event_date = event_date_for(event_type, date, &history.actions);
                let mut event = NewEvent::bare(symbol, event_date, event_type);
                event.severity = severity;
                event.db_price_at_detection = Some(stored_close);
                event.yf_price_at_detection = Some(provider_close);
                event.pct_difference = Some(diff_pct);
                event.notes = Some(format!("detected from sample at {date}"));
                self.events.record(&event).await?;
            }
            checks.push(SampleCheck {
                date,
                stored_close,
                provider_close,
                diff_pct,
                significant,
                classification,
            });
        }

        let needs_refresh = checks.iter().any(|c| c.significant);
        if needs_refresh {
            tracing::warn!(
                %symbol,
                max_pct_diff,
                "stored adjusted prices have drifted from the provider"
            );
        }
        Ok(SymbolAdjustmentReport {
            symbol: symbol.to_string(),
            needs_refresh,
            max_pct_diff,
            samples: checks,
            skipped: None,
        })
    }

    /// Scan many symbols (default: all active). With a fixer supplied,
    /// flagged symbols are repaired immediately.
    pub async fn scan_all_symbols(
        &self,
        symbols: Option<Vec<String>>,
        fixer: Option<&AdjustmentFixer>,
    ) -> Result<ScanSummary, ServiceError> {
        if !self.enabled {
            return Err(ServiceError::AdjustmentCheckDisabled);
        }
        let targets = match symbols {
            Some(list) => list,
            None => self.symbols.list_active().await?,
        };

        let mut summary = ScanSummary::default();
        for symbol in targets {
            summary.scanned += 1;
            let report = match self.detect(&symbol).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(%symbol, "adjustment check failed: {e}");
                    summary.failed.push((symbol.clone(), e.to_string()));
                    continue;
                }
            };
            for check in &report.samples {
                if let Some((event_type, severity)) = check.classification {
                    *summary
                        .by_type
                        .entry(event_type.as_str().to_string())
                        .or_default() += 1;
                    *summary
                        .by_severity
                        .entry(severity.as_str().to_string())
                        .or_default() += 1;
                }
            }
            if report.needs_refresh {
                summary.flagged.push(symbol.clone());
                if let Some(fixer) = fixer {
                    match fixer.fix_symbol(&symbol).await {
                        Ok(_) => summary.fixed.push(symbol.clone()),
                        Err(e) => summary.failed.push((symbol.clone(), e.to_string())),
                    }
                }
            }
        }
        Ok(summary)
    }
}

/// Evenly spread `count` indices over `0..len`, always including both ends.
fn sample_indices(len: usize, count: usize) -> Vec<usize> {
    debug_assert!(len >= 2);
    let count = count.clamp(2, len);
    let mut indices: Vec<usize> = (0..count)
        .map(|i| i * (len - 1) / (count - 1))
        .collect();
    indices.dedup();
    indices
}

/// `|stored − provider| / stored × 100` in fixed precision. `None` when the
/// inputs cannot be represented or stored is zero.
fn diff_percent(stored: f64, provider: f64) -> Option<f64> {
    let stored_dec = Decimal::from_f64_retain(stored)?;
    let provider_dec = Decimal::from_f64_retain(provider)?;
    if stored_dec.is_zero() {
        return None;
    }
    let diff = (stored_dec - provider_dec).abs() / stored_dec.abs() * Decimal::ONE_HUNDRED;
    diff.to_f64()
}

/// The classification ladder. Split evidence wins over everything, then the
/// spinoff suspicion, then dividend-shaped drift, then capital gains.
fn classify(diff_pct: f64, sample_date: NaiveDate, actions: &ActionFeed) -> (EventType, Severity) {
    let splits_after: Vec<_> = actions
        .splits
        .iter()
        .filter(|s| s.date > sample_date)
        .collect();
    if diff_pct >= SPLIT_PCT && !splits_after.is_empty() {
        let cumulative: f64 = splits_after.iter().map(|s| s.factor()).product();
        if cumulative < 1.0 {
            return (EventType::ReverseSplit, Severity::High);
        }
        return (EventType::StockSplit, Severity::Critical);
    }
    if diff_pct >= SPINOFF_PCT && splits_after.is_empty() {
        return (EventType::Spinoff, Severity::Critical);
    }

    let dividends_after: Vec<_> = actions
        .dividends
        .iter()
        .filter(|d| d.date > sample_date)
        .collect();
    if !dividends_after.is_empty() {
        let max_div = dividends_after
            .iter()
            .map(|d| d.amount)
            .fold(f64::MIN, f64::max);
        let mean_div =
            dividends_after.iter().map(|d| d.amount).sum::<f64>() / dividends_after.len() as f64;
        if max_div > 2.0 * mean_div && diff_pct >= SPECIAL_DIVIDEND_PCT {
            return (EventType::SpecialDividend, Severity::High);
        }
        return (EventType::Dividend, Severity::Normal);
    }

    if actions.capital_gains.iter().any(|c| c.date > sample_date) {
        return (EventType::CapitalGain, Severity::Normal);
    }

    (EventType::Unknown, Severity::Low)
}

/// Event date: the concrete action's date where one exists, otherwise the
/// sample date (spinoff suspicion, unknown drift).
fn event_date_for(event_type: EventType, sample_date: NaiveDate, actions: &ActionFeed) -> NaiveDate {
    let latest_after = |dates: Vec<NaiveDate>| {
        dates
            .into_iter()
            .filter(|d| *d > sample_date)
            .max()
            .unwrap_or(sample_date)
    };
    match event_type {
        EventType::StockSplit | EventType::ReverseSplit => {
            latest_after(actions.splits.iter().map(|s| s.date).collect())
        }
        EventType::Dividend | EventType::SpecialDividend => {
            latest_after(actions.dividends.iter().map(|d| d.date).collect())
        }
        EventType::CapitalGain => {
            latest_after(actions.capital_gains.iter().map(|c| c.date).collect())
        }
        EventType::Spinoff | EventType::Unknown => sample_date,
    }
}
