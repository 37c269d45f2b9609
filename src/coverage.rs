//! Coverage engine: decide what is missing for a requested window, fetch it,
//! write it, and record any corporate actions the provider reports.
//!
//! All decisions run per storage segment under the symbol's writer lock, and
//! the coverage status is re-read inside the lock, so a second caller racing
//! over the same window finds nothing left to do.

use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::locks::SymbolLocks;
use crate::model::{EventType, NewEvent};
use crate::provider::{ActionFeed, History, ProviderError, UpstreamProvider};
use crate::store::events::EventStore;
use crate::store::prices::{Coverage, PriceStore, UpsertCounts};
use crate::store::symbols::SymbolStore;
use crate::symbols::{resolve_segments, Segment};

/// Ladder of anchor dates probed to locate a symbol's true inception when a
/// request reaches further back than the provider's history.
const ANCHOR_YEARS: [i32; 5] = [1970, 1980, 1990, 2000, 2010];
const PROBE_WINDOW_DAYS: u64 = 370;

/// What happened for one storage segment of an `ensure_coverage` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentOutcome {
    pub storage_symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub fetched_ranges: Vec<(NaiveDate, NaiveDate)>,
    pub counts: UpsertCounts,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageOutcome {
    pub symbol: String,
    pub segments: Vec<SegmentOutcome>,
}

impl CoverageOutcome {
    pub fn rows_written(&self) -> usize {
        self.segments.iter().map(|s| s.counts.written()).sum()
    }

    pub fn upstream_ranges(&self) -> usize {
        self.segments.iter().map(|s| s.fetched_ranges.len()).sum()
    }

    pub fn notes(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| s.note.as_deref())
            .collect()
    }
}

/// Compute the fetch sub-ranges for one segment, unioning up to three
/// candidates: initial backfill, gap fill, and tail refresh. Overlapping or
/// adjacent ranges merge; empty ones drop.
pub fn plan_fetch_ranges(
    from: NaiveDate,
    to: NaiveDate,
    coverage: &Coverage,
    today: NaiveDate,
    refetch_days: i64,
    force_refresh: bool,
) -> Vec<(NaiveDate, NaiveDate)> {
    let (Some(first), Some(last)) = (coverage.first_date, coverage.last_date) else {
        return vec![(from, to)];
    };
    if force_refresh {
        // stored bounds are voided so the whole window re-fetches
        return vec![(from, to)];
    }

    let mut candidates: Vec<(NaiveDate, NaiveDate)> = Vec::with_capacity(3);

    // head extension: the request starts before stored history does
    if from < first {
        candidates.push((from, first.min(to)));
    }

    // gap fill: first working day inside stored bounds with no row
    if let Some(missing) = coverage.first_missing_weekday {
        candidates.push((missing.max(from), last.min(to)));
    }

    // tail refresh: stored history ends inside the window and is stale
    if to >= last && (today - last).num_days() > 1 {
        let tail_start = last
            .checked_sub_days(Days::new(refetch_days.max(0) as u64))
            .unwrap_or(last);
        candidates.push((tail_start.max(from), to));
    }

    candidates.retain(|(a, b)| a <= b);
    candidates.sort();

    let mut merged: Vec<(NaiveDate, NaiveDate)> = Vec::new();
    for (a, b) in candidates {
        match merged.last_mut() {
            Some((_, prev_b)) if a <= prev_b.checked_add_days(Days::new(1)).unwrap_or(*prev_b) => {
                *prev_b = (*prev_b).max(b);
            }
            _ => merged.push((a, b)),
        }
    }
    merged
}

pub struct CoverageService {
    prices: PriceStore,
    symbols: SymbolStore,
    events: EventStore,
    provider: Arc<dyn UpstreamProvider>,
    locks: Arc<SymbolLocks>,
    refetch_days: i64,
}

impl CoverageService {
    pub fn new(
        prices: PriceStore,
        symbols: SymbolStore,
        events: EventStore,
        provider: Arc<dyn UpstreamProvider>,
        locks: Arc<SymbolLocks>,
        refetch_days: i64,
    ) -> Self {
        Self {
            prices,
            symbols,
            events,
            provider,
            locks,
            refetch_days,
        }
    }

    /// Guarantee the database holds up-to-date rows for `[from, to]` across
    /// every storage segment of `symbol`, fetching whatever is missing.
    pub async fn ensure_coverage(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
        force_refresh: bool,
    ) -> Result<CoverageOutcome, ServiceError> {
        self.ensure_coverage_with_cancel(symbol, from, to, force_refresh, &CancellationToken::new())
            .await
    }

    /// Like [`ensure_coverage`](Self::ensure_coverage), but stops fetching at
    /// the next segment, probe, or range boundary once `cancel` fires. The
    /// range already in flight completes and its writes stay; skipped work is
    /// reported through segment notes.
    pub async fn ensure_coverage_with_cancel(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<CoverageOutcome, ServiceError> {
        if from > to {
            return Err(ServiceError::Validation(format!(
                "from {from} is after to {to}"
            )));
        }

        let rename = self.symbols.rename_to(symbol).await?;
        let segments = resolve_segments(symbol, from, to, rename.as_ref());

        let mut outcomes = Vec::with_capacity(segments.len());
        for segment in segments {
            if cancel.is_cancelled() {
                outcomes.push(SegmentOutcome {
                    storage_symbol: segment.storage_symbol.clone(),
                    from: segment.from,
                    to: segment.to,
                    fetched_ranges: Vec::new(),
                    counts: UpsertCounts::default(),
                    note: Some("cancelled before fetch".into()),
                });
                continue;
            }
            outcomes.push(self.ensure_segment(&segment, force_refresh, cancel).await?);
        }
        Ok(CoverageOutcome {
            symbol: symbol.to_string(),
            segments: outcomes,
        })
    }

    async fn ensure_segment(
        &self,
        segment: &Segment,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<SegmentOutcome, ServiceError> {
        let Segment {
            storage_symbol,
            from,
            to,
        } = segment;
        let (mut from, to) = (*from, *to);

        // serialize writers; re-read coverage after the lock so a concurrent
        // caller's work is visible
        let _guard = self.locks.acquire(storage_symbol).await;
        let coverage = self.prices.coverage(storage_symbol, from, to).await?;
        let today = Utc::now().date_naive();

        let mut note = None;
        if coverage.first_date.is_none() && !force_refresh {
            // nothing stored yet: locate the provider's inception before
            // asking for decades that may not exist
            if let Some(inception) = self
                .locate_inception(storage_symbol, from, today, cancel)
                .await?
            {
                if inception > to {
                    tracing::info!(
                        symbol = %storage_symbol,
                        %inception,
                        "requested window ends before provider history begins"
                    );
                    return Ok(SegmentOutcome {
                        storage_symbol: storage_symbol.clone(),
                        from,
                        to,
                        fetched_ranges: Vec::new(),
                        counts: UpsertCounts::default(),
                        note: Some(format!("no data available before {inception}")),
                    });
                }
                if inception > from {
                    note = Some(format!("start adjusted to {inception}"));
                    from = inception;
                }
            }
        }

        let plan = plan_fetch_ranges(from, to, &coverage, today, self.refetch_days, force_refresh);

        let mut counts = UpsertCounts::default();
        let mut fetched_ranges = Vec::with_capacity(plan.len());
        for (range_from, range_to) in plan {
            if cancel.is_cancelled() {
                let skipped_note = "cancelled before remaining ranges";
                note = Some(match note.take() {
                    Some(existing) => format!("{existing}; {skipped_note}"),
                    None => skipped_note.to_string(),
                });
                break;
            }
            let history = self
                .fetch_window(storage_symbol, range_from, range_to)
                .await?;
            let written = self
                .prices
                .upsert_bars(storage_symbol, &history.bars, self.provider.source_name())
                .await?;
            counts.inserted += written.inserted;
            counts.updated += written.updated;
            counts.skipped += written.skipped;
            self.record_actions(storage_symbol, &history.actions).await?;
            fetched_ranges.push((range_from, range_to));
            tracing::debug!(
                symbol = %storage_symbol,
                from = %range_from,
                to = %range_to,
                inserted = written.inserted,
                updated = written.updated,
                skipped = written.skipped,
                "coverage range fetched"
            );
        }

        Ok(SegmentOutcome {
            storage_symbol: storage_symbol.clone(),
            from,
            to,
            fetched_ranges,
            counts,
            note,
        })
    }

    /// Fetch one range, treating an explicit "no data" answer as an empty
    /// window (legal for delisted or pre-IPO spans).
    async fn fetch_window(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<History, ServiceError> {
        match self.provider.daily_history(symbol, from, to).await {
            Ok(history) => Ok(history),
            Err(ProviderError::NoData(_)) => Ok(History::default()),
            Err(ProviderError::InvalidSymbol(s)) => Err(ServiceError::SymbolNotFound(s)),
            Err(e) => Err(e.into()),
        }
    }

    /// Probe the anchor ladder to find the first date the provider has data
    /// for. Returns `None` when no anchor lies after `from` (nothing to
    /// probe), the provider has no data at all, or cancellation fires
    /// mid-ladder.
    async fn locate_inception(
        &self,
        symbol: &str,
        from: NaiveDate,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Option<NaiveDate>, ServiceError> {
        let anchors: Vec<NaiveDate> = ANCHOR_YEARS
            .iter()
            .filter_map(|y| NaiveDate::from_ymd_opt(*y, 1, 1))
            .filter(|a| *a > from)
            .collect();
        if anchors.is_empty() {
            return Ok(None);
        }

        let mut previous_empty = from;
        for anchor in &anchors {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let probe_to = anchor
                .checked_add_days(Days::new(PROBE_WINDOW_DAYS))
                .unwrap_or(*anchor)
                .min(today);
            tracing::debug!(%symbol, anchor = %anchor, "probing inception anchor");
            let probe = self.fetch_window(symbol, *anchor, probe_to).await?;
            if let Some(first_hit) = probe.bars.first().map(|b| b.date) {
                // data exists by this anchor; the true inception sits between
                // the last empty anchor and the first hit
                let refined = self.fetch_window(symbol, previous_empty, first_hit).await?;
                let inception = refined.bars.first().map(|b| b.date).unwrap_or(first_hit);
                return Ok(Some(inception));
            }
            previous_empty = *anchor;
        }

        // every anchor was empty: anything the provider has starts after the
        // last anchor
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let tail = self.fetch_window(symbol, previous_empty, today).await?;
        Ok(tail.bars.first().map(|b| b.date))
    }

    /// Record provider-reported actions as corporate events; duplicates on
    /// the natural key are dropped by the store.
    async fn record_actions(
        &self,
        symbol: &str,
        actions: &ActionFeed,
    ) -> Result<(), ServiceError> {
        for split in &actions.splits {
            let event_type = if split.factor() < 1.0 {
                EventType::ReverseSplit
            } else {
                EventType::StockSplit
            };
            let mut event = NewEvent::bare(symbol, split.date, event_type);
            event.ratio = Some(split.factor());
            event.notes = Some("reported by provider".into());
            self.events.record(&event).await?;
        }
        for dividend in &actions.dividends {
            let mut event = NewEvent::bare(symbol, dividend.date, EventType::Dividend);
            event.amount = Some(dividend.amount);
            event.ex_date = Some(dividend.date);
            event.notes = Some("reported by provider".into());
            self.events.record(&event).await?;
        }
        for gain in &actions.capital_gains {
            let mut event = NewEvent::bare(symbol, gain.date, EventType::CapitalGain);
            event.amount = Some(gain.amount);
            event.notes = Some("reported by provider".into());
            self.events.record(&event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn covered(first: &str, last: &str) -> Coverage {
        Coverage {
            first_date: Some(d(first)),
            last_date: Some(d(last)),
            first_missing_weekday: None,
        }
    }

    #[test]
    fn empty_symbol_plans_full_window() {
        let plan = plan_fetch_ranges(
            d("2024-01-01"),
            d("2024-01-20"),
            &Coverage::default(),
            d("2024-01-20"),
            7,
            false,
        );
        assert_eq!(plan, vec![(d("2024-01-01"), d("2024-01-20"))]);
    }

    #[test]
    fn tail_refresh_reaches_back_n_days() {
        // rows through 2024-01-10, today 2024-01-20, N=7:
        // one fetch starting at max(from, last - N) = 2024-01-03
        let plan = plan_fetch_ranges(
            d("2024-01-01"),
            d("2024-01-20"),
            &covered("2023-01-03", "2024-01-10"),
            d("2024-01-20"),
            7,
            false,
        );
        assert_eq!(plan, vec![(d("2024-01-03"), d("2024-01-20"))]);
    }

    #[test]
    fn tail_refresh_clamps_to_requested_from() {
        let plan = plan_fetch_ranges(
            d("2024-01-08"),
            d("2024-01-20"),
            &covered("2023-01-03", "2024-01-10"),
            d("2024-01-20"),
            7,
            false,
        );
        assert_eq!(plan, vec![(d("2024-01-08"), d("2024-01-20"))]);
    }

    #[test]
    fn fresh_data_needs_no_tail_refresh() {
        let plan = plan_fetch_ranges(
            d("2024-01-01"),
            d("2024-01-19"),
            &covered("2023-01-03", "2024-01-19"),
            d("2024-01-20"),
            7,
            false,
        );
        assert!(plan.is_empty());

        // one-day gap to today is also fresh enough
        let plan = plan_fetch_ranges(
            d("2024-01-01"),
            d("2024-01-20"),
            &covered("2023-01-03", "2024-01-19"),
            d("2024-01-20"),
            7,
            false,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn historical_window_inside_coverage_needs_nothing() {
        // request ends before stored history ends: no tail refresh
        let plan = plan_fetch_ranges(
            d("2020-01-01"),
            d("2020-06-30"),
            &covered("2015-01-02", "2024-01-10"),
            d("2024-01-20"),
            7,
            false,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn head_extension_fetches_up_to_first_date() {
        let plan = plan_fetch_ranges(
            d("2014-01-01"),
            d("2020-06-30"),
            &covered("2015-01-02", "2024-01-10"),
            d("2024-01-20"),
            7,
            false,
        );
        assert_eq!(plan, vec![(d("2014-01-01"), d("2015-01-02"))]);
    }

    #[test]
    fn gap_fill_spans_from_first_hole() {
        let coverage = Coverage {
            first_date: Some(d("2024-01-02")),
            last_date: Some(d("2024-01-10")),
            first_missing_weekday: Some(d("2024-01-04")),
        };
        let plan = plan_fetch_ranges(
            d("2024-01-02"),
            d("2024-01-10"),
            &coverage,
            d("2024-01-10"),
            7,
            false,
        );
        assert_eq!(plan, vec![(d("2024-01-04"), d("2024-01-10"))]);
    }

    #[test]
    fn gap_and_tail_merge_into_one_range() {
        let coverage = Coverage {
            first_date: Some(d("2024-01-02")),
            last_date: Some(d("2024-01-10")),
            first_missing_weekday: Some(d("2024-01-08")),
        };
        let plan = plan_fetch_ranges(
            d("2024-01-02"),
            d("2024-01-20"),
            &coverage,
            d("2024-01-20"),
            7,
            false,
        );
        // gap [01-08, 01-10] and tail [01-03, 01-20] merge
        assert_eq!(plan, vec![(d("2024-01-03"), d("2024-01-20"))]);
    }

    #[test]
    fn force_refresh_voids_coverage() {
        let plan = plan_fetch_ranges(
            d("2024-01-01"),
            d("2024-01-20"),
            &covered("2023-01-03", "2024-01-19"),
            d("2024-01-20"),
            7,
            true,
        );
        assert_eq!(plan, vec![(d("2024-01-01"), d("2024-01-20"))]);
    }
}
