//! Price rows: validated batch upsert, coverage queries, segment reads.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, Utc, Weekday};
use rusqlite::{params, OptionalExtension};

use crate::db::Db;
use crate::error::ServiceError;
use crate::model::{DailyBar, PriceRow};

/// Counts returned by a batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl UpsertCounts {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// What the coverage engine needs to know about stored data for one symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    /// Overall bounds for the storage symbol (not window-clipped).
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    /// First working day inside the requested window with no row.
    pub first_missing_weekday: Option<NaiveDate>,
}

#[derive(Clone)]
pub struct PriceStore {
    db: Db,
}

impl PriceStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Batch-upsert bars for one storage symbol. Rows violating the OHLC
    /// invariants are skipped with a structured log and do not abort the
    /// batch. The symbol row is created on first reference and its date
    /// bounds widen to cover the written rows.
    pub async fn upsert_bars(
        &self,
        symbol: &str,
        bars: &[DailyBar],
        source: &str,
    ) -> Result<UpsertCounts, ServiceError> {
        let symbol = symbol.to_string();
        let source = source.to_string();
        let bars = bars.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now();
                let mut counts = UpsertCounts::default();

                tx.execute(
                    "INSERT OR IGNORE INTO symbols (symbol, created_at) VALUES (?1, ?2)",
                    params![symbol, now],
                )?;

                {
                    let mut exists = tx.prepare_cached(
                        "SELECT 1 FROM prices WHERE symbol = ?1 AND date = ?2",
                    )?;
                    let mut upsert = tx.prepare_cached(
                        "INSERT INTO prices
                             (symbol, date, open, high, low, close, volume, source, last_updated)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                         ON CONFLICT(symbol, date) DO UPDATE SET
                             open = excluded.open,
                             high = excluded.high,
                             low = excluded.low,
                             close = excluded.close,
                             volume = excluded.volume,
                             source = excluded.source,
                             last_updated = excluded.last_updated",
                    )?;

                    for bar in &bars {
                        if !bar.is_valid() {
                            tracing::warn!(
                                %symbol,
                                date = %bar.date,
                                open = bar.open,
                                high = bar.high,
                                low = bar.low,
                                close = bar.close,
                                volume = bar.volume,
                                "skipping bar violating OHLC invariants"
                            );
                            counts.skipped += 1;
                            continue;
                        }
                        let existed = exists
                            .query_row(params![symbol, bar.date], |_| Ok(()))
                            .optional()?
                            .is_some();
                        upsert.execute(params![
                            symbol, bar.date, bar.open, bar.high, bar.low, bar.close, bar.volume,
                            source, now,
                        ])?;
                        if existed {
                            counts.updated += 1;
                        } else {
                            counts.inserted += 1;
                        }
                    }
                }

                tx.execute(
                    "UPDATE symbols SET
                         first_date = (SELECT MIN(date) FROM prices WHERE symbol = ?1),
                         last_date = (SELECT MAX(date) FROM prices WHERE symbol = ?1)
                     WHERE symbol = ?1",
                    params![symbol],
                )?;

                tx.commit()?;
                Ok(counts)
            })
            .await
    }

    /// Coverage status for `(symbol, from, to)`: overall stored bounds plus
    /// the first working day inside those bounds (clipped to the window)
    /// with no row.
    pub async fn coverage(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Coverage, ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                let (first_date, last_date): (Option<NaiveDate>, Option<NaiveDate>) = conn
                    .prepare_cached(
                        "SELECT MIN(date), MAX(date) FROM prices WHERE symbol = ?1",
                    )?
                    .query_row(params![symbol], |row| Ok((row.get(0)?, row.get(1)?)))?;

                let (Some(first), Some(last)) = (first_date, last_date) else {
                    return Ok(Coverage::default());
                };

                // gap scan covers [first_date, last_date] ∩ [from, to]; days
                // before first_date are a head extension, not a gap
                let scan_from = from.max(first);
                let scan_to = to.min(last);
                let mut first_missing = None;
                if scan_from <= scan_to {
                    let present: HashSet<NaiveDate> = conn
                        .prepare_cached(
                            "SELECT date FROM prices
                             WHERE symbol = ?1 AND date >= ?2 AND date <= ?3",
                        )?
                        .query_map(params![symbol, scan_from, scan_to], |row| row.get(0))?
                        .collect::<rusqlite::Result<_>>()?;
                    let mut day = scan_from;
                    while day <= scan_to {
                        let is_weekday =
                            !matches!(day.weekday(), Weekday::Sat | Weekday::Sun);
                        if is_weekday && !present.contains(&day) {
                            first_missing = Some(day);
                            break;
                        }
                        match day.succ_opt() {
                            Some(next) => day = next,
                            None => break,
                        }
                    }
                }

                Ok(Coverage {
                    first_date,
                    last_date,
                    first_missing_weekday: first_missing,
                })
            })
            .await
    }

    /// Rows for one resolved segment, labeled with the symbol the caller
    /// asked for; the storage symbol rides along in `source_symbol`.
    pub async fn read_segment(
        &self,
        requested_symbol: &str,
        storage_symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<PriceRow>, ServiceError> {
        let requested = requested_symbol.to_string();
        let storage = storage_symbol.to_string();
        self.db
            .call(move |conn| {
                conn.prepare_cached(
                    "SELECT date, open, high, low, close, volume, source, last_updated
                     FROM prices
                     WHERE symbol = ?1 AND date >= ?2 AND date <= ?3
                     ORDER BY date",
                )?
                .query_map(params![storage, from, to], |row| {
                    Ok(PriceRow {
                        symbol: requested.clone(),
                        date: row.get(0)?,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                        source: row.get(6)?,
                        last_updated: row.get(7)?,
                        source_symbol: storage.clone(),
                    })
                })?
                .collect()
            })
            .await
    }

    /// `(date, close)` pairs for rows dated on or before `cutoff`, ordered by
    /// date. Detector sampling input.
    pub async fn closes_through(
        &self,
        symbol: &str,
        cutoff: NaiveDate,
    ) -> Result<Vec<(NaiveDate, f64)>, ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                conn.prepare_cached(
                    "SELECT date, close FROM prices
                     WHERE symbol = ?1 AND date <= ?2 ORDER BY date",
                )?
                .query_map(params![symbol, cutoff], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect()
            })
            .await
    }

    /// Delete price rows for a symbol, optionally windowed. Returns the
    /// number of rows removed and re-derives the symbol's date bounds.
    pub async fn delete_rows(
        &self,
        symbol: &str,
        window: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<usize, ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let deleted = match window {
                    Some((from, to)) => tx.execute(
                        "DELETE FROM prices WHERE symbol = ?1 AND date >= ?2 AND date <= ?3",
                        params![symbol, from, to],
                    )?,
                    None => tx.execute("DELETE FROM prices WHERE symbol = ?1", params![symbol])?,
                };
                tx.execute(
                    "UPDATE symbols SET
                         first_date = (SELECT MIN(date) FROM prices WHERE symbol = ?1),
                         last_date = (SELECT MAX(date) FROM prices WHERE symbol = ?1)
                     WHERE symbol = ?1",
                    params![symbol],
                )?;
                tx.commit()?;
                Ok(deleted)
            })
            .await
    }

    pub async fn row_count(&self, symbol: &str) -> Result<usize, ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                conn.prepare_cached("SELECT COUNT(*) FROM prices WHERE symbol = ?1")?
                    .query_row(params![symbol], |row| row.get::<_, i64>(0))
                    .map(|n| n as usize)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn bar(date: &str, close: f64) -> DailyBar {
        DailyBar {
            date: d(date),
            open: close * 0.99,
            high: close * 1.01,
            low: close * 0.98,
            close,
            volume: 1_000,
        }
    }

    fn make_store() -> PriceStore {
        PriceStore::new(Db::in_memory().unwrap())
    }

    #[tokio::test]
    async fn upsert_counts_and_idempotence() {
        let store = make_store();
        let bars = vec![bar("2024-01-02", 100.0), bar("2024-01-03", 101.0)];

        let first = store.upsert_bars("AAPL", &bars, "test").await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.updated, 0);

        // same payload again: no new rows, everything updates in place
        let second = store.upsert_bars("AAPL", &bars, "test").await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(store.row_count("AAPL").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn invalid_bars_are_skipped_not_fatal() {
        let store = make_store();
        let mut bad = bar("2024-01-03", 50.0);
        bad.low = 60.0; // low above close
        let counts = store
            .upsert_bars("AAPL", &[bar("2024-01-02", 100.0), bad], "test")
            .await
            .unwrap();
        assert_eq!(counts.inserted, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(store.row_count("AAPL").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_maintains_symbol_bounds() {
        let store = make_store();
        store
            .upsert_bars("AAPL", &[bar("2024-01-03", 100.0)], "test")
            .await
            .unwrap();
        store
            .upsert_bars("AAPL", &[bar("2024-01-02", 99.0), bar("2024-01-05", 101.0)], "test")
            .await
            .unwrap();
        let cov = store
            .coverage("AAPL", d("2024-01-01"), d("2024-01-31"))
            .await
            .unwrap();
        assert_eq!(cov.first_date, Some(d("2024-01-02")));
        assert_eq!(cov.last_date, Some(d("2024-01-05")));
    }

    #[tokio::test]
    async fn coverage_finds_weekday_gap() {
        let store = make_store();
        // Tue Jan 2, Wed Jan 3, then Fri Jan 5; Thu Jan 4 missing
        store
            .upsert_bars(
                "AAPL",
                &[
                    bar("2024-01-02", 100.0),
                    bar("2024-01-03", 101.0),
                    bar("2024-01-05", 102.0),
                ],
                "test",
            )
            .await
            .unwrap();

        let cov = store
            .coverage("AAPL", d("2024-01-02"), d("2024-01-05"))
            .await
            .unwrap();
        assert_eq!(cov.first_missing_weekday, Some(d("2024-01-04")));

        // weekend-only absence is not a gap
        let store2 = make_store();
        store2
            .upsert_bars(
                "MSFT",
                &[bar("2024-01-05", 100.0), bar("2024-01-08", 101.0)],
                "test",
            )
            .await
            .unwrap();
        let cov2 = store2
            .coverage("MSFT", d("2024-01-05"), d("2024-01-08"))
            .await
            .unwrap();
        assert_eq!(cov2.first_missing_weekday, None);
    }

    #[tokio::test]
    async fn days_before_first_row_are_not_gaps() {
        let store = make_store();
        store
            .upsert_bars("AAPL", &[bar("2024-01-10", 100.0)], "test")
            .await
            .unwrap();
        let cov = store
            .coverage("AAPL", d("2024-01-08"), d("2024-01-10"))
            .await
            .unwrap();
        // Mon Jan 8 precedes first_date; head extension is the planner's job
        assert_eq!(cov.first_missing_weekday, None);
        assert_eq!(cov.first_date, Some(d("2024-01-10")));
    }

    #[tokio::test]
    async fn empty_symbol_has_default_coverage() {
        let store = make_store();
        let cov = store
            .coverage("NOPE", d("2024-01-01"), d("2024-01-31"))
            .await
            .unwrap();
        assert_eq!(cov, Coverage::default());
    }

    #[tokio::test]
    async fn read_segment_labels_rows() {
        let store = make_store();
        store
            .upsert_bars("FB", &[bar("2022-06-08", 196.64)], "test")
            .await
            .unwrap();
        let rows = store
            .read_segment("META", "FB", d("2022-06-01"), d("2022-06-30"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "META");
        assert_eq!(rows[0].source_symbol, "FB");
    }

    #[tokio::test]
    async fn delete_windowed_and_full() {
        let store = make_store();
        store
            .upsert_bars(
                "AAPL",
                &[
                    bar("2024-01-02", 100.0),
                    bar("2024-01-03", 101.0),
                    bar("2024-01-04", 102.0),
                ],
                "test",
            )
            .await
            .unwrap();

        let n = store
            .delete_rows("AAPL", Some((d("2024-01-03"), d("2024-01-03"))))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.row_count("AAPL").await.unwrap(), 2);

        let n = store.delete_rows("AAPL", None).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.row_count("AAPL").await.unwrap(), 0);
    }
}
