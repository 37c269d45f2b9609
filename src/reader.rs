//! Price reader: optional coverage pass, segment-stitched reads, caps.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::Config;
use crate::coverage::CoverageService;
use crate::error::ServiceError;
use crate::locks::SymbolLocks;
use crate::model::PriceRow;
use crate::store::prices::PriceStore;
use crate::store::symbols::SymbolStore;
use crate::symbols::registry::SymbolRegistry;
use crate::symbols::{normalize, resolve_segments};

/// Rows plus per-symbol metadata notes (inception adjustments and the like).
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub rows: Vec<PriceRow>,
    pub notes: BTreeMap<String, String>,
}

pub struct PriceReader {
    prices: PriceStore,
    symbols: SymbolStore,
    coverage: Arc<CoverageService>,
    registry: Arc<SymbolRegistry>,
    locks: Arc<SymbolLocks>,
    max_symbols_fetch: usize,
    max_symbols_local: usize,
    max_rows_fetch: usize,
    max_rows_local: usize,
}

impl PriceReader {
    pub fn new(
        prices: PriceStore,
        symbols: SymbolStore,
        coverage: Arc<CoverageService>,
        registry: Arc<SymbolRegistry>,
        locks: Arc<SymbolLocks>,
        config: &Config,
    ) -> Self {
        Self {
            prices,
            symbols,
            coverage,
            registry,
            locks,
            max_symbols_fetch: config.api_max_symbols,
            max_symbols_local: config.api_max_symbols_local,
            max_rows_fetch: config.api_max_rows,
            max_rows_local: config.api_max_rows_local,
        }
    }

    /// Remove stored rows for a symbol, optionally windowed. Destructive, so
    /// the caller must pass an explicit confirmation.
    pub async fn delete_prices(
        &self,
        raw_symbol: &str,
        window: Option<(NaiveDate, NaiveDate)>,
        confirm: bool,
    ) -> Result<usize, ServiceError> {
        if !confirm {
            return Err(ServiceError::ConfirmationRequired);
        }
        let symbol = normalize(raw_symbol)?;
        if self.symbols.get(&symbol).await?.is_none() {
            return Err(ServiceError::SymbolNotFound(symbol));
        }
        let deleted = {
            let _guard = self.locks.acquire(&symbol).await;
            self.prices.delete_rows(&symbol, window).await?
        };
        tracing::info!(%symbol, deleted, "price rows deleted");
        Ok(deleted)
    }

    /// Serve `[from, to]` for a list of symbols. With `auto_fetch` the
    /// coverage engine runs first so the database is complete before the
    /// read; without it the call is local-only.
    pub async fn get_prices(
        &self,
        raw_symbols: &[String],
        from: NaiveDate,
        to: NaiveDate,
        auto_fetch: bool,
    ) -> Result<ReadResponse, ServiceError> {
        if from > to {
            return Err(ServiceError::Validation(format!(
                "from {from} is after to {to}"
            )));
        }

        // canonicalize, preserving order, dropping duplicates
        let mut symbols: Vec<String> = Vec::with_capacity(raw_symbols.len());
        for raw in raw_symbols {
            let canonical = normalize(raw)?;
            if !symbols.contains(&canonical) {
                symbols.push(canonical);
            }
        }
        if symbols.is_empty() {
            return Err(ServiceError::Validation("no symbols requested".into()));
        }

        let symbol_cap = if auto_fetch {
            self.max_symbols_fetch
        } else {
            self.max_symbols_local
        };
        if symbols.len() > symbol_cap {
            return Err(ServiceError::TooMuchData(format!(
                "{} symbols exceeds the limit of {symbol_cap}",
                symbols.len()
            )));
        }

        let mut notes = BTreeMap::new();
        if auto_fetch {
            for symbol in &symbols {
                self.registry.ensure_registered(symbol).await?;
                let outcome = self.coverage.ensure_coverage(symbol, from, to, false).await?;
                if let Some(note) = outcome.notes().first() {
                    notes.insert(symbol.clone(), (*note).to_string());
                }
            }
        }

        let mut rows: Vec<PriceRow> = Vec::new();
        for symbol in &symbols {
            let rename = self.symbols.rename_to(symbol).await?;
            for segment in resolve_segments(symbol, from, to, rename.as_ref()) {
                let mut segment_rows = self
                    .prices
                    .read_segment(symbol, &segment.storage_symbol, segment.from, segment.to)
                    .await?;
                rows.append(&mut segment_rows);
            }
        }
        rows.sort_by(|a, b| (a.date, &a.symbol).cmp(&(b.date, &b.symbol)));

        let row_cap = if auto_fetch {
            self.max_rows_fetch
        } else {
            self.max_rows_local
        };
        if rows.len() > row_cap {
            return Err(ServiceError::TooMuchData(format!(
                "{} rows exceeds the limit of {row_cap}",
                rows.len()
            )));
        }

        if rows.is_empty() && notes.is_empty() {
            return Err(ServiceError::NoDataInRange {
                symbol: symbols.join(","),
                from,
                to,
            });
        }

        Ok(ReadResponse { rows, notes })
    }
}
