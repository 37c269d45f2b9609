//! Adjustment repair: wipe a drifted symbol's history and queue a
//! high-priority full re-ingest.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use crate::error::ServiceError;
use crate::locks::SymbolLocks;
use crate::model::JobPriority;
use crate::store::events::EventStore;
use crate::store::jobs::{CreateJobRequest, JobStore};
use crate::store::prices::PriceStore;
use crate::store::symbols::SymbolStore;

/// Fallback start when a symbol has never recorded a first date.
const FULL_HISTORY_START: &str = "1970-01-01";
const FIXER_ACTOR: &str = "adjustment_fixer";

#[derive(Debug, Clone, PartialEq)]
pub struct FixOutcome {
    pub symbol: String,
    pub rows_deleted: usize,
    pub job_id: String,
    pub events_marked: usize,
}

pub struct AdjustmentFixer {
    prices: PriceStore,
    symbols: SymbolStore,
    events: EventStore,
    jobs: JobStore,
    locks: Arc<SymbolLocks>,
}

impl AdjustmentFixer {
    pub fn new(
        prices: PriceStore,
        symbols: SymbolStore,
        events: EventStore,
        jobs: JobStore,
        locks: Arc<SymbolLocks>,
    ) -> Self {
        Self {
            prices,
            symbols,
            events,
            jobs,
            locks,
        }
    }

    /// Delete all stored prices for `symbol`, transition its active events to
    /// `fixing`, and submit a forced full-history re-ingest. The sweeper
    /// resolves the events once the job reaches a terminal state.
    pub async fn fix_symbol(&self, symbol: &str) -> Result<FixOutcome, ServiceError> {
        // capture the known start before the delete re-derives bounds
        let first_known: NaiveDate = self
            .symbols
            .get(symbol)
            .await?
            .and_then(|s| s.first_date)
            .unwrap_or_else(|| {
                FULL_HISTORY_START
                    .parse()
                    .unwrap_or(NaiveDate::MIN)
            });

        let rows_deleted = {
            let _guard = self.locks.acquire(symbol).await;
            self.prices.delete_rows(symbol, None).await?
        };

        let job = self
            .jobs
            .create(CreateJobRequest {
                symbols: vec![symbol.to_string()],
                date_from: first_known,
                date_to: Utc::now().date_naive(),
                interval: "1d".into(),
                force_refresh: true,
                priority: JobPriority::High,
                created_by: Some(FIXER_ACTOR.to_string()),
            })
            .await?;

        let events_marked = self
            .events
            .mark_fixing(symbol, &job.job_id, rows_deleted)
            .await?;

        tracing::info!(
            %symbol,
            rows_deleted,
            job_id = %job.job_id,
            events_marked,
            "scheduled full re-ingest for drifted symbol"
        );
        Ok(FixOutcome {
            symbol: symbol.to_string(),
            rows_deleted,
            job_id: job.job_id,
            events_marked,
        })
    }
}
