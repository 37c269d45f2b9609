//! Append-only corporate event records.
//!
//! Inserts dedup on `(symbol, event_date, event_type)`; status updates follow
//! the monotone lifecycle and reject anything else.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::bad_enum;
use crate::db::Db;
use crate::error::ServiceError;
use crate::model::{CorporateEvent, EventStatus, EventType, NewEvent, Severity};

/// Dashboard query filter; all fields optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub symbol: Option<String>,
    pub event_type: Option<EventType>,
    pub status: Option<EventStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Clone)]
pub struct EventStore {
    db: Db,
}

impl EventStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a detected event. Returns false when the natural key already
    /// exists (the duplicate is silently dropped).
    pub async fn record(&self, event: &NewEvent) -> Result<bool, ServiceError> {
        let event = event.clone();
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO corporate_events
                         (symbol, event_date, event_type, ratio, amount, currency, ex_date,
                          detected_at, db_price_at_detection, yf_price_at_detection,
                          pct_difference, severity, status, source_data, notes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'detected', ?13, ?14)",
                    params![
                        event.symbol,
                        event.event_date,
                        event.event_type.as_str(),
                        event.ratio,
                        event.amount,
                        event.currency,
                        event.ex_date,
                        Utc::now(),
                        event.db_price_at_detection,
                        event.yf_price_at_detection,
                        event.pct_difference,
                        event.severity.as_str(),
                        event.source_data,
                        event.notes,
                    ],
                )?;
                Ok(n == 1)
            })
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<CorporateEvent>, ServiceError> {
        self.db
            .call(move |conn| {
                conn.prepare_cached(&format!("{SELECT_EVENT} WHERE id = ?1"))?
                    .query_row(params![id], map_event)
                    .optional()
            })
            .await
    }

    /// Events for a symbol still awaiting a fix (`detected` or `confirmed`).
    pub async fn active_for_symbol(
        &self,
        symbol: &str,
    ) -> Result<Vec<CorporateEvent>, ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                conn.prepare_cached(&format!(
                    "{SELECT_EVENT} WHERE symbol = ?1 AND status IN ('detected','confirmed')
                     ORDER BY event_date"
                ))?
                .query_map(params![symbol], map_event)?
                .collect()
            })
            .await
    }

    /// Transition every active event of `symbol` to `fixing`, stamping the
    /// fix job and the number of deleted rows. Returns how many moved.
    pub async fn mark_fixing(
        &self,
        symbol: &str,
        fix_job_id: &str,
        rows_deleted: usize,
    ) -> Result<usize, ServiceError> {
        let symbol = symbol.to_string();
        let fix_job_id = fix_job_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE corporate_events
                     SET status = 'fixing', fix_job_id = ?2, rows_deleted = ?3
                     WHERE symbol = ?1 AND status IN ('detected','confirmed')",
                    params![symbol, fix_job_id, rows_deleted as i64],
                )
            })
            .await
    }

    /// Resolve all `fixing` events tied to a fix job: `fixed` (with
    /// `rows_refetched` and `fixed_at`) on success, `failed` otherwise.
    pub async fn resolve_fixing(
        &self,
        fix_job_id: &str,
        success: bool,
        rows_refetched: usize,
    ) -> Result<usize, ServiceError> {
        let fix_job_id = fix_job_id.to_string();
        self.db
            .call(move |conn| {
                if success {
                    conn.execute(
                        "UPDATE corporate_events
                         SET status = 'fixed', fixed_at = ?2, rows_refetched = ?3
                         WHERE fix_job_id = ?1 AND status = 'fixing'",
                        params![fix_job_id, Utc::now(), rows_refetched as i64],
                    )
                } else {
                    conn.execute(
                        "UPDATE corporate_events
                         SET status = 'failed'
                         WHERE fix_job_id = ?1 AND status = 'fixing'",
                        params![fix_job_id],
                    )
                }
            })
            .await
    }

    /// Distinct fix-job ids with events still in `fixing`; the maintenance
    /// sweeper resolves these against terminal job states.
    pub async fn fixing_job_ids(&self) -> Result<Vec<String>, ServiceError> {
        self.db
            .call(|conn| {
                conn.prepare_cached(
                    "SELECT DISTINCT fix_job_id FROM corporate_events
                     WHERE status = 'fixing' AND fix_job_id IS NOT NULL",
                )?
                .query_map([], |row| row.get(0))?
                .collect()
            })
            .await
    }

    /// Single-event status update honoring the monotone lifecycle.
    pub async fn update_status(
        &self,
        id: i64,
        next: EventStatus,
    ) -> Result<CorporateEvent, ServiceError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("unknown event id {id}")))?;
        if !current.status.can_transition_to(next) {
            return Err(ServiceError::Validation(format!(
                "illegal event transition {} -> {}",
                current.status.as_str(),
                next.as_str()
            )));
        }
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE corporate_events SET status = ?2 WHERE id = ?1",
                    params![id, next.as_str()],
                )
            })
            .await?;
        self.get(id)
            .await?
            .ok_or_else(|| ServiceError::Database("event vanished mid-update".into()))
    }

    pub async fn list(&self, filter: &EventFilter) -> Result<Vec<CorporateEvent>, ServiceError> {
        let filter = filter.clone();
        self.db
            .call(move |conn| {
                let mut sql = format!("{SELECT_EVENT} WHERE 1=1");
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(symbol) = &filter.symbol {
                    sql.push_str(" AND symbol = ?");
                    args.push(Box::new(symbol.clone()));
                }
                if let Some(event_type) = filter.event_type {
                    sql.push_str(" AND event_type = ?");
                    args.push(Box::new(event_type.as_str()));
                }
                if let Some(status) = filter.status {
                    sql.push_str(" AND status = ?");
                    args.push(Box::new(status.as_str()));
                }
                if let Some(from) = filter.date_from {
                    sql.push_str(" AND event_date >= ?");
                    args.push(Box::new(from));
                }
                if let Some(to) = filter.date_to {
                    sql.push_str(" AND event_date <= ?");
                    args.push(Box::new(to));
                }
                sql.push_str(" ORDER BY detected_at DESC, id DESC LIMIT ? OFFSET ?");
                let limit = if filter.limit == 0 { 100 } else { filter.limit };
                args.push(Box::new(limit as i64));
                args.push(Box::new(filter.offset as i64));

                conn.prepare(&sql)?
                    .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), map_event)?
                    .collect()
            })
            .await
    }
}

const SELECT_EVENT: &str = "SELECT id, symbol, event_date, event_type, ratio, amount, currency,
        ex_date, detected_at, db_price_at_detection, yf_price_at_detection, pct_difference,
        severity, status, fixed_at, fix_job_id, rows_deleted, rows_refetched, source_data, notes
    FROM corporate_events";

fn map_event(row: &Row<'_>) -> rusqlite::Result<CorporateEvent> {
    let type_raw: String = row.get(3)?;
    let severity_raw: String = row.get(12)?;
    let status_raw: String = row.get(13)?;
    Ok(CorporateEvent {
        id: row.get(0)?,
        symbol: row.get(1)?,
        event_date: row.get(2)?,
        event_type: EventType::parse(&type_raw).ok_or_else(|| bad_enum("event_type", &type_raw))?,
        ratio: row.get(4)?,
        amount: row.get(5)?,
        currency: row.get(6)?,
        ex_date: row.get::<_, Option<NaiveDate>>(7)?,
        detected_at: row.get(8)?,
        db_price_at_detection: row.get(9)?,
        yf_price_at_detection: row.get(10)?,
        pct_difference: row.get(11)?,
        severity: Severity::parse(&severity_raw)
            .ok_or_else(|| bad_enum("severity", &severity_raw))?,
        status: EventStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?,
        fixed_at: row.get::<_, Option<DateTime<Utc>>>(14)?,
        fix_job_id: row.get(15)?,
        rows_deleted: row.get(16)?,
        rows_refetched: row.get(17)?,
        source_data: row.get(18)?,
        notes: row.get(19)?,
    })
}
