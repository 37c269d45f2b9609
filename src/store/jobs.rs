//! Durable fetch-job queue.
//!
//! Jobs are created `pending`, claimed by the worker through a conditional
//! `pending → running` update (losers of the race skip), and finish in one of
//! the terminal states. Progress and per-symbol results live on the row so
//! clients can poll.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use garde::Validate;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bad_enum;
use crate::config::Config;
use crate::db::Db;
use crate::error::ServiceError;
use crate::model::{FetchJob, JobPriority, JobProgress, JobStatus, SymbolResult};

/// Job creation payload. Shape checks live here; config-dependent limits are
/// enforced in [`JobStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateJobRequest {
    /// Symbols to fetch, already canonicalized.
    #[garde(length(min = 1), inner(pattern(r"^[A-Z0-9.^-]{1,20}$")))]
    pub symbols: Vec<String>,
    #[garde(skip)]
    pub date_from: NaiveDate,
    #[garde(skip)]
    pub date_to: NaiveDate,
    /// Bar interval; only daily is supported.
    #[garde(skip)]
    #[serde(default = "default_interval")]
    pub interval: String,
    #[garde(skip)]
    #[serde(default)]
    pub force_refresh: bool,
    #[garde(skip)]
    #[serde(default)]
    pub priority: JobPriority,
    #[garde(skip)]
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_interval() -> String {
    "1d".to_string()
}

#[derive(Clone)]
pub struct JobStore {
    db: Db,
    max_symbols: usize,
    max_days: i64,
}

impl JobStore {
    pub fn new(db: Db, config: &Config) -> Self {
        Self {
            db,
            max_symbols: config.fetch_job_max_symbols,
            max_days: config.fetch_job_max_days,
        }
    }

    /// Validate and enqueue a job. Returns the stored record with
    /// `status = pending`.
    pub async fn create(&self, req: CreateJobRequest) -> Result<FetchJob, ServiceError> {
        req.validate()?;
        if req.symbols.len() > self.max_symbols {
            return Err(ServiceError::Validation(format!(
                "too many symbols: {} > {}",
                req.symbols.len(),
                self.max_symbols
            )));
        }
        if req.date_from > req.date_to {
            return Err(ServiceError::Validation(format!(
                "date_from {} is after date_to {}",
                req.date_from, req.date_to
            )));
        }
        let today = Utc::now().date_naive();
        if req.date_to > today {
            return Err(ServiceError::Validation(format!(
                "date_to {} is in the future",
                req.date_to
            )));
        }
        let span = (req.date_to - req.date_from).num_days() + 1;
        if span > self.max_days {
            return Err(ServiceError::Validation(format!(
                "window of {span} days exceeds the {} day limit",
                self.max_days
            )));
        }
        if req.interval != "1d" {
            return Err(ServiceError::Validation(format!(
                "unsupported interval: {}",
                req.interval
            )));
        }

        let job_id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let symbols_json = serde_json::to_string(&req.symbols)
            .map_err(|e| ServiceError::Database(e.to_string()))?;
        let total = req.symbols.len() as i64;

        {
            let job_id = job_id.clone();
            let req = req.clone();
            self.db
                .call(move |conn| {
                    conn.execute(
                        "INSERT INTO fetch_jobs
                             (job_id, status, symbols, date_from, date_to, interval,
                              force_refresh, priority, progress_total, created_at, created_by)
                         VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            job_id,
                            symbols_json,
                            req.date_from,
                            req.date_to,
                            req.interval,
                            req.force_refresh,
                            req.priority.as_str(),
                            total,
                            created_at,
                            req.created_by,
                        ],
                    )?;
                    Ok(())
                })
                .await?;
        }

        tracing::info!(
            %job_id,
            symbols = req.symbols.len(),
            from = %req.date_from,
            to = %req.date_to,
            priority = req.priority.as_str(),
            "fetch job created"
        );
        self.get(&job_id).await
    }

    pub async fn get(&self, job_id: &str) -> Result<FetchJob, ServiceError> {
        let key = job_id.to_string();
        self.db
            .call(move |conn| {
                conn.prepare_cached(&format!("{SELECT_JOB} WHERE job_id = ?1"))?
                    .query_row(params![key], map_job)
                    .optional()
            })
            .await?
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))
    }

    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FetchJob>, ServiceError> {
        let limit = if limit == 0 { 100 } else { limit } as i64;
        let offset = offset as i64;
        self.db
            .call(move |conn| match status {
                Some(s) => conn
                    .prepare_cached(&format!(
                        "{SELECT_JOB} WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                    ))?
                    .query_map(params![s.as_str(), limit, offset], map_job)?
                    .collect(),
                None => conn
                    .prepare_cached(&format!(
                        "{SELECT_JOB} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                    ))?
                    .query_map(params![limit, offset], map_job)?
                    .collect(),
            })
            .await
    }

    /// Claim the oldest highest-priority pending job. The `pending → running`
    /// transition is conditional, so concurrent claimers get distinct jobs or
    /// nothing.
    pub async fn claim_next(&self) -> Result<Option<FetchJob>, ServiceError> {
        loop {
            let candidate: Option<String> = self
                .db
                .call(|conn| {
                    conn.prepare_cached(
                        "SELECT job_id FROM fetch_jobs WHERE status = 'pending'
                         ORDER BY CASE priority
                             WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
                             created_at ASC
                         LIMIT 1",
                    )?
                    .query_row([], |row| row.get(0))
                    .optional()
                })
                .await?;

            let Some(job_id) = candidate else {
                return Ok(None);
            };

            let won = {
                let job_id = job_id.clone();
                self.db
                    .call(move |conn| {
                        conn.execute(
                            "UPDATE fetch_jobs SET status = 'running', started_at = ?2
                             WHERE job_id = ?1 AND status = 'pending'",
                            params![job_id, Utc::now()],
                        )
                    })
                    .await?
                    == 1
            };
            if won {
                return Ok(Some(self.get(&job_id).await?));
            }
            // lost the race; try the next candidate
        }
    }

    pub async fn status_of(&self, job_id: &str) -> Result<JobStatus, ServiceError> {
        let key = job_id.to_string();
        let raw: Option<String> = self
            .db
            .call(move |conn| {
                conn.prepare_cached("SELECT status FROM fetch_jobs WHERE job_id = ?1")?
                    .query_row(params![key], |row| row.get(0))
                    .optional()
            })
            .await?;
        let raw = raw.ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;
        JobStatus::parse(&raw).ok_or_else(|| ServiceError::Database(format!("bad status {raw:?}")))
    }

    /// Update progress counters after a symbol completes (or starts).
    pub async fn update_progress(
        &self,
        job_id: &str,
        completed: i64,
        current_symbol: Option<&str>,
        fetched_rows: i64,
    ) -> Result<(), ServiceError> {
        let job_id = job_id.to_string();
        let current = current_symbol.map(str::to_string);
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE fetch_jobs
                     SET progress_completed = ?2, current_symbol = ?3, fetched_rows = ?4
                     WHERE job_id = ?1",
                    params![job_id, completed, current, fetched_rows],
                )?;
                Ok(())
            })
            .await
    }

    /// Merge one symbol's outcome into the job's result map.
    pub async fn record_symbol_result(
        &self,
        job_id: &str,
        symbol: &str,
        result: &SymbolResult,
    ) -> Result<(), ServiceError> {
        let job_id = job_id.to_string();
        let symbol = symbol.to_string();
        let result = result.clone();
        self.db
            .call(move |conn| {
                let raw: String = conn
                    .prepare_cached("SELECT per_symbol_results FROM fetch_jobs WHERE job_id = ?1")?
                    .query_row(params![job_id], |row| row.get(0))?;
                let mut map: BTreeMap<String, SymbolResult> =
                    serde_json::from_str(&raw).unwrap_or_default();
                map.insert(symbol.clone(), result.clone());
                let encoded = serde_json::to_string(&map)
                    .map_err(|e| bad_enum("per_symbol_results", &e.to_string()))?;
                conn.execute(
                    "UPDATE fetch_jobs SET per_symbol_results = ?2 WHERE job_id = ?1",
                    params![job_id, encoded],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn append_error(&self, job_id: &str, error: &str) -> Result<(), ServiceError> {
        let job_id = job_id.to_string();
        let error = error.to_string();
        self.db
            .call(move |conn| {
                let raw: String = conn
                    .prepare_cached("SELECT errors FROM fetch_jobs WHERE job_id = ?1")?
                    .query_row(params![job_id], |row| row.get(0))?;
                let mut errors: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
                errors.push(error.clone());
                let encoded =
                    serde_json::to_string(&errors).map_err(|e| bad_enum("errors", &e.to_string()))?;
                conn.execute(
                    "UPDATE fetch_jobs SET errors = ?2 WHERE job_id = ?1",
                    params![job_id, encoded],
                )?;
                Ok(())
            })
            .await
    }

    /// Stamp a terminal status and `completed_at`.
    pub async fn finish(&self, job_id: &str, status: JobStatus) -> Result<(), ServiceError> {
        debug_assert!(status.is_terminal());
        let job_id = job_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE fetch_jobs
                     SET status = ?2, completed_at = ?3, current_symbol = NULL
                     WHERE job_id = ?1",
                    params![job_id, status.as_str(), Utc::now()],
                )?;
                Ok(())
            })
            .await
    }

    /// Cooperative cancel. Pending jobs terminalize immediately; running jobs
    /// flip to `cancelled` and the worker notices between symbols. Terminal
    /// jobs are not cancellable.
    pub async fn cancel(&self, job_id: &str) -> Result<FetchJob, ServiceError> {
        let current = self.status_of(job_id).await?;
        match current {
            JobStatus::Pending => {
                let key = job_id.to_string();
                self.db
                    .call(move |conn| {
                        conn.execute(
                            "UPDATE fetch_jobs SET status = 'cancelled', completed_at = ?2
                             WHERE job_id = ?1 AND status = 'pending'",
                            params![key, Utc::now()],
                        )
                    })
                    .await?;
                self.get(job_id).await
            }
            JobStatus::Running => {
                let key = job_id.to_string();
                self.db
                    .call(move |conn| {
                        conn.execute(
                            "UPDATE fetch_jobs SET status = 'cancelled'
                             WHERE job_id = ?1 AND status = 'running'",
                            params![key],
                        )
                    })
                    .await?;
                self.get(job_id).await
            }
            other => Err(ServiceError::JobNotCancellable {
                job_id: job_id.to_string(),
                status: other.as_str().to_string(),
            }),
        }
    }

    /// Demote `running` jobs left behind by an unclean shutdown.
    pub async fn sweep_abandoned(&self) -> Result<Vec<String>, ServiceError> {
        let ids: Vec<String> = self
            .db
            .call(|conn| {
                conn.prepare_cached("SELECT job_id FROM fetch_jobs WHERE status = 'running'")?
                    .query_map([], |row| row.get(0))?
                    .collect()
            })
            .await?;
        if !ids.is_empty() {
            self.db
                .call(|conn| {
                    conn.execute(
                        "UPDATE fetch_jobs SET status = 'failed', completed_at = ?1
                         WHERE status = 'running'",
                        params![Utc::now()],
                    )
                })
                .await?;
            tracing::warn!(count = ids.len(), "demoted abandoned running jobs to failed");
        }
        Ok(ids)
    }

    /// Delete terminal jobs whose `completed_at` is older than the retention
    /// window. Returns the number removed.
    pub async fn cleanup_terminal(&self, older_than_days: i64) -> Result<usize, ServiceError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM fetch_jobs
                     WHERE status IN ('completed','completed_with_errors','failed','cancelled')
                       AND completed_at IS NOT NULL AND completed_at < ?1",
                    params![cutoff],
                )
            })
            .await
    }
}

const SELECT_JOB: &str = "SELECT job_id, status, symbols, date_from, date_to, interval,
        force_refresh, priority, progress_total, progress_completed, current_symbol,
        fetched_rows, per_symbol_results, errors, created_at, started_at, completed_at, created_by
    FROM fetch_jobs";

fn map_job(row: &Row<'_>) -> rusqlite::Result<FetchJob> {
    let status_raw: String = row.get(1)?;
    let symbols_raw: String = row.get(2)?;
    let priority_raw: String = row.get(7)?;
    let results_raw: String = row.get(12)?;
    let errors_raw: String = row.get(13)?;
    Ok(FetchJob {
        job_id: row.get(0)?,
        status: JobStatus::parse(&status_raw).ok_or_else(|| bad_enum("status", &status_raw))?,
        symbols: serde_json::from_str(&symbols_raw)
            .map_err(|e| bad_enum("symbols", &e.to_string()))?,
        date_from: row.get(3)?,
        date_to: row.get(4)?,
        interval: row.get(5)?,
        force_refresh: row.get(6)?,
        priority: JobPriority::parse(&priority_raw)
            .ok_or_else(|| bad_enum("priority", &priority_raw))?,
        progress: JobProgress {
            total: row.get(8)?,
            completed: row.get(9)?,
            current_symbol: row.get(10)?,
            fetched_rows: row.get(11)?,
        },
        per_symbol_results: serde_json::from_str(&results_raw)
            .map_err(|e| bad_enum("per_symbol_results", &e.to_string()))?,
        errors: serde_json::from_str(&errors_raw).map_err(|e| bad_enum("errors", &e.to_string()))?,
        created_at: row.get(14)?,
        started_at: row.get::<_, Option<DateTime<Utc>>>(15)?,
        completed_at: row.get::<_, Option<DateTime<Utc>>>(16)?,
        created_by: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SymbolOutcome;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn store() -> JobStore {
        JobStore::new(Db::in_memory().unwrap(), &Config::default())
    }

    fn request(symbols: &[&str]) -> CreateJobRequest {
        CreateJobRequest {
            symbols: symbols.iter().map(|s| (*s).to_string()).collect(),
            date_from: d("2024-01-01"),
            date_to: d("2024-01-31"),
            interval: "1d".into(),
            force_refresh: false,
            priority: JobPriority::Normal,
            created_by: Some("test".into()),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let store = store();
        let job = store.create(request(&["AAPL", "MSFT"])).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress.total, 2);
        assert_eq!(job.progress.completed, 0);

        let loaded = store.get(&job.job_id).await.unwrap();
        assert_eq!(loaded, job);
        assert!(matches!(
            store.get("missing").await,
            Err(ServiceError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn creation_validation() {
        let store = store();

        let empty = store.create(request(&[])).await;
        assert!(matches!(empty, Err(ServiceError::Validation(_))));

        let bad_symbol = store.create(request(&["aapl!"])).await;
        assert!(matches!(bad_symbol, Err(ServiceError::Validation(_))));

        let mut inverted = request(&["AAPL"]);
        inverted.date_from = d("2024-02-01");
        assert!(matches!(
            store.create(inverted).await,
            Err(ServiceError::Validation(_))
        ));

        let mut future = request(&["AAPL"]);
        future.date_to = Utc::now().date_naive() + chrono::Duration::days(5);
        assert!(matches!(
            store.create(future).await,
            Err(ServiceError::Validation(_))
        ));

        let mut bad_interval = request(&["AAPL"]);
        bad_interval.interval = "1h".into();
        assert!(matches!(
            store.create(bad_interval).await,
            Err(ServiceError::Validation(_))
        ));

        let too_many: Vec<String> = (0..200).map(|i| format!("S{i}")).collect();
        let refs: Vec<&str> = too_many.iter().map(String::as_str).collect();
        assert!(matches!(
            store.create(request(&refs)).await,
            Err(ServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_age() {
        let store = store();
        let normal = store.create(request(&["AAA"])).await.unwrap();
        let mut high_req = request(&["BBB"]);
        high_req.priority = JobPriority::High;
        let high = store.create(high_req).await.unwrap();

        let first = store.claim_next().await.unwrap().unwrap();
        assert_eq!(first.job_id, high.job_id);
        assert_eq!(first.status, JobStatus::Running);
        assert!(first.started_at.is_some());

        let second = store.claim_next().await.unwrap().unwrap();
        assert_eq!(second.job_id, normal.job_id);

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_and_results_round_trip() {
        let store = store();
        let job = store.create(request(&["AAPL", "MSFT"])).await.unwrap();

        store
            .update_progress(&job.job_id, 1, Some("MSFT"), 250)
            .await
            .unwrap();
        store
            .record_symbol_result(
                &job.job_id,
                "AAPL",
                &SymbolResult {
                    status: SymbolOutcome::Success,
                    rows: 250,
                    error: None,
                },
            )
            .await
            .unwrap();
        store.append_error(&job.job_id, "MSFT: flaky").await.unwrap();

        let loaded = store.get(&job.job_id).await.unwrap();
        assert_eq!(loaded.progress.completed, 1);
        assert_eq!(loaded.progress.current_symbol.as_deref(), Some("MSFT"));
        assert_eq!(loaded.progress.fetched_rows, 250);
        assert!((loaded.progress.percent() - 50.0).abs() < f64::EPSILON);
        assert_eq!(loaded.per_symbol_results["AAPL"].rows, 250);
        assert_eq!(loaded.errors, vec!["MSFT: flaky".to_string()]);
    }

    #[tokio::test]
    async fn cancel_semantics() {
        let store = store();

        let pending = store.create(request(&["AAPL"])).await.unwrap();
        let cancelled = store.cancel(&pending.job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // terminal jobs cannot be cancelled again
        assert!(matches!(
            store.cancel(&pending.job_id).await,
            Err(ServiceError::JobNotCancellable { .. })
        ));

        let running = store.create(request(&["MSFT"])).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        let flagged = store.cancel(&running.job_id).await.unwrap();
        assert_eq!(flagged.status, JobStatus::Cancelled);
        // running→cancelled leaves completion to the worker
        assert!(flagged.completed_at.is_none());
    }

    #[tokio::test]
    async fn sweep_demotes_abandoned_running_jobs() {
        let store = store();
        store.create(request(&["AAPL"])).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();

        let swept = store.sweep_abandoned().await.unwrap();
        assert_eq!(swept, vec![claimed.job_id.clone()]);
        assert_eq!(
            store.status_of(&claimed.job_id).await.unwrap(),
            JobStatus::Failed
        );
        assert!(store.sweep_abandoned().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_old_terminal_jobs() {
        let store = store();
        let job = store.create(request(&["AAPL"])).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store.finish(&job.job_id, JobStatus::Completed).await.unwrap();

        // freshly completed job survives a 30 day retention window
        assert_eq!(store.cleanup_terminal(30).await.unwrap(), 0);
        // zero-day retention removes it
        assert_eq!(store.cleanup_terminal(0).await.unwrap(), 1);
        assert!(matches!(
            store.get(&job.job_id).await,
            Err(ServiceError::JobNotFound(_))
        ));
    }
}
