//! Scheduled maintenance: daily incremental updates, periodic adjustment
//! scans, and startup reconciliation.
//!
//! The shared-secret gate for the cron endpoints lives at the HTTP boundary;
//! these entry points assume the caller is already authorized. No lock is
//! held across a batch; each symbol is processed independently by the
//! worker.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::adjust::{AdjustmentDetector, AdjustmentFixer, ScanSummary};
use crate::config::Config;
use crate::error::ServiceError;
use crate::model::{JobPriority, JobStatus};
use crate::store::events::EventStore;
use crate::store::jobs::{CreateJobRequest, JobStore};
use crate::store::symbols::SymbolStore;

const MAINTENANCE_ACTOR: &str = "daily_maintenance";

/// Outcome of a daily incremental update (or its dry run).
#[derive(Debug, Clone, PartialEq)]
pub struct DailyUpdateReport {
    pub symbols: usize,
    pub batches: Vec<Vec<String>>,
    pub date_from: chrono::NaiveDate,
    pub date_to: chrono::NaiveDate,
    pub submitted_jobs: Vec<String>,
    pub dry_run: bool,
}

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub abandoned_jobs: Vec<String>,
    pub fixes_resolved: usize,
    pub fixes_failed: usize,
    pub jobs_cleaned: usize,
}

pub struct MaintenanceService {
    symbols: SymbolStore,
    jobs: JobStore,
    events: EventStore,
    detector: Arc<AdjustmentDetector>,
    fixer: Arc<AdjustmentFixer>,
    batch_size: usize,
    update_days: i64,
    cleanup_days: i64,
    auto_fix: bool,
}

impl MaintenanceService {
    pub fn new(
        symbols: SymbolStore,
        jobs: JobStore,
        events: EventStore,
        detector: Arc<AdjustmentDetector>,
        fixer: Arc<AdjustmentFixer>,
        config: &Config,
    ) -> Self {
        Self {
            symbols,
            jobs,
            events,
            detector,
            fixer,
            batch_size: config.cron_batch_size.max(1),
            update_days: config.cron_update_days,
            cleanup_days: config.fetch_job_cleanup_days,
            auto_fix: config.adjustment_auto_fix,
        }
    }

    /// Submit incremental-update jobs covering `[today − K, today − 1]` for
    /// every active symbol, batched. `dry_run` returns the plan untouched.
    pub async fn daily_update(&self, dry_run: bool) -> Result<DailyUpdateReport, ServiceError> {
        let today = Utc::now().date_naive();
        let date_to = today - Duration::days(1);
        let date_from = today - Duration::days(self.update_days);

        let active = self.symbols.list_active().await?;
        let batches: Vec<Vec<String>> = active
            .chunks(self.batch_size)
            .map(<[String]>::to_vec)
            .collect();

        let mut submitted_jobs = Vec::new();
        if !dry_run {
            for batch in &batches {
                let job = self
                    .jobs
                    .create(CreateJobRequest {
                        symbols: batch.clone(),
                        date_from,
                        date_to,
                        interval: "1d".into(),
                        force_refresh: false,
                        priority: JobPriority::Normal,
                        created_by: Some(MAINTENANCE_ACTOR.to_string()),
                    })
                    .await?;
                submitted_jobs.push(job.job_id);
            }
            tracing::info!(
                symbols = active.len(),
                jobs = submitted_jobs.len(),
                from = %date_from,
                to = %date_to,
                "daily incremental update submitted"
            );
        }

        Ok(DailyUpdateReport {
            symbols: active.len(),
            batches,
            date_from,
            date_to,
            submitted_jobs,
            dry_run,
        })
    }

    /// Run the adjustment scan over all active symbols, fixing flagged ones
    /// when auto-fix is configured (or explicitly requested).
    pub async fn adjustment_scan(
        &self,
        auto_fix: Option<bool>,
    ) -> Result<ScanSummary, ServiceError> {
        let fix = auto_fix.unwrap_or(self.auto_fix);
        let fixer = fix.then(|| self.fixer.as_ref());
        self.detector.scan_all_symbols(None, fixer).await
    }

    /// Startup / periodic reconciliation: demote abandoned `running` jobs,
    /// resolve `fixing` events whose job has terminated, and drop expired
    /// terminal jobs.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ServiceError> {
        let mut report = ReconcileReport {
            abandoned_jobs: self.jobs.sweep_abandoned().await?,
            ..ReconcileReport::default()
        };

        for job_id in self.events.fixing_job_ids().await? {
            let job = match self.jobs.get(&job_id).await {
                Ok(job) => job,
                Err(ServiceError::JobNotFound(_)) => {
                    // fix job evaporated (cleanup raced); treat as failed
                    report.fixes_failed += self.events.resolve_fixing(&job_id, false, 0).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match job.status {
                JobStatus::Completed | JobStatus::CompletedWithErrors => {
                    let refetched = job.progress.fetched_rows.max(0) as usize;
                    let success = job.status == JobStatus::Completed && refetched > 0;
                    if success {
                        report.fixes_resolved +=
                            self.events.resolve_fixing(&job_id, true, refetched).await?;
                    } else {
                        report.fixes_failed +=
                            self.events.resolve_fixing(&job_id, false, refetched).await?;
                    }
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    report.fixes_failed += self.events.resolve_fixing(&job_id, false, 0).await?;
                }
                JobStatus::Pending | JobStatus::Running => {}
            }
        }

        report.jobs_cleaned = self.jobs.cleanup_terminal(self.cleanup_days).await?;
        if !report.abandoned_jobs.is_empty()
            || report.fixes_resolved > 0
            || report.fixes_failed > 0
            || report.jobs_cleaned > 0
        {
            tracing::info!(
                abandoned = report.abandoned_jobs.len(),
                fixes_resolved = report.fixes_resolved,
                fixes_failed = report.fixes_failed,
                jobs_cleaned = report.jobs_cleaned,
                "maintenance reconciliation applied"
            );
        }
        Ok(report)
    }
}
