//! Fetch worker: a long-lived actor draining the job queue.
//!
//! Jobs run with bounded symbol-level concurrency. Cancellation is
//! cooperative: the API flips the job's status, the worker checks it between
//! symbols, and a per-job watcher mirrors the flag into a token the coverage
//! engine consults before every probe and fetch range, so even a symbol with
//! a multi-range plan stops at the next range boundary. The range in flight
//! completes and written data stays. Process shutdown stops scheduling but
//! leaves an interrupted job `running` for the startup sweeper to reconcile.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::coverage::CoverageService;
use crate::model::{FetchJob, JobStatus, SymbolOutcome, SymbolResult};
use crate::store::jobs::JobStore;
use crate::store::symbols::SymbolStore;

pub struct FetchWorker {
    jobs: JobStore,
    coverage: Arc<CoverageService>,
    symbols: SymbolStore,
    per_job_concurrency: usize,
    max_concurrent_jobs: usize,
    symbol_timeout: Duration,
    job_timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl FetchWorker {
    pub fn new(
        jobs: JobStore,
        coverage: Arc<CoverageService>,
        symbols: SymbolStore,
        config: &Config,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            jobs,
            coverage,
            symbols,
            per_job_concurrency: config.fetch_worker_concurrency.max(1),
            max_concurrent_jobs: config.fetch_max_concurrent_jobs.max(1),
            symbol_timeout: config.fetch_symbol_timeout,
            job_timeout: config.fetch_job_timeout,
            poll_interval,
            cancel,
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Claim-and-execute loop; exits when the shutdown token fires.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            per_job_concurrency = self.per_job_concurrency,
            max_concurrent_jobs = self.max_concurrent_jobs,
            "fetch worker started"
        );
        let job_slots = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            loop {
                let Ok(permit) = job_slots.clone().try_acquire_owned() else {
                    break;
                };
                match self.jobs.claim_next().await {
                    Ok(Some(job)) => {
                        let worker = self.clone();
                        tokio::spawn(async move {
                            worker.execute_job(job).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("job claim failed: {e}");
                        break;
                    }
                }
            }
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = sleep(self.poll_interval) => {}
            }
        }
        tracing::info!("fetch worker stopped");
    }

    /// Execute one claimed job to a terminal status (or leave it `running`
    /// if the process is shutting down).
    pub async fn execute_job(&self, job: FetchJob) {
        let job_id = job.job_id.clone();
        tracing::info!(
            %job_id,
            symbols = job.symbols.len(),
            from = %job.date_from,
            to = %job.date_to,
            force_refresh = job.force_refresh,
            "job started"
        );

        let deadline = Instant::now() + self.job_timeout;
        let slots = Arc::new(Semaphore::new(self.per_job_concurrency));
        let mut in_flight: JoinSet<(String, SymbolResult)> = JoinSet::new();
        let mut tally = Tally::default();
        let mut cancelled = false;
        let mut shutdown = false;

        // child of the shutdown token, also fired by the watcher when the
        // job's stored status flips to cancelled; coverage loops check it
        // between probes and fetch ranges
        let job_cancel = self.cancel.child_token();
        let watcher = {
            let jobs = self.jobs.clone();
            let job_id = job_id.clone();
            let job_cancel = job_cancel.clone();
            let poll_interval = self.poll_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = job_cancel.cancelled() => break,
                        () = sleep(poll_interval) => {
                            if matches!(jobs.status_of(&job_id).await, Ok(JobStatus::Cancelled)) {
                                job_cancel.cancel();
                                break;
                            }
                        }
                    }
                }
            })
        };

        for symbol in &job.symbols {
            // absorb finished symbols so progress stays current
            while let Some(joined) = in_flight.try_join_next() {
                self.absorb(&job_id, joined, &mut tally).await;
            }

            if self.cancel.is_cancelled() {
                shutdown = true;
                break;
            }
            if self.is_cancelled_in_store(&job_id).await {
                cancelled = true;
                break;
            }
            if Instant::now() >= deadline {
                let _ = self.jobs.append_error(&job_id, "job timeout exceeded").await;
                tally.any_failure = true;
                break;
            }

            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .expect("job semaphore is never closed");
            // the slot wait can be long; re-check both flags
            if self.cancel.is_cancelled() {
                shutdown = true;
                break;
            }
            if self.is_cancelled_in_store(&job_id).await {
                cancelled = true;
                break;
            }

            let _ = self
                .jobs
                .update_progress(
                    &job_id,
                    tally.completed,
                    Some(symbol.as_str()),
                    tally.fetched_rows,
                )
                .await;

            let coverage = self.coverage.clone();
            let symbols_store = self.symbols.clone();
            let symbol = symbol.clone();
            let (from, to, force) = (job.date_from, job.date_to, job.force_refresh);
            let symbol_timeout = self.symbol_timeout;
            let cancel = job_cancel.clone();
            in_flight.spawn(async move {
                let result = run_symbol(
                    &coverage,
                    &symbols_store,
                    &symbol,
                    from,
                    to,
                    force,
                    symbol_timeout,
                    &cancel,
                )
                .await;
                drop(permit);
                (symbol, result)
            });
        }

        // await whatever is still in flight; cancellation never abandons it
        while let Some(joined) = in_flight.join_next().await {
            self.absorb(&job_id, joined, &mut tally).await;
        }

        job_cancel.cancel();
        let _ = watcher.await;

        if shutdown {
            tracing::info!(%job_id, "shutdown mid-job; leaving status for startup reconciliation");
            return;
        }

        let status = if cancelled {
            JobStatus::Cancelled
        } else if !tally.any_success && tally.any_failure {
            JobStatus::Failed
        } else if tally.any_failure {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        };
        if let Err(e) = self.jobs.finish(&job_id, status).await {
            tracing::warn!(%job_id, "failed to finalize job: {e}");
            return;
        }
        tracing::info!(
            %job_id,
            status = status.as_str(),
            completed = tally.completed,
            fetched_rows = tally.fetched_rows,
            "job finished"
        );
    }

    async fn is_cancelled_in_store(&self, job_id: &str) -> bool {
        matches!(
            self.jobs.status_of(job_id).await,
            Ok(JobStatus::Cancelled)
        )
    }

    async fn absorb(
        &self,
        job_id: &str,
        joined: Result<(String, SymbolResult), tokio::task::JoinError>,
        tally: &mut Tally,
    ) {
        match joined {
            Ok((symbol, result)) => {
                tally.completed += 1;
                tally.fetched_rows += result.rows;
                match result.status {
                    SymbolOutcome::Success | SymbolOutcome::Partial => tally.any_success = true,
                    SymbolOutcome::Failed => tally.any_failure = true,
                }
                if let (SymbolOutcome::Failed, Some(err)) = (result.status, result.error.as_ref()) {
                    let _ = self
                        .jobs
                        .append_error(job_id, &format!("{symbol}: {err}"))
                        .await;
                }
                let _ = self.jobs.record_symbol_result(job_id, &symbol, &result).await;
                let _ = self
                    .jobs
                    .update_progress(job_id, tally.completed, None, tally.fetched_rows)
                    .await;
            }
            Err(join_err) => {
                tally.any_failure = true;
                let _ = self
                    .jobs
                    .append_error(job_id, &format!("symbol task panicked: {join_err}"))
                    .await;
            }
        }
    }
}

#[derive(Default)]
struct Tally {
    completed: i64,
    fetched_rows: i64,
    any_success: bool,
    any_failure: bool,
}

#[allow(clippy::too_many_arguments)]
async fn run_symbol(
    coverage: &CoverageService,
    symbols: &SymbolStore,
    symbol: &str,
    from: chrono::NaiveDate,
    to: chrono::NaiveDate,
    force_refresh: bool,
    symbol_timeout: Duration,
    cancel: &CancellationToken,
) -> SymbolResult {
    match timeout(
        symbol_timeout,
        coverage.ensure_coverage_with_cancel(symbol, from, to, force_refresh, cancel),
    )
    .await
    {
        Ok(Ok(outcome)) => {
            let rows = outcome.rows_written() as i64;
            // a forced full-window fetch is the one-shot full backfill
            if force_refresh {
                if let Err(e) = symbols.mark_full_history(symbol).await {
                    tracing::warn!(%symbol, "could not mark full history: {e}");
                }
            }
            let notes = outcome.notes();
            if notes.is_empty() {
                SymbolResult {
                    status: SymbolOutcome::Success,
                    rows,
                    error: None,
                }
            } else {
                SymbolResult {
                    status: SymbolOutcome::Partial,
                    rows,
                    error: Some(notes.join("; ")),
                }
            }
        }
        Ok(Err(e)) => SymbolResult {
            status: SymbolOutcome::Failed,
            rows: 0,
            error: Some(e.to_string()),
        },
        Err(_) => SymbolResult {
            status: SymbolOutcome::Failed,
            rows: 0,
            error: Some(format!("coverage timed out after {symbol_timeout:?}")),
        },
    }
}
