//! Environment-driven configuration.
//!
//! Every knob has a default so a bare process comes up usable; a present but
//! unparsable value is a startup failure, not a silent fallback.
//!
//! | Env Var | Default | Purpose |
//! |---------|---------|---------|
//! | `DATABASE_PATH` | `pricevault.db` | SQLite database file |
//! | `PORT` | `8000` | health listener port |
//! | `YF_RATE_LIMIT_REQUESTS_PER_SECOND` | `2.0` | token bucket refill rate |
//! | `YF_RATE_LIMIT_BURST_SIZE` | `5` | token bucket capacity |
//! | `YF_RATE_LIMIT_MAX_BACKOFF_DELAY` | `60` | cap (s) for rate-limit backoff |
//! | `FETCH_TIMEOUT_SECONDS` | `30` | per-request upstream timeout |
//! | `FETCH_MAX_RETRIES` | `3` | transient-error retry attempts |
//! | `FETCH_BACKOFF_MAX_SECONDS` | `30` | cap (s) for transient backoff |
//! | `YF_REFETCH_DAYS` | `7` | tail-refresh window N |
//! | `YF_REQ_CONCURRENCY` | `4` | global upstream call semaphore |
//! | `API_MAX_SYMBOLS` | `10` | read cap, `auto_fetch=true` |
//! | `API_MAX_SYMBOLS_LOCAL` | `50` | read cap, `auto_fetch=false` |
//! | `API_MAX_ROWS` | `10000` | row cap, `auto_fetch=true` |
//! | `API_MAX_ROWS_LOCAL` | `100000` | row cap, `auto_fetch=false` |
//! | `FETCH_JOB_MAX_SYMBOLS` | `100` | job creation guard |
//! | `FETCH_JOB_MAX_DAYS` | `36500` | job window guard |
//! | `FETCH_JOB_TIMEOUT` | `3600` | whole-job timeout (s), intentionally large |
//! | `FETCH_SYMBOL_TIMEOUT` | `300` | per-symbol coverage timeout (s) |
//! | `FETCH_WORKER_CONCURRENCY` | `4` | symbols in flight per job |
//! | `FETCH_MAX_CONCURRENT_JOBS` | `2` | jobs in flight per process |
//! | `FETCH_JOB_CLEANUP_DAYS` | `30` | terminal-job retention |
//! | `ADJUSTMENT_CHECK_ENABLED` | `true` | feature flag for 4.H/4.I |
//! | `ADJUSTMENT_MIN_THRESHOLD_PCT` | `0.001` | significance threshold (%) |
//! | `ADJUSTMENT_SAMPLE_POINTS` | `10` | samples per symbol |
//! | `ADJUSTMENT_MIN_DATA_AGE_DAYS` | `7` | minimum row age for sampling |
//! | `ADJUSTMENT_AUTO_FIX` | `false` | invoke the fixer from scans |
//! | `CRON_SECRET_TOKEN` | (empty) | shared secret; empty disables the check |
//! | `CRON_BATCH_SIZE` | `50` | symbols per maintenance job |
//! | `CRON_UPDATE_DAYS` | `7` | daily update lookback K |
//! | `ENABLE_AUTO_REGISTRATION` | `true` | register unknown symbols on read |
//! | `AUTO_REGISTER_TIMEOUT` | `10` | registration budget (s) |
//! | `YF_VALIDATE_TIMEOUT` | `5` | validator probe timeout (s) |

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    pub rate_limit_requests_per_second: f64,
    pub rate_limit_burst_size: u32,
    pub rate_limit_max_backoff: Duration,
    pub fetch_timeout: Duration,
    pub fetch_max_retries: u32,
    pub fetch_backoff_max: Duration,
    pub refetch_days: i64,
    pub upstream_concurrency: usize,

    pub api_max_symbols: usize,
    pub api_max_symbols_local: usize,
    pub api_max_rows: usize,
    pub api_max_rows_local: usize,

    pub fetch_job_max_symbols: usize,
    pub fetch_job_max_days: i64,
    pub fetch_job_timeout: Duration,
    pub fetch_symbol_timeout: Duration,
    pub fetch_worker_concurrency: usize,
    pub fetch_max_concurrent_jobs: usize,
    pub fetch_job_cleanup_days: i64,

    pub adjustment_check_enabled: bool,
    pub adjustment_min_threshold_pct: f64,
    pub adjustment_sample_points: usize,
    pub adjustment_min_data_age_days: i64,
    pub adjustment_auto_fix: bool,

    pub cron_secret_token: String,
    pub cron_batch_size: usize,
    pub cron_update_days: i64,

    pub enable_auto_registration: bool,
    pub auto_register_timeout: Duration,
    pub validate_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "pricevault.db".into(),
            port: 8000,
            rate_limit_requests_per_second: 2.0,
            rate_limit_burst_size: 5,
            rate_limit_max_backoff: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(30),
            fetch_max_retries: 3,
            fetch_backoff_max: Duration::from_secs(30),
            refetch_days: 7,
            upstream_concurrency: 4,
            api_max_symbols: 10,
            api_max_symbols_local: 50,
            api_max_rows: 10_000,
            api_max_rows_local: 100_000,
            fetch_job_max_symbols: 100,
            fetch_job_max_days: 36_500,
            fetch_job_timeout: Duration::from_secs(3600),
            fetch_symbol_timeout: Duration::from_secs(300),
            fetch_worker_concurrency: 4,
            fetch_max_concurrent_jobs: 2,
            fetch_job_cleanup_days: 30,
            adjustment_check_enabled: true,
            adjustment_min_threshold_pct: 0.001,
            adjustment_sample_points: 10,
            adjustment_min_data_age_days: 7,
            adjustment_auto_fix: false,
            cron_secret_token: String::new(),
            cron_batch_size: 50,
            cron_update_days: 7,
            enable_auto_registration: true,
            auto_register_timeout: Duration::from_secs(10),
            validate_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Build from the process environment. A variable that is present but
    /// fails to parse aborts startup.
    pub fn from_env() -> Result<Self> {
        let d = Config::default();
        Ok(Self {
            database_path: env_or("DATABASE_PATH", d.database_path),
            port: parse_env("PORT", d.port)?,
            rate_limit_requests_per_second: parse_env(
                "YF_RATE_LIMIT_REQUESTS_PER_SECOND",
                d.rate_limit_requests_per_second,
            )?,
            rate_limit_burst_size: parse_env("YF_RATE_LIMIT_BURST_SIZE", d.rate_limit_burst_size)?,
            rate_limit_max_backoff: secs_env(
                "YF_RATE_LIMIT_MAX_BACKOFF_DELAY",
                d.rate_limit_max_backoff,
            )?,
            fetch_timeout: secs_env("FETCH_TIMEOUT_SECONDS", d.fetch_timeout)?,
            fetch_max_retries: parse_env("FETCH_MAX_RETRIES", d.fetch_max_retries)?,
            fetch_backoff_max: secs_env("FETCH_BACKOFF_MAX_SECONDS", d.fetch_backoff_max)?,
            refetch_days: parse_env("YF_REFETCH_DAYS", d.refetch_days)?,
            upstream_concurrency: parse_env("YF_REQ_CONCURRENCY", d.upstream_concurrency)?,
            api_max_symbols: parse_env("API_MAX_SYMBOLS", d.api_max_symbols)?,
            api_max_symbols_local: parse_env("API_MAX_SYMBOLS_LOCAL", d.api_max_symbols_local)?,
            api_max_rows: parse_env("API_MAX_ROWS", d.api_max_rows)?,
            api_max_rows_local: parse_env("API_MAX_ROWS_LOCAL", d.api_max_rows_local)?,
            fetch_job_max_symbols: parse_env("FETCH_JOB_MAX_SYMBOLS", d.fetch_job_max_symbols)?,
            fetch_job_max_days: parse_env("FETCH_JOB_MAX_DAYS", d.fetch_job_max_days)?,
            fetch_job_timeout: secs_env("FETCH_JOB_TIMEOUT", d.fetch_job_timeout)?,
            fetch_symbol_timeout: secs_env("FETCH_SYMBOL_TIMEOUT", d.fetch_symbol_timeout)?,
            fetch_worker_concurrency: parse_env(
                "FETCH_WORKER_CONCURRENCY",
                d.fetch_worker_concurrency,
            )?,
            fetch_max_concurrent_jobs: parse_env(
                "FETCH_MAX_CONCURRENT_JOBS",
                d.fetch_max_concurrent_jobs,
            )?,
            fetch_job_cleanup_days: parse_env("FETCH_JOB_CLEANUP_DAYS", d.fetch_job_cleanup_days)?,
            adjustment_check_enabled: parse_env(
                "ADJUSTMENT_CHECK_ENABLED",
                d.adjustment_check_enabled,
            )?,
            adjustment_min_threshold_pct: parse_env(
                "ADJUSTMENT_MIN_THRESHOLD_PCT",
                d.adjustment_min_threshold_pct,
            )?,
            adjustment_sample_points: parse_env(
                "ADJUSTMENT_SAMPLE_POINTS",
                d.adjustment_sample_points,
            )?,
            adjustment_min_data_age_days: parse_env(
                "ADJUSTMENT_MIN_DATA_AGE_DAYS",
                d.adjustment_min_data_age_days,
            )?,
            adjustment_auto_fix: parse_env("ADJUSTMENT_AUTO_FIX", d.adjustment_auto_fix)?,
            cron_secret_token: env_or("CRON_SECRET_TOKEN", d.cron_secret_token),
            cron_batch_size: parse_env("CRON_BATCH_SIZE", d.cron_batch_size)?,
            cron_update_days: parse_env("CRON_UPDATE_DAYS", d.cron_update_days)?,
            enable_auto_registration: parse_env(
                "ENABLE_AUTO_REGISTRATION",
                d.enable_auto_registration,
            )?,
            auto_register_timeout: secs_env("AUTO_REGISTER_TIMEOUT", d.auto_register_timeout)?,
            validate_timeout: secs_env("YF_VALIDATE_TIMEOUT", d.validate_timeout)?,
        })
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &str, default: Duration) -> Result<Duration> {
    let secs = parse_env::<u64>(key, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.refetch_days, 7);
        assert_eq!(c.fetch_worker_concurrency, 4);
        assert_eq!(c.adjustment_sample_points, 10);
        assert!(c.adjustment_check_enabled);
        assert!(!c.adjustment_auto_fix);
        assert!(c.api_max_symbols <= c.api_max_symbols_local);
        assert!(c.api_max_rows <= c.api_max_rows_local);
        assert!(c.cron_secret_token.is_empty());
    }
}
