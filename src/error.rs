//! Service-level error taxonomy.
//!
//! One variant per canonical wire code; the HTTP layer maps `code()` into the
//! error envelope. Auth failures never originate here; they are handled at
//! the boundary before a request reaches the core.

use chrono::NaiveDate;
use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown symbol: {0}")]
    SymbolNotFound(String),

    #[error("no data for {symbol} in {from}..{to}")]
    NoDataInRange {
        symbol: String,
        from: NaiveDate,
        to: NaiveDate,
    },

    #[error("request would return too much data: {0}")]
    TooMuchData(String),

    #[error(transparent)]
    Upstream(#[from] ProviderError),

    #[error("database error: {0}")]
    Database(String),

    #[error("unknown job: {0}")]
    JobNotFound(String),

    #[error("job {job_id} is {status} and cannot be cancelled")]
    JobNotCancellable { job_id: String, status: String },

    #[error("adjustment checking is disabled by configuration")]
    AdjustmentCheckDisabled,

    #[error("destructive operation requires confirm=true")]
    ConfirmationRequired,
}

impl ServiceError {
    /// Canonical `UPPER_SNAKE` code for the wire error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::SymbolNotFound(_) => "SYMBOL_NOT_FOUND",
            ServiceError::NoDataInRange { .. } => "NO_DATA_IN_RANGE",
            ServiceError::TooMuchData(_) => "TOO_MUCH_DATA",
            ServiceError::Upstream(ProviderError::RateLimited) => "UPSTREAM_RATE_LIMITED",
            ServiceError::Upstream(_) => "UPSTREAM_ERROR",
            ServiceError::Database(_) => "DATABASE_ERROR",
            ServiceError::JobNotFound(_) => "JOB_NOT_FOUND",
            ServiceError::JobNotCancellable { .. } => "JOB_NOT_CANCELLABLE",
            ServiceError::AdjustmentCheckDisabled => "ADJUSTMENT_CHECK_DISABLED",
            ServiceError::ConfirmationRequired => "CONFIRMATION_REQUIRED",
        }
    }

    /// Suggested `Retry-After` seconds for 503-class failures, if any.
    /// Write paths do not retry internally; callers are told to come back.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ServiceError::Database(_) => Some(1),
            ServiceError::Upstream(ProviderError::RateLimited) => Some(5),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Database(e.to_string())
    }
}

impl From<garde::Report> for ServiceError {
    fn from(report: garde::Report) -> Self {
        ServiceError::Validation(report.to_string())
    }
}
