//! Persistent entities and their closed status vocabularies.
//!
//! Every `status`, `event_type`, `severity`, and `priority` is a closed enum;
//! unknown values coming out of storage or off the wire are rejected at the
//! boundary rather than carried around as strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One validated daily bar, as handed to the upsert writer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl DailyBar {
    /// OHLC integrity check enforced at write time (and again by the schema).
    pub fn is_valid(&self) -> bool {
        let prices_positive =
            self.open > 0.0 && self.high > 0.0 && self.low > 0.0 && self.close > 0.0;
        prices_positive
            && self.volume >= 0
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
    }
}

/// A stored price row as returned to readers. `symbol` is always the symbol
/// the caller asked for; `source_symbol` is where the row physically lives
/// (differs only across a one-hop rename).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub source: String,
    pub last_updated: DateTime<Utc>,
    pub source_symbol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub symbol: String,
    pub name: Option<String>,
    pub exchange: Option<String>,
    pub currency: Option<String>,
    pub is_active: bool,
    pub has_full_history: bool,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// A one-hop rename record: `old_symbol` became `new_symbol` on `change_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolChange {
    pub old_symbol: String,
    pub new_symbol: String,
    pub change_date: NaiveDate,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Corporate events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StockSplit,
    ReverseSplit,
    Dividend,
    SpecialDividend,
    CapitalGain,
    Spinoff,
    Unknown,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StockSplit => "stock_split",
            EventType::ReverseSplit => "reverse_split",
            EventType::Dividend => "dividend",
            EventType::SpecialDividend => "special_dividend",
            EventType::CapitalGain => "capital_gain",
            EventType::Spinoff => "spinoff",
            EventType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock_split" => Some(EventType::StockSplit),
            "reverse_split" => Some(EventType::ReverseSplit),
            "dividend" => Some(EventType::Dividend),
            "special_dividend" => Some(EventType::SpecialDividend),
            "capital_gain" => Some(EventType::CapitalGain),
            "spinoff" => Some(EventType::Spinoff),
            "unknown" => Some(EventType::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Normal,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Normal => "normal",
            Severity::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "normal" => Some(Severity::Normal),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Detected,
    Confirmed,
    Fixing,
    Fixed,
    Ignored,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Detected => "detected",
            EventStatus::Confirmed => "confirmed",
            EventStatus::Fixing => "fixing",
            EventStatus::Fixed => "fixed",
            EventStatus::Ignored => "ignored",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(EventStatus::Detected),
            "confirmed" => Some(EventStatus::Confirmed),
            "fixing" => Some(EventStatus::Fixing),
            "fixed" => Some(EventStatus::Fixed),
            "ignored" => Some(EventStatus::Ignored),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }

    /// Monotone lifecycle: `detected → (confirmed|ignored) → fixing →
    /// (fixed|failed)`, with `ignored` terminal.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        matches!(
            (self, next),
            (EventStatus::Detected, EventStatus::Confirmed)
                | (EventStatus::Detected, EventStatus::Ignored)
                | (EventStatus::Detected, EventStatus::Fixing)
                | (EventStatus::Confirmed, EventStatus::Ignored)
                | (EventStatus::Confirmed, EventStatus::Fixing)
                | (EventStatus::Fixing, EventStatus::Fixed)
                | (EventStatus::Fixing, EventStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporateEvent {
    pub id: i64,
    pub symbol: String,
    pub event_date: NaiveDate,
    pub event_type: EventType,
    pub ratio: Option<f64>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub ex_date: Option<NaiveDate>,
    pub detected_at: DateTime<Utc>,
    pub db_price_at_detection: Option<f64>,
    pub yf_price_at_detection: Option<f64>,
    pub pct_difference: Option<f64>,
    pub severity: Severity,
    pub status: EventStatus,
    pub fixed_at: Option<DateTime<Utc>>,
    pub fix_job_id: Option<String>,
    pub rows_deleted: Option<i64>,
    pub rows_refetched: Option<i64>,
    pub source_data: Option<String>,
    pub notes: Option<String>,
}

/// Insertion payload for a freshly detected event. Deduped on
/// `(symbol, event_date, event_type)` by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub symbol: String,
    pub event_date: NaiveDate,
    pub event_type: EventType,
    pub ratio: Option<f64>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub ex_date: Option<NaiveDate>,
    pub db_price_at_detection: Option<f64>,
    pub yf_price_at_detection: Option<f64>,
    pub pct_difference: Option<f64>,
    pub severity: Severity,
    pub source_data: Option<String>,
    pub notes: Option<String>,
}

impl NewEvent {
    /// Bare event carrying only the natural key, severity `normal`.
    pub fn bare(symbol: &str, event_date: NaiveDate, event_type: EventType) -> Self {
        Self {
            symbol: symbol.to_string(),
            event_date,
            event_type,
            ratio: None,
            amount: None,
            currency: None,
            ex_date: None,
            db_price_at_detection: None,
            yf_price_at_detection: None,
            pct_difference: None,
            severity: Severity::Normal,
            source_data: None,
            notes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "completed_with_errors" => Some(JobStatus::CompletedWithErrors),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolOutcome {
    Success,
    Partial,
    Failed,
}

/// Per-symbol result recorded on a job as it progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolResult {
    pub status: SymbolOutcome,
    pub rows: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: i64,
    pub completed: i64,
    pub current_symbol: Option<String>,
    pub fetched_rows: i64,
}

impl JobProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchJob {
    pub job_id: String,
    pub status: JobStatus,
    pub symbols: Vec<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub interval: String,
    pub force_refresh: bool,
    pub priority: JobPriority,
    pub progress: JobProgress,
    pub per_symbol_results: BTreeMap<String, SymbolResult>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}
