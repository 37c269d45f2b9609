//! Symbol registry rows and the one-hop rename table.

use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::Db;
use crate::error::ServiceError;
use crate::model::{SymbolChange, SymbolRecord};

#[derive(Clone)]
pub struct SymbolStore {
    db: Db,
}

impl SymbolStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, symbol: &str) -> Result<Option<SymbolRecord>, ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                conn.prepare_cached(
                    "SELECT symbol, name, exchange, currency, is_active, has_full_history,
                            first_date, last_date, created_at
                     FROM symbols WHERE symbol = ?1",
                )?
                .query_row(params![symbol], map_symbol)
                .optional()
            })
            .await
    }

    /// Register a symbol if it is not yet known. Returns true when a new row
    /// was created.
    pub async fn register(&self, symbol: &str) -> Result<bool, ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO symbols (symbol, created_at) VALUES (?1, ?2)",
                    params![symbol, Utc::now()],
                )?;
                Ok(n == 1)
            })
            .await
    }

    pub async fn set_active(&self, symbol: &str, active: bool) -> Result<(), ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE symbols SET is_active = ?2 WHERE symbol = ?1",
                    params![symbol, active],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn mark_full_history(&self, symbol: &str) -> Result<(), ServiceError> {
        let symbol = symbol.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE symbols SET has_full_history = 1 WHERE symbol = ?1",
                    params![symbol],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_active(&self) -> Result<Vec<String>, ServiceError> {
        self.db
            .call(|conn| {
                conn.prepare_cached(
                    "SELECT symbol FROM symbols WHERE is_active = 1 ORDER BY symbol",
                )?
                .query_map([], |row| row.get(0))?
                .collect()
            })
            .await
    }

    /// The rename that produced `current`, if any. `UNIQUE(new_symbol)`
    /// guarantees at most one row, the one-hop property.
    pub async fn rename_to(&self, current: &str) -> Result<Option<SymbolChange>, ServiceError> {
        let current = current.to_string();
        self.db
            .call(move |conn| {
                conn.prepare_cached(
                    "SELECT old_symbol, new_symbol, change_date, reason
                     FROM symbol_changes WHERE new_symbol = ?1",
                )?
                .query_row(params![current], |row| {
                    Ok(SymbolChange {
                        old_symbol: row.get(0)?,
                        new_symbol: row.get(1)?,
                        change_date: row.get(2)?,
                        reason: row.get(3)?,
                    })
                })
                .optional()
            })
            .await
    }

    /// Administrative insert of a rename record (also used by tests).
    pub async fn insert_change(&self, change: &SymbolChange) -> Result<(), ServiceError> {
        let change = change.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO symbol_changes (old_symbol, change_date, new_symbol, reason)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        change.old_symbol,
                        change.change_date,
                        change.new_symbol,
                        change.reason
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

fn map_symbol(row: &Row<'_>) -> rusqlite::Result<SymbolRecord> {
    Ok(SymbolRecord {
        symbol: row.get(0)?,
        name: row.get(1)?,
        exchange: row.get(2)?,
        currency: row.get(3)?,
        is_active: row.get(4)?,
        has_full_history: row.get(5)?,
        first_date: row.get::<_, Option<NaiveDate>>(6)?,
        last_date: row.get::<_, Option<NaiveDate>>(7)?,
        created_at: row.get(8)?,
    })
}
