//! Async handle over the embedded SQLite database.
//!
//! One connection, serialized behind a `tokio::sync::Mutex`; callers pass
//! closures that run while the lock is held. Transient `SQLITE_BUSY`-class
//! failures retry a bounded number of times before surfacing as a
//! `DATABASE_ERROR`. Coverage code must never hold this lock across an
//! upstream call; fetch first, then write.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::ServiceError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const ACQUIRE_RETRIES: u32 = 3;
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(300);

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the database file, apply pragmas, run migrations.
    pub fn open(path: &str) -> Result<Self, ServiceError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::finish_init(conn)
    }

    /// In-memory database; used by tests, dropped with the handle.
    pub fn in_memory() -> Result<Self, ServiceError> {
        Self::finish_init(Connection::open_in_memory()?)
    }

    fn finish_init(conn: Connection) -> Result<Self, ServiceError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut conn = conn;
        // Unrecoverable schema mismatch is fatal by contract.
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| ServiceError::Database(format!("migration failed: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection, retrying busy/locked failures.
    pub async fn call<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        F: Fn(&mut Connection) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let mut conn = self.conn.lock().await;
                f(&mut conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt < ACQUIRE_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        "database busy, retrying in {}ms: {e}",
                        ACQUIRE_RETRY_DELAY.as_millis()
                    );
                    tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}
