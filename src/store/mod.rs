//! Typed stores over the shared database handle.
//!
//! Each store is a thin struct owning a [`Db`](crate::db::Db) clone and
//! mapping rows into the closed types in [`model`](crate::model). Enum
//! columns reject unknown values at the row mapper.

pub mod events;
pub mod jobs;
pub mod prices;
pub mod symbols;

/// Row-mapper error for an out-of-vocabulary enum column.
pub(crate) fn bad_enum(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown {column}: {value:?}").into(),
    )
}
