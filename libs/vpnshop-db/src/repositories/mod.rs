pub mod order_repo;
pub mod payment_repo;
pub mod wallet_repo;

use sqlx::{Row, postgres::PgRow};
use std::str::FromStr;

use crate::store::StoreError;

/// Reads a TEXT column into one of the shared enums.
pub(crate) fn text_column<T>(row: &PgRow, column: &'static str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: T::Err| StoreError::Corrupt {
        column,
        detail: e.to_string(),
    })
}

pub(crate) fn optional_text_column<T>(
    row: &PgRow,
    column: &'static str,
) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value.parse().map_err(|e: T::Err| StoreError::Corrupt {
            column,
            detail: e.to_string(),
        })
    })
    .transpose()
}

pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        column,
        detail: e.to_string(),
    })
}

pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23505") && db.constraint() == Some(constraint)
        }
        _ => false,
    }
}
