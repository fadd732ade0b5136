//! Pre-flight discovery queries: column lists, PK bounds, secure_file_priv.

use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::Row;

use super::sql::quote_ident;
use crate::error::{MigrateError, Result};

/// Ordered column names of a table in the connection's current database.
pub async fn table_columns(pool: &MySqlPool, table: &str) -> Result<Vec<String>> {
    // CAST to CHAR to handle collation differences where information_schema
    // may return VARBINARY instead of VARCHAR
    let query = r#"
        SELECT CAST(COLUMN_NAME AS CHAR(255)) AS COLUMN_NAME
        FROM INFORMATION_SCHEMA.COLUMNS
        WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
        ORDER BY ORDINAL_POSITION
    "#;

    let rows: Vec<MySqlRow> = sqlx::query(query).bind(table).fetch_all(pool).await?;

    let columns: Vec<String> = rows
        .iter()
        .map(|row| row.get::<String, _>("COLUMN_NAME"))
        .collect();

    if columns.is_empty() {
        return Err(MigrateError::Discovery(format!(
            "no columns found for table {:?}",
            table
        )));
    }

    Ok(columns)
}

/// MIN/MAX of the numeric primary key, restricted by the optional filter.
/// Returns `None` when the table (or the filtered view of it) is empty.
pub async fn pk_range(
    pool: &MySqlPool,
    table: &str,
    pk_col: &str,
    filter: Option<&str>,
) -> Result<Option<(u64, u64)>> {
    let pk = quote_ident(pk_col);
    let mut query = format!(
        "SELECT MIN({}), MAX({}) FROM {}",
        pk,
        pk,
        quote_ident(table)
    );
    if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
        query.push_str(" WHERE ");
        query.push_str(filter);
    }

    let row = sqlx::query(&query).fetch_one(pool).await?;
    let min = get_u64_opt(&row, 0)?;
    let max = get_u64_opt(&row, 1)?;

    Ok(min.zip(max))
}

/// MAX of a numeric column; `None` when the table is empty.
pub async fn max_pk(pool: &MySqlPool, table: &str, pk_col: &str) -> Result<Option<u64>> {
    let query = format!(
        "SELECT MAX({}) FROM {}",
        quote_ident(pk_col),
        quote_ident(table)
    );

    let row = sqlx::query(&query).fetch_one(pool).await?;
    get_u64_opt(&row, 0)
}

/// The server's `@@secure_file_priv`; `None` when unset or empty.
pub async fn secure_file_priv(pool: &MySqlPool) -> Result<Option<String>> {
    let row = sqlx::query("SELECT @@secure_file_priv").fetch_one(pool).await?;
    let dir: Option<String> = row.try_get(0)?;

    Ok(dir
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty()))
}

/// Decode a nullable numeric column that may come back signed or unsigned.
fn get_u64_opt(row: &MySqlRow, idx: usize) -> Result<Option<u64>> {
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return Ok(v);
    }
    let v: Option<i64> = row.try_get(idx)?;
    match v {
        Some(n) if n < 0 => Err(MigrateError::Discovery(format!(
            "negative primary key {} is not supported",
            n
        ))),
        Some(n) => Ok(Some(n as u64)),
        None => Ok(None),
    }
}
