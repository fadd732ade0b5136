//! Cell-to-text conversion for staged CSV records.
//!
//! Every source cell is rendered to the textual form the bulk loader expects:
//! NULL as the empty field, timestamps as `YYYY-MM-DD HH:MM:SS` in UTC, binary
//! blobs passed through as raw UTF-8, everything else in its canonical text
//! form. Conversion dispatches on the column type reported by the driver.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::mysql::MySqlRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::error::{MigrateError, Result};

/// Timestamp layout used across chunks and the bulk-load statement.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render one cell of a row to its text form.
pub fn render_cell(row: &MySqlRow, idx: usize) -> Result<String> {
    let is_null = row
        .try_get_raw(idx)
        .map(|v| v.is_null())
        .unwrap_or(true);
    if is_null {
        return Ok(String::new());
    }

    let type_name = row.column(idx).type_info().name().to_uppercase();

    let rendered = match type_name.as_str() {
        "BOOLEAN" => row
            .try_get::<bool, _>(idx)
            .map(|v| if v { "1".to_string() } else { "0".to_string() })
            .ok(),

        "TINYINT" => get_int::<i8>(row, idx),
        "TINYINT UNSIGNED" => get_int::<u8>(row, idx),
        "SMALLINT" => get_int::<i16>(row, idx),
        "SMALLINT UNSIGNED" | "YEAR" => get_int::<u16>(row, idx),
        "MEDIUMINT" | "INT" => get_int::<i32>(row, idx),
        "MEDIUMINT UNSIGNED" | "INT UNSIGNED" => get_int::<u32>(row, idx),
        "BIGINT" => get_int::<i64>(row, idx),
        "BIGINT UNSIGNED" | "BIT" => get_int::<u64>(row, idx),

        "FLOAT" => row.try_get::<f32, _>(idx).map(|v| v.to_string()).ok(),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(|v| v.to_string()).ok(),
        "DECIMAL" => row
            .try_get::<Decimal, _>(idx)
            .map(|v| v.to_string())
            .ok(),

        "DATE" => row
            .try_get::<NaiveDate, _>(idx)
            .map(|v| v.format("%Y-%m-%d").to_string())
            .ok(),
        "TIME" => row
            .try_get::<NaiveTime, _>(idx)
            .map(|v| v.format("%H:%M:%S").to_string())
            .ok(),
        "DATETIME" => row
            .try_get::<NaiveDateTime, _>(idx)
            .map(|v| v.format(TS_FORMAT).to_string())
            .ok(),
        "TIMESTAMP" => row
            .try_get::<DateTime<Utc>, _>(idx)
            .map(|v| v.naive_utc().format(TS_FORMAT).to_string())
            .ok()
            .or_else(|| {
                row.try_get::<NaiveDateTime, _>(idx)
                    .map(|v| v.format(TS_FORMAT).to_string())
                    .ok()
            }),

        "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM"
        | "SET" => row.try_get::<String, _>(idx).ok(),

        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .ok(),

        _ => None,
    };

    if let Some(text) = rendered {
        return Ok(text);
    }

    // Unknown or mis-reported type: fall back string, raw bytes, then the
    // numeric decodings.
    if let Ok(s) = row.try_get::<String, _>(idx) {
        return Ok(s);
    }
    if let Ok(b) = row.try_get::<Vec<u8>, _>(idx) {
        return Ok(String::from_utf8_lossy(&b).into_owned());
    }
    if let Some(n) = get_int::<i64>(row, idx).or_else(|| get_int::<u64>(row, idx)) {
        return Ok(n);
    }
    if let Ok(f) = row.try_get::<f64, _>(idx) {
        return Ok(f.to_string());
    }

    Err(MigrateError::Stage(format!(
        "cannot render column {} ({}) as text",
        row.column(idx).name(),
        type_name
    )))
}

/// Render every cell of a row in column order.
pub fn render_row(row: &MySqlRow) -> Result<Vec<String>> {
    (0..row.len()).map(|i| render_cell(row, i)).collect()
}

fn get_int<'r, T>(row: &'r MySqlRow, idx: usize) -> Option<String>
where
    T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql> + std::fmt::Display,
{
    row.try_get::<T, _>(idx).map(|v| v.to_string()).ok()
}
