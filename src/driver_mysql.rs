//! MySQL over sqlx. sqlx opens its own TCP sockets, so tunneled MySQL
//! connections are pointed at a local forwarder instead of a dialer.

use std::str::FromStr;
use std::time::Duration;

use log::debug;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Connection, Row, TypeInfo, ValueRef};

use crate::config::PoolLimits;
use crate::models::structs::QueryResult;

/// Idle connections above the cap are not tracked individually by sqlx;
/// this reaps them instead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Build a pool without connecting. `acquire_timeout` bounds how long a
/// caller waits for a connection, including the dial.
pub fn open_lazy(
    dsn: &str,
    limits: PoolLimits,
    acquire_timeout: Duration,
) -> Result<MySqlPool, sqlx::Error> {
    let options = MySqlConnectOptions::from_str(dsn)?;
    Ok(pool_options(limits, acquire_timeout).connect_lazy_with(options))
}

fn pool_options(limits: PoolLimits, acquire_timeout: Duration) -> MySqlPoolOptions {
    MySqlPoolOptions::new()
        .max_connections(limits.max_open.max(1) as u32)
        .min_connections(0)
        .max_lifetime(Some(limits.max_lifetime))
        .idle_timeout(Some(IDLE_TIMEOUT))
        .acquire_timeout(acquire_timeout)
        .test_before_acquire(true)
}

/// A new lazy pool like `pool` but with `database` as the default schema.
/// The old pool is left open for the caller to close.
pub fn with_database(pool: &MySqlPool, database: &str) -> MySqlPool {
    let options = pool.connect_options().as_ref().clone().database(database);
    pool.options().clone().connect_lazy_with(options)
}

pub async fn ping(pool: &MySqlPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}

/// Run `sql` over the text protocol and render every value as text.
pub async fn query(pool: &MySqlPool, sql: &str) -> Result<QueryResult, sqlx::Error> {
    let rows = sqlx::raw_sql(sql).fetch_all(pool).await?;
    let headers = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    debug!("MySQL query returned {} rows", rows.len());
    Ok((headers, convert_rows(&rows)))
}

pub async fn exec(pool: &MySqlPool, sql: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::raw_sql(sql).execute(pool).await?;
    Ok(result.rows_affected())
}

pub(crate) fn convert_rows(rows: &[MySqlRow]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| (0..row.columns().len()).map(|idx| value_as_string(row, idx)).collect())
        .collect()
}

fn value_as_string(row: &MySqlRow, idx: usize) -> String {
    match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return "NULL".to_string(),
        Ok(_) => {}
        Err(e) => return format!("[ERROR:{e}]"),
    }

    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let typed = match type_name.as_str() {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => {
            row.try_get::<i64, _>(idx).ok().map(|v| v.to_string())
        }
        "YEAR" => row.try_get::<i16, _>(idx).ok().map(|v| v.to_string()),
        t if t.ends_with("UNSIGNED") => row.try_get::<u64, _>(idx).ok().map(|v| v.to_string()),
        "FLOAT" => row.try_get::<f32, _>(idx).ok().map(|v| v.to_string()),
        "DOUBLE" | "REAL" => row.try_get::<f64, _>(idx).ok().map(|v| v.to_string()),
        "DECIMAL" | "NUMERIC" => row
            .try_get::<rust_decimal::Decimal, _>(idx)
            .ok()
            .map(|v| v.to_string()),
        "BOOLEAN" | "BOOL" => row.try_get::<bool, _>(idx).ok().map(|v| v.to_string()),
        "DATE" => row.try_get::<chrono::NaiveDate, _>(idx).ok().map(|v| v.to_string()),
        "TIME" => row.try_get::<chrono::NaiveTime, _>(idx).ok().map(|v| v.to_string()),
        "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .ok()
            .map(|v| v.to_string()),
        "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .ok()
            .map(|v| v.to_rfc3339()),
        "BIT" => row.try_get::<Vec<u8>, _>(idx).ok().map(|bytes| {
            use std::fmt::Write as _;
            let mut s = String::with_capacity(bytes.len() * 8 + 2);
            s.push_str("0b");
            for b in bytes {
                let _ = write!(&mut s, "{:08b}", b);
            }
            s
        }),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
            .try_get::<Vec<u8>, _>(idx)
            .ok()
            .map(bytes_to_string_or_marker),
        _ => None,
    };

    typed.unwrap_or_else(|| fallback(row, idx, &type_name))
}

/// Last resort when the declared type did not decode: text, then bytes, then
/// the common scalar types.
fn fallback(row: &MySqlRow, idx: usize, type_name: &str) -> String {
    if let Ok(val) = row.try_get::<String, _>(idx) {
        return val;
    }
    if let Ok(val) = row.try_get::<Vec<u8>, _>(idx) {
        return bytes_to_string_or_marker(val);
    }
    if let Ok(val) = row.try_get::<i64, _>(idx) {
        return val.to_string();
    }
    if let Ok(val) = row.try_get::<u64, _>(idx) {
        return val.to_string();
    }
    if let Ok(val) = row.try_get::<f64, _>(idx) {
        return val.to_string();
    }
    if let Ok(val) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
        return val.to_string();
    }
    format!("[CONVERSION_ERROR:{type_name}]")
}

// Heuristic: treat bytes as text if they are mostly printable
fn looks_textual(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    let printable = bytes
        .iter()
        .filter(|&&b| (0x20..=0x7E).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();
    (printable as f32) / (bytes.len() as f32) > 0.85
}

fn bytes_to_string_or_marker(mut bytes: Vec<u8>) -> String {
    // BINARY(n) pads with NULs
    while matches!(bytes.last(), Some(0)) {
        bytes.pop();
    }
    if bytes.is_empty() {
        return String::new();
    }
    if looks_textual(&bytes) {
        return String::from_utf8_lossy(&bytes).into_owned();
    }
    let mut s = String::with_capacity(2 + bytes.len() * 2);
    s.push_str("0x");
    for byte in &bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut s, "{:02X}", byte);
    }
    s
}
