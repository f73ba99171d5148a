//! SQLite queries for mappings, devices and logs
//!
//! One table set is used for both reads and writes: `mappings`, `devices`, `logs`.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::error::{Result, StoreError};
use crate::model::{Device, LogRecord, Mapping};

/// Create the gateway tables if missing
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mappings (
            tcp_address INTEGER PRIMARY KEY CHECK (tcp_address BETWEEN 0 AND 65535),
            rtu_id INTEGER NOT NULL CHECK (rtu_id BETWEEN 0 AND 255),
            rtu_address INTEGER NOT NULL CHECK (rtu_address BETWEEN 0 AND 65535),
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            updated_at TEXT NOT NULL,
            ip_address TEXT NOT NULL,
            tcp_port INTEGER NOT NULL CHECK (tcp_port BETWEEN 0 AND 65535),
            device_name TEXT NOT NULL,
            device_model TEXT,
            device_type TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            service TEXT NOT NULL,
            message TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Mappings
// ============================================================================

pub async fn get_mapping(pool: &SqlitePool, tcp_address: u16) -> Result<Option<Mapping>> {
    let row = sqlx::query(
        r#"
        SELECT tcp_address, rtu_id, rtu_address
        FROM mappings
        WHERE tcp_address = ?
        "#,
    )
    .bind(i64::from(tcp_address))
    .fetch_optional(pool)
    .await?;

    row.map(hydrate_mapping).transpose()
}

pub async fn list_mappings(pool: &SqlitePool) -> Result<Vec<Mapping>> {
    let rows = sqlx::query(
        r#"
        SELECT tcp_address, rtu_id, rtu_address
        FROM mappings
        ORDER BY tcp_address ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(hydrate_mapping).collect()
}

/// Insert or replace by `tcp_address`
pub async fn upsert_mapping(pool: &SqlitePool, mapping: &Mapping) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO mappings (tcp_address, rtu_id, rtu_address, updated_at)
        VALUES (?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(tcp_address) DO UPDATE SET
            rtu_id = excluded.rtu_id,
            rtu_address = excluded.rtu_address,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(i64::from(mapping.tcp_address))
    .bind(i64::from(mapping.rtu_id))
    .bind(i64::from(mapping.rtu_address))
    .execute(pool)
    .await?;

    Ok(())
}

/// Returns whether a row was removed
pub async fn delete_mapping(pool: &SqlitePool, tcp_address: u16) -> Result<bool> {
    let result = sqlx::query("DELETE FROM mappings WHERE tcp_address = ?")
        .bind(i64::from(tcp_address))
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn hydrate_mapping(row: SqliteRow) -> Result<Mapping> {
    let tcp_address: i64 = row.try_get("tcp_address")?;
    let rtu_id: i64 = row.try_get("rtu_id")?;
    let rtu_address: i64 = row.try_get("rtu_address")?;

    Ok(Mapping {
        tcp_address: narrow(tcp_address, "tcp_address")?,
        rtu_id: narrow(rtu_id, "rtu_id")?,
        rtu_address: narrow(rtu_address, "rtu_address")?,
    })
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T> {
    T::try_from(value)
        .map_err(|_| StoreError::InvalidRecord(format!("{} out of range: {}", column, value)))
}

// ============================================================================
// Devices
// ============================================================================

pub async fn list_devices(pool: &SqlitePool) -> Result<Vec<Device>> {
    let rows = sqlx::query(
        r#"
        SELECT id, updated_at, ip_address, tcp_port, device_name, device_model, device_type
        FROM devices
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(hydrate_device).collect()
}

pub async fn get_device(pool: &SqlitePool, id: i64) -> Result<Device> {
    let row = sqlx::query(
        r#"
        SELECT id, updated_at, ip_address, tcp_port, device_name, device_model, device_type
        FROM devices
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => hydrate_device(row),
        None => Err(StoreError::NotFound(format!("device {}", id))),
    }
}

/// Insert a device (`id == None`) or update an existing one. Returns the id.
pub async fn upsert_device(pool: &SqlitePool, device: &Device) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO devices (id, updated_at, ip_address, tcp_port, device_name, device_model, device_type)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            updated_at = excluded.updated_at,
            ip_address = excluded.ip_address,
            tcp_port = excluded.tcp_port,
            device_name = excluded.device_name,
            device_model = excluded.device_model,
            device_type = excluded.device_type
        "#,
    )
    .bind(device.id)
    .bind(Utc::now())
    .bind(&device.ip_address)
    .bind(i64::from(device.tcp_port))
    .bind(&device.device_name)
    .bind(&device.device_model)
    .bind(&device.device_type)
    .execute(pool)
    .await?;

    // last_insert_rowid is not touched by the UPDATE branch
    Ok(device.id.unwrap_or_else(|| result.last_insert_rowid()))
}

pub async fn delete_device(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM devices WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

fn hydrate_device(row: SqliteRow) -> Result<Device> {
    let tcp_port: i64 = row.try_get("tcp_port")?;
    Ok(Device {
        id: Some(row.try_get("id")?),
        updated_at: row.try_get::<Option<DateTime<Utc>>, _>("updated_at")?,
        ip_address: row.try_get("ip_address")?,
        tcp_port: narrow(tcp_port, "tcp_port")?,
        device_name: row.try_get("device_name")?,
        device_model: row.try_get("device_model")?,
        device_type: row.try_get("device_type")?,
    })
}

// ============================================================================
// Logs
// ============================================================================

pub async fn insert_log(pool: &SqlitePool, record: &LogRecord) -> Result<()> {
    sqlx::query("INSERT INTO logs (timestamp, service, message) VALUES (?, ?, ?)")
        .bind(record.timestamp)
        .bind(&record.service)
        .bind(&record.message)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recent entries, newest first
pub async fn recent_logs(pool: &SqlitePool, limit: u32) -> Result<Vec<LogRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT timestamp, service, message
        FROM logs
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<LogRecord> {
            Ok(LogRecord {
                timestamp: row.try_get("timestamp")?,
                service: row.try_get("service")?,
                message: row.try_get("message")?,
            })
        })
        .collect()
}
