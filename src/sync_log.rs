//! Append-only sync audit log.
//!
//! Every ingest, pull and import promotion appends an entry; nothing in the
//! engine updates or expires them. `clear` exists for the operator's
//! troubleshooting screen and is the only way entries leave the table.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::DbState;

pub const EVENT_UPLOAD: &str = "upload";
pub const EVENT_DOWNLOAD: &str = "download";
pub const EVENT_ERROR: &str = "error";

/// Append one audit entry. Entries are immutable once written.
pub fn append(
    db: &DbState,
    event_type: &str,
    sales_rep_id: Option<&str>,
    records_count: i64,
    status: &str,
    error_message: Option<&str>,
    device_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sync_logs (id, event_type, sales_rep_id, records_count, status, error_message, device_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            id,
            event_type,
            sales_rep_id,
            records_count,
            status,
            error_message,
            device_id,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        ],
    )
    .map_err(|e| format!("append sync log: {e}"))?;

    Ok(serde_json::json!({ "id": id }))
}

/// Newest-first slice of the audit log.
pub fn recent(db: &DbState, limit: i64) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, event_type, sales_rep_id, records_count, status, error_message, device_id, created_at
             FROM sync_logs
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([limit.max(0)], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "eventType": row.get::<_, String>(1)?,
                "salesRepId": row.get::<_, Option<String>>(2)?,
                "recordsCount": row.get::<_, i64>(3)?,
                "status": row.get::<_, String>(4)?,
                "errorMessage": row.get::<_, Option<String>>(5)?,
                "deviceId": row.get::<_, Option<String>>(6)?,
                "createdAt": row.get::<_, Option<String>>(7)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let entries: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(Value::Array(entries))
}

/// Aggregate import statistics over the stored entries.
pub fn stats(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let total_imported: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(records_count), 0) FROM sync_logs WHERE event_type = 'upload'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let today_imported: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(records_count), 0) FROM sync_logs
             WHERE event_type = 'upload' AND substr(created_at, 1, 10) = date('now')",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let failed_imports: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sync_logs WHERE event_type = 'error'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let last_import: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM sync_logs WHERE event_type = 'upload'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(None);

    Ok(serde_json::json!({
        "totalImported": total_imported,
        "todayImported": today_imported,
        "failedImports": failed_imports,
        "lastImportTimestamp": last_import,
    }))
}

/// Operator-triggered bulk delete. There is no automatic expiry.
pub fn clear(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let cleared = conn
        .execute("DELETE FROM sync_logs", [])
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "success": true, "cleared": cleared }))
}

// ===========================================================================
// Tests
// ===========================================================================
