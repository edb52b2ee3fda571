//! Local SQLite database layer for Campo Sync.
//!
//! Uses rusqlite with WAL mode, matching the back-office server's SQLite
//! configuration. Provides schema migrations, settings helpers, and shared
//! state for use across the sync engine's operations.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Initialize the database at `{data_dir}/campo.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("campo.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Migration v1: staging tables for mobile order intake.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- mobile_orders: staged orders/visits uploaded by field devices.
        -- local_id is the client-side correlation id; it is intentionally
        -- NOT unique, so a batch resubmitted after a timeout can stage
        -- duplicate rows (a uniqueness constraint here is a future migration).
        CREATE TABLE IF NOT EXISTS mobile_orders (
            id TEXT PRIMARY KEY,
            local_id TEXT,
            code TEXT,
            customer_id TEXT,
            customer_name TEXT,
            customer_code TEXT,
            sales_rep_id TEXT,
            sales_rep_name TEXT,
            order_date TEXT,
            due_date TEXT,
            delivery_date TEXT,
            total REAL NOT NULL DEFAULT 0,
            discount REAL DEFAULT 0,
            business_status TEXT DEFAULT 'open',
            payment_status TEXT DEFAULT 'pending',
            payment_method TEXT,
            payment_method_id TEXT,
            payment_table TEXT,
            payment_table_id TEXT,
            notes TEXT,
            delivery_address TEXT,
            delivery_city TEXT,
            delivery_state TEXT,
            delivery_zip TEXT,
            rejection_reason TEXT,
            visit_notes TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            imported_to_orders INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_mobile_orders_sync_status
            ON mobile_orders(sync_status);

        -- mobile_order_items: line items of a staged sale order
        CREATE TABLE IF NOT EXISTS mobile_order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES mobile_orders(id) ON DELETE CASCADE,
            product_id TEXT,
            product_name TEXT,
            product_code TEXT,
            quantity REAL NOT NULL DEFAULT 0,
            unit_price REAL NOT NULL DEFAULT 0,
            discount REAL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            unit TEXT,
            position INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_mobile_order_items_order
            ON mobile_order_items(order_id);
        ",
    )
    .map_err(|e| format!("migrate v1: {e}"))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])
        .map_err(|e| format!("record v1: {e}"))?;
    Ok(())
}

/// Migration v2: append-only sync audit log.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_logs (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            sales_rep_id TEXT,
            records_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            error_message TEXT,
            device_id TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_logs_created_at
            ON sync_logs(created_at);
        ",
    )
    .map_err(|e| format!("migrate v2: {e}"))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])
        .map_err(|e| format!("record v2: {e}"))?;
    Ok(())
}

/// Migration v3: canonical order ledger surface.
///
/// `mobile_order_id` links ledger rows back to the staging row the import
/// executor promoted; a source='mobile' row without a matching imported
/// staging row never passed through the executor.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            code TEXT,
            customer_id TEXT,
            customer_name TEXT,
            sales_rep_id TEXT,
            sales_rep_name TEXT,
            total REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'open',
            source TEXT NOT NULL DEFAULT 'backoffice',
            imported INTEGER NOT NULL DEFAULT 0,
            mobile_order_id TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_orders_source_imported
            ON orders(source, imported);
        ",
    )
    .map_err(|e| format!("migrate v3: {e}"))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (3)", [])
        .map_err(|e| format!("record v3: {e}"))?;
    Ok(())
}

/// Migration v4: persisted sale/visit classification.
///
/// The gateway stores the validated order kind so downstream consumers never
/// re-derive it from the total/rejection_reason pair.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    if !column_exists(conn, "mobile_orders", "order_kind")? {
        conn.execute(
            "ALTER TABLE mobile_orders ADD COLUMN order_kind TEXT NOT NULL DEFAULT 'sale'",
            [],
        )
        .map_err(|e| format!("migrate v4 add order_kind: {e}"))?;
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_mobile_orders_rep_status
             ON mobile_orders(sales_rep_id, sync_status);",
    )
    .map_err(|e| format!("migrate v4 index: {e}"))?;

    conn.execute("INSERT INTO schema_version (version) VALUES (4)", [])
        .map_err(|e| format!("record v4: {e}"))?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| format!("table_info query: {e}"))?;
    for name in names.flatten() {
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ===========================================================================
// Settings helpers
// ===========================================================================

/// Read a setting value; None if missing.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Get all settings grouped by category as JSON.
pub fn get_all_settings(conn: &Connection) -> serde_json::Value {
    let mut stmt = match conn.prepare(
        "SELECT setting_category, setting_key, setting_value FROM local_settings ORDER BY setting_category, setting_key",
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("get_all_settings prepare: {e}");
            return serde_json::json!({});
        }
    };

    let mut result = serde_json::Map::new();

    let rows = match stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    }) {
        Ok(r) => r,
        Err(e) => {
            error!("get_all_settings query: {e}");
            return serde_json::json!({});
        }
    };

    for (cat, key, val) in rows.flatten() {
        let category = result.entry(cat).or_insert_with(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = category {
            map.insert(key, serde_json::Value::String(val));
        }
    }

    serde_json::Value::Object(result)
}

/// Test helper: run migrations against an arbitrary (in-memory) connection.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
