//! Orphan reconciliation over the canonical ledger.
//!
//! An orphan is a ledger row marked source='mobile' and imported=1 that the
//! import executor never wrote: it carries no staging row in the 'imported'
//! state. Historic app versions wrote such rows straight into the ledger,
//! bypassing review. Detection is read-only; fixing is a manually triggered
//! corrective action that flips the rows back into the pending-review flow
//! and is safe to re-run.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::DbState;

/// Ledger rows flagged imported without a matching executor-driven import.
pub fn detect_orphans(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, code, customer_id, customer_name, sales_rep_id, sales_rep_name,
                    total, mobile_order_id, created_at
             FROM orders
             WHERE source = 'mobile' AND imported = 1
               AND NOT EXISTS (
                   SELECT 1 FROM mobile_orders m
                   WHERE m.id = orders.mobile_order_id AND m.sync_status = 'imported'
               )
             ORDER BY created_at, id",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "code": row.get::<_, Option<String>>(1)?,
                "customerId": row.get::<_, Option<String>>(2)?,
                "customerName": row.get::<_, Option<String>>(3)?,
                "salesRepId": row.get::<_, Option<String>>(4)?,
                "salesRepName": row.get::<_, Option<String>>(5)?,
                "total": row.get::<_, f64>(6)?,
                "mobileOrderId": row.get::<_, Option<String>>(7)?,
                "createdAt": row.get::<_, Option<String>>(8)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let orphans: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!({
        "count": orphans.len(),
        "orphans": orphans,
    }))
}

/// Return the given ledger rows to the pending-review flow.
///
/// Per row: clear the imported flag, then make sure a staging row is
/// visible again — the linked one is reset to 'pending' when it exists,
/// otherwise a minimal staging row is materialized from the ledger fields.
/// Rows already fixed (or not mobile-sourced) are skipped, so re-running on
/// the same ids is a no-op.
pub fn fix_orphans(db: &DbState, order_ids: &[String]) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut fixed = 0i64;
    let mut skipped = 0i64;
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    for order_id in order_ids {
        let cleared = conn
            .execute(
                "UPDATE orders SET imported = 0, updated_at = ?2
                 WHERE id = ?1 AND source = 'mobile' AND imported = 1",
                params![order_id, now],
            )
            .map_err(|e| format!("clear imported flag: {e}"))?;
        if cleared == 0 {
            skipped += 1;
            continue;
        }

        let ledger = conn
            .query_row(
                "SELECT code, customer_id, customer_name, sales_rep_id, sales_rep_name,
                        total, mobile_order_id, created_at
                 FROM orders WHERE id = ?1",
                params![order_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| format!("read ledger row: {e}"))?;

        let Some((code, customer_id, customer_name, sales_rep_id, sales_rep_name, total, mobile_order_id, created_at)) =
            ledger
        else {
            warn!(order_id = %order_id, "Ledger row disappeared while fixing orphans");
            skipped += 1;
            continue;
        };

        let staging_id = mobile_order_id.unwrap_or_else(|| order_id.clone());

        // A linked staging row stuck in 'imported' goes back to review;
        // reviewable rows are already visible and stay untouched.
        let restored = conn
            .execute(
                "UPDATE mobile_orders
                 SET sync_status = 'pending', imported_to_orders = 0, updated_at = ?2
                 WHERE id = ?1 AND sync_status = 'imported'",
                params![staging_id, now],
            )
            .map_err(|e| format!("restore staging row: {e}"))?;

        if restored == 0 {
            let kind = if total > 0.0 { "sale" } else { "visit" };
            conn.execute(
                "INSERT OR IGNORE INTO mobile_orders (
                    id, local_id, code, customer_id, customer_name,
                    sales_rep_id, sales_rep_name, order_date, total,
                    order_kind, sync_status, imported_to_orders, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', 0, ?11, ?11)",
                params![
                    staging_id,
                    order_id,
                    code,
                    customer_id,
                    customer_name,
                    sales_rep_id,
                    sales_rep_name,
                    created_at,
                    total,
                    kind,
                    now,
                ],
            )
            .map_err(|e| format!("materialize staging row: {e}"))?;
        }

        fixed += 1;
    }

    info!(requested = order_ids.len(), fixed, skipped, "Orphan fix finished");

    Ok(serde_json::json!({
        "requested": order_ids.len() as i64,
        "fixed": fixed,
        "skipped": skipped,
        "message": format!("{fixed} orders returned to review"),
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbState;
    use crate::staging;
    use crate::{db, importer, sync};
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn insert_ledger_row(db: &DbState, id: &str, source: &str, imported: i64, link: Option<&str>) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO orders (id, code, customer_id, customer_name, sales_rep_id,
                                 sales_rep_name, total, status, source, imported, mobile_order_id)
             VALUES (?1, 'PED-900001', 'c1', 'Mercado Central', 'r1', 'João',
                     90.0, 'open', ?2, ?3, ?4)",
            params![id, source, imported, link],
        )
        .unwrap();
    }

    #[test]
    fn detection_only_flags_rows_that_bypassed_the_executor() {
        let db = test_db();

        // Proper import through the executor: not an orphan
        let payload = serde_json::json!({
            "id": "s1",
            "customerId": "c1",
            "customerName": "Mercado Central",
            "salesRepId": "r1",
            "salesRepName": "João",
            "date": "2024-01-05",
            "total": 40.0,
            "paymentMethod": "Boleto",
            "paymentMethodId": "7f6c9e9a-3a0f-4a6e-9d2f-0b8a1c2d3e4f",
            "items": [{
                "productName": "Café 500g",
                "productCode": "CAF500",
                "quantity": 1,
                "unitPrice": 40.0,
                "total": 40.0
            }]
        });
        let envelope = sync::ingest_orders(&db, "r1", &[payload]).unwrap();
        let staged_id = envelope["processedOrders"][0]["serverId"]
            .as_str()
            .unwrap()
            .to_string();
        importer::import_selected(&db, &[staged_id]).unwrap();

        // Bypassed the executor entirely
        insert_ledger_row(&db, "led-orphan", "mobile", 1, None);
        // Mobile-sourced but awaiting import: not an orphan
        insert_ledger_row(&db, "led-pending", "mobile", 0, None);
        // Back-office order: never an orphan
        insert_ledger_row(&db, "led-web", "backoffice", 1, None);

        let detected = detect_orphans(&db).expect("detect");
        assert_eq!(detected["count"], 1);
        assert_eq!(detected["orphans"][0]["id"], "led-orphan");
    }

    #[test]
    fn fix_round_trip_returns_order_to_pending_review() {
        let db = test_db();
        insert_ledger_row(&db, "led-1", "mobile", 1, None);

        let outcome = fix_orphans(&db, &["led-1".to_string()]).expect("fix");
        assert_eq!(outcome["fixed"], 1);

        let conn = db.conn.lock().unwrap();
        let imported: i64 = conn
            .query_row("SELECT imported FROM orders WHERE id = 'led-1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(imported, 0);
        drop(conn);

        let pending = staging::get_pending_orders(&db).expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["id"], "led-1");
        assert_eq!(pending[0]["customerName"], "Mercado Central");
        assert_eq!(pending[0]["orderKind"], "sale");

        // Fixed rows are no longer detected
        let detected = detect_orphans(&db).expect("detect");
        assert_eq!(detected["count"], 0);
    }

    #[test]
    fn fix_is_idempotent() {
        let db = test_db();
        insert_ledger_row(&db, "led-2", "mobile", 1, None);

        let first = fix_orphans(&db, &["led-2".to_string()]).expect("first fix");
        assert_eq!(first["fixed"], 1);

        let second = fix_orphans(&db, &["led-2".to_string()]).expect("second fix");
        assert_eq!(second["fixed"], 0);
        assert_eq!(second["skipped"], 1);

        let pending = staging::get_pending_orders(&db).expect("pending");
        assert_eq!(pending.len(), 1, "no duplicate staging rows");
    }

    #[test]
    fn fix_restores_a_linked_staging_row() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO mobile_orders (id, customer_name, sales_rep_id, total,
                                            order_kind, sync_status, imported_to_orders)
                 VALUES ('mo-linked', 'Padaria Sul', 'r2', 25.0, 'sale', 'imported', 1)",
                [],
            )
            .unwrap();
        }
        insert_ledger_row(&db, "led-3", "mobile", 1, Some("mo-linked"));

        fix_orphans(&db, &["led-3".to_string()]).expect("fix");

        let conn = db.conn.lock().unwrap();
        let (status, flag): (String, i64) = conn
            .query_row(
                "SELECT sync_status, imported_to_orders FROM mobile_orders WHERE id = 'mo-linked'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "pending");
        assert_eq!(flag, 0);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM mobile_orders", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1, "no second staging row materialized");
    }

    #[test]
    fn fix_skips_non_mobile_rows() {
        let db = test_db();
        insert_ledger_row(&db, "led-4", "backoffice", 1, None);

        let outcome = fix_orphans(&db, &["led-4".to_string()]).expect("fix");
        assert_eq!(outcome["fixed"], 0);
        assert_eq!(outcome["skipped"], 1);

        let conn = db.conn.lock().unwrap();
        let imported: i64 = conn
            .query_row("SELECT imported FROM orders WHERE id = 'led-4'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(imported, 1, "back-office rows are untouched");
    }
}
