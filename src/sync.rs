//! Mobile order intake gateway for Campo Sync.
//!
//! Field devices POST batches of orders and visit records captured offline.
//! Each order in a batch is processed independently: validation failure or a
//! write failure on one order never aborts the rest. Sale orders are staged
//! with a two-phase write (order row, then item rows); when the item write
//! fails the order row is deleted again so no half-staged order survives.
//! A payload without orders is a pull: the device receives its rep's
//! currently pending orders instead.

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::staging;
use crate::sync_log;
use crate::validation::{self, MobileOrderInput, OrderKind};

/// Per-order result statuses reported back to the device.
pub const RESULT_SYNCED: &str = "synced";
pub const RESULT_VALIDATION_ERROR: &str = "validation_error";
pub const RESULT_ITEMS_ERROR: &str = "items_error";
pub const RESULT_ERROR: &str = "error";

// ---------------------------------------------------------------------------
// Device payload parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DeviceSyncPayload {
    #[serde(default, alias = "sales_rep_id", alias = "repId")]
    sales_rep_id: String,
    #[serde(default, alias = "device_id")]
    device_id: Option<String>,
    #[serde(default)]
    orders: Option<Vec<Value>>,
}

fn parse_device_sync_payload(payload: Value) -> Result<DeviceSyncPayload, String> {
    let mut parsed: DeviceSyncPayload = serde_json::from_value(payload)
        .map_err(|e| format!("Invalid device sync payload: {e}"))?;
    parsed.sales_rep_id = parsed.sales_rep_id.trim().to_string();
    if parsed.sales_rep_id.is_empty() {
        return Err("Missing salesRepId".into());
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Order code generation
// ---------------------------------------------------------------------------

/// Generate the next server-assigned sequential order code (PED-NNNNNN).
///
/// Uses `local_settings` (category='orders', key='code_counter') as a
/// persistent counter; codes are assigned at persistence time and do not
/// reflect client-side submission order across devices.
fn next_order_code(conn: &rusqlite::Connection) -> String {
    let current: i64 = db::get_setting(conn, "orders", "code_counter")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    let next = current + 1;
    if let Err(e) = db::set_setting(conn, "orders", "code_counter", &next.to_string()) {
        warn!("Failed to persist order code counter: {e}");
    }
    format!("PED-{next:06}")
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

fn local_id_of(raw: &Value) -> Option<String> {
    for key in ["localId", "local_id", "id"] {
        if let Some(s) = raw.get(key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Stage one validated order. Returns the per-order result.
fn stage_order(
    db: &DbState,
    input: &MobileOrderInput,
    kind: OrderKind,
    local_id: Option<&str>,
) -> Value {
    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(e) => {
            return serde_json::json!({
                "localId": local_id,
                "serverId": Value::Null,
                "status": RESULT_ERROR,
                "error": format!("database lock poisoned: {e}"),
            });
        }
    };

    let server_id = Uuid::new_v4().to_string();
    let code = next_order_code(&conn);

    if let Err(e) = staging::insert_order(
        &conn,
        &server_id,
        input,
        kind,
        &code,
        staging::STATUS_SYNCED,
    ) {
        warn!(local_id = ?local_id, error = %e, "Order row insert failed");
        return serde_json::json!({
            "localId": local_id,
            "serverId": Value::Null,
            "status": RESULT_ERROR,
            "error": format!("insert order: {e}"),
        });
    }

    if kind == OrderKind::Sale {
        if let Err(e) = staging::insert_items(&conn, &server_id, &input.items) {
            // Two-phase write without a multi-table transaction: undo the
            // order row so the batch never leaves a half-staged sale behind.
            if let Err(del_err) = staging::delete_order(&conn, &server_id) {
                warn!(
                    server_id = %server_id,
                    error = %del_err,
                    "Compensating delete failed after item write error"
                );
            }
            warn!(local_id = ?local_id, error = %e, "Item rows insert failed, order rolled back");
            return serde_json::json!({
                "localId": local_id,
                "serverId": Value::Null,
                "status": RESULT_ITEMS_ERROR,
                "error": format!("insert items: {e}"),
            });
        }
    }

    serde_json::json!({
        "localId": local_id,
        "serverId": server_id,
        "code": code,
        "status": RESULT_SYNCED,
    })
}

/// Ingest a batch of uploaded orders for one sales rep.
///
/// Orders are processed sequentially and independently; the returned
/// envelope carries one result per submitted order plus a summary. There is
/// no retry and no deduplication of resubmitted client-local ids: a batch
/// resubmitted after a timeout stages duplicate rows.
pub fn ingest_orders(db: &DbState, sales_rep_id: &str, orders: &[Value]) -> Result<Value, String> {
    let mut results: Vec<Value> = Vec::with_capacity(orders.len());
    let mut synced = 0i64;
    let mut validation_errors = 0i64;
    let mut other_errors = 0i64;

    for raw in orders {
        let local_id = local_id_of(raw);

        let mut input: MobileOrderInput = match serde_json::from_value(raw.clone()) {
            Ok(v) => v,
            Err(e) => {
                validation_errors += 1;
                results.push(serde_json::json!({
                    "localId": local_id,
                    "serverId": Value::Null,
                    "status": RESULT_VALIDATION_ERROR,
                    "errorCode": "INVALID_PAYLOAD",
                    "validationErrors": [format!("Invalid order payload: {e}")],
                }));
                continue;
            }
        };

        // Old app versions omit the per-order rep and rely on the batch one.
        if input.sales_rep_id.as_deref().map(str::trim).unwrap_or("").is_empty() {
            input.sales_rep_id = Some(sales_rep_id.to_string());
        }

        let report = validation::validate_order(&input);
        if !report.is_valid {
            validation_errors += 1;
            results.push(serde_json::json!({
                "localId": local_id,
                "serverId": Value::Null,
                "status": RESULT_VALIDATION_ERROR,
                "errorCode": report.error_code,
                "validationErrors": report.errors,
            }));
            continue;
        }
        let Some(kind) = report.kind else {
            // Unreachable when is_valid, kept as a guard for rule drift.
            validation_errors += 1;
            results.push(serde_json::json!({
                "localId": local_id,
                "serverId": Value::Null,
                "status": RESULT_VALIDATION_ERROR,
                "errorCode": validation::CODE_INVALID_ORDER_TYPE,
                "validationErrors": ["Order kind could not be determined"],
            }));
            continue;
        };

        let result = stage_order(db, &input, kind, local_id.as_deref());
        match result.get("status").and_then(Value::as_str) {
            Some(RESULT_SYNCED) => synced += 1,
            _ => other_errors += 1,
        }
        results.push(result);
    }

    let total = orders.len() as i64;
    info!(
        sales_rep_id = %sales_rep_id,
        total,
        synced,
        validation_errors,
        other_errors,
        "Mobile order batch processed"
    );

    Ok(serde_json::json!({
        "processedOrders": results,
        "summary": {
            "total": total,
            "synced": synced,
            "validationErrors": validation_errors,
            "otherErrors": other_errors,
        },
    }))
}

// ---------------------------------------------------------------------------
// Device endpoint
// ---------------------------------------------------------------------------

/// Entry point for the device sync endpoint.
///
/// `{salesRepId, deviceId?, orders: [...]}` uploads a batch; without
/// `orders` the call is a pull returning the rep's pending orders. Every
/// call appends a sync audit entry.
pub async fn handle_device_sync(db: &DbState, payload: Value) -> Result<Value, String> {
    let parsed = parse_device_sync_payload(payload)?;

    match parsed.orders {
        Some(ref orders) if !orders.is_empty() => {
            let envelope = ingest_orders(db, &parsed.sales_rep_id, orders)?;
            let summary = &envelope["summary"];
            let total = summary["total"].as_i64().unwrap_or(0);
            let synced = summary["synced"].as_i64().unwrap_or(0);

            let (event_type, status, error_message) = if synced == 0 {
                (
                    sync_log::EVENT_ERROR,
                    "failed",
                    Some(format!("All {total} orders in the batch failed")),
                )
            } else if synced < total {
                (sync_log::EVENT_UPLOAD, "partial", None)
            } else {
                (sync_log::EVENT_UPLOAD, "success", None)
            };

            if let Err(e) = sync_log::append(
                db,
                event_type,
                Some(&parsed.sales_rep_id),
                synced,
                status,
                error_message.as_deref(),
                parsed.device_id.as_deref(),
            ) {
                warn!("Failed to append upload audit entry: {e}");
            }

            Ok(serde_json::json!({
                "success": true,
                "message": format!("{synced} of {total} orders synced"),
                "processedOrders": envelope["processedOrders"],
                "summary": summary,
            }))
        }
        _ => {
            let orders = staging::get_pending_orders_by_sales_rep(db, &parsed.sales_rep_id)
                .map_err(|e| e.to_string())?;

            if let Err(e) = sync_log::append(
                db,
                sync_log::EVENT_DOWNLOAD,
                Some(&parsed.sales_rep_id),
                orders.len() as i64,
                "success",
                None,
                parsed.device_id.as_deref(),
            ) {
                warn!("Failed to append download audit entry: {e}");
            }

            Ok(serde_json::json!({
                "success": true,
                "orders": orders,
                "count": orders.len(),
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Operator status & revalidation sweep
// ---------------------------------------------------------------------------

/// Snapshot of staged-row counts plus audit stats; the operator dashboard's
/// refresh payload.
pub fn get_sync_status(db: &DbState) -> Result<Value, String> {
    let staged = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare("SELECT sync_status, COUNT(*) FROM mobile_orders GROUP BY sync_status")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| e.to_string())?;

        let mut staged = serde_json::Map::new();
        let mut pending_review = 0i64;
        for (status, count) in rows.flatten() {
            if status == staging::STATUS_PENDING || status == staging::STATUS_SYNCED {
                pending_review += count;
            }
            staged.insert(status, serde_json::json!(count));
        }
        staged.insert("pendingReview".to_string(), serde_json::json!(pending_review));
        Value::Object(staged)
    };

    let audit = sync_log::stats(db)?;

    Ok(serde_json::json!({
        "staged": staged,
        "audit": audit,
    }))
}

/// Re-run the validation engine over staged rows still awaiting review and
/// flag the ones that no longer pass. Used by the back office after a
/// business-rule change; flagged rows drop out of the import surface until
/// the device resubmits them.
pub fn revalidate_pending_orders(db: &DbState) -> Result<Value, String> {
    let pending = staging::get_pending_orders(db).map_err(|e| e.to_string())?;

    let mut flagged: Vec<Value> = Vec::new();
    for row in &pending {
        let input: MobileOrderInput = match serde_json::from_value(row.clone()) {
            Ok(v) => v,
            Err(e) => {
                warn!("Staged row no longer deserializes: {e}");
                continue;
            }
        };
        let report = validation::validate_order(&input);
        if report.is_valid {
            continue;
        }

        let id = row.get("id").and_then(Value::as_str).unwrap_or_default();
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let moved = staging::update_sync_status(
            &conn,
            id,
            staging::REVIEWABLE_STATUSES,
            staging::STATUS_VALIDATION_ERROR,
        )
        .map_err(|e| e.to_string())?;
        if moved {
            flagged.push(serde_json::json!({
                "id": id,
                "errorCode": report.error_code,
                "validationErrors": report.errors,
            }));
        }
    }

    if !flagged.is_empty() {
        info!(count = flagged.len(), "Revalidation flagged staged orders");
    }

    Ok(serde_json::json!({
        "checked": pending.len(),
        "flagged": flagged.len(),
        "orders": flagged,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
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

    fn sale_payload(local_id: &str, total: f64) -> Value {
        serde_json::json!({
            "id": local_id,
            "localId": local_id,
            "customerId": "c1",
            "customerName": "Mercado Central",
            "salesRepId": "r1",
            "salesRepName": "João",
            "date": "2024-01-05",
            "total": total,
            "paymentMethod": "Boleto",
            "paymentMethodId": "7f6c9e9a-3a0f-4a6e-9d2f-0b8a1c2d3e4f",
            "items": [{
                "productName": "Café 500g",
                "productCode": "CAF500",
                "quantity": 1,
                "unitPrice": total,
                "total": total
            }]
        })
    }

    fn visit_payload(local_id: &str) -> Value {
        serde_json::json!({
            "id": local_id,
            "total": 0,
            "rejectionReason": "Loja fechada",
            "customerId": "c1",
            "customerName": "Loja X",
            "salesRepId": "r1",
            "salesRepName": "João",
            "date": "2024-01-01"
        })
    }

    fn staged_count(db: &DbState) -> i64 {
        let conn = db.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM mobile_orders", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn partial_batch_keeps_valid_orders() {
        let db = test_db();
        let invalid = serde_json::json!({
            "id": "bad-1",
            "total": 150.0,
            "customerId": "c2",
            "customerName": "Padaria Sul",
            "salesRepId": "r1",
            "salesRepName": "João",
            "date": "2024-01-05"
            // no payment method, no items
        });

        let envelope =
            ingest_orders(&db, "r1", &[sale_payload("ok-1", 100.0), invalid]).expect("ingest");

        let results = envelope["processedOrders"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["status"], RESULT_SYNCED);
        assert_eq!(results[1]["status"], RESULT_VALIDATION_ERROR);
        assert_eq!(envelope["summary"]["synced"], 1);
        assert_eq!(envelope["summary"]["validationErrors"], 1);

        // The valid order was persisted regardless of the invalid one
        assert_eq!(staged_count(&db), 1);
    }

    #[test]
    fn visit_batch_stages_without_items() {
        let db = test_db();
        let envelope = ingest_orders(&db, "r1", &[visit_payload("v1")]).expect("ingest");
        assert_eq!(envelope["summary"]["synced"], 1);

        let conn = db.conn.lock().unwrap();
        let (kind, status, items): (String, String, i64) = conn
            .query_row(
                "SELECT order_kind, sync_status,
                        (SELECT COUNT(*) FROM mobile_order_items) FROM mobile_orders",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(kind, "visit");
        assert_eq!(status, "synced");
        assert_eq!(items, 0);
    }

    #[test]
    fn item_write_failure_rolls_back_order_row() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            // Simulate a broken items table so the second phase fails
            conn.execute_batch(
                "ALTER TABLE mobile_order_items RENAME TO mobile_order_items_bk;",
            )
            .unwrap();
        }

        let envelope = ingest_orders(&db, "r1", &[sale_payload("ok-2", 50.0)]).expect("ingest");
        let results = envelope["processedOrders"].as_array().unwrap();
        assert_eq!(results[0]["status"], RESULT_ITEMS_ERROR);
        assert_eq!(envelope["summary"]["otherErrors"], 1);

        // Compensating delete removed the half-staged order
        assert_eq!(staged_count(&db), 0);
    }

    #[test]
    fn resubmitted_batch_stages_duplicate_rows() {
        let db = test_db();
        ingest_orders(&db, "r1", &[sale_payload("dup-1", 10.0)]).expect("first");
        ingest_orders(&db, "r1", &[sale_payload("dup-1", 10.0)]).expect("resubmit");

        let conn = db.conn.lock().unwrap();
        let dupes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM mobile_orders WHERE local_id = 'dup-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(dupes, 2, "no idempotency key: resubmission stages again");
    }

    #[test]
    fn order_codes_are_sequential() {
        let db = test_db();
        let envelope = ingest_orders(
            &db,
            "r1",
            &[sale_payload("s1", 10.0), sale_payload("s2", 20.0)],
        )
        .expect("ingest");

        let results = envelope["processedOrders"].as_array().unwrap();
        assert_eq!(results[0]["code"], "PED-000001");
        assert_eq!(results[1]["code"], "PED-000002");
    }

    #[tokio::test]
    async fn device_sync_upload_appends_audit_entry() {
        let db = test_db();
        let payload = serde_json::json!({
            "salesRepId": "r1",
            "deviceId": "tab-07",
            "orders": [visit_payload("v2")]
        });

        let resp = handle_device_sync(&db, payload).await.expect("sync");
        assert_eq!(resp["success"], true);
        assert_eq!(resp["summary"]["synced"], 1);

        let recent = sync_log::recent(&db, 10).expect("recent");
        let entries = recent.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["eventType"], "upload");
        assert_eq!(entries[0]["status"], "success");
        assert_eq!(entries[0]["deviceId"], "tab-07");
        assert_eq!(entries[0]["recordsCount"], 1);
    }

    #[tokio::test]
    async fn device_sync_without_orders_is_a_pull() {
        let db = test_db();
        ingest_orders(&db, "r1", &[sale_payload("s3", 30.0)]).expect("ingest");

        let resp = handle_device_sync(&db, serde_json::json!({ "salesRepId": "r1" }))
            .await
            .expect("pull");
        assert_eq!(resp["success"], true);
        assert_eq!(resp["count"], 1);
        assert_eq!(resp["orders"][0]["localId"], "s3");

        let recent = sync_log::recent(&db, 10).expect("recent");
        assert_eq!(recent[0]["eventType"], "download");
    }

    #[tokio::test]
    async fn device_sync_requires_sales_rep() {
        let db = test_db();
        let err = handle_device_sync(&db, serde_json::json!({}))
            .await
            .expect_err("missing rep should fail");
        assert!(err.contains("salesRepId"));
    }

    #[tokio::test]
    async fn failed_batch_appends_error_entry() {
        let db = test_db();
        let payload = serde_json::json!({
            "salesRepId": "r1",
            "orders": [{ "id": "bad-2", "total": 0 }]
        });

        let resp = handle_device_sync(&db, payload).await.expect("sync");
        assert_eq!(resp["summary"]["synced"], 0);

        let recent = sync_log::recent(&db, 10).expect("recent");
        assert_eq!(recent[0]["eventType"], "error");
        assert_eq!(recent[0]["status"], "failed");
    }

    #[test]
    fn revalidation_flags_rows_that_no_longer_pass() {
        let db = test_db();
        {
            let conn = db.conn.lock().unwrap();
            // Staged before a rule change: sale without a payment method
            let stale = MobileOrderInput {
                id: Some("legacy-1".to_string()),
                customer_id: Some("c1".to_string()),
                customer_name: Some("Mercado Central".to_string()),
                sales_rep_id: Some("r1".to_string()),
                sales_rep_name: Some("João".to_string()),
                date: Some("2024-01-02".to_string()),
                total: 80.0,
                ..Default::default()
            };
            staging::insert_order(
                &conn,
                "mo-legacy",
                &stale,
                crate::validation::OrderKind::Sale,
                "PED-000099",
                staging::STATUS_SYNCED,
            )
            .unwrap();
        }

        let report = revalidate_pending_orders(&db).expect("revalidate");
        assert_eq!(report["checked"], 1);
        assert_eq!(report["flagged"], 1);

        let conn = db.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT sync_status FROM mobile_orders WHERE id = 'mo-legacy'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, staging::STATUS_VALIDATION_ERROR);
    }

    #[test]
    fn sync_status_snapshot_counts_staged_rows() {
        let db = test_db();
        ingest_orders(&db, "r1", &[sale_payload("s4", 10.0), visit_payload("v3")])
            .expect("ingest");

        let status = get_sync_status(&db).expect("status");
        assert_eq!(status["staged"]["synced"], 2);
        assert_eq!(status["staged"]["pendingReview"], 2);
    }

    mod dto_tests {
        use super::*;

        #[test]
        fn parse_device_payload_supports_aliases() {
            let parsed = parse_device_sync_payload(serde_json::json!({
                "sales_rep_id": "r7",
                "device_id": "tab-01"
            }))
            .expect("alias payload should parse");
            assert_eq!(parsed.sales_rep_id, "r7");
            assert_eq!(parsed.device_id.as_deref(), Some("tab-01"));
            assert!(parsed.orders.is_none());
        }

        #[test]
        fn parse_device_payload_rejects_blank_rep() {
            let err = parse_device_sync_payload(serde_json::json!({ "salesRepId": "  " }))
                .expect_err("blank rep should fail");
            assert!(err.contains("salesRepId"));
        }
    }
}
