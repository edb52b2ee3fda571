//! Import/reject executor: the operator surface that promotes staged mobile
//! orders into the canonical order ledger, or rejects them.
//!
//! Concurrency discipline: ownership of an order is taken with a guarded
//! claim, a single conditional UPDATE that only succeeds while the row still
//! holds its expected pre-transition status. Two operators racing on the
//! same order produce exactly one ledger row; the loser gets an
//! informational `already_processed` result, never a failure.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::grouping;
use crate::staging::{self, StagingError};
use crate::sync_log;

pub const RESULT_IMPORTED: &str = "imported";
pub const RESULT_REJECTED: &str = "rejected";
pub const RESULT_ALREADY_PROCESSED: &str = "already_processed";
pub const RESULT_NOT_FOUND: &str = "not_found";
pub const RESULT_ERROR: &str = "error";

/// Claim a reviewable row for processing. Returns the prior status when the
/// claim wins, None when another caller already took the row. Each attempt
/// is one atomic conditional UPDATE.
fn claim_for_processing(
    conn: &Connection,
    order_id: &str,
) -> Result<Option<&'static str>, StagingError> {
    for &prior in staging::REVIEWABLE_STATUSES {
        if staging::update_sync_status(conn, order_id, &[prior], staging::STATUS_IMPORTING)? {
            return Ok(Some(prior));
        }
    }
    Ok(None)
}

/// Compose and write the ledger row for a claimed staging row. Returns the
/// new ledger id.
fn write_ledger_row(conn: &Connection, order_id: &str) -> Result<String, String> {
    let staged = conn
        .query_row(
            "SELECT code, customer_id, customer_name, sales_rep_id, sales_rep_name, total
             FROM mobile_orders WHERE id = ?1",
            params![order_id],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, f64>(5)?,
                ))
            },
        )
        .optional()
        .map_err(|e| format!("read staged order: {e}"))?
        .ok_or_else(|| format!("staged order {order_id} disappeared mid-import"))?;

    let (code, customer_id, customer_name, sales_rep_id, sales_rep_name, total) = staged;
    let ledger_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    conn.execute(
        "INSERT INTO orders (
            id, code, customer_id, customer_name, sales_rep_id, sales_rep_name,
            total, status, source, imported, mobile_order_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', 'mobile', 1, ?8, ?9, ?9)",
        params![
            ledger_id,
            code,
            customer_id,
            customer_name,
            sales_rep_id,
            sales_rep_name,
            total,
            order_id,
            now,
        ],
    )
    .map_err(|e| format!("write ledger row: {e}"))?;

    Ok(ledger_id)
}

/// Import the selected staged orders into the canonical ledger.
///
/// Per order: claim, write the ledger row, then finalize the staging row as
/// imported. A ledger-write failure reverts the claim to its prior status
/// and is reported for that order only; the rest of the batch continues.
pub fn import_selected(db: &DbState, order_ids: &[String]) -> Result<Value, String> {
    let mut results: Vec<Value> = Vec::with_capacity(order_ids.len());
    let mut imported = 0i64;
    let mut already_processed = 0i64;
    let mut errors = 0i64;

    for order_id in order_ids {
        let conn = match db.conn.lock() {
            Ok(c) => c,
            Err(e) => {
                errors += 1;
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_ERROR,
                    "error": format!("database lock poisoned: {e}"),
                }));
                continue;
            }
        };

        let prior = match claim_for_processing(&conn, order_id) {
            Ok(p) => p,
            Err(e) => {
                errors += 1;
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_ERROR,
                    "error": e.to_string(),
                }));
                continue;
            }
        };

        let Some(prior) = prior else {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM mobile_orders WHERE id = ?1",
                    params![order_id],
                    |_| Ok(()),
                )
                .optional()
                .map(|r| r.is_some())
                .unwrap_or(false);
            if exists {
                already_processed += 1;
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_ALREADY_PROCESSED,
                }));
            } else {
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_NOT_FOUND,
                }));
            }
            continue;
        };

        match write_ledger_row(&conn, order_id) {
            Ok(ledger_id) => {
                match staging::mark_imported(&conn, order_id) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(order_id = %order_id, "Claimed row left the importing state unexpectedly");
                    }
                    Err(e) => {
                        warn!(order_id = %order_id, error = %e, "Failed to finalize imported row");
                    }
                }
                imported += 1;
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_IMPORTED,
                    "ledgerId": ledger_id,
                }));
            }
            Err(e) => {
                // Give the row back so a later attempt can claim it again.
                if let Err(revert_err) = staging::update_sync_status(
                    &conn,
                    order_id,
                    &[staging::STATUS_IMPORTING],
                    prior,
                ) {
                    warn!(
                        order_id = %order_id,
                        error = %revert_err,
                        "Failed to revert claim after ledger write error"
                    );
                }
                errors += 1;
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_ERROR,
                    "error": e,
                }));
            }
        }
    }

    info!(
        requested = order_ids.len(),
        imported, already_processed, errors, "Import run finished"
    );

    if imported > 0 {
        if let Err(e) = sync_log::append(
            db,
            sync_log::EVENT_UPLOAD,
            None,
            imported,
            "imported",
            None,
            None,
        ) {
            warn!("Failed to append import audit entry: {e}");
        }
    }
    if errors > 0 {
        let first_error = results
            .iter()
            .find(|r| r.get("status").and_then(Value::as_str) == Some(RESULT_ERROR))
            .and_then(|r| r.get("error").and_then(Value::as_str))
            .unwrap_or("import failed")
            .to_string();
        if let Err(e) = sync_log::append(
            db,
            sync_log::EVENT_ERROR,
            None,
            0,
            "failed",
            Some(&first_error),
            None,
        ) {
            warn!("Failed to append import error audit entry: {e}");
        }
    }

    let message = if errors > 0 {
        format!("{imported} orders imported, {errors} failed")
    } else {
        format!("{imported} orders imported")
    };

    Ok(serde_json::json!({
        "results": results,
        "message": message,
        "summary": {
            "requested": order_ids.len() as i64,
            "imported": imported,
            "alreadyProcessed": already_processed,
            "errors": errors,
        },
    }))
}

/// Reject the selected staged orders. Same guarded-claim discipline as
/// import, but terminal and without any ledger write.
pub fn reject_selected(db: &DbState, order_ids: &[String]) -> Result<Value, String> {
    let mut results: Vec<Value> = Vec::with_capacity(order_ids.len());
    let mut rejected = 0i64;
    let mut already_processed = 0i64;

    for order_id in order_ids {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;

        match staging::mark_rejected(&conn, order_id) {
            Ok(true) => {
                rejected += 1;
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_REJECTED,
                }));
            }
            Ok(false) => {
                let exists: bool = conn
                    .query_row(
                        "SELECT 1 FROM mobile_orders WHERE id = ?1",
                        params![order_id],
                        |_| Ok(()),
                    )
                    .optional()
                    .map(|r| r.is_some())
                    .unwrap_or(false);
                if exists {
                    already_processed += 1;
                    results.push(serde_json::json!({
                        "orderId": order_id,
                        "status": RESULT_ALREADY_PROCESSED,
                    }));
                } else {
                    results.push(serde_json::json!({
                        "orderId": order_id,
                        "status": RESULT_NOT_FOUND,
                    }));
                }
            }
            Err(e) => {
                results.push(serde_json::json!({
                    "orderId": order_id,
                    "status": RESULT_ERROR,
                    "error": e.to_string(),
                }));
            }
        }
    }

    info!(
        requested = order_ids.len(),
        rejected, already_processed, "Reject run finished"
    );

    Ok(serde_json::json!({
        "results": results,
        "message": format!("{rejected} orders rejected"),
        "summary": {
            "requested": order_ids.len() as i64,
            "rejected": rejected,
            "alreadyProcessed": already_processed,
        },
    }))
}

/// Operator refresh: the current pending snapshot grouped per sales rep.
pub fn get_import_groups(db: &DbState) -> Result<Value, String> {
    let pending = staging::get_pending_orders(db).map_err(|e| e.to_string())?;
    let groups = grouping::group_pending_orders(&pending);

    let total_pending = pending.len() as i64;
    let total_value: f64 = groups
        .iter()
        .filter_map(|g| g.get("totalValue").and_then(Value::as_f64))
        .sum();

    Ok(serde_json::json!({
        "groups": groups,
        "totalPending": total_pending,
        "totalValue": total_value,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
