//! Staging store access for mobile orders awaiting back-office review.
//!
//! Rows live in `mobile_orders` / `mobile_order_items` until an operator
//! imports or rejects them. All status changes go through guarded
//! expected-status transitions; once a row reaches a terminal state its
//! business fields never change again.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbState;
use crate::validation::{MobileOrderInput, MobileOrderItemInput, OrderKind};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SYNCED: &str = "synced";
pub const STATUS_VALIDATION_ERROR: &str = "validation_error";
pub const STATUS_ITEMS_ERROR: &str = "items_error";
pub const STATUS_IMPORTING: &str = "importing";
pub const STATUS_IMPORTED: &str = "imported";
pub const STATUS_REJECTED: &str = "rejected";

/// Statuses from which an operator action may still claim a row.
pub const REVIEWABLE_STATUSES: &[&str] = &[STATUS_PENDING, STATUS_SYNCED];

/// Errors surfaced by staging-store operations.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("database lock poisoned: {0}")]
    Lock(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

const ORDER_COLUMNS: &str = "id, local_id, code, customer_id, customer_name, customer_code,
        sales_rep_id, sales_rep_name, order_date, due_date, delivery_date,
        total, discount, business_status, payment_status, payment_method,
        payment_method_id, payment_table, payment_table_id, notes,
        delivery_address, delivery_city, delivery_state, delivery_zip,
        rejection_reason, visit_notes, order_kind, sync_status,
        imported_to_orders, created_at, updated_at";

fn order_row_to_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "localId": row.get::<_, Option<String>>(1)?,
        "code": row.get::<_, Option<String>>(2)?,
        "customerId": row.get::<_, Option<String>>(3)?,
        "customerName": row.get::<_, Option<String>>(4)?,
        "customerCode": row.get::<_, Option<String>>(5)?,
        "salesRepId": row.get::<_, Option<String>>(6)?,
        "salesRepName": row.get::<_, Option<String>>(7)?,
        "date": row.get::<_, Option<String>>(8)?,
        "dueDate": row.get::<_, Option<String>>(9)?,
        "deliveryDate": row.get::<_, Option<String>>(10)?,
        "total": row.get::<_, f64>(11)?,
        "discount": row.get::<_, Option<f64>>(12)?,
        "businessStatus": row.get::<_, Option<String>>(13)?,
        "paymentStatus": row.get::<_, Option<String>>(14)?,
        "paymentMethod": row.get::<_, Option<String>>(15)?,
        "paymentMethodId": row.get::<_, Option<String>>(16)?,
        "paymentTable": row.get::<_, Option<String>>(17)?,
        "paymentTableId": row.get::<_, Option<String>>(18)?,
        "notes": row.get::<_, Option<String>>(19)?,
        "deliveryAddress": row.get::<_, Option<String>>(20)?,
        "deliveryCity": row.get::<_, Option<String>>(21)?,
        "deliveryState": row.get::<_, Option<String>>(22)?,
        "deliveryZip": row.get::<_, Option<String>>(23)?,
        "rejectionReason": row.get::<_, Option<String>>(24)?,
        "visitNotes": row.get::<_, Option<String>>(25)?,
        "orderKind": row.get::<_, String>(26)?,
        "syncStatus": row.get::<_, String>(27)?,
        "importedToOrders": row.get::<_, i64>(28)? != 0,
        "createdAt": row.get::<_, Option<String>>(29)?,
        "updatedAt": row.get::<_, Option<String>>(30)?,
        "items": [],
    }))
}

fn load_items(conn: &Connection, order_id: &str) -> rusqlite::Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, product_id, product_name, product_code, quantity, unit_price,
                discount, total, unit, position
         FROM mobile_order_items WHERE order_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![order_id], |row| {
        Ok(serde_json::json!({
            "id": row.get::<_, String>(0)?,
            "productId": row.get::<_, Option<String>>(1)?,
            "productName": row.get::<_, Option<String>>(2)?,
            "productCode": row.get::<_, Option<String>>(3)?,
            "quantity": row.get::<_, f64>(4)?,
            "unitPrice": row.get::<_, f64>(5)?,
            "discount": row.get::<_, Option<f64>>(6)?,
            "total": row.get::<_, f64>(7)?,
            "unit": row.get::<_, Option<String>>(8)?,
            "position": row.get::<_, i64>(9)?,
        }))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn hydrate_items(conn: &Connection, orders: &mut [Value]) -> rusqlite::Result<()> {
    for order in orders.iter_mut() {
        let id = order
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let items = load_items(conn, &id)?;
        if let Some(obj) = order.as_object_mut() {
            obj.insert("items".to_string(), Value::Array(items));
        }
    }
    Ok(())
}

fn query_orders(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Value>, StagingError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, order_row_to_json)?;
    let mut orders: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    hydrate_items(conn, &mut orders)?;
    Ok(orders)
}

// ===========================================================================
// Read surface
// ===========================================================================

/// All staged orders still awaiting review, oldest first, items hydrated.
///
/// Rows mid-claim ('importing') and terminal rows are excluded: an operator
/// refresh during a concurrent import never offers a claimed row again.
pub fn get_pending_orders(db: &DbState) -> Result<Vec<Value>, StagingError> {
    let conn = db.conn.lock().map_err(|e| StagingError::Lock(e.to_string()))?;
    query_orders(
        &conn,
        &format!(
            "SELECT {ORDER_COLUMNS} FROM mobile_orders
             WHERE sync_status IN ('pending', 'synced')
             ORDER BY created_at, id"
        ),
        &[],
    )
}

/// Pending orders for one sales rep, oldest first.
pub fn get_pending_orders_by_sales_rep(
    db: &DbState,
    sales_rep_id: &str,
) -> Result<Vec<Value>, StagingError> {
    let conn = db.conn.lock().map_err(|e| StagingError::Lock(e.to_string()))?;
    query_orders(
        &conn,
        &format!(
            "SELECT {ORDER_COLUMNS} FROM mobile_orders
             WHERE sync_status IN ('pending', 'synced') AND sales_rep_id = ?1
             ORDER BY created_at, id"
        ),
        &[&sales_rep_id],
    )
}

/// One staged order by id, any status; None when absent.
pub fn get_order_by_id(db: &DbState, id: &str) -> Result<Option<Value>, StagingError> {
    let conn = db.conn.lock().map_err(|e| StagingError::Lock(e.to_string()))?;
    let order = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM mobile_orders WHERE id = ?1"),
            params![id],
            order_row_to_json,
        )
        .optional()?;

    match order {
        Some(mut order) => {
            let items = load_items(&conn, id)?;
            if let Some(obj) = order.as_object_mut() {
                obj.insert("items".to_string(), Value::Array(items));
            }
            Ok(Some(order))
        }
        None => Ok(None),
    }
}

// ===========================================================================
// Write surface
// ===========================================================================

/// Insert the order row of a validated upload under a server-generated id.
/// The client's correlation id lands in `local_id` (falling back to the
/// client record id for devices that send only `id`). Caller holds the
/// connection and supplies the server-assigned code and the validated
/// classification.
pub fn insert_order(
    conn: &Connection,
    order_id: &str,
    order: &MobileOrderInput,
    kind: OrderKind,
    code: &str,
    sync_status: &str,
) -> rusqlite::Result<()> {
    let local_id = order.local_id.as_ref().or(order.id.as_ref());
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    conn.execute(
        "INSERT INTO mobile_orders (
            id, local_id, code, customer_id, customer_name, customer_code,
            sales_rep_id, sales_rep_name, order_date, due_date, delivery_date,
            total, discount, business_status, payment_status, payment_method,
            payment_method_id, payment_table, payment_table_id, notes,
            delivery_address, delivery_city, delivery_state, delivery_zip,
            rejection_reason, visit_notes, order_kind, sync_status,
            imported_to_orders, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15, ?16,
            ?17, ?18, ?19, ?20,
            ?21, ?22, ?23, ?24,
            ?25, ?26, ?27, ?28,
            0, ?29, ?29
        )",
        params![
            order_id,
            local_id,
            code,
            order.customer_id,
            order.customer_name,
            order.customer_code,
            order.sales_rep_id,
            order.sales_rep_name,
            order.date,
            order.due_date,
            order.delivery_date,
            order.total,
            order.discount,
            order.business_status.as_deref().unwrap_or("open"),
            order.payment_status.as_deref().unwrap_or("pending"),
            order.payment_method,
            order.payment_method_id,
            order.payment_table,
            order.payment_table_id,
            order.notes,
            order.delivery_address,
            order.delivery_city,
            order.delivery_state,
            order.delivery_zip,
            order.rejection_reason,
            order.visit_notes,
            kind.as_str(),
            sync_status,
            now,
        ],
    )?;
    Ok(())
}

/// Insert the item rows of a staged sale order, preserving submitted order.
pub fn insert_items(
    conn: &Connection,
    order_id: &str,
    items: &[MobileOrderItemInput],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO mobile_order_items (
            id, order_id, product_id, product_name, product_code,
            quantity, unit_price, discount, total, unit, position
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    for (idx, item) in items.iter().enumerate() {
        stmt.execute(params![
            Uuid::new_v4().to_string(),
            order_id,
            item.product_id,
            item.product_name,
            item.product_code,
            item.quantity,
            item.unit_price,
            item.discount,
            item.total,
            item.unit,
            idx as i64,
        ])?;
    }
    Ok(())
}

/// Compensating delete for a half-written order (items cascade).
pub fn delete_order(conn: &Connection, order_id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM mobile_orders WHERE id = ?1", params![order_id])
}

/// Guarded expected-status transition: succeeds only when the row's current
/// status is still one of `from`. This single conditional UPDATE is the
/// claim primitive the import executor relies on; it must never be split
/// into a read followed by a write.
pub fn update_sync_status(
    conn: &Connection,
    order_id: &str,
    from: &[&str],
    to: &str,
) -> Result<bool, StagingError> {
    let placeholders = from
        .iter()
        .enumerate()
        .map(|(i, _)| format!("?{}", i + 4))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE mobile_orders
         SET sync_status = ?1, updated_at = ?2
         WHERE id = ?3 AND sync_status IN ({placeholders})"
    );

    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut args: Vec<&dyn rusqlite::ToSql> = vec![&to, &now, &order_id];
    for status in from {
        args.push(status);
    }
    let changed = conn.execute(&sql, args.as_slice())?;
    Ok(changed == 1)
}

/// Finalize an import claim: 'importing' -> 'imported' and flag the row.
pub fn mark_imported(conn: &Connection, order_id: &str) -> Result<bool, StagingError> {
    let changed = conn.execute(
        "UPDATE mobile_orders
         SET sync_status = 'imported', imported_to_orders = 1, updated_at = ?2
         WHERE id = ?1 AND sync_status = 'importing'",
        params![
            order_id,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        ],
    )?;
    Ok(changed == 1)
}

/// Terminal rejection of a reviewable row. No ledger write is involved and
/// there is no unreject.
pub fn mark_rejected(conn: &Connection, order_id: &str) -> Result<bool, StagingError> {
    update_sync_status(conn, order_id, REVIEWABLE_STATUSES, STATUS_REJECTED)
}

// ===========================================================================
// Tests
// ===========================================================================
