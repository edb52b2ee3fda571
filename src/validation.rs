//! Business-rule validation for incoming mobile orders.
//!
//! Every order uploaded by a field device passes through [`validate_order`]
//! before it is staged. Rules accumulate: all violations end up in `errors`,
//! while `error_code` carries the category of the first violated rule. A
//! record is classified as a sale (positive total, payment data, items) or a
//! visit (zero total with a rejection reason); downstream code reads the
//! resulting [`OrderKind`] instead of re-deriving the distinction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CODE_MISSING_ORDER_ID: &str = "MISSING_ORDER_ID";
pub const CODE_MISSING_CUSTOMER: &str = "MISSING_CUSTOMER";
pub const CODE_MISSING_SALES_REP: &str = "MISSING_SALES_REP";
pub const CODE_INVALID_ORDER_TYPE: &str = "INVALID_ORDER_TYPE";
pub const CODE_MISSING_PAYMENT_METHOD: &str = "MISSING_PAYMENT_METHOD";
pub const CODE_INVALID_PAYMENT_METHOD: &str = "INVALID_PAYMENT_METHOD";
pub const CODE_MISSING_ITEMS: &str = "MISSING_ITEMS";
pub const CODE_INVALID_ITEM: &str = "INVALID_ITEM";
pub const CODE_MISSING_DATE: &str = "MISSING_DATE";

/// Classification of a staged record, decided once at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Sale,
    Visit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Sale => "sale",
            OrderKind::Visit => "visit",
        }
    }
}

/// Line item of an uploaded sale order. Field devices run mixed app
/// versions, so both camelCase and snake_case keys are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileOrderItemInput {
    #[serde(default, alias = "product_id")]
    pub product_id: Option<String>,
    #[serde(default, alias = "product_name")]
    pub product_name: Option<String>,
    #[serde(default, alias = "product_code")]
    pub product_code: Option<String>,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default, alias = "unit_price")]
    pub unit_price: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// An order or visit record as uploaded by a field device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobileOrderInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "local_id", alias = "clientId", alias = "client_id")]
    pub local_id: Option<String>,
    #[serde(default, alias = "customer_id")]
    pub customer_id: Option<String>,
    #[serde(default, alias = "customer_name")]
    pub customer_name: Option<String>,
    #[serde(default, alias = "customer_code")]
    pub customer_code: Option<String>,
    #[serde(default, alias = "sales_rep_id")]
    pub sales_rep_id: Option<String>,
    #[serde(default, alias = "sales_rep_name")]
    pub sales_rep_name: Option<String>,
    #[serde(default, alias = "order_date")]
    pub date: Option<String>,
    #[serde(default, alias = "due_date")]
    pub due_date: Option<String>,
    #[serde(default, alias = "delivery_date")]
    pub delivery_date: Option<String>,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default, alias = "business_status")]
    pub business_status: Option<String>,
    #[serde(default, alias = "payment_status")]
    pub payment_status: Option<String>,
    #[serde(default, alias = "payment_method")]
    pub payment_method: Option<String>,
    #[serde(default, alias = "payment_method_id")]
    pub payment_method_id: Option<String>,
    #[serde(default, alias = "payment_table")]
    pub payment_table: Option<String>,
    #[serde(default, alias = "payment_table_id")]
    pub payment_table_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "delivery_address")]
    pub delivery_address: Option<String>,
    #[serde(default, alias = "delivery_city")]
    pub delivery_city: Option<String>,
    #[serde(default, alias = "delivery_state")]
    pub delivery_state: Option<String>,
    #[serde(default, alias = "delivery_zip")]
    pub delivery_zip: Option<String>,
    #[serde(default, alias = "rejection_reason")]
    pub rejection_reason: Option<String>,
    #[serde(default, alias = "visit_notes")]
    pub visit_notes: Option<String>,
    #[serde(default)]
    pub items: Vec<MobileOrderItemInput>,
}

/// Outcome of validating one uploaded order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    /// Category of the FIRST violated rule; the full list is in `errors`.
    pub error_code: Option<String>,
    /// Sale/visit classification; None when the record is neither.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<OrderKind>,
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

/// A payment method reference must be a UUID of version 1 through 5.
fn is_well_formed_payment_method_id(raw: &str) -> bool {
    match Uuid::parse_str(raw.trim()) {
        Ok(parsed) => matches!(parsed.get_version_num(), 1..=5),
        Err(_) => false,
    }
}

/// Validate one uploaded order against the intake business rules.
///
/// Rules are evaluated in a fixed sequence and never short-circuit; every
/// violation is collected. `error_code` keeps the first violated rule's
/// category so callers get a stable primary code even when several rules
/// fail at once.
pub fn validate_order(order: &MobileOrderInput) -> ValidationReport {
    let mut errors: Vec<String> = Vec::new();
    let mut error_code: Option<&'static str> = None;

    fn record(
        errors: &mut Vec<String>,
        error_code: &mut Option<&'static str>,
        code: &'static str,
        message: String,
    ) {
        errors.push(message);
        if error_code.is_none() {
            *error_code = Some(code);
        }
    }

    // 1. Structural
    if blank(&order.id) {
        record(
            &mut errors,
            &mut error_code,
            CODE_MISSING_ORDER_ID,
            "Order id is required".to_string(),
        );
    }

    // 2. Customer
    if blank(&order.customer_id) {
        record(
            &mut errors,
            &mut error_code,
            CODE_MISSING_CUSTOMER,
            "Customer id is required".to_string(),
        );
    }
    if blank(&order.customer_name) {
        record(
            &mut errors,
            &mut error_code,
            CODE_MISSING_CUSTOMER,
            "Customer name is required".to_string(),
        );
    }

    // 3. Sales rep
    if blank(&order.sales_rep_id) {
        record(
            &mut errors,
            &mut error_code,
            CODE_MISSING_SALES_REP,
            "Sales rep id is required".to_string(),
        );
    }
    if blank(&order.sales_rep_name) {
        record(
            &mut errors,
            &mut error_code,
            CODE_MISSING_SALES_REP,
            "Sales rep name is required".to_string(),
        );
    }

    // 4. Type determination: a visit is a zero-total record carrying a
    // rejection reason; a sale has a positive total.
    let is_visit = order.total == 0.0 && !blank(&order.rejection_reason);
    let is_sale = order.total > 0.0;
    let kind = match (is_sale, is_visit) {
        (true, false) => Some(OrderKind::Sale),
        (false, true) => Some(OrderKind::Visit),
        _ => {
            record(
                &mut errors,
                &mut error_code,
                CODE_INVALID_ORDER_TYPE,
                format!(
                    "Order is neither a sale nor a visit (total = {}, rejection reason {})",
                    order.total,
                    if blank(&order.rejection_reason) {
                        "missing"
                    } else {
                        "present"
                    }
                ),
            );
            None
        }
    };

    // 5. Sale rules. Visits skip payment and item checks entirely.
    if kind == Some(OrderKind::Sale) {
        match order.payment_method_id.as_deref().map(str::trim) {
            None | Some("") => record(
                &mut errors,
                &mut error_code,
                CODE_MISSING_PAYMENT_METHOD,
                "Payment method id is required for sale orders".to_string(),
            ),
            Some(method_id) if !is_well_formed_payment_method_id(method_id) => record(
                &mut errors,
                &mut error_code,
                CODE_INVALID_PAYMENT_METHOD,
                format!("Payment method id '{method_id}' is not a well-formed UUID"),
            ),
            Some(_) => {}
        }
        if blank(&order.payment_method) {
            record(
                &mut errors,
                &mut error_code,
                CODE_MISSING_PAYMENT_METHOD,
                "Payment method name is required for sale orders".to_string(),
            );
        }

        if order.items.is_empty() {
            record(
                &mut errors,
                &mut error_code,
                CODE_MISSING_ITEMS,
                "Sale orders must have at least one item".to_string(),
            );
        }
        for (idx, item) in order.items.iter().enumerate() {
            let position = idx + 1;
            if blank(&item.product_name) {
                record(
                    &mut errors,
                    &mut error_code,
                    CODE_INVALID_ITEM,
                    format!("Item {position}: product name is required"),
                );
            }
            if blank(&item.product_code) {
                record(
                    &mut errors,
                    &mut error_code,
                    CODE_INVALID_ITEM,
                    format!("Item {position}: product code is required"),
                );
            }
            if item.quantity <= 0.0 {
                record(
                    &mut errors,
                    &mut error_code,
                    CODE_INVALID_ITEM,
                    format!("Item {position}: quantity must be greater than zero"),
                );
            }
            if item.unit_price < 0.0 {
                record(
                    &mut errors,
                    &mut error_code,
                    CODE_INVALID_ITEM,
                    format!("Item {position}: unit price cannot be negative"),
                );
            }
            if item.total < 0.0 {
                record(
                    &mut errors,
                    &mut error_code,
                    CODE_INVALID_ITEM,
                    format!("Item {position}: total cannot be negative"),
                );
            }
        }
    }

    // 6. Date, regardless of type
    if blank(&order.date) {
        record(
            &mut errors,
            &mut error_code,
            CODE_MISSING_DATE,
            "Order date is required".to_string(),
        );
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        error_code: error_code.map(String::from),
        errors,
        kind,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
