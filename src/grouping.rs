//! Per-sales-rep grouping of the staged snapshot, plus the operator's
//! selection model.
//!
//! `group_pending_orders` is a pure function over a snapshot: no hidden
//! state, no side effects, identical output for an unchanged input. The
//! selection model is two independent id sets scoped to the operator's
//! session; it is never persisted and never touches the staging store.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

fn field_str<'a>(order: &'a Value, key: &str) -> &'a str {
    order.get(key).and_then(Value::as_str).unwrap_or("")
}

fn is_blank(order: &Value, key: &str) -> bool {
    field_str(order, key).trim().is_empty()
}

/// Sale/visit classification of a snapshot row. Staged rows carry the
/// persisted `orderKind`; rows from elsewhere fall back to the intake rule.
fn kind_of(order: &Value) -> &str {
    match field_str(order, "orderKind") {
        "" => {
            let total = order.get("total").and_then(Value::as_f64).unwrap_or(0.0);
            if total > 0.0 {
                "sale"
            } else if !is_blank(order, "rejectionReason") {
                "visit"
            } else {
                ""
            }
        }
        kind => kind,
    }
}

/// A sale order still lacking a payment-table reference needs operator
/// attention before import; cancelled orders are left out of the count.
fn has_issue(order: &Value) -> bool {
    if kind_of(order) != "sale" {
        return false;
    }
    let business_status = field_str(order, "businessStatus");
    if business_status.eq_ignore_ascii_case("cancelled")
        || business_status.eq_ignore_ascii_case("canceled")
    {
        return false;
    }
    is_blank(order, "paymentTableId") && is_blank(order, "paymentTable")
}

/// Partition a pending snapshot into per-sales-rep groups with aggregates.
///
/// Groups come back ordered by rep name, then rep id, so repeated calls on
/// an unchanged snapshot are byte-identical.
pub fn group_pending_orders(orders: &[Value]) -> Vec<Value> {
    let mut rep_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&Value>> = HashMap::new();

    for order in orders {
        let rep_id = field_str(order, "salesRepId").to_string();
        if !groups.contains_key(&rep_id) {
            rep_order.push(rep_id.clone());
        }
        groups.entry(rep_id).or_default().push(order);
    }

    let mut result: Vec<Value> = rep_order
        .into_iter()
        .map(|rep_id| {
            let members = &groups[&rep_id];
            let rep_name = members
                .iter()
                .map(|o| field_str(o, "salesRepName"))
                .find(|name| !name.trim().is_empty())
                .unwrap_or("");

            let mut pending_orders = 0i64;
            let mut visits = 0i64;
            let mut total_value = 0.0f64;
            let mut with_issues = 0i64;

            for order in members.iter() {
                match kind_of(order) {
                    "sale" => {
                        pending_orders += 1;
                        total_value += order.get("total").and_then(Value::as_f64).unwrap_or(0.0);
                    }
                    "visit" => visits += 1,
                    _ => {}
                }
                if has_issue(order) {
                    with_issues += 1;
                }
            }

            serde_json::json!({
                "salesRepId": rep_id,
                "salesRepName": rep_name,
                "orders": members.iter().map(|o| (*o).clone()).collect::<Vec<Value>>(),
                "pendingOrdersCount": pending_orders,
                "visitsCount": visits,
                "totalValue": total_value,
                "ordersWithIssues": with_issues,
            })
        })
        .collect();

    result.sort_by(|a, b| {
        let name_a = a["salesRepName"].as_str().unwrap_or("");
        let name_b = b["salesRepName"].as_str().unwrap_or("");
        name_a
            .cmp(name_b)
            .then_with(|| a["salesRepId"].as_str().cmp(&b["salesRepId"].as_str()))
    });
    result
}

// ---------------------------------------------------------------------------
// Selection model
// ---------------------------------------------------------------------------

/// The operator's current selection: order ids and sales-rep ids, held as
/// two independent sets.
#[derive(Debug, Default, Clone)]
pub struct SelectionState {
    selected_order_ids: HashSet<String>,
    selected_sales_rep_ids: HashSet<String>,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle one order id. Does not touch the rep set: how "all members
    /// selected" is reflected back onto the rep checkbox is the UI's call.
    pub fn toggle_order(&mut self, order_id: &str) -> bool {
        if self.selected_order_ids.remove(order_id) {
            false
        } else {
            self.selected_order_ids.insert(order_id.to_string());
            true
        }
    }

    /// Toggle a sales rep: selects or deselects every order id currently in
    /// that rep's group. Membership is read from the snapshot at toggle
    /// time; orders staged afterwards are not picked up retroactively.
    pub fn toggle_sales_rep(&mut self, groups: &[Value], sales_rep_id: &str) -> bool {
        let member_ids: Vec<String> = groups
            .iter()
            .filter(|g| g.get("salesRepId").and_then(Value::as_str) == Some(sales_rep_id))
            .flat_map(|g| {
                g.get("orders")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
            })
            .filter_map(|o| o.get("id").and_then(Value::as_str))
            .map(String::from)
            .collect();

        if self.selected_sales_rep_ids.remove(sales_rep_id) {
            for id in &member_ids {
                self.selected_order_ids.remove(id);
            }
            false
        } else {
            self.selected_sales_rep_ids.insert(sales_rep_id.to_string());
            self.selected_order_ids.extend(member_ids);
            true
        }
    }

    /// Replace the order selection wholesale with every id in the snapshot
    /// (and mark every rep selected).
    pub fn select_all(&mut self, orders: &[Value]) {
        self.selected_order_ids = orders
            .iter()
            .filter_map(|o| o.get("id").and_then(Value::as_str))
            .map(String::from)
            .collect();
        self.selected_sales_rep_ids = orders
            .iter()
            .filter_map(|o| o.get("salesRepId").and_then(Value::as_str))
            .map(String::from)
            .collect();
    }

    /// Drop the whole selection, both sets.
    pub fn clear_selection(&mut self) {
        self.selected_order_ids.clear();
        self.selected_sales_rep_ids.clear();
    }

    pub fn is_order_selected(&self, order_id: &str) -> bool {
        self.selected_order_ids.contains(order_id)
    }

    pub fn is_sales_rep_selected(&self, sales_rep_id: &str) -> bool {
        self.selected_sales_rep_ids.contains(sales_rep_id)
    }

    /// Selected order ids in a stable order, ready to hand to the importer.
    pub fn selected_order_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.selected_order_ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn selected_count(&self) -> usize {
        self.selected_order_ids.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sale(id: &str, rep: &str, rep_name: &str, total: f64, payment_table: Option<&str>) -> Value {
        serde_json::json!({
            "id": id,
            "salesRepId": rep,
            "salesRepName": rep_name,
            "orderKind": "sale",
            "total": total,
            "businessStatus": "open",
            "paymentTableId": payment_table,
            "paymentTable": payment_table.map(|_| "Tabela 30d"),
        })
    }

    fn visit(id: &str, rep: &str, rep_name: &str) -> Value {
        serde_json::json!({
            "id": id,
            "salesRepId": rep,
            "salesRepName": rep_name,
            "orderKind": "visit",
            "total": 0.0,
            "rejectionReason": "Loja fechada",
        })
    }

    #[test]
    fn groups_aggregate_sales_and_visits_per_rep() {
        let snapshot = vec![
            sale("o1", "r1", "João", 100.0, Some("pt-1")),
            visit("v1", "r1", "João"),
        ];

        let groups = group_pending_orders(&snapshot);
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g["salesRepId"], "r1");
        assert_eq!(g["salesRepName"], "João");
        assert_eq!(g["pendingOrdersCount"], 1);
        assert_eq!(g["visitsCount"], 1);
        assert_eq!(g["totalValue"], 100.0);
        assert_eq!(g["ordersWithIssues"], 0);
        assert_eq!(g["orders"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_payment_table_counts_as_issue_unless_cancelled() {
        let mut cancelled = sale("o3", "r1", "João", 50.0, None);
        cancelled["businessStatus"] = Value::String("cancelled".to_string());

        let snapshot = vec![
            sale("o1", "r1", "João", 100.0, None),
            sale("o2", "r1", "João", 80.0, Some("pt-1")),
            cancelled,
        ];

        let groups = group_pending_orders(&snapshot);
        assert_eq!(groups[0]["ordersWithIssues"], 1);
        assert_eq!(groups[0]["pendingOrdersCount"], 3);
        assert_eq!(groups[0]["totalValue"], 230.0);
    }

    #[test]
    fn grouping_is_pure() {
        let snapshot = vec![
            sale("o1", "r2", "Maria", 10.0, Some("pt-1")),
            sale("o2", "r1", "João", 20.0, None),
            visit("v1", "r2", "Maria"),
        ];

        let first = group_pending_orders(&snapshot);
        let second = group_pending_orders(&snapshot);
        assert_eq!(first, second);

        // Ordered by rep name regardless of snapshot order
        assert_eq!(first[0]["salesRepName"], "João");
        assert_eq!(first[1]["salesRepName"], "Maria");
    }

    #[test]
    fn toggle_sales_rep_selects_current_members_only() {
        let snapshot = vec![
            sale("o1", "r1", "João", 10.0, Some("pt-1")),
            sale("o2", "r1", "João", 20.0, Some("pt-1")),
            sale("o3", "r2", "Maria", 30.0, Some("pt-1")),
        ];
        let groups = group_pending_orders(&snapshot);

        let mut selection = SelectionState::new();
        assert!(selection.toggle_sales_rep(&groups, "r1"));
        assert!(selection.is_order_selected("o1"));
        assert!(selection.is_order_selected("o2"));
        assert!(!selection.is_order_selected("o3"));
        assert!(selection.is_sales_rep_selected("r1"));

        // New order staged after the toggle is not retroactively selected
        let later = vec![
            sale("o1", "r1", "João", 10.0, Some("pt-1")),
            sale("o2", "r1", "João", 20.0, Some("pt-1")),
            sale("o4", "r1", "João", 40.0, Some("pt-1")),
        ];
        let _ = group_pending_orders(&later);
        assert!(!selection.is_order_selected("o4"));

        // Toggling off removes the members captured at toggle time
        assert!(!selection.toggle_sales_rep(&groups, "r1"));
        assert_eq!(selection.selected_count(), 0);
    }

    #[test]
    fn toggle_order_is_independent_of_rep_set() {
        let snapshot = vec![sale("o1", "r1", "João", 10.0, Some("pt-1"))];
        let groups = group_pending_orders(&snapshot);

        let mut selection = SelectionState::new();
        selection.toggle_sales_rep(&groups, "r1");
        assert!(selection.is_order_selected("o1"));

        // Deselecting the lone member leaves the rep flag to the UI
        assert!(!selection.toggle_order("o1"));
        assert!(!selection.is_order_selected("o1"));
        assert!(selection.is_sales_rep_selected("r1"));
    }

    #[test]
    fn select_all_and_clear_replace_wholesale() {
        let snapshot = vec![
            sale("o1", "r1", "João", 10.0, Some("pt-1")),
            visit("v1", "r2", "Maria"),
        ];

        let mut selection = SelectionState::new();
        selection.toggle_order("stale-id");
        selection.select_all(&snapshot);
        assert_eq!(selection.selected_order_ids(), vec!["o1", "v1"]);
        assert!(!selection.is_order_selected("stale-id"));
        assert!(selection.is_sales_rep_selected("r1"));
        assert!(selection.is_sales_rep_selected("r2"));

        selection.clear_selection();
        assert_eq!(selection.selected_count(), 0);
        assert!(!selection.is_sales_rep_selected("r1"));
    }
}
