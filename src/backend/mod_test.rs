use super::*;
use serde_json::json;

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn event(kind: ChangeKind, new: Option<Value>, old: Option<Value>) -> ChangeEvent {
    ChangeEvent { table: "drone_telemetry".into(), kind, new: new.map(row), old: old.map(row) }
}

// =============================================================================
// RowFilter / Query
// =============================================================================

#[test]
fn row_filter_matches_equal_value_only() {
    let f = RowFilter::eq("drone_id", "drone-1");
    assert!(f.matches(&row(json!({"drone_id": "drone-1"}))));
    assert!(!f.matches(&row(json!({"drone_id": "drone-2"}))));
    assert!(!f.matches(&row(json!({"id": "drone-1"}))));
}

#[test]
fn query_builder_collects_clauses() {
    let q = Query::table("tasks")
        .select("*, projects(name)")
        .eq("status", "todo")
        .order_desc("created_at")
        .limit(10);
    assert_eq!(q.table, "tasks");
    assert_eq!(q.select, "*, projects(name)");
    assert_eq!(q.filters, vec![RowFilter::eq("status", "todo")]);
    assert_eq!(q.order, Some(Order { column: "created_at".into(), descending: true }));
    assert_eq!(q.limit, Some(10));
}

#[test]
fn query_matches_requires_all_filters() {
    let q = Query::table("tasks").eq("status", "todo").eq("priority", "high");
    assert!(q.matches(&row(json!({"status": "todo", "priority": "high"}))));
    assert!(!q.matches(&row(json!({"status": "todo", "priority": "low"}))));
}

#[test]
fn compare_values_orders_nulls_first() {
    assert_eq!(compare_values(None, Some(&json!(1))), Ordering::Less);
    assert_eq!(compare_values(Some(&Value::Null), None), Ordering::Equal);
    assert_eq!(compare_values(Some(&json!(2)), Some(&json!(1.5))), Ordering::Greater);
    assert_eq!(compare_values(Some(&json!("2024-01-02")), Some(&json!("2024-01-01"))), Ordering::Greater);
}

// =============================================================================
// ChangeFilter
// =============================================================================

#[test]
fn change_filter_checks_table_and_kind() {
    let f = ChangeFilter::table("drone_telemetry").kind(ChangeKind::Insert);
    assert!(f.matches(&event(ChangeKind::Insert, Some(json!({})), None)));
    assert!(!f.matches(&event(ChangeKind::Update, Some(json!({})), Some(json!({})))));

    let mut other_table = event(ChangeKind::Insert, Some(json!({})), None);
    other_table.table = "drones".into();
    assert!(!f.matches(&other_table));
}

#[test]
fn change_filter_row_matches_new_or_old() {
    let f = ChangeFilter::table("drone_telemetry").row(RowFilter::eq("drone_id", "d1"));
    assert!(f.matches(&event(ChangeKind::Insert, Some(json!({"drone_id": "d1"})), None)));
    assert!(f.matches(&event(ChangeKind::Delete, None, Some(json!({"drone_id": "d1"})))));
    assert!(!f.matches(&event(ChangeKind::Insert, Some(json!({"drone_id": "d2"})), None)));
}

#[test]
fn change_kind_serializes_uppercase() {
    assert_eq!(serde_json::to_value(ChangeKind::Insert).unwrap(), json!("INSERT"));
    let kind: ChangeKind = serde_json::from_value(json!("DELETE")).unwrap();
    assert_eq!(kind, ChangeKind::Delete);
}

// =============================================================================
// Errors / helpers
// =============================================================================

#[test]
fn backend_error_retryable_only_for_transient() {
    assert!(BackendError::Unavailable("down".into()).retryable());
    assert!(BackendError::SubscriptionClosed.retryable());
    assert!(!BackendError::NotFound { table: "tasks".into() }.retryable());
    assert!(!BackendError::Invalid("bad".into()).retryable());
    assert_eq!(BackendError::NotFound { table: "tasks".into() }.error_code(), "E_NOT_FOUND");
}

#[test]
fn to_row_rejects_non_objects() {
    assert!(to_row(&json!({"a": 1})).is_ok());
    assert!(matches!(to_row(&json!([1, 2])), Err(BackendError::Invalid(_))));
}
