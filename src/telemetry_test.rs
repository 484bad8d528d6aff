use super::*;
use crate::backend::memory::MemoryBackend;
use serde_json::json;

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn fleet() -> (MemoryBackend, Arc<dyn Backend>) {
    let memory = MemoryBackend::new();
    memory.seed(
        DEFAULT_TELEMETRY_TABLE,
        [
            row(json!({ "drone_id": "drone-1", "battery_level": 90, "altitude": 5, "captured_at": "2026-05-01T09:00:00Z" })),
            row(json!({ "drone_id": "drone-1", "battery_level": 80, "altitude": 10, "captured_at": "2026-05-01T09:01:00Z" })),
            row(json!({ "drone_id": "drone-2", "battery_level": 40, "captured_at": "2026-05-01T09:02:00Z" })),
        ],
    );
    memory.seed(
        DEFAULT_STATUS_TABLE,
        [
            row(json!({ "id": "drone-1", "name": "Kestrel" })),
            row(json!({ "id": "drone-2", "name": "Osprey" })),
        ],
    );
    let shared: Arc<dyn Backend> = Arc::new(memory.clone());
    (memory, shared)
}

/// Let the feed task drain queued events.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn battery(view: &TelemetryView) -> Option<f64> {
    view.snapshot.as_ref().and_then(|s| s.battery_level)
}

// =============================================================================
// feed
// =============================================================================

#[tokio::test]
async fn status_update_merges_over_seeded_snapshot() {
    let (memory, backend) = fleet();
    let mut subscriber = TelemetrySubscriber::new(backend.clone(), TelemetryConfig::default());
    let mut rx = subscriber.subscribe("drone-1").await.unwrap();

    let seeded = subscriber.view();
    assert_eq!(battery(&seeded), Some(80.0));
    assert!(seeded.connected);
    assert_eq!(memory.fetch_count(DEFAULT_TELEMETRY_TABLE), 1);

    backend
        .update(DEFAULT_STATUS_TABLE, &RowFilter::eq("id", "drone-1"), row(json!({ "battery_level": 75 })))
        .await
        .unwrap();
    let view = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| battery(v) == Some(75.0)))
        .await
        .unwrap()
        .unwrap()
        .clone();

    let snapshot = view.snapshot.unwrap();
    assert_eq!(snapshot.altitude, Some(10.0));
    assert_eq!(snapshot.entity_id, "drone-1");
}

#[tokio::test]
async fn telemetry_insert_for_other_drone_is_ignored() {
    let (_memory, backend) = fleet();
    let mut subscriber = TelemetrySubscriber::new(backend.clone(), TelemetryConfig::default());
    subscriber.subscribe("drone-1").await.unwrap();

    backend
        .insert(DEFAULT_TELEMETRY_TABLE, row(json!({ "drone_id": "drone-2", "battery_level": 1 })))
        .await
        .unwrap();
    backend
        .insert(DEFAULT_TELEMETRY_TABLE, row(json!({ "drone_id": "drone-1", "speed": 12.5, "lat": 1.5, "lng": 2.5 })))
        .await
        .unwrap();
    settle().await;

    let snapshot = subscriber.view().snapshot.unwrap();
    assert_eq!(snapshot.battery_level, Some(80.0));
    assert_eq!(snapshot.speed, Some(12.5));
    assert_eq!(snapshot.position, Some(Position { lat: 1.5, lon: 2.5 }));
}

#[tokio::test]
async fn no_stored_row_starts_disconnected() {
    let memory = MemoryBackend::new();
    let backend: Arc<dyn Backend> = Arc::new(memory);
    let mut subscriber = TelemetrySubscriber::new(backend, TelemetryConfig::default());
    subscriber.subscribe("drone-9").await.unwrap();

    let view = subscriber.view();
    assert_eq!(view.entity_id.as_deref(), Some("drone-9"));
    assert!(view.snapshot.is_none());
    assert!(!view.connected);
}

#[tokio::test]
async fn gap_triggers_refetch_of_latest_row() {
    let (memory, backend) = fleet();
    let mut subscriber = TelemetrySubscriber::new(backend, TelemetryConfig::default());
    subscriber.subscribe("drone-1").await.unwrap();
    assert_eq!(memory.fetch_count(DEFAULT_TELEMETRY_TABLE), 1);

    memory.signal_gap(DEFAULT_TELEMETRY_TABLE);
    settle().await;
    assert_eq!(memory.fetch_count(DEFAULT_TELEMETRY_TABLE), 2);
}

#[tokio::test]
async fn unreachable_backend_reports_error_in_view() {
    let (memory, backend) = fleet();
    memory.set_reachable(false);
    let mut subscriber = TelemetrySubscriber::new(backend, TelemetryConfig::default());

    assert!(subscriber.subscribe("drone-1").await.is_err());
    let view = subscriber.view();
    assert!(view.error.is_some());
    assert!(!view.connected);
}

// =============================================================================
// entity switching
// =============================================================================

#[tokio::test]
async fn switching_entity_keeps_one_subscription_per_table() {
    let (memory, backend) = fleet();
    let mut subscriber = TelemetrySubscriber::new(backend, TelemetryConfig::default());

    subscriber.subscribe("drone-1").await.unwrap();
    subscriber.set_entity("drone-2").await.unwrap();
    subscriber.set_entity("drone-1").await.unwrap();
    subscriber.set_entity("drone-2").await.unwrap();

    assert_eq!(memory.active_subscriptions(DEFAULT_TELEMETRY_TABLE), 1);
    assert_eq!(memory.active_subscriptions(DEFAULT_STATUS_TABLE), 1);
    assert_eq!(battery(&subscriber.view()), Some(40.0));
    assert_eq!(subscriber.view().entity_id.as_deref(), Some("drone-2"));
}

#[tokio::test]
async fn empty_entity_is_idle() {
    let (memory, backend) = fleet();
    let mut subscriber = TelemetrySubscriber::new(backend, TelemetryConfig::default());
    subscriber.subscribe("drone-1").await.unwrap();

    subscriber.set_entity("  ").await.unwrap();
    assert_eq!(subscriber.view(), TelemetryView::default());
    assert_eq!(memory.active_subscriptions(DEFAULT_TELEMETRY_TABLE), 0);
    assert_eq!(memory.active_subscriptions(DEFAULT_STATUS_TABLE), 0);
}

#[tokio::test]
async fn close_stops_feed() {
    let (memory, backend) = fleet();
    let mut subscriber = TelemetrySubscriber::new(backend, TelemetryConfig::default());
    subscriber.subscribe("drone-1").await.unwrap();
    subscriber.close().await;
    assert_eq!(memory.active_subscriptions(DEFAULT_TELEMETRY_TABLE), 0);
    assert!(subscriber.view().entity_id.is_none());
}

#[test]
fn uav_mode_gates_construction() {
    let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
    assert!(TelemetrySubscriber::from_config(backend.clone(), &SyncConfig::default()).is_none());
    let config = SyncConfig { uav_mode: true, ..SyncConfig::default() };
    assert!(TelemetrySubscriber::from_config(backend, &config).is_some());
}

// =============================================================================
// health
// =============================================================================

#[tokio::test(start_paused = true)]
async fn silence_past_threshold_disconnects_and_update_reconnects() {
    let (_memory, backend) = fleet();
    let mut subscriber = TelemetrySubscriber::new(backend.clone(), TelemetryConfig::default());
    subscriber.subscribe("drone-1").await.unwrap();
    assert!(subscriber.view().connected);

    for _ in 0..6 {
        tokio::time::advance(Duration::from_secs(DEFAULT_HEALTH_CHECK_SECS)).await;
        settle().await;
    }
    // 30s elapsed: not yet past the threshold
    assert!(subscriber.view().connected);

    tokio::time::advance(Duration::from_secs(DEFAULT_HEALTH_CHECK_SECS)).await;
    settle().await;
    assert!(!subscriber.view().connected);

    backend
        .insert(DEFAULT_TELEMETRY_TABLE, row(json!({ "drone_id": "drone-1", "battery_level": 70 })))
        .await
        .unwrap();
    settle().await;
    let view = subscriber.view();
    assert!(view.connected);
    assert_eq!(battery(&view), Some(70.0));
}

// =============================================================================
// merge
// =============================================================================

#[test]
fn merge_is_idempotent_and_keeps_absent_fields() {
    let mut snapshot = TelemetrySnapshot::new("drone-1");
    snapshot.merge(&TelemetryPatch::from_row(&row(json!({ "battery_level": 80, "altitude": 10 }))).unwrap());

    let patch = TelemetryPatch::from_row(&row(json!({ "battery_level": 75, "altitude": null }))).unwrap();
    snapshot.merge(&patch);
    let once = snapshot.clone();
    snapshot.merge(&patch);

    assert_eq!(snapshot, once);
    assert_eq!(snapshot.battery_level, Some(75.0));
    assert_eq!(snapshot.altitude, Some(10.0));
}

#[test]
fn lone_coordinate_needs_a_known_partner() {
    let mut snapshot = TelemetrySnapshot::new("d");
    snapshot.merge(&TelemetryPatch { latitude: Some(1.0), ..TelemetryPatch::default() });
    assert!(snapshot.position.is_none());

    snapshot.merge(&TelemetryPatch { latitude: Some(1.0), longitude: Some(2.0), ..TelemetryPatch::default() });
    snapshot.merge(&TelemetryPatch { longitude: Some(3.0), ..TelemetryPatch::default() });
    assert_eq!(snapshot.position, Some(Position { lat: 1.0, lon: 3.0 }));
}

#[test]
fn patch_accepts_alternate_spellings() {
    let patch = TelemetryPatch::from_row(&row(json!({
        "batteryLevel": 55,
        "timestamp": "2026-05-01T10:00:00Z",
        "flightMode": "loiter",
        "position": { "lat": 4.0, "lon": 5.0 },
        "errors": ["gps weak"]
    })))
    .unwrap();
    assert_eq!(patch.battery_level, Some(55.0));
    assert!(patch.captured_at.is_some());
    assert_eq!(patch.flight_mode.as_deref(), Some("loiter"));
    assert_eq!((patch.latitude, patch.longitude), (Some(4.0), Some(5.0)));
    assert_eq!(patch.errors, Some(vec!["gps weak".to_owned()]));
}

#[test]
fn patch_rejects_wrong_types() {
    assert!(TelemetryPatch::from_row(&row(json!({ "battery_level": "full" }))).is_err());
}
