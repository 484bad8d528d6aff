//! Drone telemetry: live snapshot plus connectivity inferred from recency.
//!
//! DESIGN
//! ======
//! A subscriber watches one entity at a time. Switching entities aborts the
//! previous feed task and waits for it to finish before the next one opens
//! its subscriptions, so two feeds never write the same view.
//!
//! A feed owns two change subscriptions:
//! - inserts on the telemetry table filtered by `drone_id`
//! - updates on the status table filtered by `id`
//!
//! Both carry partial rows. Each row is merged over the current snapshot;
//! only fields present (and non-null) in the row overwrite. Merging the same
//! row twice yields the same snapshot.
//!
//! HEALTH
//! ======
//! `connected` turns true whenever a row is applied. A periodic check turns
//! it false once the last applied row is older than the threshold. Recency
//! is measured on the local monotonic clock, not the row's `captured_at`,
//! so a drone with a skewed clock is judged by arrival time.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, ChangeEvent, ChangeFilter, ChangeKind, Query, Row, RowFilter, Subscription,
    SubscriptionMessage,
};
use crate::config::SyncConfig;

pub const DEFAULT_HEALTH_THRESHOLD_SECS: u64 = 30;
pub const DEFAULT_HEALTH_CHECK_SECS: u64 = 5;
pub const DEFAULT_TELEMETRY_TABLE: &str = "drone_telemetry";
pub const DEFAULT_STATUS_TABLE: &str = "drones";

/// Canonical column -> accepted spellings.
const ALIASES: &[(&str, &[&str])] = &[
    ("captured_at", &["capturedAt", "timestamp", "updated_at"]),
    ("battery_level", &["batteryLevel", "battery"]),
    ("signal_strength", &["signalStrength"]),
    ("satellite_count", &["satelliteCount", "satellites"]),
    ("flight_mode", &["flightMode", "mode"]),
    ("latitude", &["lat"]),
    ("longitude", &["lon", "lng"]),
];

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Silence longer than this marks the entity disconnected.
    pub health_threshold: Duration,
    pub health_check_interval: Duration,
    pub telemetry_table: String,
    pub status_table: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            health_threshold: Duration::from_secs(DEFAULT_HEALTH_THRESHOLD_SECS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_SECS),
            telemetry_table: DEFAULT_TELEMETRY_TABLE.into(),
            status_table: DEFAULT_STATUS_TABLE.into(),
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub entity_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub captured_at: Option<OffsetDateTime>,
    pub battery_level: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub position: Option<Position>,
    pub heading: Option<f64>,
    pub signal_strength: Option<f64>,
    pub satellite_count: Option<u32>,
    pub armed: Option<bool>,
    pub flight_mode: Option<String>,
    pub errors: Vec<String>,
}

impl TelemetrySnapshot {
    #[must_use]
    pub fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_owned(),
            captured_at: None,
            battery_level: None,
            altitude: None,
            speed: None,
            position: None,
            heading: None,
            signal_strength: None,
            satellite_count: None,
            armed: None,
            flight_mode: None,
            errors: Vec::new(),
        }
    }

    /// Overwrite every field the patch carries; keep the rest.
    pub fn merge(&mut self, patch: &TelemetryPatch) {
        fn set<T: Clone>(slot: &mut Option<T>, value: Option<&T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        set(&mut self.captured_at, patch.captured_at.as_ref());
        set(&mut self.battery_level, patch.battery_level.as_ref());
        set(&mut self.altitude, patch.altitude.as_ref());
        set(&mut self.speed, patch.speed.as_ref());
        set(&mut self.heading, patch.heading.as_ref());
        set(&mut self.signal_strength, patch.signal_strength.as_ref());
        set(&mut self.satellite_count, patch.satellite_count.as_ref());
        set(&mut self.armed, patch.armed.as_ref());
        set(&mut self.flight_mode, patch.flight_mode.as_ref());
        if let Some(errors) = &patch.errors {
            self.errors.clone_from(errors);
        }

        // EDGE: a lone coordinate only lands when the other one is known.
        if patch.latitude.is_some() || patch.longitude.is_some() {
            let lat = patch.latitude.or(self.position.map(|p| p.lat));
            let lon = patch.longitude.or(self.position.map(|p| p.lon));
            if let (Some(lat), Some(lon)) = (lat, lon) {
                self.position = Some(Position { lat, lon });
            }
        }
    }
}

/// Partial telemetry as carried by one row. Absent and null are the same.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TelemetryPatch {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub captured_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub signal_strength: Option<f64>,
    #[serde(default)]
    pub satellite_count: Option<u32>,
    #[serde(default)]
    pub armed: Option<bool>,
    #[serde(default)]
    pub flight_mode: Option<String>,
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

impl TelemetryPatch {
    /// Parse a row, folding alternate column spellings and a nested
    /// `position: {lat, lon}` into the canonical columns.
    ///
    /// # Errors
    ///
    /// Returns the serde error when a present field has the wrong type.
    pub fn from_row(row: &Row) -> Result<Self, serde_json::Error> {
        let mut row = row.clone();
        for (canonical, aliases) in ALIASES {
            for alias in *aliases {
                let value = row.remove(*alias);
                if let Some(value) = value {
                    if row.get(*canonical).is_none_or(Value::is_null) {
                        row.insert((*canonical).to_owned(), value);
                    }
                }
            }
        }
        if let Some(Value::Object(position)) = row.remove("position") {
            for (from, to) in [("lat", "latitude"), ("lon", "longitude")] {
                if let Some(v) = position.get(from) {
                    row.entry(to).or_insert_with(|| v.clone());
                }
            }
        }
        serde_json::from_value(Value::Object(row))
    }
}

// =============================================================================
// VIEW
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryView {
    /// `None` while idle.
    pub entity_id: Option<String>,
    pub snapshot: Option<TelemetrySnapshot>,
    pub connected: bool,
    /// Local arrival time of the last applied row.
    pub last_update: Option<Instant>,
    /// Readable message when the feed could not start.
    pub error: Option<String>,
}

// =============================================================================
// SUBSCRIBER
// =============================================================================

pub struct TelemetrySubscriber {
    backend: Arc<dyn Backend>,
    config: TelemetryConfig,
    view: Arc<watch::Sender<TelemetryView>>,
    task: Option<JoinHandle<()>>,
}

impl TelemetrySubscriber {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: TelemetryConfig) -> Self {
        let (view, _) = watch::channel(TelemetryView::default());
        Self { backend, config, view: Arc::new(view), task: None }
    }

    /// Subscriber for the UAV surface, or `None` when UAV mode is off.
    #[must_use]
    pub fn from_config(backend: Arc<dyn Backend>, config: &SyncConfig) -> Option<Self> {
        if !config.uav_mode {
            debug!("telemetry: uav mode off");
            return None;
        }
        Some(Self::new(backend, config.telemetry.clone()))
    }

    /// Start watching `entity_id` and return a receiver for its view.
    ///
    /// # Errors
    ///
    /// See [`TelemetrySubscriber::set_entity`].
    pub async fn subscribe(&mut self, entity_id: &str) -> Result<watch::Receiver<TelemetryView>, BackendError> {
        self.set_entity(entity_id).await?;
        Ok(self.watch())
    }

    /// Switch to `entity_id`. The previous feed is fully stopped first. An
    /// empty id leaves the subscriber idle.
    ///
    /// # Errors
    ///
    /// Returns the backend error when a subscription or the seed fetch
    /// fails; the view then carries the message and stays disconnected.
    pub async fn set_entity(&mut self, entity_id: &str) -> Result<(), BackendError> {
        self.stop().await;

        let entity_id = entity_id.trim();
        if entity_id.is_empty() {
            self.view.send_replace(TelemetryView::default());
            return Ok(());
        }
        self.view.send_replace(TelemetryView { entity_id: Some(entity_id.to_owned()), ..TelemetryView::default() });

        let feed = Feed {
            backend: self.backend.clone(),
            config: self.config.clone(),
            entity_id: entity_id.to_owned(),
            view: self.view.clone(),
        };
        match feed.open().await {
            Ok(streams) => {
                info!(%entity_id, "telemetry: feed started");
                self.task = Some(tokio::spawn(feed.run(streams)));
                Ok(())
            }
            Err(e) => {
                warn!(%entity_id, error = %e, "telemetry: feed failed to start");
                let message = e.to_string();
                self.view.send_modify(|view| view.error = Some(message));
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn view(&self) -> TelemetryView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<TelemetryView> {
        self.view.subscribe()
    }

    /// Stop the feed and return to idle.
    pub async fn close(&mut self) {
        self.stop().await;
        self.view.send_replace(TelemetryView::default());
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for TelemetrySubscriber {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// FEED
// =============================================================================

struct Streams {
    telemetry: Subscription,
    status: Subscription,
}

#[derive(Clone, Copy, Debug)]
enum Source {
    Telemetry,
    Status,
}

struct Feed {
    backend: Arc<dyn Backend>,
    config: TelemetryConfig,
    entity_id: String,
    view: Arc<watch::Sender<TelemetryView>>,
}

impl Feed {
    /// Subscribe to both streams, then seed from the latest stored row.
    async fn open(&self) -> Result<Streams, BackendError> {
        let telemetry = self
            .backend
            .subscribe(
                ChangeFilter::table(&self.config.telemetry_table)
                    .kind(ChangeKind::Insert)
                    .row(RowFilter::eq("drone_id", self.entity_id.as_str())),
            )
            .await?;
        let status = self
            .backend
            .subscribe(
                ChangeFilter::table(&self.config.status_table)
                    .kind(ChangeKind::Update)
                    .row(RowFilter::eq("id", self.entity_id.as_str())),
            )
            .await?;
        self.resync(Source::Telemetry).await?;
        Ok(Streams { telemetry, status })
    }

    async fn run(self, mut streams: Streams) {
        let period = self.config.health_check_interval.max(Duration::from_millis(1));
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let (source, message) = tokio::select! {
                msg = streams.telemetry.recv() => (Source::Telemetry, msg),
                msg = streams.status.recv() => (Source::Status, msg),
                _ = health.tick() => {
                    self.check_health();
                    continue;
                }
            };
            match message {
                Some(SubscriptionMessage::Change(event)) => self.apply_event(&event),
                Some(SubscriptionMessage::Gap) => {
                    debug!(entity_id = %self.entity_id, ?source, "telemetry: gap; resyncing");
                    if let Err(e) = self.resync(source).await {
                        warn!(entity_id = %self.entity_id, ?source, error = %e, "telemetry: resync failed");
                    }
                }
                None => {
                    warn!(entity_id = %self.entity_id, ?source, "telemetry: stream closed");
                    self.view.send_if_modified(|view| std::mem::replace(&mut view.connected, false));
                    break;
                }
            }
        }
    }

    /// Re-read the latest row for `source` and merge it.
    async fn resync(&self, source: Source) -> Result<(), BackendError> {
        let query = match source {
            Source::Telemetry => Query::table(&self.config.telemetry_table)
                .eq("drone_id", self.entity_id.as_str())
                .order_desc("captured_at")
                .limit(1),
            Source::Status => Query::table(&self.config.status_table)
                .eq("id", self.entity_id.as_str())
                .limit(1),
        };
        let rows = self.backend.fetch(&query).await?;
        if let Some(row) = rows.first() {
            self.apply_row(row);
        }
        Ok(())
    }

    fn apply_event(&self, event: &ChangeEvent) {
        if let Some(row) = &event.new {
            self.apply_row(row);
        }
    }

    fn apply_row(&self, row: &Row) {
        let patch = match TelemetryPatch::from_row(row) {
            Ok(patch) => patch,
            Err(e) => {
                warn!(entity_id = %self.entity_id, error = %e, "telemetry: dropping malformed row");
                return;
            }
        };
        let entity_id = &self.entity_id;
        self.view.send_modify(|view| {
            view.snapshot
                .get_or_insert_with(|| TelemetrySnapshot::new(entity_id))
                .merge(&patch);
            view.connected = true;
            view.last_update = Some(Instant::now());
        });
    }

    fn check_health(&self) {
        let threshold = self.config.health_threshold;
        self.view.send_if_modified(|view| {
            let stale = view.last_update.is_none_or(|at| at.elapsed() > threshold);
            if view.connected && stale {
                info!(entity_id = %self.entity_id, "telemetry: no update within threshold; disconnected");
                view.connected = false;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
#[path = "telemetry_test.rs"]
mod tests;
