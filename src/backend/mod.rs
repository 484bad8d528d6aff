//! Backend seam: row queries, change streams, presence channels.
//!
//! DESIGN
//! ======
//! The hosted service exposes row-level CRUD plus a push stream of
//! insert/update/delete notifications keyed by table and an optional
//! `column = value` filter. Presence channels publish a `sync` payload
//! (identity key -> list of tracked metas) whenever membership changes.
//! Rows stay untyped JSON at this layer; stores parse them into domain
//! types at the edge.
//!
//! TRADE-OFFS
//! ==========
//! Subscriptions are bounded queues. When a consumer falls behind, events are
//! dropped and a single [`SubscriptionMessage::Gap`] is queued in their place
//! so the consumer knows to resynchronize with a full fetch.

pub mod memory;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::error::ErrorCode;

/// A single table row as delivered by the backend.
pub type Row = serde_json::Map<String, Value>;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Transport or service failure; the same call may succeed later.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("no matching row in {table}")]
    NotFound { table: String },

    /// The request was rejected as malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("subscription closed")]
    SubscriptionClosed,
}

impl ErrorCode for BackendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_BACKEND_UNAVAILABLE",
            Self::NotFound { .. } => "E_NOT_FOUND",
            Self::Invalid(_) => "E_INVALID_REQUEST",
            Self::SubscriptionClosed => "E_SUBSCRIPTION_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::SubscriptionClosed)
    }
}

// =============================================================================
// QUERIES
// =============================================================================

/// Equality filter on one column (`column=eq.value`).
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub column: String,
    pub value: Value,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { column: column.into(), value: value.into() }
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        row.get(&self.column) == Some(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Read request against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    /// Column list with optional embedded joins, e.g. `*, projects(name)`.
    pub select: String,
    pub filters: Vec<RowFilter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self { table: table.into(), select: "*".into(), filters: Vec::new(), order: None, limit: None }
    }

    #[must_use]
    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = select.into();
        self
    }

    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(RowFilter::eq(column, value));
        self
    }

    #[must_use]
    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order = Some(Order { column: column.into(), descending: true });
        self
    }

    #[must_use]
    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order = Some(Order { column: column.into(), descending: false });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

/// Total order used for `ORDER BY`: nulls first, then numbers/strings/bools
/// compared within their own kind.
#[must_use]
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

// =============================================================================
// CHANGE STREAM
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-level change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// Row after the change. `None` for deletes.
    pub new: Option<Row>,
    /// Row before the change. `None` for inserts.
    pub old: Option<Row>,
}

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFilter {
    pub table: String,
    /// `None` means every event kind.
    pub kind: Option<ChangeKind>,
    pub row: Option<RowFilter>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self { table: table.into(), kind: None, row: None }
    }

    #[must_use]
    pub fn kind(mut self, kind: ChangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn row(mut self, filter: RowFilter) -> Self {
        self.row = Some(filter);
        self
    }

    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        if self.kind.is_some_and(|k| k != event.kind) {
            return false;
        }
        match &self.row {
            None => true,
            Some(f) => event.new.as_ref().is_some_and(|r| f.matches(r)) || event.old.as_ref().is_some_and(|r| f.matches(r)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    Change(ChangeEvent),
    /// Events were lost (slow consumer or reconnect); resync from a fetch.
    Gap,
}

/// Set by the sending side when a full queue dropped an event. The owning
/// [`Subscription`] reports a `Gap` once its queue is drained.
#[derive(Debug, Default)]
pub struct GapSignal {
    missed: AtomicBool,
    wake: Notify,
}

impl GapSignal {
    pub fn mark(&self) {
        self.missed.store(true, AtomicOrdering::SeqCst);
        self.wake.notify_one();
    }

    fn take(&self) -> bool {
        self.missed.swap(false, AtomicOrdering::SeqCst)
    }
}

/// Receiving half of a change subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<SubscriptionMessage>,
    gap: Arc<GapSignal>,
}

impl Subscription {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<SubscriptionMessage>) -> Self {
        Self { id: Uuid::new_v4(), rx, gap: Arc::default() }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Handle the sender marks when it has to drop an event.
    #[must_use]
    pub fn gap_signal(&self) -> Arc<GapSignal> {
        self.gap.clone()
    }

    /// Next message, or `None` once the backend closed the stream.
    ///
    /// Queued changes come first; a pending gap is reported once the queue
    /// is empty, even if no further event ever arrives.
    pub async fn recv(&mut self) -> Option<SubscriptionMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            if self.gap.take() {
                return Some(SubscriptionMessage::Gap);
            }
            tokio::select! {
                message = self.rx.recv() => return message,
                () = self.gap.wake.notified() => {}
            }
        }
    }
}

// =============================================================================
// PRESENCE CHANNEL
// =============================================================================

/// Full channel state: identity key -> metas tracked under that key (one per
/// connection, so a user with two tabs has two entries).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSync {
    pub state: HashMap<String, Vec<Value>>,
}

/// Membership in a presence channel.
#[derive(Debug)]
pub struct PresenceSubscription {
    /// Connection id assigned by the channel.
    pub conn: Uuid,
    pub channel: String,
    pub rx: mpsc::Receiver<PresenceSync>,
}

// =============================================================================
// BACKEND TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, BackendError>;

    /// Insert a row, returning it as stored (with generated columns).
    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError>;

    /// Merge `patch` into every row matching `filter`.
    async fn update(&self, table: &str, filter: &RowFilter, patch: Row) -> Result<Vec<Row>, BackendError>;

    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>, BackendError>;

    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, BackendError>;

    /// Join a presence channel. The current state is delivered immediately.
    async fn join_presence(&self, channel: &str) -> Result<PresenceSubscription, BackendError>;

    /// Publish (or replace) this connection's meta under `key`.
    async fn track(&self, channel: &str, conn: Uuid, key: &str, meta: Value) -> Result<(), BackendError>;

    async fn leave_presence(&self, channel: &str, conn: Uuid) -> Result<(), BackendError>;
}

/// Serialize a value into a row, rejecting non-object shapes.
///
/// # Errors
///
/// Returns [`BackendError::Invalid`] when `value` does not serialize to a JSON object.
pub fn to_row(value: &impl Serialize) -> Result<Row, BackendError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(BackendError::Invalid(format!("expected object row, got {other}"))),
        Err(e) => Err(BackendError::Invalid(e.to_string())),
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
