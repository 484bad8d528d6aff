//! In-process backend.
//!
//! DESIGN
//! ======
//! Tables are vectors of JSON rows behind one `std::sync::Mutex`; nothing
//! awaits while the lock is held. Every write builds a [`ChangeEvent`] and
//! fans it out to matching subscribers with `try_send`, mirroring how the
//! hosted service pushes row changes. A full queue drops the event and marks
//! the subscription's [`GapSignal`]. Presence rooms keep one meta per
//! connection and push the whole state to every listener on each change.
//!
//! Listeners whose receiving half was dropped are pruned on the next
//! publish. For presence that prune doubles as the membership-leave event,
//! which is how a crashed client eventually disappears from peers' rosters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

use super::{
    Backend, BackendError, ChangeEvent, ChangeFilter, ChangeKind, GapSignal, PresenceSubscription, PresenceSync,
    Query, Row, RowFilter, Subscription, SubscriptionMessage, compare_values,
};

const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;
const PRESENCE_BUFFER: usize = 64;

// =============================================================================
// STATE
// =============================================================================

struct Subscriber {
    filter: ChangeFilter,
    tx: mpsc::Sender<SubscriptionMessage>,
    /// Marked when an event was dropped; the receiver then reports a `Gap`.
    gap: Arc<GapSignal>,
}

#[derive(Default)]
struct PresenceRoom {
    tracked: HashMap<Uuid, (String, Value)>,
    listeners: HashMap<Uuid, mpsc::Sender<PresenceSync>>,
}

impl PresenceRoom {
    fn snapshot(&self) -> PresenceSync {
        let mut state: HashMap<String, Vec<Value>> = HashMap::new();
        for (key, meta) in self.tracked.values() {
            state.entry(key.clone()).or_default().push(meta.clone());
        }
        PresenceSync { state }
    }

    fn prune_departed(&mut self) {
        let departed: Vec<Uuid> = self
            .listeners
            .iter()
            .filter(|(_, tx)| tx.is_closed())
            .map(|(conn, _)| *conn)
            .collect();
        for conn in departed {
            debug!(%conn, "presence: listener gone, dropping membership");
            self.listeners.remove(&conn);
            self.tracked.remove(&conn);
        }
    }

    fn broadcast(&mut self) {
        self.prune_departed();
        let sync = self.snapshot();
        for tx in self.listeners.values() {
            let _ = tx.try_send(sync.clone());
        }
    }
}

struct MemoryInner {
    tables: HashMap<String, Vec<Row>>,
    subscribers: Vec<Subscriber>,
    rooms: HashMap<String, PresenceRoom>,
    reachable: bool,
    fetches: HashMap<String, usize>,
    buffer: usize,
}

impl MemoryInner {
    fn ensure_reachable(&self) -> Result<(), BackendError> {
        if self.reachable {
            Ok(())
        } else {
            Err(BackendError::Unavailable("memory backend set unreachable".into()))
        }
    }

    fn publish(&mut self, event: &ChangeEvent) {
        self.subscribers.retain(|sub| {
            if !sub.filter.matches(event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(SubscriptionMessage::Change(event.clone())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(table = %sub.filter.table, "memory: subscriber queue full; gap owed");
                    sub.gap.mark();
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

// =============================================================================
// MEMORY BACKEND
// =============================================================================

/// Cloneable handle; clones share the same tables and channels.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIPTION_BUFFER)
    }

    /// Backend whose change subscriptions queue at most `buffer` messages.
    #[must_use]
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                tables: HashMap::new(),
                subscribers: Vec::new(),
                rooms: HashMap::new(),
                reachable: true,
                fetches: HashMap::new(),
                buffer: buffer.max(1),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load rows without emitting change events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut inner = self.lock();
        let stored = inner.tables.entry(table.to_owned()).or_default();
        for row in rows {
            stored.push(with_generated_columns(row));
        }
    }

    /// Make every subsequent call fail with [`BackendError::Unavailable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Number of `fetch` calls served for `table`.
    #[must_use]
    pub fn fetch_count(&self, table: &str) -> usize {
        self.lock().fetches.get(table).copied().unwrap_or(0)
    }

    /// Live change subscriptions on `table`.
    #[must_use]
    pub fn active_subscriptions(&self, table: &str) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| s.filter.table == table && !s.tx.is_closed())
            .count()
    }

    /// Connections currently tracked in a presence channel.
    #[must_use]
    pub fn presence_members(&self, channel: &str) -> usize {
        self.lock()
            .rooms
            .get(channel)
            .map_or(0, |room| room.tracked.len())
    }

    /// Owe a `Gap` to every subscription on `table`, as after a reconnect.
    pub fn signal_gap(&self, table: &str) {
        let inner = self.lock();
        for sub in inner.subscribers.iter().filter(|s| s.filter.table == table) {
            sub.gap.mark();
        }
    }

    /// Snapshot of a table's rows in storage order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn fetch(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;
        *inner.fetches.entry(query.table.clone()).or_default() += 1;

        let mut rows: Vec<Row> = inner
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.descending { ord.reverse() } else { ord }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;
        let row = with_generated_columns(row);
        inner
            .tables
            .entry(table.to_owned())
            .or_default()
            .push(row.clone());
        inner.publish(&ChangeEvent { table: table.to_owned(), kind: ChangeKind::Insert, new: Some(row.clone()), old: None });
        Ok(row)
    }

    async fn update(&self, table: &str, filter: &RowFilter, patch: Row) -> Result<Vec<Row>, BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;

        let mut changes = Vec::new();
        if let Some(rows) = inner.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                let old = row.clone();
                for (key, value) in &patch {
                    row.insert(key.clone(), value.clone());
                }
                changes.push((old, row.clone()));
            }
        }
        if changes.is_empty() {
            return Err(BackendError::NotFound { table: table.to_owned() });
        }

        let mut updated = Vec::with_capacity(changes.len());
        for (old, new) in changes {
            inner.publish(&ChangeEvent {
                table: table.to_owned(),
                kind: ChangeKind::Update,
                new: Some(new.clone()),
                old: Some(old),
            });
            updated.push(new);
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<Vec<Row>, BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;

        let mut removed = Vec::new();
        if let Some(rows) = inner.tables.get_mut(table) {
            rows.retain(|r| {
                if filter.matches(r) {
                    removed.push(r.clone());
                    false
                } else {
                    true
                }
            });
        }
        for old in &removed {
            inner.publish(&ChangeEvent { table: table.to_owned(), kind: ChangeKind::Delete, new: None, old: Some(old.clone()) });
        }
        Ok(removed)
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;
        let (tx, rx) = mpsc::channel(inner.buffer);
        debug!(table = %filter.table, kind = ?filter.kind, "memory: subscribe");
        let subscription = Subscription::new(rx);
        inner.subscribers.push(Subscriber { filter, tx, gap: subscription.gap_signal() });
        Ok(subscription)
    }

    async fn join_presence(&self, channel: &str) -> Result<PresenceSubscription, BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(PRESENCE_BUFFER);
        let room = inner.rooms.entry(channel.to_owned()).or_default();
        room.prune_departed();
        let _ = tx.try_send(room.snapshot());
        room.listeners.insert(conn, tx);
        Ok(PresenceSubscription { conn, channel: channel.to_owned(), rx })
    }

    async fn track(&self, channel: &str, conn: Uuid, key: &str, meta: Value) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;
        let room = inner.rooms.entry(channel.to_owned()).or_default();
        if !room.listeners.contains_key(&conn) {
            return Err(BackendError::Invalid(format!("connection {conn} has not joined {channel}")));
        }
        room.tracked.insert(conn, (key.to_owned(), meta));
        room.broadcast();
        Ok(())
    }

    async fn leave_presence(&self, channel: &str, conn: Uuid) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.ensure_reachable()?;
        if let Some(room) = inner.rooms.get_mut(channel) {
            room.listeners.remove(&conn);
            room.tracked.remove(&conn);
            room.broadcast();
        }
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Fill `id` and `created_at` the way the hosted tables default them.
fn with_generated_columns(mut row: Row) -> Row {
    if !row.contains_key("id") {
        row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
    }
    if !row.contains_key("created_at") {
        let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        row.insert("created_at".into(), Value::String(now));
    }
    row
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
