//! Resource stores: fetch a table, subscribe to its changes, keep a sorted
//! local copy.
//!
//! DESIGN
//! ======
//! A store publishes `ResourceState { items, loading, error }` through a
//! `watch` channel. Items are ordered newest first by `created_at`.
//!
//! Open sequence:
//! 1. subscribe to every change kind on the table
//! 2. fetch the whole table (with the resource's column list and joins)
//! 3. spawn the sync task that drains the subscription
//!
//! Subscribing before the fetch means no change can fall between the two.
//!
//! SYNC MODES
//! ==========
//! - `Refetch`: any change re-reads the whole table.
//! - `Patch` (default): inserts, updates and deletes are applied by id. A row
//!   that fails to parse, or a gap in the stream, falls back to a refetch.
//!   Resources with an embedded join re-read the single changed row so the
//!   joined columns are present.
//!
//! Writes (`create`, `update`, `delete`) go straight to the backend and never
//! touch local state; the subscription brings the change back.
//!
//! ERROR HANDLING
//! ==============
//! Fetch failures land in `error` and keep the previous items. Every write
//! to state is fenced by a closed flag and a fetch generation, so a slow
//! response can neither resurrect a closed store nor overwrite a newer
//! result.

pub mod models;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, ChangeEvent, ChangeFilter, ChangeKind, Query, Row, RowFilter, Subscription,
    SubscriptionMessage, to_row,
};
use crate::notice::ConnectivityMonitor;

pub use models::{Drone, DroneStore, Mission, MissionStore, Project, ProjectStore, Task, TaskStore};

/// A table-backed entity.
pub trait Resource: DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: &'static str;
    /// Column list, including embedded joins such as `*, projects(name)`.
    const SELECT: &'static str = "*";

    fn id(&self) -> &str;
    fn created_at(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    Refetch,
    #[default]
    Patch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
    pub items: Vec<T>,
    pub loading: bool,
    pub error: Option<String>,
}

impl<T> Default for ResourceState<T> {
    fn default() -> Self {
        Self { items: Vec::new(), loading: false, error: None }
    }
}

#[derive(Clone, Default)]
pub struct StoreOptions {
    pub mode: SyncMode,
    /// Fed with the outcome of every fetch.
    pub connectivity: Option<ConnectivityMonitor>,
}

// =============================================================================
// STORE
// =============================================================================

pub struct ResourceStore<T: Resource> {
    sync: Arc<Syncer<T>>,
    rx: watch::Receiver<ResourceState<T>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Resource> ResourceStore<T> {
    /// Open with default options (patch mode, no connectivity monitor).
    pub async fn open(backend: Arc<dyn Backend>) -> Self {
        Self::open_with(backend, StoreOptions::default()).await
    }

    /// Subscribe, load, and start syncing. Never fails: problems are
    /// reported through [`ResourceState::error`].
    pub async fn open_with(backend: Arc<dyn Backend>, options: StoreOptions) -> Self {
        let (tx, _) = watch::channel(ResourceState { loading: true, ..ResourceState::default() });
        let sync = Arc::new(Syncer {
            backend,
            mode: options.mode,
            connectivity: options.connectivity,
            state: tx,
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        // PHASE: SUBSCRIBE
        let subscription = match sync.backend.subscribe(ChangeFilter::table(T::TABLE)).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(table = T::TABLE, error = %e, "resource: subscribe failed; live updates disabled");
                None
            }
        };

        // PHASE: INITIAL LOAD
        sync.refetch().await;
        if subscription.is_none() {
            sync.state.send_modify(|state| {
                state.error.get_or_insert_with(|| format!("live updates unavailable for {}", T::TABLE));
            });
        }

        // PHASE: SYNC
        let task = subscription.map(|subscription| {
            let sync = sync.clone();
            tokio::spawn(async move { sync.run(subscription).await })
        });
        info!(table = T::TABLE, mode = ?sync.mode, "resource: opened");

        let rx = sync.state.subscribe();
        Self { sync, rx, task }
    }

    #[must_use]
    pub fn state(&self) -> ResourceState<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change and return the new state.
    pub async fn changed(&mut self) -> ResourceState<T> {
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ResourceState<T>> {
        self.sync.state.subscribe()
    }

    /// Re-read the whole table.
    pub async fn refetch(&self) {
        self.sync.refetch().await;
    }

    /// Insert a row. Local state follows through the subscription.
    ///
    /// # Errors
    ///
    /// Returns the backend error, or [`BackendError::Invalid`] when `value`
    /// is not an object.
    pub async fn create(&self, value: &impl Serialize) -> Result<Row, BackendError> {
        let row = to_row(value)?;
        self.sync.backend.insert(T::TABLE, row).await
    }

    /// Merge `patch` into the row with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] when no row has that id.
    pub async fn update(&self, id: &str, patch: &impl Serialize) -> Result<Vec<Row>, BackendError> {
        let patch = to_row(patch)?;
        self.sync.backend.update(T::TABLE, &RowFilter::eq("id", id), patch).await
    }

    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn delete(&self, id: &str) -> Result<Vec<Row>, BackendError> {
        self.sync.backend.delete(T::TABLE, &RowFilter::eq("id", id)).await
    }

    /// Stop syncing. Results still in flight are discarded.
    pub async fn close(mut self) {
        self.sync.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        debug!(table = T::TABLE, "resource: closed");
    }
}

impl<T: Resource> Drop for ResourceStore<T> {
    fn drop(&mut self) {
        self.sync.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// SYNCER
// =============================================================================

struct Syncer<T> {
    backend: Arc<dyn Backend>,
    mode: SyncMode,
    connectivity: Option<ConnectivityMonitor>,
    state: watch::Sender<ResourceState<T>>,
    closed: AtomicBool,
    /// Bumped by every refetch; only the latest one may publish.
    generation: AtomicU64,
}

impl<T: Resource> Syncer<T> {
    async fn run(&self, mut subscription: Subscription) {
        while let Some(message) = subscription.recv().await {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match message {
                SubscriptionMessage::Gap => {
                    debug!(table = T::TABLE, "resource: gap; refetching");
                    self.refetch().await;
                }
                SubscriptionMessage::Change(event) => match self.mode {
                    SyncMode::Refetch => self.refetch().await,
                    SyncMode::Patch => {
                        if !self.patch(&event).await {
                            self.refetch().await;
                        }
                    }
                },
            }
        }
        debug!(table = T::TABLE, "resource: subscription ended");
    }

    async fn refetch(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(|state| state.loading = true);

        let query = Query::table(T::TABLE).select(T::SELECT).order_desc("created_at");
        let result = self.backend.fetch(&query).await;
        if let Some(monitor) = &self.connectivity {
            monitor.observe(!matches!(result, Err(BackendError::Unavailable(_))));
        }

        // EDGE: a newer refetch started while this one was in flight.
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match result {
            Ok(rows) => {
                let mut items: Vec<T> = rows.iter().filter_map(|row| parse_row::<T>(row).ok()).collect();
                sort_newest_first(&mut items);
                debug!(table = T::TABLE, count = items.len(), "resource: fetched");
                self.publish(|state| {
                    state.items = items;
                    state.error = None;
                    state.loading = false;
                });
            }
            Err(e) => {
                warn!(table = T::TABLE, error = %e, "resource: fetch failed");
                let message = format!("failed to load {}: {e}", T::TABLE);
                self.publish(|state| {
                    state.error = Some(message);
                    state.loading = false;
                });
            }
        }
    }

    /// Apply one change by id. Returns false when a full refetch is needed.
    async fn patch(&self, event: &ChangeEvent) -> bool {
        match event.kind {
            ChangeKind::Delete => {
                let Some(id) = event.old.as_ref().and_then(row_id) else {
                    return false;
                };
                self.publish(|state| state.items.retain(|item| item.id() != id));
                true
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = &event.new else {
                    return false;
                };
                let item = if T::SELECT == "*" {
                    parse_row::<T>(row).ok()
                } else {
                    let Some(id) = row_id(row) else {
                        return false;
                    };
                    match self.fetch_one(&id).await {
                        Ok(Some(item)) => Some(item),
                        // EDGE: deleted again before the point read
                        Ok(None) => return true,
                        Err(_) => None,
                    }
                };
                let Some(item) = item else {
                    return false;
                };
                self.publish(|state| upsert(&mut state.items, item));
                true
            }
        }
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<T>, BackendError> {
        let query = Query::table(T::TABLE).select(T::SELECT).eq("id", id).limit(1);
        let rows = self.backend.fetch(&query).await?;
        rows.first().map(parse_row::<T>).transpose()
    }

    fn publish(&self, apply: impl FnOnce(&mut ResourceState<T>)) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.state.send_modify(apply);
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_row<T: Resource>(row: &Row) -> Result<T, BackendError> {
    serde_json::from_value(Value::Object(row.clone())).map_err(|e| {
        warn!(table = T::TABLE, error = %e, "resource: row failed to parse");
        BackendError::Invalid(e.to_string())
    })
}

fn row_id(row: &Row) -> Option<String> {
    match row.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn sort_newest_first<T: Resource>(items: &mut [T]) {
    items.sort_by_key(|item| std::cmp::Reverse(item.created_at()));
}

/// Replace any item with the same id, keeping newest-first order.
fn upsert<T: Resource>(items: &mut Vec<T>, item: T) {
    items.retain(|existing| existing.id() != item.id());
    let at = items.partition_point(|existing| existing.created_at() > item.created_at());
    items.insert(at, item);
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
