//! Presence tracker: who else is connected to a shared channel.
//!
//! DESIGN
//! ======
//! One background task per joined channel owns the presence subscription.
//! It selects over two sources:
//!
//! - `sync` payloads from the channel, each of which replaces the roster
//!   wholesale (flatten every meta of every key, validate, dedup by identity)
//! - a heartbeat interval that republishes this client's record, skipped
//!   while the page is hidden
//!
//! The roster is published through a `watch` channel so views re-render on
//! change without polling.
//!
//! TRADE-OFFS
//! ==========
//! Leaving sends no "offline" record. Departure shows up in peers' rosters
//! only when the channel itself drops the membership, so a crashed client
//! stays listed until the provider times it out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, PresenceSync};

pub const DEFAULT_HEARTBEAT_SECS: u64 = 300;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Offline,
}

/// One client's advertised liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    #[serde(alias = "user_id")]
    pub identity: String,
    #[serde(alias = "name", default)]
    pub display_name: String,
    #[serde(alias = "online_at", with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl PresenceRecord {
    /// Parse a tracked meta, rejecting shapes without a usable identity.
    fn from_meta(meta: &Value) -> Option<Self> {
        match serde_json::from_value::<Self>(meta.clone()) {
            Ok(record) if !record.identity.trim().is_empty() => Some(record),
            Ok(_) => {
                warn!("presence: dropping record with empty identity");
                None
            }
            Err(e) => {
                warn!(error = %e, "presence: dropping malformed record");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS) }
    }
}

// =============================================================================
// PAGE VISIBILITY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Foreground/background state of the hosting page. Clones share state; the
/// embedding shell flips it, trackers read it.
#[derive(Clone)]
pub struct PageVisibility {
    tx: Arc<watch::Sender<Visibility>>,
}

impl PageVisibility {
    #[must_use]
    pub fn new(initial: Visibility) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, visibility: Visibility) {
        self.tx.send_if_modified(|current| {
            let changed = *current != visibility;
            *current = visibility;
            changed
        });
    }

    #[must_use]
    pub fn get(&self) -> Visibility {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.get() == Visibility::Visible
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}

impl Default for PageVisibility {
    fn default() -> Self {
        Self::new(Visibility::Visible)
    }
}

// =============================================================================
// TRACKER
// =============================================================================

pub struct PresenceTracker {
    backend: Arc<dyn Backend>,
    channel: String,
    conn: Uuid,
    identity: String,
    roster: watch::Receiver<Vec<PresenceRecord>>,
    heartbeats: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl PresenceTracker {
    /// Join `channel`, publish this client's record, and start the heartbeat.
    ///
    /// # Errors
    ///
    /// Returns the backend error when joining or the first publish fails.
    pub async fn join(
        backend: Arc<dyn Backend>,
        channel: &str,
        identity: &str,
        display_name: &str,
        config: PresenceConfig,
        visibility: PageVisibility,
    ) -> Result<Self, BackendError> {
        let mut subscription = backend.join_presence(channel).await?;
        let conn = subscription.conn;

        // PHASE: INITIAL PUBLISH
        let me = Me { identity: identity.to_owned(), display_name: display_name.to_owned() };
        if let Err(e) = publish(backend.as_ref(), channel, conn, &me).await {
            let _ = backend.leave_presence(channel, conn).await;
            return Err(e);
        }
        info!(%channel, %identity, %conn, "presence: joined");

        let (roster_tx, roster) = watch::channel(Vec::new());
        let heartbeats = Arc::new(AtomicU64::new(0));

        let task = {
            let backend = backend.clone();
            let channel = channel.to_owned();
            let heartbeats = heartbeats.clone();
            let period = config.heartbeat_interval.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        sync = subscription.rx.recv() => {
                            let Some(sync) = sync else {
                                debug!(%channel, "presence: channel closed");
                                break;
                            };
                            roster_tx.send_replace(flatten(&sync));
                        }
                        _ = ticker.tick() => {
                            if !visibility.is_visible() {
                                debug!(%channel, "presence: page hidden; skipping heartbeat");
                                continue;
                            }
                            heartbeats.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = publish(backend.as_ref(), &channel, conn, &me).await {
                                warn!(%channel, error = %e, "presence: heartbeat failed");
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            backend,
            channel: channel.to_owned(),
            conn,
            identity: identity.to_owned(),
            roster,
            heartbeats,
            task: Some(task),
        })
    }

    /// Latest roster, one record per identity.
    #[must_use]
    pub fn online_members(&self) -> Vec<PresenceRecord> {
        self.roster.borrow().clone()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.roster.borrow().len()
    }

    #[must_use]
    pub fn is_online(&self, identity: &str) -> bool {
        self.roster.borrow().iter().any(|r| r.identity == identity)
    }

    /// Receiver that wakes on every roster replacement.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceRecord>> {
        self.roster.clone()
    }

    /// Heartbeats actually sent (the initial publish excluded).
    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Stop the heartbeat and leave the channel.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the leave call fails; the heartbeat is
    /// stopped regardless.
    pub async fn leave(mut self) -> Result<(), BackendError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!(channel = %self.channel, identity = %self.identity, "presence: leaving");
        self.backend.leave_presence(&self.channel, self.conn).await
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        // Aborting drops the subscription receiver; the channel prunes the
        // membership on its next broadcast.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

struct Me {
    identity: String,
    display_name: String,
}

async fn publish(backend: &dyn Backend, channel: &str, conn: Uuid, me: &Me) -> Result<(), BackendError> {
    let record = PresenceRecord {
        identity: me.identity.clone(),
        display_name: me.display_name.clone(),
        last_seen_at: OffsetDateTime::now_utc(),
        status: PresenceStatus::Online,
    };
    let meta = serde_json::to_value(&record).map_err(|e| BackendError::Invalid(e.to_string()))?;
    backend.track(channel, conn, &me.identity, meta).await
}

/// Flatten every meta under every key into one roster. Records sharing an
/// identity collapse into the most recently seen one.
fn flatten(sync: &PresenceSync) -> Vec<PresenceRecord> {
    let mut by_identity: HashMap<String, PresenceRecord> = HashMap::new();
    for record in sync.state.values().flatten().filter_map(PresenceRecord::from_meta) {
        match by_identity.get(&record.identity) {
            Some(existing) if existing.last_seen_at >= record.last_seen_at => {}
            _ => {
                by_identity.insert(record.identity.clone(), record);
            }
        }
    }
    let mut roster: Vec<PresenceRecord> = by_identity.into_values().collect();
    roster.sort_by(|a, b| a.display_name.cmp(&b.display_name).then_with(|| a.identity.cmp(&b.identity)));
    roster
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
