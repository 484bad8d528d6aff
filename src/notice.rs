//! User-facing notices (the toast stream).
//!
//! Components never surface failures by panicking or returning into a render
//! path; they push a [`Notice`] here and the shell decides how to show it.
//! Delivery is best effort: with no listener attached, notices are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A recovery attempt is running.
    Recovering { attempt: u32, max: u32 },
    Recovered,
    /// Terminal failure; no further automatic retry.
    Failed { message: String },
    Offline,
    Online,
    RateLimited { retry_after: Duration },
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn notify(&self, notice: Notice) {
        match &notice {
            Notice::Failed { message } => warn!(%message, "notice: failed"),
            other => info!(notice = ?other, "notice"),
        }
        let _ = self.tx.send(notice);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CONNECTIVITY
// =============================================================================

/// Turns reachability observations into `Offline`/`Online` notices, emitting
/// only on transitions. Starts out assuming the backend is reachable.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    notifier: Notifier,
    online: Arc<AtomicBool>,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier, online: Arc::new(AtomicBool::new(true)) }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn observe(&self, reachable: bool) {
        let was_online = self.online.swap(reachable, Ordering::AcqRel);
        match (was_online, reachable) {
            (true, false) => self.notifier.notify(Notice::Offline),
            (false, true) => self.notifier.notify(Notice::Online),
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "notice_test.rs"]
mod tests;
