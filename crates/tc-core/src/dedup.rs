//! Sliding-window duplicate suppression keyed by transport message id.
//!
//! QoS-2 delivery already filters most replays; this tracker catches the
//! rest (broker restarts, client republish) within a bounded window.  An
//! entry records the message's own creation timestamp and is evicted once
//! that timestamp falls out of the window, independent of any further
//! activity.  The window bounds memory and the dedup horizon, nothing else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tc_protocol::Decoded;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, trace};

/// Seconds a message id stays tracked.
pub const DEFAULT_MSG_LIFE_SECS: i64 = 10;

/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Record of recently seen message ids.
///
/// All lookups, inserts, and evictions run under one lock; a sweep never
/// observes a torn check-and-insert.
#[derive(Debug)]
pub struct DuplicateTracker {
    seen: Mutex<HashMap<u32, i64>>,
    lifetime_secs: i64,
}

impl Default for DuplicateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateTracker {
    pub fn new() -> Self {
        Self::with_lifetime(DEFAULT_MSG_LIFE_SECS)
    }

    pub fn with_lifetime(lifetime_secs: i64) -> Self {
        DuplicateTracker {
            seen: Mutex::new(HashMap::new()),
            lifetime_secs,
        }
    }

    /// Atomic check-and-insert.
    ///
    /// Returns true if the message's transport id is already tracked (the
    /// stored timestamp is NOT refreshed).  A first sighting is recorded
    /// under the message's creation timestamp and reported as novel.
    /// Messages without a transport id are never tracked or flagged.
    pub fn is_duplicate(&self, decoded: &Decoded) -> bool {
        let Some(mid) = decoded.mid else {
            return false;
        };
        let mut seen = self.seen.lock().expect("dedup lock poisoned");
        if seen.contains_key(&mid) {
            trace!(mid, "duplicate message id");
            return true;
        }
        seen.insert(mid, decoded.message.timestamp());
        false
    }

    /// Evict every entry whose tracked timestamp is older than
    /// `now - lifetime`.  `now` is UTC seconds.
    pub fn sweep(&self, now: i64) {
        let horizon = now - self.lifetime_secs;
        let mut seen = self.seen.lock().expect("dedup lock poisoned");
        let before = seen.len();
        seen.retain(|_, stamped| *stamped > horizon);
        let evicted = before - seen.len();
        if evicted > 0 {
            debug!(evicted, tracked = seen.len(), "swept expired message ids");
        }
    }

    pub fn tracked(&self) -> usize {
        self.seen.lock().expect("dedup lock poisoned").len()
    }
}

/// Run the periodic sweep until shutdown is signalled.
pub fn spawn_sweeper(
    tracker: Arc<DuplicateTracker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => tracker.sweep(Utc::now().timestamp()),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("duplicate tracker sweeper stopping");
                        return;
                    }
                }
            }
        }
    })
}
