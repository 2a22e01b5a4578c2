//! Process-supervisor liveness reporting.
//!
//! The dispatcher marks [`Health`] on any inbound traffic, successful
//! publish, or subscription ack; the heartbeat task emits a
//! [`LivenessReporter::heartbeat`] only when the flag is set and clears it
//! after every attempt, so a wedged server stops heartbeating within one
//! period.  How the heartbeat reaches the supervisor is the reporter
//! implementation's business; nothing here depends on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, info};

/// Injected supervisor notification channel.
pub trait LivenessReporter: Send + Sync + 'static {
    /// Startup complete, serving traffic.
    fn ready(&self);
    /// One watchdog heartbeat.
    fn heartbeat(&self);
    /// Orderly shutdown beginning.
    fn stopping(&self);
}

/// Reporter that only logs; used when no supervisor socket is configured.
#[derive(Debug, Default)]
pub struct LogLiveness;

impl LivenessReporter for LogLiveness {
    fn ready(&self) {
        info!("liveness: ready");
    }

    fn heartbeat(&self) {
        debug!("liveness: heartbeat");
    }

    fn stopping(&self) {
        info!("liveness: stopping");
    }
}

/// Latch set by any sign of life, consumed by each heartbeat attempt.
#[derive(Debug, Default)]
pub struct Health {
    active: AtomicBool,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_active(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    /// Read and clear the latch.
    pub fn take(&self) -> bool {
        self.active.swap(false, Ordering::Relaxed)
    }
}

/// Emit heartbeats while healthy until shutdown is signalled.
pub fn spawn_heartbeat<R: LivenessReporter>(
    reporter: Arc<R>,
    health: Arc<Health>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        // The first tick fires immediately; skip it so a heartbeat always
        // reflects a full period of observed activity.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if health.take() {
                        reporter.heartbeat();
                    } else {
                        debug!("no activity since last heartbeat, staying silent");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("heartbeat task stopping");
                        return;
                    }
                }
            }
        }
    })
}
