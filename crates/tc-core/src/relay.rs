//! Per-phase relay queues and the physical output driver.
//!
//! Each configured output pin owns a queue of active holders (one entry per
//! requesting user).  The physical output is ON exactly while its queue is
//! non-empty, so overlapping riders behave like a reference count with
//! per-holder expiry.  A background checker evicts entries that have gone
//! unrefreshed past the fail-safe limit and rewrites every output on every
//! pass, unconditionally, so a missed or failed write heals on the next
//! wake instead of sticking a relay on.
//!
//! # Wakeups
//!
//! Queue mutations signal the checker through a [`Notify`].  Its stored
//! permit means a wake requested while a pass is running still triggers one
//! more pass; the periodic tick is only the fallback for the no-traffic case.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, error, info, warn};

/// Fail-safe: no holder survives this long without a refresh.
pub const MAX_PHASE_ON_SECS: u64 = 48;

/// Periodic checks per fail-safe window; 48 s / 4 = a pass every 12 s.
pub const CHECK_PHASE_TIMEOUT_INTERVAL: u32 = 4;

// ---------------------------------------------------------------------------
// Output abstraction
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("write to output {pin} failed: {reason}")]
    Write { pin: u8, reason: String },
}

/// The physical actuator (relay/GPIO pin) behind each phase.
///
/// Implementations are injected at engine construction; writes happen under
/// the engine lock and must not block.
pub trait OutputWriter: Send + Sync + 'static {
    fn write(&self, pin: u8, on: bool) -> Result<(), OutputError>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Checker timings, injectable so tests run under paused time.
#[derive(Debug, Clone, Copy)]
pub struct RelayTimings {
    pub max_on: Duration,
    pub check_interval: Duration,
}

impl Default for RelayTimings {
    fn default() -> Self {
        RelayTimings {
            max_on: Duration::from_secs(MAX_PHASE_ON_SECS),
            check_interval: Duration::from_secs(
                MAX_PHASE_ON_SECS / u64::from(CHECK_PHASE_TIMEOUT_INTERVAL),
            ),
        }
    }
}

/// One queue per configured output pin; holders keyed by user id.
struct Queues {
    by_pin: HashMap<u8, HashMap<String, Instant>>,
}

/// Relay engine owning the phase→output mapping and all holder state.
///
/// The mapping is fixed for the engine's lifetime; two phases may share one
/// pin, in which case either phase's holders keep that output on.
pub struct RelayEngine<W: OutputWriter> {
    writer: W,
    phase_to_output: HashMap<u32, u8>,
    queues: Mutex<Queues>,
    wake: Notify,
    timings: RelayTimings,
}

impl<W: OutputWriter> RelayEngine<W> {
    pub fn new(writer: W, phase_to_output: HashMap<u32, u8>) -> Arc<Self> {
        Self::with_timings(writer, phase_to_output, RelayTimings::default())
    }

    pub fn with_timings(
        writer: W,
        phase_to_output: HashMap<u32, u8>,
        timings: RelayTimings,
    ) -> Arc<Self> {
        let pins: HashSet<u8> = phase_to_output.values().copied().collect();
        let by_pin = pins.into_iter().map(|pin| (pin, HashMap::new())).collect();
        Arc::new(RelayEngine {
            writer,
            phase_to_output,
            queues: Mutex::new(Queues { by_pin }),
            wake: Notify::new(),
            timings,
        })
    }

    /// Whether `phase` maps to an output this engine controls.
    pub fn controls_phase(&self, phase: u32) -> bool {
        self.phase_to_output.contains_key(&phase)
    }

    /// The set of phases this engine was configured with.
    pub fn phases(&self) -> impl Iterator<Item = u32> + '_ {
        self.phase_to_output.keys().copied()
    }

    /// Add or refresh `user`'s hold on `phase` and wake the checker.
    ///
    /// A phase outside the configured map is a configuration error (the
    /// dispatcher already validated protocol-level membership): logged,
    /// nothing mutated.
    pub fn set_phase_on(&self, phase: u32, user: &str) {
        let Some(&pin) = self.phase_to_output.get(&phase) else {
            error!(phase, user, "phase request for an unmapped output");
            return;
        };
        {
            let mut queues = self.queues.lock().expect("relay lock poisoned");
            let queue = queues.by_pin.entry(pin).or_default();
            match queue.insert(user.to_owned(), Instant::now()) {
                Some(_) => debug!(phase, pin, user, "phase hold refreshed"),
                None => info!(phase, pin, user, "phase hold added"),
            }
        }
        self.wake.notify_one();
    }

    /// Release `user`'s hold on `phase`, if any, and wake the checker.
    ///
    /// A release with no matching hold is a safe no-op: the transport does
    /// not order ON/OFF, and the fail-safe may already have evicted it.
    pub fn set_phase_off(&self, phase: u32, user: &str) {
        let Some(&pin) = self.phase_to_output.get(&phase) else {
            error!(phase, user, "phase release for an unmapped output");
            return;
        };
        {
            let mut queues = self.queues.lock().expect("relay lock poisoned");
            let queue = queues.by_pin.entry(pin).or_default();
            match queue.remove(user) {
                Some(_) => info!(phase, pin, user, "phase hold released"),
                None => debug!(phase, pin, user, "release without a matching hold"),
            }
        }
        self.wake.notify_one();
    }

    /// Number of active holders on `phase`'s output (0 for unmapped phases).
    pub fn holder_count(&self, phase: u32) -> usize {
        let Some(pin) = self.phase_to_output.get(&phase) else {
            return 0;
        };
        let queues = self.queues.lock().expect("relay lock poisoned");
        queues.by_pin.get(pin).map_or(0, HashMap::len)
    }

    /// One checker pass: evict expired holders, then drive every output.
    ///
    /// Runs under the queue lock, so a pass and a mutation never interleave.
    pub fn check_and_drive(&self) {
        let now = Instant::now();
        let max_on = self.timings.max_on;
        let mut queues = self.queues.lock().expect("relay lock poisoned");
        for (pin, queue) in &mut queues.by_pin {
            let before = queue.len();
            queue.retain(|user, last_refresh| {
                let keep = now.duration_since(*last_refresh) <= max_on;
                if !keep {
                    warn!(pin, user = %user, "phase hold timed out, evicting");
                }
                keep
            });
            if before != queue.len() {
                debug!(pin, evicted = before - queue.len(), "fail-safe eviction");
            }
            // Written on every pass, not just on change.
            let on = !queue.is_empty();
            if let Err(e) = self.writer.write(*pin, on) {
                warn!(pin, on, error = %e, "output write failed");
            }
        }
    }
}

/// Run the checker until shutdown is signalled.
///
/// Every iteration drives one pass and then waits for a signal, the periodic
/// deadline, or shutdown.
pub fn spawn_checker<W: OutputWriter>(
    engine: Arc<RelayEngine<W>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            engine.check_and_drive();
            tokio::select! {
                _ = engine.wake.notified() => {}
                _ = sleep(engine.timings.check_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Outputs keep their last-written state; the external
                        // hardware watchdog owns reset-on-death.
                        debug!("relay checker stopping");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every write and the current level per pin.
    #[derive(Clone, Default)]
    struct TestOutputs {
        state: Arc<Mutex<HashMap<u8, bool>>>,
        writes: Arc<Mutex<Vec<(u8, bool)>>>,
    }

    impl TestOutputs {
        fn level(&self, pin: u8) -> Option<bool> {
            self.state.lock().unwrap().get(&pin).copied()
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl OutputWriter for TestOutputs {
        fn write(&self, pin: u8, on: bool) -> Result<(), OutputError> {
            self.state.lock().unwrap().insert(pin, on);
            self.writes.lock().unwrap().push((pin, on));
            Ok(())
        }
    }

    fn default_map() -> HashMap<u32, u8> {
        // Phases 2 and 3 deliberately share pin 4.
        HashMap::from([(1, 3), (2, 4), (3, 4), (4, 5)])
    }

    #[test]
    fn on_is_idempotent() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_on(1, "bike-7");
        engine.set_phase_on(1, "bike-7");
        assert_eq!(engine.holder_count(1), 1);
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(true));
    }

    #[test]
    fn release_without_hold_is_a_noop() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_off(1, "bike-7");
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(false));
    }

    #[test]
    fn unmapped_phase_mutates_nothing() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_on(9, "bike-7");
        assert_eq!(engine.holder_count(9), 0);
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(false));
        assert_eq!(outputs.level(4), Some(false));
        assert_eq!(outputs.level(5), Some(false));
    }

    #[test]
    fn output_follows_last_holder() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_on(1, "bike-a");
        engine.set_phase_on(1, "bike-b");
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(true));

        engine.set_phase_off(1, "bike-a");
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(true), "second holder keeps it on");

        engine.set_phase_off(1, "bike-b");
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(false));
    }

    #[test]
    fn phases_sharing_a_pin_share_the_queue() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_on(2, "bike-a");
        engine.set_phase_on(3, "bike-b");
        engine.check_and_drive();
        assert_eq!(outputs.level(4), Some(true));

        engine.set_phase_off(2, "bike-a");
        engine.check_and_drive();
        assert_eq!(outputs.level(4), Some(true));

        engine.set_phase_off(3, "bike-b");
        engine.check_and_drive();
        assert_eq!(outputs.level(4), Some(false));
    }

    #[test]
    fn every_pass_rewrites_all_outputs() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.check_and_drive();
        engine.check_and_drive();
        // 3 pins x 2 passes, regardless of any state change.
        assert_eq!(outputs.write_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn fail_safe_evicts_stale_holders() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_on(1, "bike-7");
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(true));

        // Just inside the window: still held.
        tokio::time::advance(Duration::from_secs(MAX_PHASE_ON_SECS)).await;
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(true));
        assert_eq!(engine.holder_count(1), 1);

        // Past the window with no refresh: evicted and driven off.
        tokio::time::advance(Duration::from_secs(1)).await;
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(false));
        assert_eq!(engine.holder_count(1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_restarts_the_fail_safe_clock() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_on(1, "bike-7");

        tokio::time::advance(Duration::from_secs(40)).await;
        engine.set_phase_on(1, "bike-7");

        tokio::time::advance(Duration::from_secs(40)).await;
        engine.check_and_drive();
        assert_eq!(engine.holder_count(1), 1, "refresh restarted the clock");

        tokio::time::advance(Duration::from_secs(9)).await;
        engine.check_and_drive();
        assert_eq!(engine.holder_count(1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_release_after_eviction_is_safe() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        engine.set_phase_on(1, "bike-7");
        tokio::time::advance(Duration::from_secs(MAX_PHASE_ON_SECS + 1)).await;
        engine.check_and_drive();
        assert_eq!(engine.holder_count(1), 0);

        // The rider's OFF finally arrives after the fail-safe already fired.
        engine.set_phase_off(1, "bike-7");
        engine.check_and_drive();
        assert_eq!(outputs.level(3), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn checker_task_drives_outputs_and_stops() {
        let outputs = TestOutputs::default();
        let engine = RelayEngine::new(outputs.clone(), default_map());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_checker(engine.clone(), rx);

        // Let the first pass run, then request a phase and let the wake fire.
        tokio::task::yield_now().await;
        engine.set_phase_on(1, "bike-7");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(outputs.level(3), Some(true));

        tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("checker did not stop")
            .expect("checker task join");
    }
}
