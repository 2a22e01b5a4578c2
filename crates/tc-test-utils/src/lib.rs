// tc-test-utils: Shared test utilities for the traffic controller suite.
//
// Provides an in-memory message bus, recording stand-ins for the output
// writer and publisher, and message builders, so dispatcher and engine tests
// run without a broker or hardware attached.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tc_core::bus::{Inbound, PublishError, Publisher};
use tc_core::relay::{OutputError, OutputWriter};
use tc_protocol::{
    Ack, AdminAction, AdminCommand, Identifier, Message, PhaseRequest, ResultCode,
};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

struct BusInner {
    subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<Inbound>>>,
    next_mid: u32,
}

/// An in-memory topic bus with broker-style message ids.
///
/// Every publish is assigned the next transport mid and delivered to all
/// current subscribers of that exact topic.  Dropped receivers are pruned
/// lazily on the next publish.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus {
            inner: Arc::new(Mutex::new(BusInner {
                subscriptions: HashMap::new(),
                next_mid: 1,
            })),
        }
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner
            .subscriptions
            .entry(topic.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish a payload, returning the mid the bus assigned to it.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> u32 {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let mid = inner.next_mid;
        inner.next_mid += 1;
        if let Some(subscribers) = inner.subscriptions.get_mut(topic) {
            subscribers.retain(|tx| {
                tx.send(Inbound {
                    topic: topic.to_owned(),
                    mid: Some(mid),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
        mid
    }

    /// Deliver a payload with an explicit mid (or none, like a QoS-0 drop-in).
    pub fn publish_with_mid(&self, topic: &str, mid: Option<u32>, payload: Vec<u8>) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if let Some(subscribers) = inner.subscriptions.get_mut(topic) {
            subscribers.retain(|tx| {
                tx.send(Inbound {
                    topic: topic.to_owned(),
                    mid,
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher { bus: self.clone() }
    }
}

/// [`Publisher`] half of a [`MemoryBus`].
#[derive(Clone)]
pub struct MemoryPublisher {
    bus: MemoryBus,
}

impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.bus.publish(topic, payload);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingPublisher
// ---------------------------------------------------------------------------

/// Captures every publish for later assertions; never fails.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().expect("publisher lock poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("publisher lock poisoned").len()
    }
}

impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.sent
            .lock()
            .expect("publisher lock poisoned")
            .push((topic.to_owned(), payload));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingOutputs
// ---------------------------------------------------------------------------

/// [`OutputWriter`] that records every write and the current pin levels.
#[derive(Clone, Default)]
pub struct RecordingOutputs {
    levels: Arc<Mutex<HashMap<u8, bool>>>,
    writes: Arc<Mutex<Vec<(u8, bool)>>>,
}

impl RecordingOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written level of `pin`, or None if never written.
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.levels.lock().expect("outputs lock poisoned").get(&pin).copied()
    }

    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.writes.lock().expect("outputs lock poisoned").clone()
    }
}

impl OutputWriter for RecordingOutputs {
    fn write(&self, pin: u8, on: bool) -> Result<(), OutputError> {
        self.levels.lock().expect("outputs lock poisoned").insert(pin, on);
        self.writes.lock().expect("outputs lock poisoned").push((pin, on));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

pub fn phase_on(user: &str, controller: &str, phase: i32, timestamp: i64) -> Message {
    Message::PhaseOn(PhaseRequest {
        timestamp,
        user_id: user.to_owned(),
        controller_id: controller.to_owned(),
        phase,
    })
}

pub fn phase_off(user: &str, controller: &str, phase: i32, timestamp: i64) -> Message {
    Message::PhaseOff(PhaseRequest {
        timestamp,
        user_id: user.to_owned(),
        controller_id: controller.to_owned(),
        phase,
    })
}

pub fn ping(id: &str, timestamp: i64) -> Message {
    Message::Ping(Identifier {
        timestamp,
        id: id.to_owned(),
    })
}

pub fn will(id: &str, timestamp: i64) -> Message {
    Message::Will(Identifier {
        timestamp,
        id: id.to_owned(),
    })
}

pub fn admin(action: AdminAction, user: &str, controller: &str, timestamp: i64) -> Message {
    Message::Admin(AdminCommand {
        timestamp,
        action,
        user_id: user.to_owned(),
        controller_id: controller.to_owned(),
    })
}

pub fn ack(user: &str, acked_mid: i32, result: ResultCode, timestamp: i64) -> Message {
    Message::Ack(Ack {
        timestamp,
        user_id: user.to_owned(),
        acked_mid,
        result,
    })
}
