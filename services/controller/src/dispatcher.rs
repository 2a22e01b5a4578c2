//! The protocol state machine between the bus and the relay engine.
//!
//! Every inbound delivery is decoded, checked against the duplicate
//! tracker, routed by kind, and answered with an ack carrying the original
//! transport mid, encoded in whichever representation the request used.
//! Decode failures are dropped without an ack: the sender is unknown and
//! untrusted at that point.
//!
//! Admin commands run on their own task so a slow subprocess never stalls
//! phase handling.  Unsupported-but-decodable kinds are always acked
//! `UNKNOWN_ERROR`; only messages with no decodable sender are dropped
//! silently.

use std::sync::Arc;

use tc_core::bus::{Inbound, Publisher, topics};
use tc_core::dedup::DuplicateTracker;
use tc_core::relay::{OutputWriter, RelayEngine};
use tc_protocol::{Ack, Decoded, Message, PhaseRequest, ResultCode, decode};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::admin::{AdminExecutor, CommandRunner};
use crate::liveness::Health;
use crate::now_ts;

/// Server-side request dispatcher.
///
/// Holds no locks of its own; the tracker and engine are individually
/// thread-safe and the publisher is a cheap clonable handle.
pub struct Dispatcher<P, W, R>
where
    P: Publisher,
    W: OutputWriter,
    R: CommandRunner,
{
    own_topic: String,
    admin_topic: String,
    publisher: P,
    tracker: Arc<DuplicateTracker>,
    engine: Arc<RelayEngine<W>>,
    admin: Arc<AdminExecutor<R>>,
    health: Arc<Health>,
}

impl<P, W, R> Dispatcher<P, W, R>
where
    P: Publisher,
    W: OutputWriter,
    R: CommandRunner,
{
    pub fn new(
        controller_id: &str,
        publisher: P,
        tracker: Arc<DuplicateTracker>,
        engine: Arc<RelayEngine<W>>,
        admin: Arc<AdminExecutor<R>>,
        health: Arc<Health>,
    ) -> Self {
        Dispatcher {
            own_topic: topics::actor(controller_id),
            admin_topic: topics::admin(controller_id),
            publisher,
            tracker,
            engine,
            admin,
            health,
        }
    }

    /// Consume deliveries until the channel closes or shutdown is signalled.
    pub async fn run(self, mut inbound: mpsc::Receiver<Inbound>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dispatcher stopping");
                        return;
                    }
                }
                maybe = inbound.recv() => match maybe {
                    Some(delivery) => self.handle(delivery).await,
                    None => {
                        info!("inbound channel closed, dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Process one delivery.
    pub async fn handle(&self, inbound: Inbound) {
        self.health.mark_active();
        if inbound.topic == topics::WILL {
            self.handle_will(&inbound);
        } else if inbound.topic == self.admin_topic {
            self.handle_admin(inbound).await;
        } else if inbound.topic == self.own_topic {
            self.handle_protocol(inbound).await;
        } else {
            debug!(topic = %inbound.topic, "delivery on an unsubscribed topic, ignoring");
        }
    }

    /// Will notices are purely informational; they never mutate phase state
    /// and are never acked.
    fn handle_will(&self, inbound: &Inbound) {
        match decode(&inbound.payload, inbound.mid) {
            Ok(Decoded {
                message: Message::Will(ident),
                ..
            }) => info!(peer = %ident.id, "peer disconnected uncleanly"),
            Ok(decoded) => debug!(
                tag = decoded.message.type_tag(),
                "non-will message on the will topic, ignoring"
            ),
            Err(e) => warn!(mid = ?inbound.mid, error = %e, "undecodable will payload"),
        }
    }

    async fn handle_protocol(&self, inbound: Inbound) {
        let decoded = match decode(&inbound.payload, inbound.mid) {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    topic = %inbound.topic,
                    mid = ?inbound.mid,
                    error = %e,
                    "dropping undecodable message"
                );
                return;
            }
        };
        if self.tracker.is_duplicate(&decoded) {
            debug!(mid = ?decoded.mid, sender = %decoded.message.sender_id(), "duplicate delivery");
            publish_ack(&self.publisher, &self.health, &decoded, ResultCode::DuplicateMid).await;
            return;
        }

        match &decoded.message {
            Message::PhaseOn(req) => self.handle_phase(&decoded, req, true).await,
            Message::PhaseOff(req) => self.handle_phase(&decoded, req, false).await,
            Message::Ping(ident) => {
                debug!(peer = %ident.id, "liveness ping");
                publish_ack(&self.publisher, &self.health, &decoded, ResultCode::Ok).await;
            }
            Message::Will(ident) => {
                info!(peer = %ident.id, "will notice on the protocol topic");
            }
            other => {
                warn!(
                    tag = other.type_tag(),
                    sender = %other.sender_id(),
                    "unsupported message type on the protocol topic"
                );
                publish_ack(&self.publisher, &self.health, &decoded, ResultCode::UnknownError)
                    .await;
            }
        }
    }

    async fn handle_phase(&self, decoded: &Decoded, req: &PhaseRequest, on: bool) {
        let phase = u32::try_from(req.phase)
            .ok()
            .filter(|p| self.engine.controls_phase(*p));
        let Some(phase) = phase else {
            warn!(phase = req.phase, user = %req.user_id, "request names an unconfigured phase");
            publish_ack(&self.publisher, &self.health, decoded, ResultCode::InvalidPhase).await;
            return;
        };
        if on {
            self.engine.set_phase_on(phase, &req.user_id);
        } else {
            self.engine.set_phase_off(phase, &req.user_id);
        }
        publish_ack(&self.publisher, &self.health, decoded, ResultCode::Ok).await;
    }

    async fn handle_admin(&self, inbound: Inbound) {
        let decoded = match decode(&inbound.payload, inbound.mid) {
            Ok(d) => d,
            Err(e) => {
                warn!(mid = ?inbound.mid, error = %e, "dropping undecodable admin message");
                return;
            }
        };
        if self.tracker.is_duplicate(&decoded) {
            debug!(mid = ?decoded.mid, "duplicate admin delivery");
            publish_ack(&self.publisher, &self.health, &decoded, ResultCode::DuplicateMid).await;
            return;
        }

        if let Message::Admin(cmd) = decoded.message.clone() {
            // Subprocess execution blocks; give each command its own task so
            // phase handling continues underneath it.
            let publisher = self.publisher.clone();
            let health = Arc::clone(&self.health);
            let admin = Arc::clone(&self.admin);
            tokio::spawn(async move {
                let rc = admin.execute(&cmd).await;
                publish_ack(&publisher, &health, &decoded, rc).await;
            });
        } else {
            warn!(
                tag = decoded.message.type_tag(),
                sender = %decoded.message.sender_id(),
                "non-admin message on the admin topic"
            );
            publish_ack(&self.publisher, &self.health, &decoded, ResultCode::UnknownError).await;
        }
    }
}

/// Build and send the ack for `request`, mirroring its wire format and mid.
async fn publish_ack<P: Publisher>(
    publisher: &P,
    health: &Health,
    request: &Decoded,
    result: ResultCode,
) {
    let requester = request.message.sender_id();
    if requester.is_empty() {
        warn!(mid = ?request.mid, "request carries no sender id, dropping ack");
        return;
    }
    let ack = Message::Ack(Ack {
        timestamp: now_ts(),
        user_id: requester.to_owned(),
        acked_mid: request.mid.map_or(0, |mid| mid as i32),
        result,
    });
    let payload = match ack.encode(request.encoding) {
        Ok(p) => p,
        Err(e) => {
            warn!(requester = %requester, error = %e, "ack could not be encoded");
            return;
        }
    };
    let topic = topics::actor(requester);
    match publisher.publish(&topic, payload).await {
        Ok(()) => {
            health.mark_active();
            debug!(topic = %topic, result = ?result, mid = ?request.mid, "ack sent");
        }
        Err(e) => warn!(topic = %topic, error = %e, "ack publish failed"),
    }
}
