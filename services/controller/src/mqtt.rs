//! MQTT broker binding.
//!
//! Everything broker-specific lives here: connection options, the last-will
//! registration, (re)subscription, and the poll loop that feeds deliveries
//! into the dispatcher's channel.  Transient connection errors
//! retry with exponential backoff (0.1 s doubling to a 60 s cap); a credential
//! refusal is fatal and surfaces to main, which aborts the process.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Packet, QoS, SubscribeFilter,
};
use tc_core::bus::{Inbound, PublishError, Publisher, topics};
use tc_protocol::{EncodeError, Identifier, Message, WireFormat};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::liveness::Health;
use crate::now_ts;

/// Backoff for transient connect failures: 0.1 s doubling to a 60 s cap.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// All protocol traffic runs at QoS 2.
const PROTOCOL_QOS: QoS = QoS::ExactlyOnce;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("last will could not be encoded: {0}")]
    Will(#[from] EncodeError),
}

/// Outbound handle; cheap to clone (wraps the rumqttc request queue).
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    health: Arc<Health>,
}

impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .publish(topic, PROTOCOL_QOS, false, payload)
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;
        self.health.mark_active();
        Ok(())
    }
}

/// Owns the broker event loop; created once at startup.
pub struct MqttDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    controller_id: String,
    inbound_tx: mpsc::Sender<Inbound>,
    health: Arc<Health>,
}

/// Build the broker connection from config.
///
/// The returned publisher is usable immediately; publishes queue until the
/// driver's event loop establishes the session.
pub fn connect(
    cfg: &ControllerConfig,
    health: Arc<Health>,
    inbound_tx: mpsc::Sender<Inbound>,
) -> Result<(MqttPublisher, MqttDriver), BusError> {
    let mut options = MqttOptions::new(
        cfg.controller_id.clone(),
        cfg.broker.host.clone(),
        cfg.broker.port,
    );
    options.set_keep_alive(Duration::from_secs(cfg.broker.keepalive_secs));
    options.set_credentials(
        cfg.broker.username.clone(),
        cfg.broker.password.clone().unwrap_or_default(),
    );

    // Peers learn about our unclean death through the broker-held will.
    let will_payload = Message::Will(Identifier {
        timestamp: now_ts(),
        id: cfg.controller_id.clone(),
    })
    .encode(WireFormat::Binary)?;
    options.set_last_will(LastWill::new(topics::WILL, will_payload, PROTOCOL_QOS, false));

    let (client, eventloop) = AsyncClient::new(options, 64);
    let publisher = MqttPublisher {
        client: client.clone(),
        health: Arc::clone(&health),
    };
    let driver = MqttDriver {
        client,
        eventloop,
        controller_id: cfg.controller_id.clone(),
        inbound_tx,
        health,
    };
    Ok((publisher, driver))
}

impl MqttDriver {
    /// Poll the broker session until shutdown; Err only on a fatal refusal.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BusError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("disconnecting from broker");
                        let _ = self.client.disconnect().await;
                        return Ok(());
                    }
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("broker session established");
                        backoff = INITIAL_BACKOFF;
                        Self::subscribe_all(&self.client, &self.controller_id).await;
                        self.health.mark_active();
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!(pkid = ack.pkid, "subscription acknowledged");
                        self.health.mark_active();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.health.mark_active();
                        let inbound = Inbound {
                            topic: publish.topic.clone(),
                            // pkid 0 is the QoS-0 placeholder, not a real id.
                            mid: (publish.pkid != 0).then_some(u32::from(publish.pkid)),
                            payload: publish.payload.to_vec(),
                        };
                        if self.inbound_tx.send(inbound).await.is_err() {
                            info!("dispatcher gone, stopping broker driver");
                            return Ok(());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(code) = fatal_refusal(&e) {
                            error!(?code, "broker refused credentials, aborting");
                            return Err(BusError::Refused(code));
                        }
                        warn!(error = %e, backoff = ?backoff, "broker connection lost, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
    }

    /// (Re)subscribe to the server's three topics after each session start.
    async fn subscribe_all(client: &AsyncClient, controller_id: &str) {
        let filters = vec![
            SubscribeFilter::new(topics::actor(controller_id), PROTOCOL_QOS),
            SubscribeFilter::new(topics::WILL.to_owned(), PROTOCOL_QOS),
            SubscribeFilter::new(topics::admin(controller_id), PROTOCOL_QOS),
        ];
        if let Err(e) = client.subscribe_many(filters).await {
            warn!(error = %e, "subscribe request failed, will retry after reconnect");
        }
    }
}

/// Credential refusals never heal on retry; everything else is transient.
fn fatal_refusal(err: &ConnectionError) -> Option<ConnectReturnCode> {
    if let ConnectionError::ConnectionRefused(code) = err {
        if matches!(
            code,
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        ) {
            return Some(*code);
        }
    }
    None
}
