//! Publish/subscribe transport abstraction consumed by the dispatcher.
//!
//! The broker client (connect/reconnect loop, QoS, last-will) lives outside
//! this crate; the dispatcher only sees inbound deliveries and an outbound
//! [`Publisher`].  Inbound messages arrive over a channel as [`Inbound`]
//! values carrying the transport-assigned message id used for duplicate
//! suppression and ack correlation.

use thiserror::Error;

/// One delivery from the message bus.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    /// Transport-assigned delivery id; absent for QoS-0 deliveries.
    pub mid: Option<u32>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("payload rejected by transport: {0}")]
    Rejected(String),
}

/// Outbound side of the bus.
///
/// Implementations must be cheap to clone (a channel or client handle); the
/// dispatcher clones one per spawned admin task.
pub trait Publisher: Clone + Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

/// Well-known topic layout shared by every client and controller.
pub mod topics {
    /// Liveness announcements (broker-delivered last wills).
    pub const WILL: &str = "tc/will";

    /// The topic one actor (user or controller) receives protocol traffic on.
    pub fn actor(id: &str) -> String {
        format!("tc/{id}")
    }

    /// The topic a controller receives admin commands on.
    pub fn admin(controller_id: &str) -> String {
        format!("tc/admin/{controller_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::topics;

    #[test]
    fn topic_layout() {
        assert_eq!(topics::actor("beacon-1"), "tc/beacon-1");
        assert_eq!(topics::admin("beacon-1"), "tc/admin/beacon-1");
        assert_eq!(topics::WILL, "tc/will");
    }
}
