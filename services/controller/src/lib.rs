// controller: Traffic controller server for phase requests over MQTT.
//
// Wires the protocol engine (tc-protocol, tc-core) to a broker connection,
// the physical outputs, the admin command runner, and the process-supervisor
// heartbeat.  The dispatcher itself is transport-generic; only `mqtt` knows
// about the broker client.

pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod liveness;
pub mod mqtt;
pub mod outputs;

/// Current UTC time in whole seconds, the protocol's timestamp unit.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
