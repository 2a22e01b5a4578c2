// tc-protocol: Traffic controller phase-request protocol types and codecs.
//
// Every message travels in one of two representations: a fixed-layout
// big-endian binary record, or a flat JSON object (phase requests and acks
// only).  Decoding dispatches on the leading 4-byte type tag and stamps the
// result with the wire format used plus the transport message id, so the
// dispatcher can deduplicate and answer in kind.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{DecodeError, EncodeError, decode};

/// Maximum length of any identity field after UTF-8 encoding.
///
/// Binary records reserve exactly this many bytes per id field (NUL padded);
/// encoding fails outright for longer ids rather than truncating.
pub const MAX_ID_BYTES: usize = 64;

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

/// Wire type tags, frozen for interop with deployed controllers.
///
/// Admin tags live in a separate numeric range so a misconfigured client
/// can never turn a phase request into a host command by an off-by-one.
pub mod type_tags {
    pub const WILL: i32 = 0x00;
    pub const PHASE_REQUEST: i32 = 0x01;
    pub const PHASE_REQUEST_ON: i32 = 0x02;
    pub const PHASE_REQUEST_OFF: i32 = 0x03;
    pub const ACK: i32 = 0x04;
    pub const ID: i32 = 0x05;
    pub const ADMIN_REBOOT: i32 = 0x100;
    pub const ADMIN_WIFI_ENABLE: i32 = 0x101;
    pub const ADMIN_WIFI_DISABLE: i32 = 0x102;
}

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Ack result codes, frozen for interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    InvalidPhase,
    InvalidCmd,
    DuplicateMid,
    UnknownError,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::InvalidPhase => 1,
            ResultCode::InvalidCmd => 2,
            ResultCode::DuplicateMid => 3,
            ResultCode::UnknownError => 0xFF,
        }
    }

    pub fn from_code(code: i32) -> Option<ResultCode> {
        match code {
            0 => Some(ResultCode::Ok),
            1 => Some(ResultCode::InvalidPhase),
            2 => Some(ResultCode::InvalidCmd),
            3 => Some(ResultCode::DuplicateMid),
            0xFF => Some(ResultCode::UnknownError),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// Bare identity record: a will notice or a liveness ping.
///
/// `timestamp` is UTC seconds at message creation on the sender's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub timestamp: i64,
    pub id: String,
}

/// A request to hold a phase on (or release it), addressed to one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRequest {
    pub timestamp: i64,
    pub user_id: String,
    pub controller_id: String,
    pub phase: i32,
}

/// Acknowledgment of one delivered message, correlated by transport mid.
///
/// `user_id` names the requester the ack is addressed to; the delivery topic
/// `tc/<user_id>` is derivable from the message itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub timestamp: i64,
    pub user_id: String,
    pub acked_mid: i32,
    pub result: ResultCode,
}

/// Allow-listed host operations a controller will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Reboot,
    WifiEnable,
    WifiDisable,
}

/// An admin command addressed to one controller by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    pub timestamp: i64,
    pub action: AdminAction,
    pub user_id: String,
    pub controller_id: String,
}

// ---------------------------------------------------------------------------
// Tagged union
// ---------------------------------------------------------------------------

/// All protocol message kinds.
///
/// `Phase` carries the directionless legacy tag; current senders always use
/// `PhaseOn`/`PhaseOff` and the server treats a bare `Phase` as unsupported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Will(Identifier),
    Ping(Identifier),
    Phase(PhaseRequest),
    PhaseOn(PhaseRequest),
    PhaseOff(PhaseRequest),
    Ack(Ack),
    Admin(AdminCommand),
}

impl Message {
    /// The wire type tag this message encodes with.
    pub fn type_tag(&self) -> i32 {
        match self {
            Message::Will(_) => type_tags::WILL,
            Message::Ping(_) => type_tags::ID,
            Message::Phase(_) => type_tags::PHASE_REQUEST,
            Message::PhaseOn(_) => type_tags::PHASE_REQUEST_ON,
            Message::PhaseOff(_) => type_tags::PHASE_REQUEST_OFF,
            Message::Ack(_) => type_tags::ACK,
            Message::Admin(cmd) => match cmd.action {
                AdminAction::Reboot => type_tags::ADMIN_REBOOT,
                AdminAction::WifiEnable => type_tags::ADMIN_WIFI_ENABLE,
                AdminAction::WifiDisable => type_tags::ADMIN_WIFI_DISABLE,
            },
        }
    }

    /// The id of the actor that created this message.
    pub fn sender_id(&self) -> &str {
        match self {
            Message::Will(ident) | Message::Ping(ident) => &ident.id,
            Message::Phase(req) | Message::PhaseOn(req) | Message::PhaseOff(req) => &req.user_id,
            Message::Ack(ack) => &ack.user_id,
            Message::Admin(cmd) => &cmd.user_id,
        }
    }

    /// Creation timestamp (UTC seconds, sender's clock).
    pub fn timestamp(&self) -> i64 {
        match self {
            Message::Will(ident) | Message::Ping(ident) => ident.timestamp,
            Message::Phase(req) | Message::PhaseOn(req) | Message::PhaseOff(req) => req.timestamp,
            Message::Ack(ack) => ack.timestamp,
            Message::Admin(cmd) => cmd.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format + decode metadata
// ---------------------------------------------------------------------------

/// Which representation a payload used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Binary,
    Json,
}

/// A decoded message plus the transport metadata the decoder stamped on it.
///
/// `encoding` and `mid` are set only by [`decode`]; application logic reads
/// them (ack-in-kind, duplicate suppression) but never writes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub message: Message,
    pub encoding: WireFormat,
    pub mid: Option<u32>,
}

// ---------------------------------------------------------------------------
// JSON wire shapes
// ---------------------------------------------------------------------------
// Flat objects with exactly these keys; `deny_unknown_fields` rejects
// permissively-shaped input and serde's typed fields reject coerced values.

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PhaseRequestWire {
    #[serde(rename = "type")]
    pub tag: i32,
    pub timestamp: i64,
    pub id: String,
    pub controller_id: String,
    pub phase: i32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AckWire {
    #[serde(rename = "type")]
    pub tag: i32,
    pub timestamp: i64,
    pub id: String,
    pub mid: i32,
    pub rc: i32,
}
