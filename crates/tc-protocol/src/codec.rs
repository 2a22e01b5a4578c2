//! Wire codecs for the phase-request protocol.
//!
//! # Binary layout
//!
//! Fixed-width big-endian records.  Every kind's layout is a strict superset
//! prefix of the bare identifier record, so a decoder can peek the leading
//! type tag and then decode the full record without re-reading:
//!
//! | Kind         | Fields (in order)                                                        | Size |
//! |--------------|--------------------------------------------------------------------------|------|
//! | Identifier   | type:i32, timestamp:i64, id:[u8;64]                                      | 76   |
//! | PhaseRequest | type:i32, timestamp:i64, user_id:[u8;64], controller_id:[u8;64], phase:i32 | 144 |
//! | Ack          | type:i32, timestamp:i64, user_id:[u8;64], acked_mid:i32, rc:i32          | 84   |
//! | AdminCommand | type:i32, timestamp:i64, user_id:[u8;64], controller_id:[u8;64]          | 140  |
//!
//! Id fields are NUL-padded on encode and trimmed of trailing NULs on decode.
//!
//! # JSON layout
//!
//! Phase requests and acks also round-trip as flat JSON objects (the wire
//! structs in the crate root).  Decoding is strict: exact key set, exact
//! value types.  A payload whose leading four bytes are not a known binary
//! tag falls back to JSON decoding, dispatching on the parsed `"type"` field.

use crate::{
    Ack, AckWire, AdminAction, AdminCommand, Decoded, Identifier, MAX_ID_BYTES, Message,
    PhaseRequest, PhaseRequestWire, ResultCode, WireFormat, type_tags,
};
use thiserror::Error;

/// Record sizes, in bytes.
pub const IDENTIFIER_LEN: usize = 4 + 8 + MAX_ID_BYTES;
pub const PHASE_REQUEST_LEN: usize = 4 + 8 + MAX_ID_BYTES + MAX_ID_BYTES + 4;
pub const ACK_LEN: usize = 4 + 8 + MAX_ID_BYTES + 4 + 4;
pub const ADMIN_COMMAND_LEN: usize = 4 + 8 + MAX_ID_BYTES + MAX_ID_BYTES;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short for a type tag ({0} bytes)")]
    Truncated(usize),
    #[error("payload length {len} does not match a {kind} record")]
    BadLength { kind: &'static str, len: usize },
    #[error("type tag {0} is not a known binary kind and the payload is not JSON")]
    UnknownTag(i32),
    #[error("id field is not valid UTF-8")]
    BadUtf8(#[from] std::str::Utf8Error),
    #[error("unknown result code {0}")]
    UnknownResultCode(i32),
    #[error("JSON payload does not match any message shape: {0}")]
    JsonShape(String),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("id `{id}` exceeds {} UTF-8 bytes (got {len})", MAX_ID_BYTES)]
    IdTooLong { id: String, len: usize },
    #[error("{0} messages have no JSON representation")]
    NoJsonForm(&'static str),
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

impl Message {
    /// Serialize in the requested representation.
    ///
    /// Binary covers every kind; JSON covers phase requests and acks only.
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, EncodeError> {
        match format {
            WireFormat::Binary => self.encode_binary(),
            WireFormat::Json => self.encode_json(),
        }
    }

    fn encode_binary(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Message::Will(ident) | Message::Ping(ident) => {
                let mut buf = Vec::with_capacity(IDENTIFIER_LEN);
                put_i32(&mut buf, self.type_tag());
                put_i64(&mut buf, ident.timestamp);
                put_id(&mut buf, &ident.id)?;
                Ok(buf)
            }
            Message::Phase(req) | Message::PhaseOn(req) | Message::PhaseOff(req) => {
                let mut buf = Vec::with_capacity(PHASE_REQUEST_LEN);
                put_i32(&mut buf, self.type_tag());
                put_i64(&mut buf, req.timestamp);
                put_id(&mut buf, &req.user_id)?;
                put_id(&mut buf, &req.controller_id)?;
                put_i32(&mut buf, req.phase);
                Ok(buf)
            }
            Message::Ack(ack) => {
                let mut buf = Vec::with_capacity(ACK_LEN);
                put_i32(&mut buf, self.type_tag());
                put_i64(&mut buf, ack.timestamp);
                put_id(&mut buf, &ack.user_id)?;
                put_i32(&mut buf, ack.acked_mid);
                put_i32(&mut buf, ack.result.code());
                Ok(buf)
            }
            Message::Admin(cmd) => {
                let mut buf = Vec::with_capacity(ADMIN_COMMAND_LEN);
                put_i32(&mut buf, self.type_tag());
                put_i64(&mut buf, cmd.timestamp);
                put_id(&mut buf, &cmd.user_id)?;
                put_id(&mut buf, &cmd.controller_id)?;
                Ok(buf)
            }
        }
    }

    fn encode_json(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Message::Phase(req) | Message::PhaseOn(req) | Message::PhaseOff(req) => {
                check_id(&req.user_id)?;
                check_id(&req.controller_id)?;
                let wire = PhaseRequestWire {
                    tag: self.type_tag(),
                    timestamp: req.timestamp,
                    id: req.user_id.clone(),
                    controller_id: req.controller_id.clone(),
                    phase: req.phase,
                };
                Ok(serde_json::to_vec(&wire)?)
            }
            Message::Ack(ack) => {
                check_id(&ack.user_id)?;
                let wire = AckWire {
                    tag: self.type_tag(),
                    timestamp: ack.timestamp,
                    id: ack.user_id.clone(),
                    mid: ack.acked_mid,
                    rc: ack.result.code(),
                };
                Ok(serde_json::to_vec(&wire)?)
            }
            Message::Will(_) => Err(EncodeError::NoJsonForm("will")),
            Message::Ping(_) => Err(EncodeError::NoJsonForm("ping")),
            Message::Admin(_) => Err(EncodeError::NoJsonForm("admin")),
        }
    }
}

fn check_id(id: &str) -> Result<(), EncodeError> {
    if id.len() > MAX_ID_BYTES {
        return Err(EncodeError::IdTooLong {
            id: id.to_owned(),
            len: id.len(),
        });
    }
    Ok(())
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_id(buf: &mut Vec<u8>, id: &str) -> Result<(), EncodeError> {
    check_id(id)?;
    buf.extend_from_slice(id.as_bytes());
    buf.resize(buf.len() + (MAX_ID_BYTES - id.len()), 0);
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a payload, stamping the result with the wire format used and the
/// caller-supplied transport message id.
///
/// The leading 4-byte big-endian signed integer selects the binary kind; a
/// tag that matches no binary kind falls back to JSON decoding.  `mid` is the
/// transport-assigned delivery id (absent for QoS-0 deliveries) and is echoed
/// back in acks and used for duplicate suppression.
pub fn decode(payload: &[u8], mid: Option<u32>) -> Result<Decoded, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::Truncated(payload.len()));
    }
    let tag = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let (message, encoding) = match tag {
        type_tags::WILL | type_tags::ID => (decode_identifier(tag, payload)?, WireFormat::Binary),
        type_tags::PHASE_REQUEST | type_tags::PHASE_REQUEST_ON | type_tags::PHASE_REQUEST_OFF => {
            (decode_phase_request(tag, payload)?, WireFormat::Binary)
        }
        type_tags::ACK => (decode_ack(payload)?, WireFormat::Binary),
        type_tags::ADMIN_REBOOT | type_tags::ADMIN_WIFI_ENABLE | type_tags::ADMIN_WIFI_DISABLE => {
            (decode_admin(tag, payload)?, WireFormat::Binary)
        }
        _ => (decode_json(tag, payload)?, WireFormat::Json),
    };
    Ok(Decoded {
        message,
        encoding,
        mid,
    })
}

fn decode_identifier(tag: i32, payload: &[u8]) -> Result<Message, DecodeError> {
    expect_len("identifier", IDENTIFIER_LEN, payload)?;
    let timestamp = get_i64(payload, 4);
    let id = get_id(payload, 12)?;
    let ident = Identifier { timestamp, id };
    Ok(match tag {
        type_tags::WILL => Message::Will(ident),
        _ => Message::Ping(ident),
    })
}

fn decode_phase_request(tag: i32, payload: &[u8]) -> Result<Message, DecodeError> {
    expect_len("phase request", PHASE_REQUEST_LEN, payload)?;
    let req = PhaseRequest {
        timestamp: get_i64(payload, 4),
        user_id: get_id(payload, 12)?,
        controller_id: get_id(payload, 12 + MAX_ID_BYTES)?,
        phase: get_i32(payload, 12 + 2 * MAX_ID_BYTES),
    };
    Ok(match tag {
        type_tags::PHASE_REQUEST_ON => Message::PhaseOn(req),
        type_tags::PHASE_REQUEST_OFF => Message::PhaseOff(req),
        _ => Message::Phase(req),
    })
}

fn decode_ack(payload: &[u8]) -> Result<Message, DecodeError> {
    expect_len("ack", ACK_LEN, payload)?;
    let rc = get_i32(payload, 12 + MAX_ID_BYTES + 4);
    let result = ResultCode::from_code(rc).ok_or(DecodeError::UnknownResultCode(rc))?;
    Ok(Message::Ack(Ack {
        timestamp: get_i64(payload, 4),
        user_id: get_id(payload, 12)?,
        acked_mid: get_i32(payload, 12 + MAX_ID_BYTES),
        result,
    }))
}

fn decode_admin(tag: i32, payload: &[u8]) -> Result<Message, DecodeError> {
    expect_len("admin command", ADMIN_COMMAND_LEN, payload)?;
    let action = match tag {
        type_tags::ADMIN_REBOOT => AdminAction::Reboot,
        type_tags::ADMIN_WIFI_ENABLE => AdminAction::WifiEnable,
        _ => AdminAction::WifiDisable,
    };
    Ok(Message::Admin(AdminCommand {
        timestamp: get_i64(payload, 4),
        action,
        user_id: get_id(payload, 12)?,
        controller_id: get_id(payload, 12 + MAX_ID_BYTES)?,
    }))
}

fn decode_json(tag: i32, payload: &[u8]) -> Result<Message, DecodeError> {
    // The tag bytes were not a known binary kind; if the payload is not JSON
    // either, report the tag so the log shows what the peer actually sent.
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(_) => return Err(DecodeError::UnknownTag(tag)),
    };
    let json_tag = value
        .get("type")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| DecodeError::JsonShape("missing integer `type` field".to_owned()))?;
    match i32::try_from(json_tag) {
        Ok(
            t @ (type_tags::PHASE_REQUEST
            | type_tags::PHASE_REQUEST_ON
            | type_tags::PHASE_REQUEST_OFF),
        ) => {
            let wire: PhaseRequestWire = serde_json::from_value(value)
                .map_err(|e| DecodeError::JsonShape(e.to_string()))?;
            let req = PhaseRequest {
                timestamp: wire.timestamp,
                user_id: wire.id,
                controller_id: wire.controller_id,
                phase: wire.phase,
            };
            Ok(match t {
                type_tags::PHASE_REQUEST_ON => Message::PhaseOn(req),
                type_tags::PHASE_REQUEST_OFF => Message::PhaseOff(req),
                _ => Message::Phase(req),
            })
        }
        Ok(type_tags::ACK) => {
            let wire: AckWire = serde_json::from_value(value)
                .map_err(|e| DecodeError::JsonShape(e.to_string()))?;
            let result =
                ResultCode::from_code(wire.rc).ok_or(DecodeError::UnknownResultCode(wire.rc))?;
            Ok(Message::Ack(Ack {
                timestamp: wire.timestamp,
                user_id: wire.id,
                acked_mid: wire.mid,
                result,
            }))
        }
        _ => Err(DecodeError::JsonShape(format!(
            "type {json_tag} has no JSON mapping"
        ))),
    }
}

fn expect_len(kind: &'static str, want: usize, payload: &[u8]) -> Result<(), DecodeError> {
    if payload.len() != want {
        return Err(DecodeError::BadLength {
            kind,
            len: payload.len(),
        });
    }
    Ok(())
}

fn get_i32(payload: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

fn get_i64(payload: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[at..at + 8]);
    i64::from_be_bytes(raw)
}

fn get_id(payload: &[u8], at: usize) -> Result<String, DecodeError> {
    let field = &payload[at..at + MAX_ID_BYTES];
    let end = field
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    Ok(std::str::from_utf8(&field[..end])?.to_owned())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> PhaseRequest {
        PhaseRequest {
            timestamp: 1_700_000_000,
            user_id: "bike-7".to_owned(),
            controller_id: "beacon-1".to_owned(),
            phase: 2,
        }
    }

    #[test]
    fn binary_round_trip_all_kinds() {
        let messages = vec![
            Message::Will(Identifier {
                timestamp: 17,
                id: "beacon-1".to_owned(),
            }),
            Message::Ping(Identifier {
                timestamp: 18,
                id: "bike-7".to_owned(),
            }),
            Message::Phase(sample_request()),
            Message::PhaseOn(sample_request()),
            Message::PhaseOff(sample_request()),
            Message::Ack(Ack {
                timestamp: 19,
                user_id: "bike-7".to_owned(),
                acked_mid: 42,
                result: ResultCode::Ok,
            }),
            Message::Admin(AdminCommand {
                timestamp: 20,
                action: AdminAction::WifiEnable,
                user_id: "ops".to_owned(),
                controller_id: "beacon-1".to_owned(),
            }),
        ];
        for msg in messages {
            let payload = msg.encode(WireFormat::Binary).expect("encode");
            let decoded = decode(&payload, Some(7)).expect("decode");
            assert_eq!(decoded.message, msg);
            assert_eq!(decoded.encoding, WireFormat::Binary);
            assert_eq!(decoded.mid, Some(7));
        }
    }

    #[test]
    fn json_round_trip_phase_request_and_ack() {
        let on = Message::PhaseOn(sample_request());
        let payload = on.encode(WireFormat::Json).expect("encode");
        let decoded = decode(&payload, Some(9)).expect("decode");
        assert_eq!(decoded.message, on);
        assert_eq!(decoded.encoding, WireFormat::Json);
        assert_eq!(decoded.mid, Some(9));

        let ack = Message::Ack(Ack {
            timestamp: 3,
            user_id: "bike-7".to_owned(),
            acked_mid: 9,
            result: ResultCode::DuplicateMid,
        });
        let payload = ack.encode(WireFormat::Json).expect("encode");
        let decoded = decode(&payload, None).expect("decode");
        assert_eq!(decoded.message, ack);
        assert_eq!(decoded.encoding, WireFormat::Json);
        assert_eq!(decoded.mid, None);
    }

    #[test]
    fn json_rejects_extra_field() {
        let raw = br#"{"type":2,"timestamp":1,"id":"u","controller_id":"c","phase":1,"extra":0}"#;
        let err = decode(raw, None).expect_err("extra field must fail");
        assert!(matches!(err, DecodeError::JsonShape(_)), "got {err:?}");
    }

    #[test]
    fn json_rejects_missing_field() {
        let raw = br#"{"type":2,"timestamp":1,"id":"u","phase":1}"#;
        let err = decode(raw, None).expect_err("missing field must fail");
        assert!(matches!(err, DecodeError::JsonShape(_)), "got {err:?}");
    }

    #[test]
    fn json_rejects_coerced_value_types() {
        // phase as a string must not be silently coerced
        let raw = br#"{"type":2,"timestamp":1,"id":"u","controller_id":"c","phase":"1"}"#;
        assert!(matches!(
            decode(raw, None),
            Err(DecodeError::JsonShape(_))
        ));
        // fractional timestamp must not be rounded
        let raw = br#"{"type":2,"timestamp":1.5,"id":"u","controller_id":"c","phase":1}"#;
        assert!(matches!(
            decode(raw, None),
            Err(DecodeError::JsonShape(_))
        ));
    }

    #[test]
    fn json_rejects_unmapped_type() {
        let raw = br#"{"type":5,"timestamp":1,"id":"u","controller_id":"c","phase":1}"#;
        assert!(matches!(
            decode(raw, None),
            Err(DecodeError::JsonShape(_))
        ));
    }

    #[test]
    fn json_rejects_unknown_ack_result_code() {
        let raw = br#"{"type":4,"timestamp":1,"id":"u","mid":3,"rc":17}"#;
        assert!(matches!(
            decode(raw, None),
            Err(DecodeError::UnknownResultCode(17))
        ));
    }

    #[test]
    fn will_and_ping_have_no_json_form() {
        let will = Message::Will(Identifier {
            timestamp: 0,
            id: "beacon-1".to_owned(),
        });
        assert!(matches!(
            will.encode(WireFormat::Json),
            Err(EncodeError::NoJsonForm("will"))
        ));
    }

    #[test]
    fn oversized_id_fails_encoding() {
        let long = "x".repeat(MAX_ID_BYTES + 1);
        let msg = Message::Ping(Identifier {
            timestamp: 0,
            id: long,
        });
        assert!(matches!(
            msg.encode(WireFormat::Binary),
            Err(EncodeError::IdTooLong { .. })
        ));
    }

    #[test]
    fn max_length_id_encodes_and_round_trips() {
        let id = "y".repeat(MAX_ID_BYTES);
        let msg = Message::Ping(Identifier { timestamp: 1, id });
        let payload = msg.encode(WireFormat::Binary).expect("encode");
        assert_eq!(payload.len(), IDENTIFIER_LEN);
        assert_eq!(decode(&payload, None).expect("decode").message, msg);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = decode(&[0, 0, 0], None).expect_err("3 bytes cannot carry a tag");
        assert!(matches!(err, DecodeError::Truncated(3)));
    }

    #[test]
    fn wrong_length_for_kind_is_rejected() {
        let mut payload = Message::Ping(Identifier {
            timestamp: 1,
            id: "u".to_owned(),
        })
        .encode(WireFormat::Binary)
        .expect("encode");
        payload.pop();
        let err = decode(&payload, None).expect_err("short record must fail");
        assert!(matches!(err, DecodeError::BadLength { kind: "identifier", .. }));
    }

    #[test]
    fn unknown_tag_without_json_fallback_is_rejected() {
        let mut payload = vec![0, 0, 0, 99];
        payload.extend_from_slice(&[0u8; 72]);
        let err = decode(&payload, None).expect_err("tag 99 is not a kind");
        assert!(matches!(err, DecodeError::UnknownTag(99)));
    }

    #[test]
    fn invalid_utf8_in_id_field_is_rejected() {
        let mut payload = Message::Ping(Identifier {
            timestamp: 1,
            id: "abc".to_owned(),
        })
        .encode(WireFormat::Binary)
        .expect("encode");
        payload[12] = 0xFF;
        assert!(matches!(
            decode(&payload, None),
            Err(DecodeError::BadUtf8(_))
        ));
    }

    #[test]
    fn trailing_nul_padding_is_trimmed() {
        let payload = Message::PhaseOn(sample_request())
            .encode(WireFormat::Binary)
            .expect("encode");
        let decoded = decode(&payload, None).expect("decode");
        match decoded.message {
            Message::PhaseOn(req) => {
                assert_eq!(req.user_id, "bike-7");
                assert_eq!(req.controller_id, "beacon-1");
            }
            other => panic!("expected PhaseOn, got {other:?}"),
        }
    }
}
