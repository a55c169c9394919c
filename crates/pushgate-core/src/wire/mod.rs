//! Binary framing for the legacy APNS gateway and Feedback service.
//!
//! # Push frame
//!
//! The enhanced/binary format is a one-byte command (`2`), a four-byte
//! big-endian frame length, then a run of items, each `[id: u8]`
//! `[len: u16 BE]` `[bytes]`:
//!
//! ```text
//! ┌────┬──────────┬───────────────────────────────────────────┐
//! │ 02 │ frame len│ items: token, payload, identifier,        │
//! │    │ (u32 BE) │        expiration (optional), priority    │
//! └────┴──────────┴───────────────────────────────────────────┘
//! ```
//!
//! The gateway never acknowledges success. On failure it writes a six-byte
//! error response `[8][status][identifier: 4]` and closes the connection,
//! silently dropping everything written after the offending frame.
//!
//! The Feedback service speaks a different, fixed-width stream: 38-byte
//! tuples of `[timestamp: u32 BE][token len: u16 BE = 32][token: 32]`.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

use crate::notification::{Notification, Payload};

/// Command byte of a push frame.
pub const PUSH_FRAME_COMMAND: u8 = 2;

/// Command byte of a gateway error response.
pub const ERROR_RESPONSE_COMMAND: u8 = 8;

/// Total length of a gateway error response.
pub const ERROR_RESPONSE_LENGTH: usize = 6;

/// Item id of the device token.
pub const DEVICE_TOKEN_ITEM_ID: u8 = 1;

/// Decoded length of a device token, in bytes.
pub const DEVICE_TOKEN_LENGTH: usize = 32;

/// Item id of the JSON payload.
pub const PAYLOAD_ITEM_ID: u8 = 2;

/// Maximum JSON payload size accepted by the gateway, in bytes.
pub const PAYLOAD_MAX_LENGTH: usize = 2048;

/// Item id of the notification identifier.
pub const IDENTIFIER_ITEM_ID: u8 = 3;

/// Decoded length of a notification identifier, in bytes.
pub const IDENTIFIER_LENGTH: usize = 4;

/// Item id of the expiration date.
pub const EXPIRATION_ITEM_ID: u8 = 4;

/// Item id of the priority byte.
pub const PRIORITY_ITEM_ID: u8 = 5;

/// Total length of one Feedback service tuple.
pub const FEEDBACK_ENTRY_LENGTH: usize = 38;

/// Encode-time validation failures.
///
/// Nothing reaches the wire when any of these fire; the command owning the
/// notification reports the error on its private channel instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The device token is not valid hex.
    #[error("device token is not hex encoded: {0}")]
    DeviceTokenNotHex(String),

    /// The device token decodes to the wrong number of bytes.
    #[error("device token length is {actual} bytes but must be 32 bytes")]
    DeviceTokenLength {
        /// Decoded length in bytes.
        actual: usize,
    },

    /// The notification identifier is not valid hex.
    #[error("notification identifier is not hex encoded: {0}")]
    IdentifierNotHex(String),

    /// The notification identifier decodes to the wrong number of bytes.
    #[error("notification identifier length is {actual} bytes but must be 4 bytes")]
    IdentifierLength {
        /// Decoded length in bytes.
        actual: usize,
    },

    /// The JSON payload exceeds the gateway's limit.
    #[error("payload size is {size} bytes but must be at most 2048 bytes")]
    PayloadTooLarge {
        /// Serialized payload size in bytes.
        size: usize,
    },

    /// The payload has no `aps` dictionary.
    #[error("payload is missing the 'aps' dictionary")]
    MissingAps,

    /// The `aps` dictionary has no alert.
    #[error("payload 'aps' dictionary is missing an alert")]
    MissingAlert,

    /// A custom payload field tried to shadow `aps`.
    #[error("'aps' is reserved and cannot be used as a custom payload field")]
    ReservedCustomField,

    /// Payload JSON serialization failed.
    #[error("payload serialization failed: {0}")]
    PayloadSerialization(String),
}

/// Malformed bytes received from Apple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The gateway response was not a well-formed six-byte error frame.
    #[error("unrecognized gateway response")]
    UnrecognizedResponse,

    /// A Feedback service record was short or misaligned.
    #[error("unrecognized feedback service entry")]
    UnrecognizedFeedbackEntry,
}

/// Status codes of a gateway error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApnsStatus {
    /// 0: no errors encountered.
    NoErrors,
    /// 1: processing error.
    Processing,
    /// 2: missing device token.
    MissingDeviceToken,
    /// 3: missing topic.
    MissingTopic,
    /// 4: missing payload.
    MissingPayload,
    /// 5: invalid token size.
    InvalidTokenSize,
    /// 6: invalid topic size.
    InvalidTopicSize,
    /// 7: invalid payload size.
    InvalidPayloadSize,
    /// 8: invalid token.
    InvalidToken,
    /// 10: the gateway is shutting down.
    Shutdown,
    /// 255: unknown.
    Unknown,
}

impl ApnsStatus {
    /// Maps a wire status code to its entry in the fixed table.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NoErrors),
            1 => Some(Self::Processing),
            2 => Some(Self::MissingDeviceToken),
            3 => Some(Self::MissingTopic),
            4 => Some(Self::MissingPayload),
            5 => Some(Self::InvalidTokenSize),
            6 => Some(Self::InvalidTopicSize),
            7 => Some(Self::InvalidPayloadSize),
            8 => Some(Self::InvalidToken),
            10 => Some(Self::Shutdown),
            255 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Returns the wire status code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::NoErrors => 0,
            Self::Processing => 1,
            Self::MissingDeviceToken => 2,
            Self::MissingTopic => 3,
            Self::MissingPayload => 4,
            Self::InvalidTokenSize => 5,
            Self::InvalidTopicSize => 6,
            Self::InvalidPayloadSize => 7,
            Self::InvalidToken => 8,
            Self::Shutdown => 10,
            Self::Unknown => 255,
        }
    }

    /// Returns Apple's description of the status.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::NoErrors => "no errors encountered",
            Self::Processing => "processing error",
            Self::MissingDeviceToken => "missing device token",
            Self::MissingTopic => "missing topic",
            Self::MissingPayload => "missing payload",
            Self::InvalidTokenSize => "invalid token size",
            Self::InvalidTopicSize => "invalid topic size",
            Self::InvalidPayloadSize => "invalid payload size",
            Self::InvalidToken => "invalid token",
            Self::Shutdown => "shutdown",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ApnsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A decoded gateway error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Status code from the fixed table.
    pub status: ApnsStatus,
    /// Identifier of the offending notification, as 8 hex characters.
    pub identifier: String,
}

/// A decoded Feedback service tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackEntry {
    /// Seconds since the Unix epoch at which the token expired.
    pub timestamp: u32,
    /// Expired device token, as 64 hex characters.
    pub device_token: String,
}

/// Encodes the item run of a notification, without the frame header.
///
/// Items are emitted in id order; the expiration item only when a date is
/// set, the priority item always.
///
/// # Errors
///
/// Returns an [`EncodeError`] when the token or identifier fail hex/length
/// validation, the payload is oversized, or the payload is missing its
/// `aps`/alert.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to the wire ranges
pub fn encode_items(notification: &Notification) -> Result<BytesMut, EncodeError> {
    let token = hex::decode(&notification.device_token)
        .map_err(|err| EncodeError::DeviceTokenNotHex(err.to_string()))?;
    if token.len() != DEVICE_TOKEN_LENGTH {
        return Err(EncodeError::DeviceTokenLength {
            actual: token.len(),
        });
    }

    let payload = payload_wire_json(&notification.payload)?;
    if payload.len() > PAYLOAD_MAX_LENGTH {
        return Err(EncodeError::PayloadTooLarge {
            size: payload.len(),
        });
    }

    let identifier = hex::decode(&notification.identifier)
        .map_err(|err| EncodeError::IdentifierNotHex(err.to_string()))?;
    if identifier.len() != IDENTIFIER_LENGTH {
        return Err(EncodeError::IdentifierLength {
            actual: identifier.len(),
        });
    }

    let mut items = BytesMut::with_capacity(64 + payload.len());
    put_item(&mut items, DEVICE_TOKEN_ITEM_ID, &token);
    put_item(&mut items, PAYLOAD_ITEM_ID, &payload);
    put_item(&mut items, IDENTIFIER_ITEM_ID, &identifier);

    if let Some(expires) = notification.expiration_date {
        // Seconds since epoch, saturated to the u32 wire range.
        let seconds = expires.timestamp().clamp(0, i64::from(u32::MAX)) as u32;
        items.put_u8(EXPIRATION_ITEM_ID);
        items.put_u16(4);
        items.put_u32(seconds);
    }

    put_item(&mut items, PRIORITY_ITEM_ID, &[notification.priority]);

    Ok(items)
}

/// Encodes the complete push frame: command byte, frame length, items.
///
/// # Errors
///
/// Propagates any [`EncodeError`] from [`encode_items`].
#[allow(clippy::cast_possible_truncation)] // item runs stay far below u32::MAX
pub fn encode_push_frame(notification: &Notification) -> Result<Bytes, EncodeError> {
    let items = encode_items(notification)?;
    let mut frame = BytesMut::with_capacity(items.len() + 5);
    frame.put_u8(PUSH_FRAME_COMMAND);
    frame.put_u32(items.len() as u32);
    frame.put_slice(&items);
    Ok(frame.freeze())
}

#[allow(clippy::cast_possible_truncation)] // callers validate item sizes
fn put_item(buf: &mut BytesMut, id: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= usize::from(u16::MAX));
    buf.put_u8(id);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

/// Serializes the wire JSON payload: custom fields flattened beside `aps`.
fn payload_wire_json(payload: &Payload) -> Result<Vec<u8>, EncodeError> {
    let aps = payload.aps.as_ref().ok_or(EncodeError::MissingAps)?;
    if aps.alert.is_none() {
        return Err(EncodeError::MissingAlert);
    }
    if payload.custom_fields().contains_key("aps") {
        return Err(EncodeError::ReservedCustomField);
    }

    let mut object = payload.custom_fields().clone();
    let aps_value = serde_json::to_value(aps)
        .map_err(|err| EncodeError::PayloadSerialization(err.to_string()))?;
    object.insert("aps".to_string(), aps_value);

    serde_json::to_vec(&Value::Object(object))
        .map_err(|err| EncodeError::PayloadSerialization(err.to_string()))
}

/// Decodes a gateway error response.
///
/// # Errors
///
/// Returns [`WireError::UnrecognizedResponse`] when the input is not six
/// bytes, does not start with command byte `8`, or carries a status code
/// outside the fixed table.
pub fn decode_error_response(data: &[u8]) -> Result<ErrorResponse, WireError> {
    if data.len() != ERROR_RESPONSE_LENGTH || data[0] != ERROR_RESPONSE_COMMAND {
        return Err(WireError::UnrecognizedResponse);
    }

    let status = ApnsStatus::from_code(data[1]).ok_or(WireError::UnrecognizedResponse)?;
    Ok(ErrorResponse {
        status,
        identifier: hex::encode(&data[2..ERROR_RESPONSE_LENGTH]),
    })
}

/// Decodes one 38-byte Feedback service tuple.
///
/// # Errors
///
/// Returns [`WireError::UnrecognizedFeedbackEntry`] when the record is not
/// exactly 38 bytes or its token-length field is not 32.
pub fn decode_feedback_entry(data: &[u8]) -> Result<FeedbackEntry, WireError> {
    if data.len() != FEEDBACK_ENTRY_LENGTH {
        return Err(WireError::UnrecognizedFeedbackEntry);
    }

    let mut buf = data;
    let timestamp = buf.get_u32();
    let token_length = buf.get_u16();
    if usize::from(token_length) != DEVICE_TOKEN_LENGTH {
        return Err(WireError::UnrecognizedFeedbackEntry);
    }

    Ok(FeedbackEntry {
        timestamp,
        device_token: hex::encode(buf),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::notification::AlertValue;

    fn valid_notification() -> Notification {
        let mut notification = Notification::new();
        notification.device_token = "00".repeat(32);
        notification.identifier = "aabbccdd".to_string();
        if let Some(aps) = notification.payload.aps.as_mut() {
            aps.alert = Some(AlertValue::from("hi"));
        }
        notification
    }

    #[test]
    fn test_frame_header_and_length() {
        let notification = valid_notification();
        let frame = encode_push_frame(&notification).unwrap();

        assert_eq!(frame[0], PUSH_FRAME_COMMAND);
        let declared = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(declared, frame.len() - 5);
    }

    #[test]
    fn test_item_layout_and_order() {
        let mut notification = valid_notification();
        notification.priority = 10;
        notification.expiration_date = DateTime::<Utc>::from_timestamp(1_700_000_000, 0);

        let items = encode_items(&notification).unwrap();
        let mut buf = &items[..];
        let mut seen = Vec::new();
        let mut total = 0usize;
        while buf.has_remaining() {
            let id = buf.get_u8();
            let len = usize::from(buf.get_u16());
            seen.push((id, len));
            total += 3 + len;
            buf.advance(len);
        }

        assert_eq!(total, items.len());
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], (DEVICE_TOKEN_ITEM_ID, DEVICE_TOKEN_LENGTH));
        assert_eq!(seen[1].0, PAYLOAD_ITEM_ID);
        assert_eq!(seen[2], (IDENTIFIER_ITEM_ID, IDENTIFIER_LENGTH));
        assert_eq!(seen[3], (EXPIRATION_ITEM_ID, 4));
        assert_eq!(seen[4], (PRIORITY_ITEM_ID, 1));
    }

    #[test]
    fn test_expiration_item_omitted_when_unset() {
        let items = encode_items(&valid_notification()).unwrap();
        let mut buf = &items[..];
        let mut ids = Vec::new();
        while buf.has_remaining() {
            let id = buf.get_u8();
            let len = usize::from(buf.get_u16());
            ids.push(id);
            buf.advance(len);
        }
        assert_eq!(
            ids,
            vec![DEVICE_TOKEN_ITEM_ID, PAYLOAD_ITEM_ID, IDENTIFIER_ITEM_ID, PRIORITY_ITEM_ID]
        );
    }

    #[test]
    fn test_device_token_round_trips_through_item() {
        let mut notification = valid_notification();
        notification.device_token =
            "b8e0c9ce2114fc73adf117de0c97376626ef9c34bbfec4fe18e1fe0b96321cae".to_string();

        let items = encode_items(&notification).unwrap();
        // First item: id, length, then the raw token bytes.
        assert_eq!(items[0], DEVICE_TOKEN_ITEM_ID);
        let token = &items[3..3 + DEVICE_TOKEN_LENGTH];
        assert_eq!(hex::encode(token), notification.device_token);
    }

    #[test]
    fn test_device_token_validation() {
        let mut notification = valid_notification();

        notification.device_token = "not-hex".to_string();
        assert!(matches!(
            encode_items(&notification),
            Err(EncodeError::DeviceTokenNotHex(_))
        ));

        // 62 hex chars decode to 31 bytes; the message reports bytes.
        notification.device_token = "00".repeat(31);
        let err = encode_items(&notification).unwrap_err();
        assert_eq!(err, EncodeError::DeviceTokenLength { actual: 31 });
        assert!(err.to_string().contains("31 bytes"));
    }

    #[test]
    fn test_identifier_validation() {
        let mut notification = valid_notification();

        notification.identifier = "An identifier".to_string();
        assert!(matches!(
            encode_items(&notification),
            Err(EncodeError::IdentifierNotHex(_))
        ));

        notification.identifier = "aabbccddee".to_string();
        assert_eq!(
            encode_items(&notification).unwrap_err(),
            EncodeError::IdentifierLength { actual: 5 }
        );
    }

    #[test]
    fn test_payload_size_boundary() {
        // Fixed wire-JSON bytes around a bare string alert.
        let probe = serde_json::json!({"aps": {"alert": ""}});
        let overhead = serde_json::to_vec(&probe).unwrap().len();

        // Exactly 2048 bytes encodes.
        let mut notification = valid_notification();
        if let Some(aps) = notification.payload.aps.as_mut() {
            aps.alert = Some(AlertValue::Text("0".repeat(PAYLOAD_MAX_LENGTH - overhead)));
        }
        assert!(encode_items(&notification).is_ok());

        // 2049 bytes is rejected.
        if let Some(aps) = notification.payload.aps.as_mut() {
            aps.alert = Some(AlertValue::Text("0".repeat(PAYLOAD_MAX_LENGTH - overhead + 1)));
        }
        assert_eq!(
            encode_items(&notification).unwrap_err(),
            EncodeError::PayloadTooLarge {
                size: PAYLOAD_MAX_LENGTH + 1
            }
        );
    }

    #[test]
    fn test_missing_aps_and_alert() {
        let mut notification = valid_notification();
        notification.payload.aps = None;
        assert_eq!(
            encode_items(&notification).unwrap_err(),
            EncodeError::MissingAps
        );

        let mut notification = valid_notification();
        if let Some(aps) = notification.payload.aps.as_mut() {
            aps.alert = None;
        }
        assert_eq!(
            encode_items(&notification).unwrap_err(),
            EncodeError::MissingAlert
        );
    }

    #[test]
    fn test_reserved_custom_field() {
        let mut notification = valid_notification();
        notification.payload.add_custom_field("aps", "bogus");
        assert_eq!(
            encode_items(&notification).unwrap_err(),
            EncodeError::ReservedCustomField
        );
    }

    #[test]
    fn test_wire_payload_flattens_custom_fields() {
        let mut notification = valid_notification();
        notification.payload.add_custom_field("weather", "sunny");

        let items = encode_items(&notification).unwrap();
        // Second item is the payload; locate it after the token item.
        let mut buf = &items[3 + DEVICE_TOKEN_LENGTH..];
        assert_eq!(buf.get_u8(), PAYLOAD_ITEM_ID);
        let len = usize::from(buf.get_u16());
        let payload: Value = serde_json::from_slice(&buf[..len]).unwrap();

        assert_eq!(payload["weather"], "sunny");
        assert_eq!(payload["aps"]["alert"], "hi");
    }

    #[test]
    fn test_wire_payload_with_dictionary_alert() {
        let mut notification = valid_notification();
        if let Some(aps) = notification.payload.aps.as_mut() {
            aps.alert = Some(AlertValue::Dictionary(crate::notification::Alert {
                title: Some("Hi!".to_string()),
                body: Some("Hello".to_string()),
                loc_args: vec!["a".to_string(), "b".to_string()],
                ..Default::default()
            }));
        }
        notification.payload.add_custom_field("x", 1);

        let items = encode_items(&notification).unwrap();
        let mut buf = &items[3 + DEVICE_TOKEN_LENGTH..];
        assert_eq!(buf.get_u8(), PAYLOAD_ITEM_ID);
        let len = usize::from(buf.get_u16());
        assert!(len < PAYLOAD_MAX_LENGTH);
        let payload: Value = serde_json::from_slice(&buf[..len]).unwrap();

        assert_eq!(payload["x"], 1);
        assert!(payload["aps"]["alert"].is_object());
        assert_eq!(payload["aps"]["alert"]["loc-args"][1], "b");
    }

    #[test]
    fn test_decode_error_response() {
        let response = decode_error_response(&[8, 8, 0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        assert_eq!(response.status, ApnsStatus::InvalidToken);
        assert_eq!(response.identifier, "aabbccdd");
    }

    #[test]
    fn test_decode_error_response_rejects_malformed_input() {
        // Wrong command byte.
        assert_eq!(
            decode_error_response(&[7, 8, 0, 0, 0, 0]).unwrap_err(),
            WireError::UnrecognizedResponse
        );
        // Short read.
        assert_eq!(
            decode_error_response(&[8, 8, 0]).unwrap_err(),
            WireError::UnrecognizedResponse
        );
        // Status code outside the fixed table.
        assert_eq!(
            decode_error_response(&[8, 9, 0, 0, 0, 0]).unwrap_err(),
            WireError::UnrecognizedResponse
        );
    }

    #[test]
    fn test_decode_error_response_all_table_entries() {
        for code in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 10, 255] {
            let response = decode_error_response(&[8, code, 0, 0, 0, 1]).unwrap();
            assert_eq!(response.status.code(), code);
            assert_eq!(response.identifier, "00000001");
        }
    }

    #[test]
    fn test_decode_feedback_entry() {
        let mut record = vec![0, 0, 0, 2, 0, 32];
        record.extend_from_slice(&[0xFF; 32]);

        let entry = decode_feedback_entry(&record).unwrap();
        assert_eq!(entry.timestamp, 2);
        assert_eq!(entry.device_token, "ff".repeat(32));
    }

    #[test]
    fn test_decode_feedback_entry_rejects_malformed_records() {
        assert_eq!(
            decode_feedback_entry(&[0; 37]).unwrap_err(),
            WireError::UnrecognizedFeedbackEntry
        );

        // Correct length, wrong token-length field.
        let mut record = vec![0, 0, 0, 1, 0, 31];
        record.extend_from_slice(&[0; 32]);
        assert_eq!(
            decode_feedback_entry(&record).unwrap_err(),
            WireError::UnrecognizedFeedbackEntry
        );
    }
}
