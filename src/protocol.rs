// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode Fast
//! messages. The contents of this module are not needed for normal client or
//! server consumers of this crate, but they are exposed for the special case of
//! someone needing to implement custom client or server code.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::crc::{crc16_v1, crc16_v2, FastCrcMode};
use crate::error::{FastError, FastProtocolError, FastReason};

const FP_OFF_VERSION: usize = 0x0;
const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0x7;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

/// The size of a Fast message header
pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

/// The largest legal Fast message id. Message ids occupy a 31-bit space; the
/// high bit of the wire field must be zero.
pub const FP_MSGID_MAX: u32 = (1 << 31) - 1;

/// Iteration cap for the matching-CRC search. Past this many timestamp
/// perturbations the encoder gives up and emits the legacy CRC alone.
const FP_CRC_MATCH_LIMIT: usize = 500_000;

/// A data type representing the circular 31-bit Fast message id space.
/// The `next` associated function retrieves the next candidate id and wraps
/// at [`FP_MSGID_MAX`] back to zero. Callers that track in-flight requests
/// must skip candidates that are still outstanding.
#[derive(Default)]
pub struct FastMessageId(u32);

impl FastMessageId {
    /// Creates a new FastMessageId starting at zero.
    pub fn new() -> Self {
        FastMessageId(0)
    }
}

impl Iterator for FastMessageId {
    type Item = u32;

    /// Returns the next Fast message id and increments the value modulo the
    /// 31-bit id space.
    fn next(&mut self) -> Option<Self::Item> {
        let current = self.0;
        self.0 = if current == FP_MSGID_MAX {
            0
        } else {
            current + 1
        };
        Some(current)
    }
}

/// An error type representing a failure to parse a buffer as a Fast message.
#[derive(Debug)]
pub enum FastParseError {
    /// The buffer does not yet hold a complete header or payload. The
    /// caller should retry once more bytes arrive; no header state is
    /// retained across attempts.
    NotEnoughBytes(usize),
    /// The buffer holds a protocol violation. Terminal for the stream.
    Protocol(FastProtocolError),
}

impl From<FastProtocolError> for FastParseError {
    fn from(error: FastProtocolError) -> Self {
        FastParseError::Protocol(error)
    }
}

/// An error type representing Fast error messages that may be returned from a
/// Fast server. Only the properties carried here survive transmission; a
/// handler error's other properties are stripped at the server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FastMessageServerError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ase_errors: Option<Value>,
}

impl FastMessageServerError {
    pub fn new(name: &str, message: &str) -> Self {
        FastMessageServerError {
            name: String::from(name),
            message: String::from(message),
            info: None,
            context: None,
            ase_errors: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for FastMessageServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for FastMessageServerError {}

/// Represents the Type field of a Fast message. Currently there is only one
/// valid value, JSON.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone)]
pub enum FastMessageType {
    Json = 1,
}

/// Represents the Status field of a Fast message.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone)]
pub enum FastMessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

/// Represents the metadata about a `FastMessage` data payload. This includes a
/// timestamp and an RPC method name. The timestamp is optional on the wire;
/// when present it is microseconds since the Unix epoch, and it is the field
/// the matching-CRC search is allowed to perturb.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct FastMessageMetaData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uts: Option<u64>,
    pub name: String,
}

impl FastMessageMetaData {
    pub fn new(n: String) -> FastMessageMetaData {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let now_micros =
            now.as_secs() * 1_000_000 + u64::from(now.subsec_micros());

        FastMessageMetaData {
            uts: Some(now_micros),
            name: n,
        }
    }
}

/// Encapsulates the Fast message metadata and the JSON formatted message data.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct FastMessageData {
    pub m: FastMessageMetaData,
    pub d: Value,
}

impl FastMessageData {
    pub fn new(n: String, d: Value) -> FastMessageData {
        FastMessageData {
            m: FastMessageMetaData::new(n),
            d,
        }
    }
}

/// Represents a Fast message including the header and data payload
#[derive(Debug, Clone)]
pub struct FastMessage {
    /// The Type field of the Fast message
    pub msg_type: FastMessageType,
    /// The Status field of the Fast message
    pub status: FastMessageStatus,
    /// The Fast message identifier
    pub id: u32,
    /// The data payload of the Fast message
    pub data: FastMessageData,
    /// On encode, an optional concrete checksum mode overriding the codec's
    /// default. On decode, the mode under which the received checksum
    /// validated.
    pub crc_mode: Option<FastCrcMode>,
}

impl PartialEq for FastMessage {
    fn eq(&self, other: &FastMessage) -> bool {
        self.msg_type == other.msg_type
            && self.status == other.status
            && self.id == other.id
            && self.data == other.data
    }
}

impl FastMessage {
    /// Parse a byte buffer into a `FastMessage`, validating the payload
    /// checksum under `crc_mode`. On success returns the message and the
    /// number of bytes it occupied. Returns `FastParseError::NotEnoughBytes`
    /// if the buffer does not yet hold a complete message.
    pub fn parse(
        buf: &[u8],
        crc_mode: FastCrcMode,
    ) -> Result<(FastMessage, usize), FastParseError> {
        if buf.len() < FP_HEADER_SZ {
            return Err(FastParseError::NotEnoughBytes(buf.len()));
        }

        let version = buf[FP_OFF_VERSION];
        if version != FP_VERSION_CURRENT {
            return Err(FastProtocolError::new(
                FastReason::UnsupportedVersion,
                format!("unsupported version: {}", version),
            )
            .into());
        }

        let msg_type: FastMessageType =
            FromPrimitive::from_u8(buf[FP_OFF_TYPE]).ok_or_else(|| {
                FastProtocolError::new(
                    FastReason::UnsupportedType,
                    format!("unsupported type: {}", buf[FP_OFF_TYPE]),
                )
            })?;
        let status: FastMessageStatus =
            FromPrimitive::from_u8(buf[FP_OFF_STATUS]).ok_or_else(|| {
                FastProtocolError::new(
                    FastReason::UnsupportedStatus,
                    format!("unsupported status: {}", buf[FP_OFF_STATUS]),
                )
            })?;
        let msg_id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
        if msg_id > FP_MSGID_MAX {
            return Err(FastProtocolError::new(
                FastReason::InvalidMsgid,
                format!("invalid msgid: {}", msg_id),
            )
            .into());
        }
        let expected_crc =
            BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4])
                as usize;

        if buf.len() < FP_HEADER_SZ + data_len {
            return Err(FastParseError::NotEnoughBytes(buf.len()));
        }

        let raw_data = &buf[FP_OFF_DATA..FP_OFF_DATA + data_len];
        let decoded_mode =
            FastMessage::validate_crc(raw_data, expected_crc, crc_mode)?;
        let data = FastMessage::parse_data(raw_data, &status)?;

        Ok((
            FastMessage {
                msg_type,
                status,
                id: msg_id,
                data,
                crc_mode: Some(decoded_mode),
            },
            FP_HEADER_SZ + data_len,
        ))
    }

    /// Validate a payload checksum under the given mode. Returns the mode
    /// that matched; in dual-accept mode a payload matching both variants
    /// reports `V1V2`.
    fn validate_crc(
        data_buf: &[u8],
        crc: u32,
        mode: FastCrcMode,
    ) -> Result<FastCrcMode, FastProtocolError> {
        match mode {
            FastCrcMode::V1 => {
                let calculated = crc16_v1(data_buf);
                if crc == calculated {
                    Ok(FastCrcMode::V1)
                } else {
                    Err(FastProtocolError::bad_crc(crc, &[calculated]))
                }
            }
            FastCrcMode::V2 => {
                let calculated = crc16_v2(data_buf);
                if crc == calculated {
                    Ok(FastCrcMode::V2)
                } else {
                    Err(FastProtocolError::bad_crc(crc, &[calculated]))
                }
            }
            FastCrcMode::V1V2 => {
                let v1 = crc16_v1(data_buf);
                let v2 = crc16_v2(data_buf);
                match (crc == v1, crc == v2) {
                    (true, true) => Ok(FastCrcMode::V1V2),
                    (true, false) => Ok(FastCrcMode::V1),
                    (false, true) => Ok(FastCrcMode::V2),
                    (false, false) => {
                        Err(FastProtocolError::bad_crc(crc, &[v1, v2]))
                    }
                }
            }
        }
    }

    /// Parse and shape-check a payload for the given message status.
    fn parse_data(
        data_buf: &[u8],
        status: &FastMessageStatus,
    ) -> Result<FastMessageData, FastProtocolError> {
        let value: Value = serde_json::from_slice(data_buf).map_err(|e| {
            FastProtocolError::new(
                FastReason::InvalidJson,
                format!("failed to parse data payload as JSON: {}", e),
            )
        })?;

        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(FastProtocolError::new(
                    FastReason::BadData,
                    format!(
                        "data payload must be an object, found {}",
                        json_kind(&other)
                    ),
                ));
            }
        };

        let m = match obj.remove("m") {
            Some(Value::Object(m)) => m,
            _ => {
                return Err(FastProtocolError::new(
                    FastReason::BadData,
                    "data payload is missing metadata object \"m\"",
                ));
            }
        };
        let name = match m.get("name") {
            Some(Value::String(name)) => name.clone(),
            _ => {
                return Err(FastProtocolError::new(
                    FastReason::BadData,
                    "metadata \"m.name\" must be a string",
                ));
            }
        };
        let uts = match m.get("uts") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(uts) => Some(uts),
                None => {
                    return Err(FastProtocolError::new(
                        FastReason::BadData,
                        "metadata \"m.uts\" must be a non-negative integer",
                    ));
                }
            },
        };

        let d = obj.remove("d");
        let d = match status {
            FastMessageStatus::Data | FastMessageStatus::End => match d {
                Some(d @ Value::Array(_)) => d,
                _ => {
                    return Err(FastProtocolError::new(
                        FastReason::BadDataD,
                        "data payload \"d\" must be an array",
                    ));
                }
            },
            FastMessageStatus::Error => match d {
                Some(d @ Value::Object(_)) => {
                    let has_name =
                        matches!(d.get("name"), Some(Value::String(_)));
                    let has_message =
                        matches!(d.get("message"), Some(Value::String(_)));
                    if !(has_name && has_message) {
                        return Err(FastProtocolError::new(
                            FastReason::BadError,
                            "error payload \"d\" must carry string \
                             \"name\" and \"message\" properties",
                        ));
                    }
                    d
                }
                _ => {
                    return Err(FastProtocolError::new(
                        FastReason::BadError,
                        "error payload \"d\" must be an object",
                    ));
                }
            },
        };

        Ok(FastMessageData {
            m: FastMessageMetaData { uts, name },
            d,
        })
    }

    /// Returns a `FastMessage` that represents a Fast protocol `DATA` message
    /// with the provided message identifer and data payload.
    pub fn data(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Data,
            id: msg_id,
            data,
            crc_mode: None,
        }
    }

    /// Returns a `FastMessage` that represents a Fast protocol `END` message
    /// with the provided message identifer. The method parameter is used in the
    /// otherwise empty data payload.
    pub fn end(msg_id: u32, method: String) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            data: FastMessageData::new(method, Value::Array(vec![])),
            crc_mode: None,
        }
    }

    /// Returns an `END` message carrying the provided data payload.
    pub fn end_with(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            data,
            crc_mode: None,
        }
    }

    /// Returns a `FastMessage` that represents a Fast protocol `ERROR` message
    /// with the provided message identifer and data payload.
    pub fn error(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Error,
            id: msg_id,
            data,
            crc_mode: None,
        }
    }

    /// Sets a per-message checksum mode. Only concrete modes (`V1`, `V2`)
    /// are accepted at encode time.
    pub fn with_crc_mode(mut self, mode: FastCrcMode) -> FastMessage {
        self.crc_mode = Some(mode);
        self
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Serialize a payload and compute its checksum under the effective
/// encoding mode, which must be concrete.
///
/// For `V2` the corrected checksum is computed directly. For `V1` the
/// matching-CRC search runs: perturb `m.uts` and re-serialize until a
/// payload is found whose legacy and corrected checksums agree, so peers
/// validating with either variant accept the message. The search is
/// bounded by `FP_CRC_MATCH_LIMIT`; on exhaustion the last serialization is
/// emitted with its legacy checksum alone. Payloads without `m.uts` are
/// never perturbed and get the legacy checksum of their one serialization.
fn serialize_with_crc(
    data: &mut FastMessageData,
    mode: FastCrcMode,
) -> Result<(Vec<u8>, u32), FastError> {
    let mut buf = serde_json::to_vec(data)?;

    match mode {
        FastCrcMode::V2 => {
            let crc = crc16_v2(&buf);
            Ok((buf, crc))
        }
        FastCrcMode::V1 => {
            if data.m.uts.is_none() {
                let crc = crc16_v1(&buf);
                return Ok((buf, crc));
            }

            for _ in 0..FP_CRC_MATCH_LIMIT {
                let crc = crc16_v1(&buf);
                if crc == crc16_v2(&buf) {
                    return Ok((buf, crc));
                }
                if let Some(uts) = data.m.uts {
                    data.m.uts = Some(uts.wrapping_add(1));
                }
                buf = serde_json::to_vec(data)?;
            }

            // No collision within the cap; emit the legacy checksum only.
            let crc = crc16_v1(&buf);
            Ok((buf, crc))
        }
        FastCrcMode::V1V2 => Err(FastError::InvalidArgument(String::from(
            "dual-accept crc mode is not a valid encoding mode",
        ))),
    }
}

/// Encode a `FastMessage` into a byte buffer using `default_mode` where the
/// message does not carry its own concrete mode. The effective mode must
/// name a single variant: a message without an override cannot be encoded
/// by a dual-accept codec.
pub(crate) fn encode_msg(
    mut msg: FastMessage,
    buf: &mut BytesMut,
    default_mode: FastCrcMode,
) -> Result<(), FastError> {
    if msg.id > FP_MSGID_MAX {
        return Err(FastError::InvalidArgument(format!(
            "msgid {} is outside the 31-bit message id space",
            msg.id
        )));
    }
    let mode = match msg.crc_mode {
        Some(mode) => mode.require_concrete("per-message encoding")?,
        None => default_mode.require_concrete("message encoding")?,
    };

    let m_msg_type_u8 = msg.msg_type.to_u8();
    let m_status_u8 = msg.status.to_u8();
    match (m_msg_type_u8, m_status_u8) {
        (Some(msg_type_u8), Some(status_u8)) => {
            let (data_buf, crc) = serialize_with_crc(&mut msg.data, mode)?;
            let data_len = data_buf.len();
            buf.reserve(FP_HEADER_SZ + data_len);
            buf.put_u8(FP_VERSION_CURRENT);
            buf.put_u8(msg_type_u8);
            buf.put_u8(status_u8);
            buf.put_u32(msg.id);
            buf.put_u32(crc);
            buf.put_u32(data_len as u32);
            buf.put_slice(&data_buf);
            Ok(())
        }
        _ => Err(FastError::InvalidArgument(String::from(
            "invalid message type or status",
        ))),
    }
}

/// This type implements the functions necessary for the Fast protocol
/// framing. The checksum mode given at construction selects how received
/// checksums validate and, absent a per-message override, how outgoing
/// checksums are computed. A dual-accept codec can decode either variant
/// but cannot encode a message that does not carry a concrete per-message
/// mode.
///
/// Decode errors are terminal: once the codec reports a protocol error it
/// emits no further messages and keeps surfacing the same error.
pub struct FastRpc {
    crc_mode: FastCrcMode,
    latched: Option<FastProtocolError>,
}

impl FastRpc {
    pub fn new(crc_mode: FastCrcMode) -> FastRpc {
        FastRpc {
            crc_mode,
            latched: None,
        }
    }

    pub fn crc_mode(&self) -> FastCrcMode {
        self.crc_mode
    }

    fn latch(&mut self, error: FastProtocolError) -> FastError {
        self.latched = Some(error.clone());
        error.into()
    }
}

impl Default for FastRpc {
    fn default() -> Self {
        FastRpc::new(FastCrcMode::default())
    }
}

impl Decoder for FastRpc {
    type Item = FastMessage;
    type Error = FastError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastMessage>, FastError> {
        if let Some(err) = &self.latched {
            return Err(err.clone().into());
        }

        match FastMessage::parse(buf, self.crc_mode) {
            Ok((msg, msg_size)) => {
                buf.advance(msg_size);
                Ok(Some(msg))
            }
            Err(FastParseError::NotEnoughBytes(_)) => Ok(None),
            Err(FastParseError::Protocol(err)) => Err(self.latch(err)),
        }
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<FastMessage>, FastError> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            None => {
                let err = FastProtocolError::new(
                    FastReason::IncompleteMessage,
                    format!(
                        "transport ended with {} unconsumed bytes",
                        buf.len()
                    ),
                );
                Err(self.latch(err))
            }
        }
    }
}

impl Encoder<FastMessage> for FastRpc {
    type Error = FastError;

    fn encode(
        &mut self,
        item: FastMessage,
        buf: &mut BytesMut,
    ) -> Result<(), FastError> {
        encode_msg(item, buf, self.crc_mode)
    }
}
