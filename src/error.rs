// Copyright 2020 Joyent, Inc.

//! Error taxonomy for the Fast protocol implementation.
//!
//! Connection-scoped faults (`FastProtocolError`, `FastTransportError`) are
//! terminal for the connection that raised them; request-scoped faults
//! (`FastServerError`) terminate only the request they belong to. Everything
//! a caller observes for a failed RPC is a `FastRequestError` whose source
//! chain leads back to the original cause. A server-reported failure
//! produces the three-layer chain request error → server error → the error
//! the handler supplied.

use std::fmt;
use std::io;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::protocol::FastMessageServerError;

/// The structured reason attached to protocol errors, transmitted as the
/// `fastReason` member of the error `info` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastReason {
    UnsupportedVersion,
    UnsupportedType,
    UnsupportedStatus,
    InvalidMsgid,
    BadCrc,
    InvalidJson,
    BadData,
    BadDataD,
    BadError,
    IncompleteMessage,
    UnknownMsgid,
    BadMethod,
}

impl fmt::Display for FastReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FastReason::UnsupportedVersion => "unsupported_version",
            FastReason::UnsupportedType => "unsupported_type",
            FastReason::UnsupportedStatus => "unsupported_status",
            FastReason::InvalidMsgid => "invalid_msgid",
            FastReason::BadCrc => "bad_crc",
            FastReason::InvalidJson => "invalid_json",
            FastReason::BadData => "bad_data",
            FastReason::BadDataD => "bad_data_d",
            FastReason::BadError => "bad_error",
            FastReason::IncompleteMessage => "incomplete_message",
            FastReason::UnknownMsgid => "unknown_msgid",
            FastReason::BadMethod => "bad_method",
        };
        f.write_str(s)
    }
}

/// A wire, framing, or checksum fault. Terminal for the connection.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("fast protocol error ({reason}): {message}")]
pub struct FastProtocolError {
    pub reason: FastReason,
    pub message: String,
}

impl FastProtocolError {
    pub fn new(reason: FastReason, message: impl Into<String>) -> Self {
        FastProtocolError {
            reason,
            message: message.into(),
        }
    }

    /// A checksum mismatch, reporting the value carried by the header
    /// against the value(s) computed over the payload.
    pub fn bad_crc(expected: u32, calculated: &[u32]) -> Self {
        let calculated = calculated
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" or ");
        FastProtocolError::new(
            FastReason::BadCrc,
            format!(
                "expected CRC {}, calculated {}",
                expected, calculated
            ),
        )
    }

    /// The structured `info` object for this error.
    pub fn info(&self) -> Value {
        json!({ "fastReason": self.reason })
    }
}

/// A failure of the underlying byte transport. Terminal for the connection.
#[derive(Debug, Error)]
#[error("fast transport error: {message}")]
pub struct FastTransportError {
    pub message: String,
    #[source]
    pub source: Option<io::Error>,
}

impl FastTransportError {
    pub fn new(message: impl Into<String>) -> Self {
        FastTransportError {
            message: message.into(),
            source: None,
        }
    }
}

impl From<io::Error> for FastTransportError {
    fn from(error: io::Error) -> Self {
        FastTransportError {
            message: error.to_string(),
            source: Some(error),
        }
    }
}

/// A failure reported by the remote RPC handler via an ERROR message.
/// Terminal for its request only; the original server-supplied error is the
/// source.
#[derive(Debug, Error)]
#[error("server error")]
pub struct FastServerError {
    #[source]
    pub source: FastMessageServerError,
}

impl FastServerError {
    pub fn new(source: FastMessageServerError) -> Self {
        FastServerError { source }
    }
}

/// The cause recorded inside a `FastRequestError`.
#[derive(Debug, Error)]
pub enum FastRequestCause {
    /// The server reported the request failed.
    #[error(transparent)]
    Server(FastServerError),
    /// The connection carrying the request failed; the shared cause is the
    /// connection-level error delivered to every outstanding request.
    #[error(transparent)]
    Connection(Arc<FastError>),
    /// A buffered call exceeded its caller-supplied object bound.
    #[error("buffered response exceeded {0} objects")]
    BufferExceeded(usize),
}

/// The client-facing wrapper for any per-request failure.
///
/// `msgid` is `None` only for requests that failed before an id was
/// assigned (for example a request issued against an already-failed
/// connection).
#[derive(Debug, Error)]
#[error("request failed: {method}")]
pub struct FastRequestError {
    pub msgid: Option<u32>,
    pub method: String,
    #[source]
    pub cause: FastRequestCause,
}

impl FastRequestError {
    pub fn new(
        msgid: impl Into<Option<u32>>,
        method: impl Into<String>,
        cause: FastRequestCause,
    ) -> Self {
        FastRequestError {
            msgid: msgid.into(),
            method: method.into(),
            cause,
        }
    }

    /// The structured `info` object for this error: the request identity
    /// plus any info the handler supplied.
    pub fn info(&self) -> Value {
        let mut info = json!({
            "rpcMethod": self.method,
        });
        if let Some(msgid) = self.msgid {
            info["rpcMsgid"] = json!(msgid);
        }
        if let FastRequestCause::Server(ref err) = self.cause {
            if let Some(Value::Object(ref extra)) = err.source.info {
                let obj = info.as_object_mut().unwrap();
                for (k, v) in extra {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        info
    }

    /// The server-supplied error, when the request failed server-side.
    pub fn server_error(&self) -> Option<&FastMessageServerError> {
        match self.cause {
            FastRequestCause::Server(ref err) => Some(&err.source),
            _ => None,
        }
    }
}

/// Top-level error type for core operations: codec faults, construction
/// validation, and client lifecycle errors.
#[derive(Debug, Error)]
pub enum FastError {
    #[error(transparent)]
    Protocol(#[from] FastProtocolError),
    #[error(transparent)]
    Transport(#[from] FastTransportError),
    /// A programmer error: an argument that violates the protocol's domain
    /// (bad msgid range, non-array RPC arguments, illegal crc mode, an
    /// unserializable payload). Raised synchronously.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The client was detached from its transport.
    #[error("client detached from transport")]
    Detached,
}

impl FastError {
    /// The protocol reason, for connection-level protocol faults.
    pub fn reason(&self) -> Option<FastReason> {
        match self {
            FastError::Protocol(e) => Some(e.reason),
            _ => None,
        }
    }
}

impl From<io::Error> for FastError {
    fn from(error: io::Error) -> Self {
        FastError::Transport(FastTransportError::from(error))
    }
}

impl From<serde_json::Error> for FastError {
    fn from(error: serde_json::Error) -> Self {
        FastError::InvalidArgument(format!(
            "failed to serialize message data: {}",
            error
        ))
    }
}
