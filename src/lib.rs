// Copyright 2019 Joyent, Inc.

//! Fast: A simple streaming RPC protocol
//!
//! Fast is a simple RPC protocol intended for use with TCP. Typically, a
//! Fast server listens for TCP connections on a well-known port, and Fast
//! clients connect to the server to make RPC requests. Clients can make
//! multiple connections to the server, but each connection represents a
//! logically separate client. Multiple RPC requests may be outstanding on
//! one connection at the same time; communication between client and server
//! consists of discrete _messages_ sent over the connection.
//!
//! Fast protocol messages have the following structure:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * TYPE      1-byte integer.  The only supported value is TYPE_JSON (0x1),
//!           indicating that the data payload is an encoded JSON object.
//!
//! * STATUS    1-byte integer.  The only supported values are:
//!
//!     * STATUS_DATA  0x1  indicates a "data" message
//!
//!     * STATUS_END   0x2  indicates an "end" message
//!
//!     * STATUS_ERROR 0x3  indicates an "error" message
//!
//! * MSGID0...MSGID3    4-byte big-endian unsigned integer, a unique
//!                    identifier for this message. The high bit must be
//!                    zero: message ids live in a 31-bit space.
//!
//! * CRC0...CRC3        4-byte big-endian unsigned integer holding the CRC16
//!                     value of the data payload, right-aligned (the upper
//!                     16 bits are zero)
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the
//!                    number of bytes of data payload that follow
//!
//! * DATA0...DATAN      Data payload.  This is a JSON-encoded object (for
//!                    TYPE = TYPE_JSON).  The encoding length in bytes is
//!                    given by the DLEN0...DLEN4 bytes.
//!
//! ### Status
//!
//! There are three allowed values for `status`:
//!
//! |Status value | Status name | Description |
//! |------------ | ----------- | ----------- |
//! | `0x1`        | `DATA`      | From clients, indicates an RPC request.  From servers, indicates one of many values emitted by an RPC call.|
//! | `0x2`        | `END`       | Indicates the successful completion of an RPC call.  Only sent by servers. |
//! | `0x3`        | `ERROR`     | Indicates the failed completion of an RPC call.  Only sent by servers. |
//!
//! ### Message IDs
//!
//! Each Fast message has a message id, which is scoped to the Fast
//! connection.  These are allocated sequentially from a circular 31-bit
//! space, skipping ids still in use by outstanding requests.
//!
//! ### Checksums
//!
//! The CRC16 field is complicated by history: early deployments shipped
//! with a buggy CRC16 implementation, so two checksum variants coexist on
//! the wire. This crate calls the legacy variant `V1` and the corrected one
//! `V2` (see [`crc::FastCrcMode`]). Clients pick one concrete variant.
//! Servers may additionally run dual-accept (`V1V2`), validating received
//! messages against either variant and mirroring the sender's variant in
//! replies. When a `V1` or dual-mode encoder emits a message it searches
//! for a payload serialization whose checksum is identical under both
//! variants by perturbing the metadata timestamp, so that peers validating
//! with either variant will accept it.
//!
//! ### Data payload
//!
//! For all messages, the `data` field contains properties:
//!
//! | Field    | Type              | Purpose |
//! | -------- | ----------------- | ------- |
//! | `m`      | object            | describes the RPC method being invoked |
//! | `m.name` | string            | name of the RPC method being invoked |
//! | `m.uts`  | number (optional) | timestamp of message creation, in microseconds since the Unix epoch |
//! | `d`      | array or object   | varies by message status: an array of values for `DATA` and `END`, an error object for `ERROR` |
//!
//! ### Messaging Scenarios
//!
//! Essentially, there are only four messaging scenarios with Fast:
//!
//! **Client initiates an RPC request.** The client allocates a new message
//! identifier and sends a `DATA` message with `data.m.name` set to the name of
//! the RPC method it wants to invoke.  Arguments are specified by the array
//! `data.d`. Clients may issue concurrent requests over a single TCP
//! connection, provided they do not re-use a message identifier for separate
//! requests.
//!
//! **Server sends data from an RPC call.** RPC calls may emit an arbitrary
//! number of values back to the client.  To emit these values, the server sends
//! `DATA` messages with `data.d` set to an array of non-null values to be
//! emitted.  All `DATA` messages for the same RPC request have the same message
//! identifier that the client included in its original `DATA` message that
//! initiated the RPC call.
//!
//! **Server completes an RPC call successfully.** When an RPC call completes
//! successfully, the server sends an `END` event having the same message
//! identifier as the one in the client's original `DATA` message that initiated
//! the RPC call. This message can contain data as well, in which case it should
//! be processed the same way as for a DATA message.
//!
//! **Server reports a failed RPC call.** Any time before an `END` message is
//! generated for an RPC call, the server may send an `ERROR` message having the
//! same message identifier as the one in the client's original `DATA` message
//! that initiated the RPC call.
//!
//! By convention, the `m` fields (`m.name` and `m.uts`) are populated for all
//! server messages, even though `m.name` is redundant.
//!
//! The RPC request begins when the client sends the initial `DATA` message.
//! The RPC request is finished when the server sends either an `ERROR` or `END`
//! message for that request.  In summary, the client only ever sends one
//! message for each request.  The server may send any number of `DATA` messages
//! and exactly one `END` or `ERROR` message.

#![allow(missing_docs)]

pub mod client;
pub mod crc;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;

pub use client::{FastClient, FastClientOptions, FastRequestStream};
pub use crc::FastCrcMode;
pub use error::{
    FastError, FastProtocolError, FastReason, FastRequestCause,
    FastRequestError, FastServerError, FastTransportError,
};
pub use metrics::FastMetrics;
pub use server::{
    FastResponseWriter, FastServer, FastServerOptions, RpcHandler,
};
