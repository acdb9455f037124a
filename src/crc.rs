// Copyright 2020 Joyent, Inc.

//! Checksum support for the Fast protocol.
//!
//! Fast messages carry a CRC16 of the data payload. Historically the
//! shipped implementation computed that checksum with a buggy CRC16 (what
//! this module calls `V1`); later deployments corrected it (`V2`). Because
//! both populations exist on the wire, a peer must be explicit about which
//! variant it speaks, and servers may run in a dual-accept mode (`V1V2`)
//! that validates against both and remembers which one matched so replies
//! can mirror it.

use std::fmt;

use crc16::{State, ARC, XMODEM};
use serde_derive::{Deserialize, Serialize};

use crate::error::FastError;

/// Selects which CRC16 variant(s) a codec computes and accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FastCrcMode {
    /// The legacy checksum only.
    V1,
    /// The corrected checksum only.
    V2,
    /// Accept either variant on receive. Only valid as a server-wide
    /// default; never as a client mode or a per-message encoding mode.
    V1V2,
}

impl FastCrcMode {
    /// Returns true for modes that name a single concrete variant.
    pub fn is_concrete(self) -> bool {
        !matches!(self, FastCrcMode::V1V2)
    }

    /// Validates a mode used where only a concrete variant is legal:
    /// client construction and per-message encoding overrides.
    pub fn require_concrete(self, site: &str) -> Result<Self, FastError> {
        if self.is_concrete() {
            Ok(self)
        } else {
            Err(FastError::InvalidArgument(format!(
                "crc mode {} is not valid for {}",
                self, site
            )))
        }
    }
}

impl Default for FastCrcMode {
    fn default() -> Self {
        FastCrcMode::V1
    }
}

impl fmt::Display for FastCrcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastCrcMode::V1 => write!(f, "v1"),
            FastCrcMode::V2 => write!(f, "v2"),
            FastCrcMode::V1V2 => write!(f, "v1/v2"),
        }
    }
}

/// Computes the legacy (`V1`) CRC16 of a payload. Bit-compatible with the
/// historically-shipped implementation; the pinned vectors in the tests
/// below are the oracle.
pub fn crc16_v1(buf: &[u8]) -> u32 {
    u32::from(State::<XMODEM>::calculate(buf))
}

/// Computes the corrected (`V2`) CRC16 of a payload.
pub fn crc16_v2(buf: &[u8]) -> u32 {
    u32::from(State::<ARC>::calculate(buf))
}

#[cfg(test)]
mod test {
    use super::*;

    // Reference vectors for the two variants. These pin the exact bit
    // pattern of the legacy implementation; any change here is a wire
    // compatibility break.
    const VECTORS: [(&[u8], u32, u32); 4] = [
        (b"[\"hello\",\"world\"]", 10980, 7500),
        (b"", 0, 0),
        (b"{}", 31641, 53730),
        (
            b"{\"m\":{\"uts\":1234567890,\"name\":\"echo\"},\"d\":[\"lafayette\"]}",
            33747,
            50537,
        ),
    ];

    #[test]
    fn v1_reference_vectors() {
        for (payload, v1, _) in VECTORS.iter() {
            assert_eq!(crc16_v1(payload), *v1);
        }
    }

    #[test]
    fn v2_reference_vectors() {
        for (payload, _, v2) in VECTORS.iter() {
            assert_eq!(crc16_v2(payload), *v2);
        }
    }

    #[test]
    fn variants_disagree_on_reference_payload() {
        let payload = b"[\"hello\",\"world\"]";
        assert_ne!(crc16_v1(payload), crc16_v2(payload));
    }

    #[test]
    fn concrete_mode_validation() {
        assert!(FastCrcMode::V1.require_concrete("client").is_ok());
        assert!(FastCrcMode::V2.require_concrete("client").is_ok());
        match FastCrcMode::V1V2.require_concrete("client") {
            Err(FastError::InvalidArgument(msg)) => {
                assert!(msg.contains("client"))
            }
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }
}
