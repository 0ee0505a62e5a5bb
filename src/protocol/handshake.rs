//! Magic + version negotiation.
//!
//! The client writes a 4-byte magic number followed by four candidate
//! versions, most preferred first; the server echoes back the one
//! version it accepted (or all-zero to refuse the connection). Separates
//! "what to write next" from "are we connected yet" so the caller's I/O
//! loop stays transport-agnostic.

use crate::constant::{HANDSHAKE_MAGIC, HANDSHAKE_NUM_CANDIDATES};
use crate::error::{Error, Result};

/// A negotiable protocol version, encoded on the wire as four bytes:
/// `[0, 0, minor, major]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    fn to_bytes(self) -> [u8; 4] {
        [0, 0, self.minor, self.major]
    }

    fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        if bytes == [0, 0, 0, 0] {
            None
        } else {
            Some(Self {
                minor: bytes[2],
                major: bytes[3],
            })
        }
    }
}

/// The versions this driver offers, most preferred first. A real
/// deployment would track every version the server might speak; this
/// driver only needs to prove the negotiation shape.
pub const SUPPORTED_VERSIONS: [ProtocolVersion; HANDSHAKE_NUM_CANDIDATES] = [
    ProtocolVersion::new(5, 4),
    ProtocolVersion::new(5, 0),
    ProtocolVersion::new(4, 4),
    ProtocolVersion::new(4, 2),
];

/// Builds the initial handshake frame: magic followed by the four
/// candidate versions.
pub fn handshake_request() -> [u8; 20] {
    let mut out = [0u8; 20];
    out[0..4].copy_from_slice(&HANDSHAKE_MAGIC);
    for (i, version) in SUPPORTED_VERSIONS.iter().enumerate() {
        let offset = 4 + i * 4;
        out[offset..offset + 4].copy_from_slice(&version.to_bytes());
    }
    out
}

/// Parses the server's 4-byte reply, returning the agreed version or an
/// error if the server refused every candidate.
pub fn negotiate(server_reply: [u8; 4]) -> Result<ProtocolVersion> {
    ProtocolVersion::from_bytes(server_reply)
        .ok_or_else(|| Error::service_unavailable("server rejected every offered protocol version"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_starts_with_magic() {
        let request = handshake_request();
        assert_eq!(&request[0..4], &HANDSHAKE_MAGIC);
    }

    #[test]
    fn request_carries_all_candidates_in_preference_order() {
        let request = handshake_request();
        for (i, version) in SUPPORTED_VERSIONS.iter().enumerate() {
            let offset = 4 + i * 4;
            assert_eq!(&request[offset..offset + 4], &version.to_bytes());
        }
    }

    #[test]
    fn negotiate_accepts_a_supported_version() {
        let reply = SUPPORTED_VERSIONS[1].to_bytes();
        assert_eq!(negotiate(reply).unwrap(), SUPPORTED_VERSIONS[1]);
    }

    #[test]
    fn negotiate_rejects_all_zero_reply() {
        let err = negotiate([0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }
}
