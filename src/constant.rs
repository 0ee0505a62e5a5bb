//! Wire-level constants.

/// Sent as the first 4 bytes of every connection, before version
/// negotiation.
pub const HANDSHAKE_MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Number of candidate protocol versions offered during the handshake.
pub const HANDSHAKE_NUM_CANDIDATES: usize = 4;

/// Message type tag bytes, as they appear after the PackStream-lite
/// structure header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    Hello = 0x01,
    Run = 0x10,
    PullAll = 0x3F,
    Reset = 0x0F,
    Begin = 0x11,
    Commit = 0x12,
    Rollback = 0x13,
    Success = 0x70,
    Record = 0x71,
    Ignored = 0x7E,
    Failure = 0x7F,
}

impl MessageTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => MessageTag::Hello,
            0x10 => MessageTag::Run,
            0x3F => MessageTag::PullAll,
            0x0F => MessageTag::Reset,
            0x11 => MessageTag::Begin,
            0x12 => MessageTag::Commit,
            0x13 => MessageTag::Rollback,
            0x70 => MessageTag::Success,
            0x71 => MessageTag::Record,
            0x7E => MessageTag::Ignored,
            0x7F => MessageTag::Failure,
            _ => return None,
        })
    }
}

/// Server codes that additionally forget the address in the routing
/// table.
pub const DATABASE_UNAVAILABLE_CODE: &str = "Neo.TransientError.General.DatabaseUnavailable";

/// The one transient code that is retryable despite looking like every
/// other `Neo.TransientError.*`.
pub const DEADLOCK_CODE: &str = "Neo.TransientError.Transaction.DeadlockDetected";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_tags() {
        for tag in [
            MessageTag::Hello,
            MessageTag::Run,
            MessageTag::PullAll,
            MessageTag::Reset,
            MessageTag::Begin,
            MessageTag::Commit,
            MessageTag::Rollback,
            MessageTag::Success,
            MessageTag::Record,
            MessageTag::Ignored,
            MessageTag::Failure,
        ] {
            assert_eq!(MessageTag::from_byte(tag as u8), Some(tag));
        }
    }

    #[test]
    fn unknown_byte_is_none() {
        assert_eq!(MessageTag::from_byte(0x42), None);
    }
}
