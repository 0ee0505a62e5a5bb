//! Chunked message framing.
//!
//! Every message is split into one or more chunks, each a 2-byte
//! big-endian length header followed by that many payload bytes, the
//! whole message terminated by a zero-length chunk.

use crate::error::{Error, Result};

/// Chunks default to this size; only the last chunk of a message is
/// allowed to be shorter.
pub const MAX_CHUNK_SIZE: usize = 0xFFFF;

/// Splits `payload` into length-prefixed chunks terminated by `0x0000`,
/// appending the result to `out`.
pub fn write_framed(payload: &[u8], out: &mut Vec<u8>) {
    if payload.is_empty() {
        out.extend_from_slice(&0u16.to_be_bytes());
        return;
    }
    for chunk in payload.chunks(MAX_CHUNK_SIZE) {
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
    out.extend_from_slice(&0u16.to_be_bytes());
}

/// Incrementally reassembles chunks read off the wire into complete
/// message payloads. Owns no I/O; callers feed it bytes as they arrive
/// and drain completed messages, keeping "bytes in" separate from
/// "messages out".
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    current: Vec<u8>,
    completed: std::collections::VecDeque<Vec<u8>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.drain_chunks();
    }

    fn drain_chunks(&mut self) {
        loop {
            if self.buf.len() < 2 {
                return;
            }
            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if self.buf.len() < 2 + len {
                return;
            }
            let chunk: Vec<u8> = self.buf.drain(0..2 + len).skip(2).collect();
            if len == 0 {
                let message = std::mem::take(&mut self.current);
                self.completed.push_back(message);
            } else {
                self.current.extend_from_slice(&chunk);
            }
        }
    }

    /// Pops the next fully reassembled message body, if one is ready.
    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.completed.pop_front()
    }
}

/// Reads exactly one framed message out of `data`, returning the
/// reassembled payload and the unconsumed remainder. Used by transports
/// that read a whole message in one syscall rather than streaming
/// through a [`Reassembler`].
pub fn read_framed(mut data: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut message = Vec::new();
    loop {
        if data.len() < 2 {
            return Err(Error::LibraryBug("truncated chunk header".into()));
        }
        let (len_bytes, rest) = data.split_at(2);
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        data = rest;
        if len == 0 {
            return Ok((message, data));
        }
        if data.len() < len {
            return Err(Error::LibraryBug("truncated chunk payload".into()));
        }
        let (chunk, rest) = data.split_at(len);
        message.extend_from_slice(chunk);
        data = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_message() {
        let payload = b"hello bolt";
        let mut framed = Vec::new();
        write_framed(payload, &mut framed);
        let (message, rest) = read_framed(&framed).unwrap();
        assert_eq!(message, payload);
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_payload_is_a_single_terminator_chunk() {
        let mut framed = Vec::new();
        write_framed(&[], &mut framed);
        assert_eq!(framed, vec![0x00, 0x00]);
    }

    #[test]
    fn splits_oversized_payload_into_multiple_chunks() {
        let payload = vec![0xAB; MAX_CHUNK_SIZE + 10];
        let mut framed = Vec::new();
        write_framed(&payload, &mut framed);
        assert_eq!(&framed[0..2], &(MAX_CHUNK_SIZE as u16).to_be_bytes());
        let (message, rest) = read_framed(&framed).unwrap();
        assert_eq!(message, payload);
        assert!(rest.is_empty());
    }

    #[test]
    fn reassembler_handles_bytes_trickling_in() {
        let payload = b"streamed";
        let mut framed = Vec::new();
        write_framed(payload, &mut framed);

        let mut reassembler = Reassembler::new();
        for byte in &framed {
            reassembler.feed(std::slice::from_ref(byte));
        }
        assert_eq!(reassembler.pop_message(), Some(payload.to_vec()));
        assert_eq!(reassembler.pop_message(), None);
    }

    #[test]
    fn reassembler_handles_multiple_messages_in_one_feed() {
        let mut framed = Vec::new();
        write_framed(b"first", &mut framed);
        write_framed(b"second", &mut framed);

        let mut reassembler = Reassembler::new();
        reassembler.feed(&framed);
        assert_eq!(reassembler.pop_message(), Some(b"first".to_vec()));
        assert_eq!(reassembler.pop_message(), Some(b"second".to_vec()));
    }
}
