//! The Bolt wire protocol: message shapes, framing, and the handshake.
//!
//! The exact byte-level encoding of values ("value packing") is an
//! external collaborator's concern — [`codec::Codec`] is the seam a real
//! packstream implementation plugs into. What lives here is everything
//! the core depends on directly: the message catalogue, chunk framing,
//! and version negotiation.

pub mod codec;
pub mod framing;
pub mod handshake;
pub mod message;

pub use codec::{Codec, PackStreamLiteCodec};
pub use message::{Message, ResponseMessage};
