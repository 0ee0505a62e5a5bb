//! A Bolt protocol client driver core: handshake, session state machine,
//! connection pooling, cluster routing, and the retry coordinator that
//! ties them together.
//!
//! `tokio` is a hard dependency: the async core is built directly on it,
//! with no tokio-free mode. The `sync` feature (on by default) adds
//! [`blocking::BlockingSession`], a thread-blocking facade over that async
//! core for callers that aren't already inside an async runtime.

mod channel;
mod constant;
mod protocol;

pub mod bookmark;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod pool;
pub mod retry;
pub mod routing;
pub mod session;
pub mod transaction;
pub mod value;

pub mod driver;

#[cfg(feature = "sync")]
pub mod blocking;

pub use bookmark::Bookmark;
pub use config::Opts;
pub use connection::Connection;
pub use driver::Driver;
pub use error::{Error, Result};
pub use pool::PooledConnection;
pub use routing::table::{AccessMode, ServerAddress};
pub use session::{Cursor, ResultSummary, Session};
pub use transaction::Transaction;
pub use value::{Params, Value};

#[cfg(feature = "sync")]
pub use blocking::BlockingSession;
