//! The message catalogue.

use std::collections::BTreeMap;

use crate::value::{Params, Value};

/// An outbound request message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Sent once per connection, immediately after the handshake.
    Hello {
        user_agent: String,
        auth: BTreeMap<String, Value>,
    },
    Run {
        statement: String,
        params: Params,
        /// `db`, `bookmarks`, `mode`, `tx_timeout`, etc.
        metadata: BTreeMap<String, Value>,
    },
    PullAll,
    Reset,
    Begin {
        metadata: BTreeMap<String, Value>,
    },
    Commit,
    Rollback,
}

/// An inbound response message: one of four kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    Success { metadata: BTreeMap<String, Value> },
    Failure { code: String, message: String },
    Record { fields: Vec<Value> },
    Ignored,
}

impl ResponseMessage {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseMessage::Record { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_not_terminal() {
        assert!(!ResponseMessage::Record { fields: vec![] }.is_terminal());
    }

    #[test]
    fn success_failure_ignored_are_terminal() {
        assert!(ResponseMessage::Success {
            metadata: BTreeMap::new()
        }
        .is_terminal());
        assert!(ResponseMessage::Failure {
            code: "x".into(),
            message: "y".into()
        }
        .is_terminal());
        assert!(ResponseMessage::Ignored.is_terminal());
    }
}
