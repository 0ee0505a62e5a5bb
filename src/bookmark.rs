//! Causal-consistency bookmarks.
//!
//! A bookmark is an ordered set of opaque server-issued strings. A session
//! carries at most one; it is replaced, never merged, on every successful
//! commit.

use std::collections::BTreeSet;

/// An ordered set of opaque bookmark values.
///
/// Internally backed by a `BTreeSet` so [`Bookmark::max_as_string`] (the
/// lexicographically-last value) is a cheap `last()` lookup, and so two
/// bookmarks built from the same values compare equal regardless of
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmark {
    values: BTreeSet<String>,
}

impl Bookmark {
    /// The empty bookmark — a session that has never committed anything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A bookmark containing a single value.
    pub fn from_single(value: impl Into<String>) -> Self {
        let mut values = BTreeSet::new();
        values.insert(value.into());
        Self { values }
    }

    /// A bookmark containing every value in `iter`.
    pub fn from_iter(iter: impl IntoIterator<Item = String>) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The lexicographically-last value, or `None` if empty.
    ///
    /// This is what [`crate::session::Session::last_bookmark`] reports:
    /// the maximum element of the current bookmark.
    pub fn max_as_string(&self) -> Option<&str> {
        self.values.iter().next_back().map(String::as_str)
    }

    /// All values, in sorted order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    /// Merge `other`'s bookmarks in, for sending the union to the server.
    ///
    /// Used only to build the bookmark set passed on the wire for
    /// `BEGIN`/auto-commit metadata when a caller supplies extra bookmarks
    /// alongside the session's own; the *response* bookmark still replaces
    /// wholesale.
    pub fn union(&self, other: &Bookmark) -> Bookmark {
        Bookmark {
            values: self.values.union(&other.values).cloned().collect(),
        }
    }
}

impl FromIterator<String> for Bookmark {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Bookmark::from_iter(iter)
    }
}
