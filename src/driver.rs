//! The driver root object: owns the connection pool and the chosen
//! provider strategy for the lifetime of the application, and mints
//! [`Session`]s against them.

use std::sync::Arc;

use tracing::instrument;

use crate::bookmark::Bookmark;
use crate::config::{Opts, UriScheme};
use crate::error::Result;
use crate::pool::Pool;
use crate::retry::RetryPolicy;
use crate::routing::provider::{DirectConnectionProvider, Provider, RoutingConnectionProvider};
use crate::routing::table::{AccessMode, ServerAddress};
use crate::session::Session;

/// The high/low water marks govern how many buffered records a cursor
/// may accumulate before the connection's read pump pauses. They aren't
/// user-configurable on [`Opts`], so the driver applies one fixed pair
/// to every session it mints.
const DEFAULT_HIGH_WATER_MARK: usize = 10_000;
const DEFAULT_LOW_WATER_MARK: usize = 100;

/// The top-level entry point: parse a URI, hold a pool and a provider,
/// mint sessions.
pub struct Driver {
    pool: Arc<Pool>,
    provider: Arc<Provider>,
    opts: Arc<Opts>,
}

impl Driver {
    /// Parses `uri` and builds a driver with basic-auth credentials
    /// filled in.
    pub fn connect(uri: &str, user: impl Into<String>, password: Option<String>) -> Result<Self> {
        let mut opts = Opts::try_from(uri)?;
        opts.user = user.into();
        opts.password = password;
        Ok(Self::from_opts(opts))
    }

    /// Builds a driver from fully-assembled [`Opts`], choosing the
    /// direct or routing provider based on the URI scheme.
    pub fn from_opts(opts: Opts) -> Self {
        let opts = Arc::new(opts);
        let pool = Arc::new(Pool::new(Arc::clone(&opts)));
        let seed = ServerAddress::new(opts.host.clone(), opts.port);

        let provider = match opts.scheme {
            UriScheme::Direct => Provider::Direct(DirectConnectionProvider::new(Arc::clone(&pool), seed)),
            UriScheme::Routed => {
                Provider::Routing(RoutingConnectionProvider::new(Arc::clone(&pool), Arc::clone(&opts), seed, None))
            }
        };

        Self {
            pool,
            provider: Arc::new(provider),
            opts,
        }
    }

    /// Opens a session with no starting bookmark.
    pub fn session(&self, mode: AccessMode, database: Option<String>) -> Session {
        self.session_with_bookmark(mode, database, Bookmark::empty())
    }

    /// Opens a session that begins causally consistent with `bookmark`.
    pub fn session_with_bookmark(&self, mode: AccessMode, database: Option<String>, bookmark: Bookmark) -> Session {
        Session::new(
            Arc::clone(&self.provider),
            mode,
            database,
            bookmark,
            RetryPolicy {
                max_retry_time: self.opts.max_transaction_retry_time,
                ..RetryPolicy::default()
            },
            DEFAULT_HIGH_WATER_MARK,
            DEFAULT_LOW_WATER_MARK,
        )
    }

    /// Acquires and immediately resets a connection, surfacing
    /// handshake/auth failures eagerly rather than on first use.
    #[instrument(skip(self))]
    pub async fn verify_connectivity(&self) -> Result<()> {
        let mut conn = self.provider.acquire(AccessMode::Read, &None).await?;
        conn.reset().await
    }

    /// Tears down every pooled connection. Future acquisitions fail
    /// fast rather than reopening.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_parses_uri_and_applies_credentials() {
        let driver = Driver::connect("bolt://localhost:7687", "neo4j", Some("secret".into())).unwrap();
        assert_eq!(driver.opts.host, "localhost");
        assert_eq!(driver.opts.user, "neo4j");
    }

    #[test]
    fn routed_scheme_builds_a_routing_provider() {
        let opts = Opts::try_from("bolt+routing://core1:7687").unwrap();
        let driver = Driver::from_opts(opts);
        assert!(matches!(driver.provider.as_ref(), Provider::Routing(_)));
    }

    #[test]
    fn direct_scheme_builds_a_direct_provider() {
        let opts = Opts::try_from("bolt://localhost:7687").unwrap();
        let driver = Driver::from_opts(opts);
        assert!(matches!(driver.provider.as_ref(), Provider::Direct(_)));
    }
}
