//! Connection configuration.
//!
//! A plain struct with a `Default` impl and a `TryFrom<&str>` URL
//! parser, carrying the Bolt-specific connection knobs.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Error;
use crate::routing::load_balancing::LoadBalancingStrategyKind;

/// Whether a URI requests direct (single-server) or routed (cluster)
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    /// `bolt://host:port` — no routing, no cluster discovery.
    Direct,
    /// `bolt+routing://host:port[?k=v&...]` — routing layer enabled; the
    /// query string becomes the routing context sent to the server.
    Routed,
}

/// How the transport should establish transport security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
    #[default]
    On,
    Off,
}

/// How server certificates are validated. The TLS handshake itself is an
/// external collaborator; this only selects which trust decision the
/// connector is configured with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrustStrategy {
    #[default]
    SystemCa,
    TrustAllCertificates,
    CustomCaFile(String),
}

/// Connection and pool configuration, defaults in brackets.
#[derive(Debug, Clone)]
pub struct Opts {
    pub scheme: UriScheme,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,

    /// `encryption` [on]
    pub encryption: Encryption,
    /// `trust strategy` [system-CA]
    pub trust_strategy: TrustStrategy,
    /// `connect_timeout` [30s]
    pub connect_timeout: Duration,
    /// `max_pool_size_per_address` [100]
    pub max_pool_size_per_address: usize,
    /// `connection_acquisition_timeout` [60s]
    pub connection_acquisition_timeout: Duration,
    /// `liveness_check_timeout` [off] — `None` disables the probe
    /// entirely, skipping the liveness check on every acquire.
    pub liveness_check_timeout: Option<Duration>,
    /// `max_transaction_retry_time` [30s]
    pub max_transaction_retry_time: Duration,
    /// `routing_ttl_floor` [none] — a lower bound clamp applied to the
    /// server-supplied TTL, so a misconfigured cluster can't force
    /// rediscovery on every call.
    pub routing_ttl_floor: Option<Duration>,
    /// `initial_routing_context` [{}]
    pub initial_routing_context: BTreeMap<String, String>,
    /// `user_agent` [library-defined]
    pub user_agent: String,
    /// `load_balancing_strategy` [least-connected]
    pub load_balancing_strategy: LoadBalancingStrategyKind,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            scheme: UriScheme::Direct,
            host: String::new(),
            port: 7687,
            user: String::new(),
            password: None,
            encryption: Encryption::On,
            trust_strategy: TrustStrategy::SystemCa,
            connect_timeout: Duration::from_secs(30),
            max_pool_size_per_address: 100,
            connection_acquisition_timeout: Duration::from_secs(60),
            liveness_check_timeout: None,
            max_transaction_retry_time: Duration::from_secs(30),
            routing_ttl_floor: None,
            initial_routing_context: BTreeMap::new(),
            user_agent: concat!("zero-bolt/", env!("CARGO_PKG_VERSION")).to_string(),
            load_balancing_strategy: LoadBalancingStrategyKind::LeastConnected,
        }
    }
}

impl Opts {
    pub fn is_routed(&self) -> bool {
        self.scheme == UriScheme::Routed
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(url: &str) -> Result<Self, Self::Error> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::BadConfigError(format!("Failed to parse bolt URL: {e}")))?;

        let scheme = match parsed.scheme() {
            "bolt" => UriScheme::Direct,
            "bolt+routing" => UriScheme::Routed,
            other => {
                return Err(Error::BadConfigError(format!(
                    "Invalid URL scheme '{other}', expected 'bolt' or 'bolt+routing'"
                )));
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::BadConfigError("Missing host in bolt URL".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(7687);
        let user = parsed.username().to_string();
        let password = parsed.password().map(ToString::to_string);

        let initial_routing_context = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut opts = Opts {
            scheme,
            host,
            port,
            user,
            password,
            initial_routing_context,
            ..Opts::default()
        };
        if scheme == UriScheme::Direct {
            opts.initial_routing_context.clear();
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_scheme() {
        let opts = Opts::try_from("bolt://localhost:7687").unwrap();
        assert_eq!(opts.scheme, UriScheme::Direct);
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.port, 7687);
        assert!(!opts.is_routed());
    }

    #[test]
    fn parses_routed_scheme_with_context() {
        let opts = Opts::try_from("bolt+routing://core1:7687?region=eu&policy=fast").unwrap();
        assert!(opts.is_routed());
        assert_eq!(
            opts.initial_routing_context.get("region").map(String::as_str),
            Some("eu")
        );
        assert_eq!(
            opts.initial_routing_context.get("policy").map(String::as_str),
            Some("fast")
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        let err = Opts::try_from("http://localhost").unwrap_err();
        assert!(matches!(err, Error::BadConfigError(_)));
    }

    #[test]
    fn default_has_spec_defaults() {
        let opts = Opts::default();
        assert_eq!(opts.max_pool_size_per_address, 100);
        assert_eq!(opts.connection_acquisition_timeout, Duration::from_secs(60));
        assert_eq!(opts.max_transaction_retry_time, Duration::from_secs(30));
        assert!(opts.liveness_check_timeout.is_none());
        assert_eq!(opts.encryption, Encryption::On);
    }
}
