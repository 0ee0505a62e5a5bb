//! The cluster-composition rediscovery procedure.

use std::collections::BTreeMap;

use tracing::{instrument, warn};

use crate::config::Opts;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::value::{Params, Value};

use super::table::{ClusterComposition, ServerAddress};

/// Expands a single configured host name into the addresses actually
/// worth trying. The identity resolver is the default; a caller may
/// inject one that performs DNS/SRV expansion to fan one host name out
/// to multiple addresses.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, seed: &ServerAddress) -> Vec<ServerAddress>;
}

#[derive(Debug, Default)]
pub struct IdentityResolver;

impl AddressResolver for IdentityResolver {
    fn resolve(&self, seed: &ServerAddress) -> Vec<ServerAddress> {
        vec![seed.clone()]
    }
}

const ROUTING_PROCEDURE: &str = "CALL dbms.cluster.routing.getRoutingTable($context)";

/// Runs the cluster-composition procedure against one router and parses
/// its SUCCESS metadata into a [`ClusterComposition`].
#[instrument(skip(opts), fields(router = %router))]
async fn fetch_from_router(
    router: &ServerAddress,
    opts: &Opts,
    context: &BTreeMap<String, String>,
) -> Result<ClusterComposition> {
    let mut conn = Connection::connect(router.clone(), opts).await?;

    let mut params = Params::new();
    let context_map: BTreeMap<String, Value> = context
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();
    params.insert("context", Value::Map(context_map));

    let outcome = conn
        .run_and_flush(ROUTING_PROCEDURE, params, BTreeMap::new(), usize::MAX, 0)
        .await?;
    conn.drain_until_idle(&outcome.backpressure).await?;

    let metadata = outcome
        .keys
        .await
        .map_err(|_| Error::LibraryBug("rediscovery RUN handler dropped".into()))??;
    let _ = metadata;

    let mut records = outcome.records;
    let mut row: Option<Vec<Value>> = None;
    let mut terminal_failure = None;
    while let Some(event) = records.recv().await {
        match event {
            crate::handler::PullEvent::Record(fields) => row = Some(fields),
            crate::handler::PullEvent::Success(_) => break,
            crate::handler::PullEvent::Failure { code, message } => {
                terminal_failure = Some(Error::from_server_failure(code, message));
                break;
            }
        }
    }
    if let Some(err) = terminal_failure {
        return Err(err);
    }
    let row = row.ok_or_else(|| {
        Error::client("routing procedure returned no rows, cluster is misconfigured")
    })?;
    parse_cluster_composition(&row)
}

fn parse_cluster_composition(row: &[Value]) -> Result<ClusterComposition> {
    let ttl_ms = row
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::client("routing table row missing ttl"))? as u64;
    let servers = row
        .get(1)
        .and_then(Value::as_list)
        .ok_or_else(|| Error::client("routing table row missing servers list"))?;

    let mut readers = Vec::new();
    let mut writers = Vec::new();
    let mut routers = Vec::new();
    for entry in servers {
        let entry_map = entry
            .as_map()
            .ok_or_else(|| Error::client("routing table server entry was not a map"))?;
        let role = entry_map
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::client("routing table server entry missing role"))?;
        let addresses = entry_map
            .get("addresses")
            .and_then(Value::as_list)
            .ok_or_else(|| Error::client("routing table server entry missing addresses"))?;
        let target = match role {
            "READ" => &mut readers,
            "WRITE" => &mut writers,
            "ROUTE" => &mut routers,
            other => return Err(Error::client(format!("unknown routing table role '{other}'"))),
        };
        for address in addresses {
            let address_str = address
                .as_str()
                .ok_or_else(|| Error::client("routing table address was not a string"))?;
            target.push(parse_address(address_str)?);
        }
    }

    Ok(ClusterComposition {
        ttl_ms,
        readers,
        writers,
        routers,
    })
}

fn parse_address(raw: &str) -> Result<ServerAddress> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| Error::client(format!("malformed server address '{raw}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::client(format!("malformed server address '{raw}'")))?;
    Ok(ServerAddress::new(host, port))
}

/// Tries each router in order, propagating client-level failures
/// immediately, skipping transport failures to move on to the next
/// router, and re-seeding from the resolver if every known router is
/// unreachable.
#[instrument(skip_all)]
pub async fn rediscover(
    routers: &[ServerAddress],
    seed: &ServerAddress,
    resolver: &dyn AddressResolver,
    opts: &Opts,
    context: &BTreeMap<String, String>,
) -> Result<ClusterComposition> {
    if let Some(composition) = try_routers(routers, opts, context).await? {
        return Ok(composition);
    }

    warn!("all known routers unreachable, re-resolving seed address");
    let reseeded = resolver.resolve(seed);
    if let Some(composition) = try_routers(&reseeded, opts, context).await? {
        return Ok(composition);
    }

    Err(Error::service_unavailable("Could not perform discovery"))
}

/// Returns `Ok(Some(composition))` on success, `Ok(None)` if every
/// router in `candidates` failed with a transport error (caller should
/// try the next seed), or `Err` if a router failed with a fatal,
/// non-transport error.
async fn try_routers(
    candidates: &[ServerAddress],
    opts: &Opts,
    context: &BTreeMap<String, String>,
) -> Result<Option<ClusterComposition>> {
    for router in candidates {
        match fetch_from_router(router, opts, context).await {
            Ok(composition) => return Ok(Some(composition)),
            Err(err @ (Error::ClientException(_) | Error::AuthenticationException(_) | Error::SecurityException(_))) => {
                return Err(err);
            }
            Err(err) => {
                warn!(router = %router, error = %err, "router unreachable, trying next");
            }
        }
    }
    Ok(None)
}
