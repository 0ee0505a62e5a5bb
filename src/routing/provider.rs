//! Connection providers: the seam between a session and "however this
//! driver currently decides which address to use."

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::config::Opts;
use crate::error::{Error, Result};
use crate::pool::{Pool, PooledConnection};

use super::load_balancing::LoadBalancingStrategy;
use super::rediscovery::{rediscover, AddressResolver, IdentityResolver};
use super::table::{AccessMode, RoutingTable, ServerAddress};

/// What a session or retry coordinator asks of the routing layer:
/// "give me a connection for mode M", plus the feedback hooks a
/// transport failure drives. Implemented by both connection
/// strategies below; callers that need to be generic over which one is
/// active hold a [`Provider`] enum instead of a trait object, since
/// `dyn`-safety and `async fn` in traits don't mix.
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self, mode: AccessMode, database: &Option<String>) -> Result<PooledConnection>;
    async fn forget(&self, address: &ServerAddress);
    async fn remove_writer(&self, address: &ServerAddress);
}

/// Single-server mode: no rediscovery, one address, straight to the
/// pool.
pub struct DirectConnectionProvider {
    pool: Arc<Pool>,
    address: ServerAddress,
}

impl DirectConnectionProvider {
    pub fn new(pool: Arc<Pool>, address: ServerAddress) -> Self {
        Self { pool, address }
    }
}

impl ConnectionProvider for DirectConnectionProvider {
    async fn acquire(&self, _mode: AccessMode, _database: &Option<String>) -> Result<PooledConnection> {
        self.pool.acquire(&self.address).await
    }

    async fn forget(&self, _address: &ServerAddress) {
        // A direct connection has no alternative address to fall back
        // to; forgetting would just make every subsequent acquire fail.
    }

    async fn remove_writer(&self, _address: &ServerAddress) {}
}

struct RefreshCoordination {
    table: RoutingTable,
    /// `Some` while a refresh is already underway; callers that observe
    /// a stale table while this is set subscribe instead of starting a
    /// second rediscovery — a single in-flight refresh future is shared
    /// by all callers.
    in_flight: Option<broadcast::Sender<core::result::Result<(), String>>>,
}

/// Cluster mode: a cached [`RoutingTable`] refreshed on demand, with
/// load-balanced selection over whichever role the caller asked for.
pub struct RoutingConnectionProvider {
    pool: Arc<Pool>,
    opts: Arc<Opts>,
    resolver: Box<dyn AddressResolver>,
    seed: ServerAddress,
    strategy: Box<dyn LoadBalancingStrategy>,
    state: AsyncMutex<RefreshCoordination>,
}

impl RoutingConnectionProvider {
    pub fn new(pool: Arc<Pool>, opts: Arc<Opts>, seed: ServerAddress, database: Option<String>) -> Self {
        let strategy = opts.load_balancing_strategy.build();
        Self {
            pool,
            opts,
            resolver: Box::new(IdentityResolver),
            seed,
            strategy,
            state: AsyncMutex::new(RefreshCoordination {
                table: RoutingTable::empty(database),
                in_flight: None,
            }),
        }
    }

    #[instrument(skip(self))]
    async fn ensure_fresh(&self, mode: AccessMode, database: &Option<String>) -> Result<()> {
        loop {
            let mut guard = self.state.lock().await;
            if !guard.table.is_stale_for(mode, database) {
                return Ok(());
            }
            if let Some(sender) = &guard.in_flight {
                let mut rx = sender.subscribe();
                drop(guard);
                match rx.recv().await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(message)) => return Err(Error::service_unavailable(message)),
                    Err(_) => continue, // sender dropped mid-refresh; retry our own check
                }
            }
            let (tx, _rx) = broadcast::channel(1);
            guard.in_flight = Some(tx.clone());
            let routers = guard.table.routers.as_slice().to_vec();
            let current_database = guard.table.database.clone();
            drop(guard);

            let routers = if routers.is_empty() { vec![self.seed.clone()] } else { routers };
            let outcome = rediscover(
                &routers,
                &self.seed,
                self.resolver.as_ref(),
                &self.opts,
                &self.opts.initial_routing_context,
            )
            .await;

            let mut guard = self.state.lock().await;
            guard.in_flight = None;
            match outcome {
                Ok(composition) => {
                    let new_table = RoutingTable::from_composition(
                        composition,
                        current_database,
                        self.opts.routing_ttl_floor,
                    );
                    let mut removed = Vec::new();
                    guard.table.readers.clone().update(new_table.readers.clone(), &mut removed);
                    guard.table.writers.clone().update(new_table.writers.clone(), &mut removed);
                    if !removed.is_empty() {
                        tracing::debug!(?removed, "routing update dropped addresses");
                    }
                    guard.table = new_table;
                    let servers = guard.table.servers();
                    drop(guard);
                    self.pool.retain_all(&servers).await;
                    let _ = tx.send(Ok(()));
                    return Ok(());
                }
                Err(err) => {
                    drop(guard);
                    let _ = tx.send(Err(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    async fn select(&self, mode: AccessMode) -> Result<ServerAddress> {
        let guard = self.state.lock().await;
        let candidates = match mode {
            AccessMode::Read => guard.table.readers.as_slice(),
            AccessMode::Write => guard.table.writers.as_slice(),
        };
        if candidates.is_empty() {
            return Err(Error::session_expired(format!("no servers available for mode {mode:?}")));
        }
        let candidates = candidates.to_vec();
        drop(guard);

        let pool = Arc::clone(&self.pool);
        let mut counts = Vec::with_capacity(candidates.len());
        for address in &candidates {
            counts.push(pool.in_use_count(address).await);
        }
        let index = self.strategy.select(candidates.len(), &|i| counts[i]);
        Ok(candidates[index].clone())
    }
}

impl ConnectionProvider for RoutingConnectionProvider {
    async fn acquire(&self, mode: AccessMode, database: &Option<String>) -> Result<PooledConnection> {
        self.ensure_fresh(mode, database).await?;
        let address = self.select(mode).await?;
        self.pool.acquire(&address).await
    }

    async fn forget(&self, address: &ServerAddress) {
        let mut guard = self.state.lock().await;
        guard.table.forget(address);
    }

    async fn remove_writer(&self, address: &ServerAddress) {
        let mut guard = self.state.lock().await;
        guard.table.remove_writer(address);
    }
}

/// A driver owns exactly one of these for its lifetime, picked at
/// construction time from the connection URI scheme.
pub enum Provider {
    Direct(DirectConnectionProvider),
    Routing(RoutingConnectionProvider),
}

impl Provider {
    pub async fn acquire(&self, mode: AccessMode, database: &Option<String>) -> Result<PooledConnection> {
        match self {
            Provider::Direct(p) => p.acquire(mode, database).await,
            Provider::Routing(p) => p.acquire(mode, database).await,
        }
    }

    pub async fn forget(&self, address: &ServerAddress) {
        match self {
            Provider::Direct(p) => p.forget(address).await,
            Provider::Routing(p) => p.forget(address).await,
        }
    }

    pub async fn remove_writer(&self, address: &ServerAddress) {
        match self {
            Provider::Direct(p) => p.remove_writer(address).await,
            Provider::Routing(p) => p.remove_writer(address).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_provider_forget_is_a_harmless_no_op() {
        let pool = Arc::new(Pool::new(Arc::new(Opts::default())));
        let address = ServerAddress::new("localhost", 7687);
        let provider = DirectConnectionProvider::new(pool, address.clone());
        provider.forget(&address).await;
    }

    #[tokio::test]
    async fn routing_provider_select_fails_closed_with_no_servers() {
        let pool = Arc::new(Pool::new(Arc::new(Opts::default())));
        let provider = RoutingConnectionProvider::new(
            pool,
            Arc::new(Opts::default()),
            ServerAddress::new("seed", 7687),
            None,
        );
        let err = provider.select(AccessMode::Write).await.unwrap_err();
        assert!(matches!(err, Error::SessionExpired(_)));
    }
}
