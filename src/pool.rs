//! Per-address connection pools and the fleet that owns them.
//!
//! Idle connections sit in a `crossbeam_queue::ArrayQueue`, and a
//! `ManuallyDrop` guard returns a checked-out connection to its pool on
//! drop rather than requiring callers to call `release()` explicitly.

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{instrument, trace, warn};

use crate::config::Opts;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::routing::table::ServerAddress;

/// One address's slice of the fleet: a bounded idle queue plus an
/// in-use counter so the load-balancing strategy can ask "how busy is
/// this address" without locking the queue.
struct AddressPool {
    idle: ArrayQueue<Connection>,
    in_use: AtomicUsize,
    max_size: usize,
    acquire_gate: tokio::sync::Semaphore,
}

impl AddressPool {
    fn new(max_size: usize) -> Self {
        Self {
            idle: ArrayQueue::new(max_size),
            in_use: AtomicUsize::new(0),
            max_size,
            acquire_gate: tokio::sync::Semaphore::new(max_size),
        }
    }
}

/// The fleet of per-address pools a driver or routing provider owns.
pub struct Pool {
    opts: Arc<Opts>,
    per_address: AsyncMutex<HashMap<ServerAddress, Arc<AddressPool>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Pool {
    pub fn new(opts: Arc<Opts>) -> Self {
        Self {
            opts,
            per_address: AsyncMutex::new(HashMap::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn address_pool(&self, address: &ServerAddress) -> Arc<AddressPool> {
        let mut guard = self.per_address.lock().await;
        guard
            .entry(address.clone())
            .or_insert_with(|| Arc::new(AddressPool::new(self.opts.max_pool_size_per_address)))
            .clone()
    }

    /// Reuses an idle, live connection if one exists; otherwise opens a
    /// new one if under the per-address cap; otherwise waits up to
    /// `connection_acquisition_timeout` for a release.
    #[instrument(skip(self), fields(address = %address))]
    pub async fn acquire(self: &Arc<Self>, address: &ServerAddress) -> Result<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::service_unavailable("pool is closed"));
        }
        let address_pool = self.address_pool(address).await;

        let permit = timeout(
            self.opts.connection_acquisition_timeout,
            address_pool.acquire_gate.acquire(),
        )
        .await
        .map_err(|_| Error::client("connection acquisition timeout"))?
        .map_err(|_| Error::LibraryBug("acquire semaphore closed unexpectedly".into()))?;
        permit.forget();

        let conn = match self.take_live_idle(&address_pool).await {
            Some(conn) => conn,
            None => match Connection::connect(address.clone(), &self.opts).await {
                Ok(conn) => conn,
                Err(err) => {
                    address_pool.acquire_gate.add_permits(1);
                    return Err(err);
                }
            },
        };

        address_pool.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection {
            pool: Arc::clone(self),
            address_pool,
            address: address.clone(),
            conn: ManuallyDrop::new(conn),
        })
    }

    /// Pops idle connections until one passes the liveness check or the
    /// queue is empty.
    async fn take_live_idle(&self, address_pool: &AddressPool) -> Option<Connection> {
        while let Some(mut conn) = address_pool.idle.pop() {
            if !self.passes_liveness_check(&mut conn).await {
                continue;
            }
            return Some(conn);
        }
        None
    }

    async fn passes_liveness_check(&self, conn: &mut Connection) -> bool {
        let Some(liveness_timeout) = self.opts.liveness_check_timeout else {
            return true;
        };
        if liveness_timeout.is_zero() {
            return true;
        }
        if conn.last_used_at.elapsed() <= liveness_timeout {
            return true;
        }
        match conn.reset().await {
            Ok(()) => true,
            Err(err) => {
                warn!(address = %conn.server_address(), error = %err, "liveness probe failed, disposing connection");
                false
            }
        }
    }

    fn release(self: &Arc<Self>, address_pool: &Arc<AddressPool>, mut conn: Connection) {
        address_pool.in_use.fetch_sub(1, Ordering::SeqCst);
        conn.last_used_at = Instant::now();
        if self.closed.load(Ordering::SeqCst) || !conn.is_open() || conn.is_quarantined() {
            address_pool.acquire_gate.add_permits(1);
            return;
        }
        if address_pool.idle.push(conn).is_err() {
            // Pool shrank out from under us (e.g. a concurrent retain_all);
            // the connection is simply dropped.
        }
        address_pool.acquire_gate.add_permits(1);
    }

    pub async fn in_use_count(&self, address: &ServerAddress) -> usize {
        match self.per_address.lock().await.get(address) {
            Some(pool) => pool.in_use.load(Ordering::SeqCst),
            None => 0,
        }
    }

    pub async fn idle_count(&self, address: &ServerAddress) -> usize {
        match self.per_address.lock().await.get(address) {
            Some(pool) => pool.idle.len(),
            None => 0,
        }
    }

    /// Drops every sub-pool whose address is not in `addresses` (spec
    /// §4.4, run after every routing update).
    #[instrument(skip(self, addresses))]
    pub async fn retain_all(&self, addresses: &[ServerAddress]) {
        let mut guard = self.per_address.lock().await;
        guard.retain(|address, _| addresses.contains(address));
    }

    /// Closes every connection across every sub-pool; future
    /// acquisitions fail fast.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.per_address.lock().await;
        guard.clear();
    }

    pub fn max_pool_size_per_address(&self) -> usize {
        self.opts.max_pool_size_per_address
    }
}

/// RAII guard returned by [`Pool::acquire`]. `Drop` returns the
/// connection to its address pool.
pub struct PooledConnection {
    pool: Arc<Pool>,
    address_pool: Arc<AddressPool>,
    address: ServerAddress,
    conn: ManuallyDrop<Connection>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").field("address", &self.address).finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Explicit, idempotent release back to the pool. After this call
    /// the guard must not be used again; `Drop` becomes a no-op because
    /// the value has already been taken.
    pub fn release(mut self) {
        self.take_and_release();
        std::mem::forget(self);
    }

    fn take_and_release(&mut self) {
        trace!(address = %self.address, "releasing connection back to pool");
        // SAFETY: called at most once, either here or from `Drop`, and
        // the value is never read again afterward in either path.
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release(&self.address_pool, conn);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.take_and_release();
    }
}
