//! The cached cluster-composition table.

use std::time::{Duration, Instant};

/// `(host, port)`, compared by both fields; used as the pool key
/// throughout the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An ordered sequence of unique addresses that preserves insertion
/// order across updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet(Vec<ServerAddress>);

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(addresses: Vec<ServerAddress>) -> Self {
        let mut set = Self::new();
        for address in addresses {
            set.push(address);
        }
        set
    }

    pub fn push(&mut self, address: ServerAddress) {
        if !self.0.contains(&address) {
            self.0.push(address);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.0.contains(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerAddress> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[ServerAddress] {
        &self.0
    }

    pub fn remove(&mut self, address: &ServerAddress) {
        self.0.retain(|a| a != address);
    }

    /// Replaces the contents with `new_set`, appending every address
    /// that was present before but is absent after into `out_removed`
    /// (the symmetric difference favoring removals).
    pub fn update(&mut self, new_set: AddressSet, out_removed: &mut Vec<ServerAddress>) {
        for old in &self.0 {
            if !new_set.contains(old) {
                out_removed.push(old.clone());
            }
        }
        self.0 = new_set.0;
    }
}

impl FromIterator<ServerAddress> for AddressSet {
    fn from_iter<T: IntoIterator<Item = ServerAddress>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

/// Raw result of the rediscovery procedure, before being folded into a
/// [`RoutingTable`].
#[derive(Debug, Clone)]
pub struct ClusterComposition {
    pub ttl_ms: u64,
    pub readers: Vec<ServerAddress>,
    pub writers: Vec<ServerAddress>,
    pub routers: Vec<ServerAddress>,
}

/// Which role within the table an acquisition is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// The mutable routing record. Mutated only under the provider's
/// per-driver mutex; this type itself does no locking.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub readers: AddressSet,
    pub writers: AddressSet,
    pub routers: AddressSet,
    pub expires_at: Instant,
    pub database: Option<String>,
}

impl RoutingTable {
    /// A table that is stale from the moment it's constructed, so the
    /// first acquisition against a freshly-created provider always
    /// triggers rediscovery.
    pub fn empty(database: Option<String>) -> Self {
        Self {
            readers: AddressSet::new(),
            writers: AddressSet::new(),
            routers: AddressSet::new(),
            expires_at: Instant::now(),
            database,
        }
    }

    /// Builds a table from a freshly-fetched composition, replacing
    /// whatever table preceded it outright.
    pub fn from_composition(composition: ClusterComposition, database: Option<String>, ttl_floor: Option<Duration>) -> Self {
        let mut ttl = Duration::from_millis(composition.ttl_ms);
        if let Some(floor) = ttl_floor {
            ttl = ttl.max(floor);
        }
        Self {
            readers: AddressSet::from_vec(composition.readers),
            writers: AddressSet::from_vec(composition.writers),
            routers: AddressSet::from_vec(composition.routers),
            expires_at: Instant::now() + ttl,
            database,
        }
    }

    /// Stale for mode `mode` when the TTL has expired, the relevant
    /// address set is empty, or the requested database differs from the
    /// one this table was built for.
    pub fn is_stale_for(&self, mode: AccessMode, requested_database: &Option<String>) -> bool {
        if Instant::now() >= self.expires_at {
            return true;
        }
        if self.database != *requested_database {
            return true;
        }
        match mode {
            AccessMode::Read => self.readers.is_empty(),
            AccessMode::Write => self.writers.is_empty(),
        }
    }

    /// Every address this table currently knows about, for
    /// `pool.retain_all`.
    pub fn servers(&self) -> Vec<ServerAddress> {
        let mut out = Vec::new();
        for address in self.readers.iter().chain(self.writers.iter()).chain(self.routers.iter()) {
            if !out.contains(address) {
                out.push(address.clone());
            }
        }
        out
    }

    pub fn remove_writer(&mut self, address: &ServerAddress) {
        self.writers.remove(address);
    }

    pub fn forget(&mut self, address: &ServerAddress) {
        self.readers.remove(address);
        self.writers.remove(address);
        self.routers.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> ServerAddress {
        ServerAddress::new(host, 7687)
    }

    #[test]
    fn address_set_preserves_insertion_order_and_dedups() {
        let mut set = AddressSet::new();
        set.push(addr("a"));
        set.push(addr("b"));
        set.push(addr("a"));
        assert_eq!(set.as_slice(), &[addr("a"), addr("b")]);
    }

    #[test]
    fn update_yields_symmetric_difference_of_removed() {
        let mut set = AddressSet::from_vec(vec![addr("a"), addr("b"), addr("c")]);
        let mut removed = Vec::new();
        set.update(AddressSet::from_vec(vec![addr("b"), addr("d")]), &mut removed);
        assert_eq!(removed, vec![addr("a"), addr("c")]);
        assert_eq!(set.as_slice(), &[addr("b"), addr("d")]);
    }

    #[test]
    fn empty_table_is_always_stale() {
        let table = RoutingTable::empty(None);
        assert!(table.is_stale_for(AccessMode::Read, &None));
        assert!(table.is_stale_for(AccessMode::Write, &None));
    }

    #[test]
    fn table_is_stale_when_role_set_is_empty() {
        let composition = ClusterComposition {
            ttl_ms: 300_000,
            readers: vec![addr("a")],
            writers: vec![],
            routers: vec![addr("r")],
        };
        let table = RoutingTable::from_composition(composition, None, None);
        assert!(!table.is_stale_for(AccessMode::Read, &None));
        assert!(table.is_stale_for(AccessMode::Write, &None));
    }

    #[test]
    fn table_is_stale_when_database_changes() {
        let composition = ClusterComposition {
            ttl_ms: 300_000,
            readers: vec![addr("a")],
            writers: vec![addr("a")],
            routers: vec![addr("r")],
        };
        let table = RoutingTable::from_composition(composition, Some("neo4j".into()), None);
        assert!(table.is_stale_for(AccessMode::Read, &Some("other".into())));
        assert!(!table.is_stale_for(AccessMode::Read, &Some("neo4j".into())));
    }

    #[test]
    fn ttl_floor_clamps_a_short_server_ttl() {
        let composition = ClusterComposition {
            ttl_ms: 1,
            readers: vec![addr("a")],
            writers: vec![addr("a")],
            routers: vec![addr("r")],
        };
        let table = RoutingTable::from_composition(composition, None, Some(Duration::from_secs(60)));
        assert!(table.expires_at > Instant::now() + Duration::from_secs(30));
    }
}
