//! Load-balancing strategies for picking an address out of a routing
//! table role.
//!
//! A strategy only ever needs a role's address list plus a way to ask
//! "how busy is this one right now", never the pool or routing table
//! directly.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Selects which [`LoadBalancingStrategy`] a [`crate::config::Opts`] wires
/// up. Kept as a plain enum (rather than requiring callers to construct a
/// trait object) so `Opts` stays `Clone` and configuration stays
/// declarative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategyKind {
    RoundRobin,
    #[default]
    LeastConnected,
}

impl LoadBalancingStrategyKind {
    pub fn build(self) -> Box<dyn LoadBalancingStrategy> {
        match self {
            LoadBalancingStrategyKind::RoundRobin => Box::new(RoundRobin::default()),
            LoadBalancingStrategyKind::LeastConnected => Box::new(LeastConnected::default()),
        }
    }
}

/// Picks one address out of a non-empty candidate list. Implementations
/// are `Send + Sync` because a driver's single strategy instance is
/// shared across every session acquiring a connection.
pub trait LoadBalancingStrategy: Send + Sync {
    /// Returns the index into `candidates` to use next. `in_use_count`
    /// reports how many connections are currently checked out against
    /// the candidate at a given index, used by strategies that weigh
    /// load rather than just rotating.
    fn select(&self, candidates_len: usize, in_use_count: &dyn Fn(usize) -> usize) -> usize;
}

/// Rotates through candidates in order, wrapping around. State is a
/// single atomic counter so the strategy can be shared without a mutex.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancingStrategy for RoundRobin {
    fn select(&self, candidates_len: usize, _in_use_count: &dyn Fn(usize) -> usize) -> usize {
        debug_assert!(candidates_len > 0, "select() called with no candidates");
        self.next.fetch_add(1, Ordering::Relaxed) % candidates_len
    }
}

/// Picks the candidate with the fewest connections currently checked
/// out, breaking ties by round robin so equally-idle addresses still
/// rotate instead of piling onto the first one in the list.
#[derive(Debug, Default)]
pub struct LeastConnected {
    tiebreak: RoundRobin,
}

impl LoadBalancingStrategy for LeastConnected {
    fn select(&self, candidates_len: usize, in_use_count: &dyn Fn(usize) -> usize) -> usize {
        debug_assert!(candidates_len > 0, "select() called with no candidates");
        let mut best_index = 0;
        let mut best_count = in_use_count(0);
        let mut tied_with_best = 1usize;
        for index in 1..candidates_len {
            let count = in_use_count(index);
            match count.cmp(&best_count) {
                std::cmp::Ordering::Less => {
                    best_index = index;
                    best_count = count;
                    tied_with_best = 1;
                }
                std::cmp::Ordering::Equal => {
                    tied_with_best += 1;
                }
                std::cmp::Ordering::Greater => {}
            }
        }
        if tied_with_best <= 1 {
            return best_index;
        }
        // Multiple candidates are tied for least-loaded: let round robin
        // pick among just those, so ties don't starve anyone.
        let tied_indices: Vec<usize> = (0..candidates_len)
            .filter(|&i| in_use_count(i) == best_count)
            .collect();
        let pick = self.tiebreak.select(tied_indices.len(), &|_| 0);
        tied_indices[pick]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_wraps() {
        let strategy = RoundRobin::default();
        let picks: Vec<usize> = (0..5).map(|_| strategy.select(3, &|_| 0)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn least_connected_picks_the_idle_one() {
        let strategy = LeastConnected::default();
        let counts = [5usize, 0, 3];
        let pick = strategy.select(3, &|i| counts[i]);
        assert_eq!(pick, 1);
    }

    #[test]
    fn least_connected_breaks_ties_by_rotating() {
        let strategy = LeastConnected::default();
        let counts = [0usize, 0, 5];
        let first = strategy.select(3, &|i| counts[i]);
        let second = strategy.select(3, &|i| counts[i]);
        assert_ne!(first, second);
        assert!(first < 2 && second < 2);
    }

    #[test]
    fn kind_builds_the_matching_strategy() {
        let _round_robin = LoadBalancingStrategyKind::RoundRobin.build();
        let _least_connected = LoadBalancingStrategyKind::LeastConnected.build();
    }
}
