//! Blocking barriers at the three synchronization scopes of the fabric.
//!
//! - **Cluster barrier**: all compute cores plus the DMA core of one cluster.
//! - **Inter-cluster barrier**: one delegated core per cluster.
//! - **Global barrier**: every core of every cluster.
//!
//! Each barrier is generation-counted: the last arrival of a generation
//! releases everyone waiting on it and opens the next generation. A barrier
//! holds its state behind a mutex, so every store a core made before
//! arriving is visible to every core after the release.
//!
//! There is no timeout. A core that never arrives leaves the others blocked
//! until the fabric *poisons* the barrier (which it does when a core returns
//! an error), after which every pending and future wait fails with
//! [`BarrierError::Poisoned`].
//!
//! # Usage
//!
//! ```
//! use fabric_emu::fabric::barrier::{HwBarrier, BarrierScope};
//! use fabric_emu::fabric::CoreId;
//!
//! let barrier = HwBarrier::new(BarrierScope::Cluster(0), 2);
//! std::thread::scope(|s| {
//!     s.spawn(|| barrier.wait(CoreId::new(0, 0)).unwrap());
//!     s.spawn(|| barrier.wait(CoreId::new(0, 1)).unwrap());
//! });
//! assert_eq!(barrier.stats().completions, 1);
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use thiserror::Error;

use super::CoreId;

/// Which cores a barrier synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierScope {
    /// All cores of one cluster.
    Cluster(usize),
    /// One representative core per cluster.
    InterCluster,
    /// Every core on the fabric.
    Global,
}

impl std::fmt::Display for BarrierScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster(k) => write!(f, "cluster {} barrier", k),
            Self::InterCluster => write!(f, "inter-cluster barrier"),
            Self::Global => write!(f, "global barrier"),
        }
    }
}

/// Barrier failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarrierError {
    /// Another core failed; nobody will complete this barrier.
    #[error("{scope} poisoned by a failing core")]
    Poisoned { scope: BarrierScope },

    /// The same core entered one generation twice (would deadlock on hardware).
    #[error("{core} entered the {scope} twice in generation {generation}")]
    DoubleArrival { scope: BarrierScope, core: CoreId, generation: u64 },
}

/// Result of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierRelease {
    /// This core's arrival completed the generation.
    Leader,
    /// This core was released by a later arrival.
    Follower,
}

/// Statistics for one barrier.
#[derive(Debug, Clone, Copy, Default)]
pub struct BarrierStats {
    /// Number of completed generations.
    pub completions: u64,
    /// Longest time between first and last arrival of a generation.
    pub max_sync_delay: Duration,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: SmallVec<[CoreId; 32]>,
    generation: u64,
    first_arrival: Option<Instant>,
    poisoned: bool,
    stats: BarrierStats,
}

/// A reusable hardware barrier for a fixed number of participants.
#[derive(Debug)]
pub struct HwBarrier {
    scope: BarrierScope,
    participants: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl HwBarrier {
    /// Create a barrier releasing after `participants` arrivals.
    pub fn new(scope: BarrierScope, participants: usize) -> Self {
        Self {
            scope,
            participants,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    /// The scope this barrier synchronizes.
    pub fn scope(&self) -> BarrierScope {
        self.scope
    }

    /// Number of arrivals needed per generation.
    pub fn participants(&self) -> usize {
        self.participants
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arrive at the barrier and block until all participants have arrived.
    pub fn wait(&self, core: CoreId) -> Result<BarrierRelease, BarrierError> {
        let mut state = self.lock();
        if state.poisoned {
            return Err(BarrierError::Poisoned { scope: self.scope });
        }
        if state.arrived.contains(&core) {
            return Err(BarrierError::DoubleArrival {
                scope: self.scope,
                core,
                generation: state.generation,
            });
        }

        let now = Instant::now();
        let first = *state.first_arrival.get_or_insert(now);
        state.arrived.push(core);

        if state.arrived.len() >= self.participants {
            state.arrived.clear();
            state.first_arrival = None;
            state.generation += 1;
            state.stats.completions += 1;
            state.stats.max_sync_delay = state.stats.max_sync_delay.max(now - first);
            log::trace!("{} generation {} released by {}", self.scope, state.generation, core);
            self.released.notify_all();
            return Ok(BarrierRelease::Leader);
        }

        let generation = state.generation;
        while state.generation == generation && !state.poisoned {
            state = self.released.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation == generation {
            return Err(BarrierError::Poisoned { scope: self.scope });
        }
        Ok(BarrierRelease::Follower)
    }

    /// Fail every pending and future wait.
    pub fn poison(&self) {
        let mut state = self.lock();
        if !state.poisoned {
            log::debug!("{} poisoned with {} core(s) waiting", self.scope, state.arrived.len());
        }
        state.poisoned = true;
        self.released.notify_all();
    }

    /// Clear arrivals and poison so the barrier can serve a new launch.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.arrived.clear();
        state.first_arrival = None;
        state.poisoned = false;
    }

    /// Number of cores currently waiting in the open generation.
    pub fn arrived_count(&self) -> usize {
        self.lock().arrived.len()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> BarrierStats {
        self.lock().stats
    }
}

/// All barriers of a fabric.
#[derive(Debug)]
pub struct Barriers {
    cluster: Vec<HwBarrier>,
    inter_cluster: HwBarrier,
    global: HwBarrier,
}

impl Barriers {
    /// Create barriers for `clusters` clusters of `cores_per_cluster` cores
    /// (compute cores plus the DMA core).
    pub fn new(clusters: usize, cores_per_cluster: usize) -> Self {
        Self {
            cluster: (0..clusters)
                .map(|k| HwBarrier::new(BarrierScope::Cluster(k), cores_per_cluster))
                .collect(),
            inter_cluster: HwBarrier::new(BarrierScope::InterCluster, clusters),
            global: HwBarrier::new(BarrierScope::Global, clusters * cores_per_cluster),
        }
    }

    /// Barrier of one cluster.
    pub fn cluster(&self, cluster: usize) -> &HwBarrier {
        &self.cluster[cluster]
    }

    /// Inter-cluster barrier.
    pub fn inter_cluster(&self) -> &HwBarrier {
        &self.inter_cluster
    }

    /// Global barrier.
    pub fn global(&self) -> &HwBarrier {
        &self.global
    }

    fn all(&self) -> impl Iterator<Item = &HwBarrier> {
        self.cluster.iter().chain([&self.inter_cluster, &self.global])
    }

    /// Poison every barrier.
    pub fn poison_all(&self) {
        self.all().for_each(HwBarrier::poison);
    }

    /// Reset every barrier.
    pub fn reset_all(&self) {
        self.all().for_each(HwBarrier::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_participant_is_leader() {
        let barrier = HwBarrier::new(BarrierScope::Global, 1);
        assert_eq!(barrier.wait(CoreId::new(0, 0)), Ok(BarrierRelease::Leader));
        assert_eq!(barrier.wait(CoreId::new(0, 0)), Ok(BarrierRelease::Leader));
        assert_eq!(barrier.stats().completions, 2);
    }

    #[test]
    fn test_release_orders_stores() {
        let barrier = HwBarrier::new(BarrierScope::Cluster(0), 4);
        let before = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..4 {
                let barrier = &barrier;
                let before = &before;
                s.spawn(move || {
                    before.fetch_add(1, Ordering::Relaxed);
                    barrier.wait(CoreId::new(0, i)).unwrap();
                    // Everyone arrived, so every increment happened
                    assert_eq!(before.load(Ordering::Relaxed), 4);
                });
            }
        });
        assert_eq!(barrier.stats().completions, 1);
        assert_eq!(barrier.arrived_count(), 0);
    }

    #[test]
    fn test_exactly_one_leader_per_generation() {
        let barrier = HwBarrier::new(BarrierScope::Global, 6);
        let leaders = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..6 {
                let barrier = &barrier;
                let leaders = &leaders;
                s.spawn(move || {
                    for _ in 0..50 {
                        if barrier.wait(CoreId::new(0, i)).unwrap() == BarrierRelease::Leader {
                            leaders.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(leaders.load(Ordering::Relaxed), 50);
        assert_eq!(barrier.stats().completions, 50);
    }

    #[test]
    fn test_double_arrival_detected() {
        let barrier = HwBarrier::new(BarrierScope::Cluster(1), 2);
        let core = CoreId::new(1, 0);
        std::thread::scope(|s| {
            let waiter = s.spawn(|| barrier.wait(core));
            // Wait until the first arrival is registered
            while barrier.arrived_count() == 0 {
                std::thread::yield_now();
            }
            let err = barrier.wait(core).unwrap_err();
            assert!(matches!(err, BarrierError::DoubleArrival { generation: 0, .. }));
            barrier.poison();
            assert!(matches!(waiter.join().unwrap(), Err(BarrierError::Poisoned { .. })));
        });
    }

    #[test]
    fn test_poison_unblocks_and_reset_recovers() {
        let barrier = HwBarrier::new(BarrierScope::InterCluster, 3);
        std::thread::scope(|s| {
            let a = s.spawn(|| barrier.wait(CoreId::new(0, 0)));
            let b = s.spawn(|| barrier.wait(CoreId::new(1, 0)));
            while barrier.arrived_count() < 2 {
                std::thread::yield_now();
            }
            barrier.poison();
            assert!(a.join().unwrap().is_err());
            assert!(b.join().unwrap().is_err());
        });
        assert!(barrier.wait(CoreId::new(2, 0)).is_err());

        barrier.reset();
        assert_eq!(barrier.arrived_count(), 0);
        std::thread::scope(|s| {
            for k in 0..3 {
                let barrier = &barrier;
                s.spawn(move || barrier.wait(CoreId::new(k, 0)).unwrap());
            }
        });
        assert_eq!(barrier.stats().completions, 1);
    }

    #[test]
    fn test_barrier_set_geometry() {
        let barriers = Barriers::new(2, 9);
        assert_eq!(barriers.cluster(1).participants(), 9);
        assert_eq!(barriers.inter_cluster().participants(), 2);
        assert_eq!(barriers.global().participants(), 18);
        assert_eq!(barriers.cluster(0).scope(), BarrierScope::Cluster(0));
    }
}
