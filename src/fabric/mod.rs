//! Execution fabric: clusters of compute cores plus one DMA core each.
//!
//! This module provides:
//! - Topology (cluster count, cores per cluster, CLM address map)
//! - Shared memory (global store plus one CLM per cluster)
//! - Barriers at cluster, inter-cluster and global scope
//! - One bulk-DMA engine and one HWPE per cluster
//! - SPMD launch: every core runs the same kernel on its own thread
//!
//! # Architecture Overview
//!
//! ```text
//!            ┌──────────── cluster 0 ────────────┐   ┌──── cluster 1 ────┐
//!            │ core0 core1 ... core(P-1)  DMcore │   │        ...        │
//!            │   │     │          │         │    │   │                   │
//!            │ ┌─┴─────┴──────────┴───┐  ┌──┴──┐ │   │                   │
//!            │ │   CLM (clm_base)     │◄─┤ DMA │ │   │  CLM (base + S)   │
//!            │ └──────────────────────┘  └──┬──┘ │   │                   │
//!            └──────────────────────────────┼────┘   └─────────┬─────────┘
//!                                           ▼                  ▼
//!            ┌──────────────────────── global store ───────────────────────┐
//!            └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use fabric_emu::{Fabric, FabricConfig};
//!
//! let fabric = Fabric::new(FabricConfig::default()).unwrap();
//! let report = fabric
//!     .launch(|core| {
//!         core.global_barrier()?;
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(report.cores, 18);
//! ```

pub mod barrier;
pub mod core;
pub mod layout;
pub mod memory;
pub mod partition;
pub mod ssr;

pub use self::core::CoreContext;
pub use barrier::{BarrierError, BarrierScope, Barriers, HwBarrier};
pub use layout::{Allocation, BufferHandle, ClmAllocator, Layout, ReductionBuffer, View};
pub use memory::{Memory, MemoryError};
pub use ssr::{DataMover, SsrError, SsrUnit};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{ConfigError, FabricConfig};
use crate::dma::engine::{ChannelStats, DmaEngine};
use crate::dma::DmaError;
use crate::hwpe::{Hwpe, HwpeError};

/// Identity of one core: its cluster and its index within the cluster.
///
/// Index `P` (one past the last compute core) is the DMA core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreId {
    /// Cluster index in `[0, C)`.
    pub cluster: usize,
    /// Index within the cluster in `[0, P]`.
    pub index: usize,
}

impl CoreId {
    /// Create a core identity.
    pub const fn new(cluster: usize, index: usize) -> Self {
        Self { cluster, index }
    }
}

impl std::fmt::Display for CoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "core ({}, {})", self.cluster, self.index)
    }
}

/// Fabric geometry and CLM address map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Number of clusters (C).
    pub clusters: usize,
    /// Compute cores per cluster (P).
    pub compute_cores: usize,
    /// Base address of cluster 0's CLM.
    pub clm_base: u64,
    /// Bytes of CLM per cluster.
    pub clm_size: u64,
    /// Address distance between clusters' CLMs (S).
    pub cluster_offset: u64,
}

impl Topology {
    /// Derive the topology from a configuration.
    pub fn from_config(config: &FabricConfig) -> Self {
        Self {
            clusters: config.clusters,
            compute_cores: config.compute_cores,
            clm_base: config.clm_base,
            clm_size: config.clm_size,
            cluster_offset: config.cluster_offset,
        }
    }

    /// Cores per cluster including the DMA core.
    #[inline]
    pub fn cores_per_cluster(&self) -> usize {
        self.compute_cores + 1
    }

    /// Cores on the whole fabric.
    #[inline]
    pub fn total_cores(&self) -> usize {
        self.clusters * self.cores_per_cluster()
    }

    /// Within-cluster index of the DMA core.
    #[inline]
    pub fn dm_core_index(&self) -> usize {
        self.compute_cores
    }

    /// Whether `core` is a DMA core.
    #[inline]
    pub fn is_dm_core(&self, core: CoreId) -> bool {
        core.index == self.compute_cores
    }

    /// Global linear index of `core` (cluster-major).
    #[inline]
    pub fn global_index(&self, core: CoreId) -> usize {
        core.cluster * self.cores_per_cluster() + core.index
    }

    /// CLM base address of a cluster: `clm_base + k * S`.
    #[inline]
    pub fn clm_base(&self, cluster: usize) -> u64 {
        self.clm_base + cluster as u64 * self.cluster_offset
    }

    /// One-past-the-end address of a cluster's CLM.
    #[inline]
    pub fn clm_end(&self, cluster: usize) -> u64 {
        self.clm_base(cluster) + self.clm_size
    }

    /// Cluster whose CLM contains `addr`, if any.
    pub fn cluster_of(&self, addr: u64) -> Option<usize> {
        (0..self.clusters).find(|&k| addr >= self.clm_base(k) && addr < self.clm_end(k))
    }

    /// Retarget a CLM pointer from one cluster to the same offset in another.
    #[inline]
    pub fn remote(&self, ptr: u64, src_cluster: usize, dst_cluster: usize) -> u64 {
        (ptr + dst_cluster as u64 * self.cluster_offset) - src_cluster as u64 * self.cluster_offset
    }

    /// Address of a logical CLM buffer inside a given cluster.
    #[inline]
    pub fn cluster_address(&self, handle: BufferHandle, cluster: usize) -> u64 {
        self.clm_base(cluster) + handle.offset
    }

    /// All cores in launch order.
    pub fn cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        (0..self.clusters)
            .flat_map(move |k| (0..self.cores_per_cluster()).map(move |i| CoreId::new(k, i)))
    }
}

/// Any failure a kernel or the fabric can report.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Memory access failure.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Bulk DMA failure.
    #[error(transparent)]
    Dma(#[from] DmaError),

    /// Barrier failure.
    #[error(transparent)]
    Barrier(#[from] BarrierError),

    /// Operand streaming failure.
    #[error(transparent)]
    Ssr(#[from] SsrError),

    /// Matrix engine failure.
    #[error(transparent)]
    Hwpe(#[from] HwpeError),

    /// A caller-guaranteed kernel precondition does not hold.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// The global store has no room for a host allocation.
    #[error("global store exhausted: requested {requested} bytes, {available} available")]
    OutOfGlobalMemory { requested: u64, available: u64 },

    /// A core panicked.
    #[error("{core} panicked: {message}")]
    CorePanicked { core: CoreId, message: String },
}

impl FabricError {
    /// Whether this error is only the echo of another core's failure.
    pub fn is_poison_echo(&self) -> bool {
        matches!(self, Self::Barrier(BarrierError::Poisoned { .. }))
    }
}

/// Summary of one kernel launch.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    /// Number of cores that ran the kernel.
    pub cores: usize,
    /// Wall-clock duration of the launch.
    pub elapsed: Duration,
    /// Global barrier generations completed during the launch.
    pub global_barriers: u64,
    /// Inter-cluster barrier generations completed during the launch.
    pub inter_cluster_barriers: u64,
}

/// The complete fabric: memory, barriers, engines.
#[derive(Debug)]
pub struct Fabric {
    config: FabricConfig,
    topology: Topology,
    memory: Memory,
    barriers: Barriers,
    dma: Vec<Mutex<DmaEngine>>,
    hwpe: Vec<Hwpe>,
    global_heap: AtomicU64,
}

impl Fabric {
    /// Alignment of host allocations in the global store.
    pub const GLOBAL_ALIGN: u64 = 64;

    /// Build a fabric from a validated configuration.
    pub fn new(config: FabricConfig) -> Result<Self, FabricError> {
        config.validate()?;
        let topology = Topology::from_config(&config);

        let mut memory = Memory::new();
        memory.add_region("global", config.global_base, config.global_size)?;
        for k in 0..topology.clusters {
            memory.add_region(format!("clm{}", k), topology.clm_base(k), topology.clm_size)?;
        }

        let dma = (0..topology.clusters)
            .map(|k| Mutex::new(DmaEngine::new(k, config.dma_channels, config.dma_bus_width)))
            .collect();
        let hwpe = (0..topology.clusters).map(Hwpe::new).collect();

        log::debug!(
            "Fabric: {} cluster(s) x ({} compute + 1 DMA) cores, CLM {} bytes every 0x{:x}",
            topology.clusters,
            topology.compute_cores,
            topology.clm_size,
            topology.cluster_offset
        );

        Ok(Self {
            barriers: Barriers::new(topology.clusters, topology.cores_per_cluster()),
            global_heap: AtomicU64::new(config.global_base),
            config,
            topology,
            memory,
            dma,
            hwpe,
        })
    }

    /// Configuration the fabric was built from.
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Geometry.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Shared memory.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Barriers.
    pub fn barriers(&self) -> &Barriers {
        &self.barriers
    }

    /// DMA engine of a cluster, locked.
    pub fn dma_engine(&self, cluster: usize) -> MutexGuard<'_, DmaEngine> {
        self.dma[cluster].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-channel DMA statistics of a cluster.
    pub fn dma_stats(&self, cluster: usize) -> Vec<ChannelStats> {
        self.dma_engine(cluster).stats().to_vec()
    }

    /// Matrix engine of a cluster.
    pub fn hwpe(&self, cluster: usize) -> &Hwpe {
        &self.hwpe[cluster]
    }

    /// First free CLM address of `cluster`.
    pub fn l1_next(&self, cluster: usize) -> u64 {
        self.topology.clm_base(cluster) + self.config.clm_reserved
    }

    /// The CLM allocator `core` starts a kernel with. The host uses it to
    /// replay a kernel's allocation sequence and find its buffers.
    pub fn clm_allocator(&self, core: CoreId) -> ClmAllocator {
        ClmAllocator::new(Layout::new(self.topology, core), self.l1_next(core.cluster))
    }

    /// Reserve `bytes` in the global store for host data.
    pub fn global_alloc(&self, bytes: u64) -> Result<u64, FabricError> {
        let size = bytes.max(1).next_multiple_of(Self::GLOBAL_ALIGN);
        let end = self.config.global_base + self.config.global_size;
        let base = self
            .global_heap
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                (cur + size <= end).then_some(cur + size)
            })
            .map_err(|cur| FabricError::OutOfGlobalMemory {
                requested: bytes,
                available: end - cur,
            })?;
        log::debug!("global_alloc: {} bytes at 0x{:010x}", bytes, base);
        Ok(base)
    }

    /// Release every host allocation in the global store.
    pub fn global_reset(&self) {
        self.global_heap.store(self.config.global_base, Ordering::Relaxed);
    }

    /// Allocate and fill a vector of doubles in the global store.
    pub fn upload_f64s(&self, values: &[f64]) -> Result<u64, FabricError> {
        let addr = self.global_alloc(8 * values.len() as u64)?;
        self.memory.write_f64s(addr, values)?;
        Ok(addr)
    }

    /// Allocate and fill a vector of words in the global store.
    pub fn upload_u32s(&self, values: &[u32]) -> Result<u64, FabricError> {
        let addr = self.global_alloc(4 * values.len() as u64)?;
        self.memory.write_u32s(addr, values)?;
        Ok(addr)
    }

    /// Run `kernel` on every core (SPMD) and wait for all of them.
    ///
    /// If any core fails, every barrier is poisoned so the other cores
    /// unblock, and the first failure that is not a poison echo is returned.
    pub fn launch<F>(&self, kernel: F) -> Result<LaunchReport, FabricError>
    where
        F: Fn(&CoreContext<'_>) -> Result<(), FabricError> + Sync,
    {
        self.barriers.reset_all();
        let global_before = self.barriers.global().stats().completions;
        let inter_before = self.barriers.inter_cluster().stats().completions;
        let started = Instant::now();
        log::debug!("launch on {} cores", self.topology.total_cores());

        let results: Vec<(CoreId, Result<(), FabricError>)> = std::thread::scope(|s| {
            let handles: Vec<_> = self
                .topology
                .cores()
                .map(|id| {
                    let kernel = &kernel;
                    let handle = s.spawn(move || {
                        let ctx = CoreContext::new(self, id, started);
                        let result = match panic::catch_unwind(AssertUnwindSafe(|| kernel(&ctx))) {
                            Ok(result) => result,
                            Err(payload) => Err(FabricError::CorePanicked {
                                core: id,
                                message: panic_message(payload.as_ref()),
                            }),
                        };
                        if let Err(e) = &result {
                            if !e.is_poison_echo() {
                                log::debug!("{} failed: {}", id, e);
                            }
                            self.barriers.poison_all();
                        }
                        result
                    });
                    (id, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = handle.join().unwrap_or_else(|payload| {
                        Err(FabricError::CorePanicked {
                            core: id,
                            message: panic_message(payload.as_ref()),
                        })
                    });
                    (id, result)
                })
                .collect()
        });

        let mut first_echo = None;
        for (id, result) in results {
            match result {
                Ok(()) => {}
                Err(e) if e.is_poison_echo() => {
                    first_echo.get_or_insert((id, e));
                }
                Err(e) => {
                    log::warn!("launch failed on {}: {}", id, e);
                    return Err(e);
                }
            }
        }
        if let Some((id, e)) = first_echo {
            log::warn!("launch failed on {}: {}", id, e);
            return Err(e);
        }

        let report = LaunchReport {
            cores: self.topology.total_cores(),
            elapsed: started.elapsed(),
            global_barriers: self.barriers.global().stats().completions - global_before,
            inter_cluster_barriers: self.barriers.inter_cluster().stats().completions - inter_before,
        };
        log::debug!("launch finished in {:?}", report.elapsed);
        Ok(report)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A small fabric for unit tests.
    pub fn small_fabric(clusters: usize, compute_cores: usize) -> Fabric {
        Fabric::new(FabricConfig {
            clusters,
            compute_cores,
            global_size: 0x10_0000,
            ..FabricConfig::default()
        })
        .unwrap()
    }
}
