//! Per-core execution context handed to every kernel invocation.
//!
//! A kernel sees the fabric only through its [`CoreContext`]: identity
//! queries, the shared memory, the barriers, and the hardware units that
//! belong to its cluster (DMA on the DMA core, operand streams on compute
//! cores, the HWPE register window).

use std::cell::{RefCell, RefMut};
use std::sync::atomic::{fence, Ordering};
use std::time::Instant;

use super::layout::{ClmAllocator, Layout};
use super::memory::Memory;
use super::ssr::SsrUnit;
use super::{CoreId, Fabric, FabricError, Topology};
use crate::config::FabricConfig;
use crate::dma::isa::DmaRegisters;
use crate::dma::{Dma, DmaError};
use crate::hwpe::driver::HwpeDriver;

/// Everything one core can observe and drive.
pub struct CoreContext<'f> {
    fabric: &'f Fabric,
    id: CoreId,
    started: Instant,
    dma_regs: RefCell<DmaRegisters>,
    ssr: RefCell<SsrUnit>,
}

impl<'f> CoreContext<'f> {
    pub(crate) fn new(fabric: &'f Fabric, id: CoreId, started: Instant) -> Self {
        Self {
            fabric,
            id,
            started,
            dma_regs: RefCell::new(DmaRegisters::default()),
            ssr: RefCell::new(SsrUnit::new()),
        }
    }

    // === Identity ===

    /// This core's identity.
    #[inline]
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Index of this core's cluster.
    #[inline]
    pub fn cluster_idx(&self) -> usize {
        self.id.cluster
    }

    /// Index of this core within its cluster (`P` for the DMA core).
    #[inline]
    pub fn cluster_core_idx(&self) -> usize {
        self.id.index
    }

    /// Number of clusters.
    #[inline]
    pub fn cluster_num(&self) -> usize {
        self.topology().clusters
    }

    /// Compute cores per cluster.
    #[inline]
    pub fn cluster_compute_core_num(&self) -> usize {
        self.topology().compute_cores
    }

    /// Global linear core index.
    #[inline]
    pub fn global_core_idx(&self) -> usize {
        self.topology().global_index(self.id)
    }

    /// Cores on the fabric.
    #[inline]
    pub fn global_core_num(&self) -> usize {
        self.topology().total_cores()
    }

    #[inline]
    pub fn is_dm_core(&self) -> bool {
        self.topology().is_dm_core(self.id)
    }

    #[inline]
    pub fn is_compute_core(&self) -> bool {
        !self.is_dm_core()
    }

    // === Fabric ===

    pub fn topology(&self) -> &'f Topology {
        self.fabric.topology()
    }

    pub fn config(&self) -> &'f FabricConfig {
        self.fabric.config()
    }

    pub fn memory(&self) -> &'f Memory {
        self.fabric.memory()
    }

    /// First free CLM address of this core's cluster.
    pub fn l1_next(&self) -> u64 {
        self.fabric.l1_next(self.id.cluster)
    }

    /// Layout helper bound to this core.
    pub fn layout(&self) -> Layout {
        Layout::new(*self.topology(), self.id)
    }

    /// Bump allocator over this cluster's CLM, starting at [`Self::l1_next`].
    ///
    /// Every core of the cluster gets the same sequence of addresses for the
    /// same sequence of requests.
    pub fn allocator(&self) -> ClmAllocator {
        self.fabric.clm_allocator(self.id)
    }

    // === Synchronization ===

    /// Wait for every core of this cluster.
    pub fn cluster_hw_barrier(&self) -> Result<(), FabricError> {
        self.fabric.barriers().cluster(self.id.cluster).wait(self.id)?;
        Ok(())
    }

    /// Wait for one delegated core of every cluster.
    pub fn inter_cluster_barrier(&self) -> Result<(), FabricError> {
        self.fabric.barriers().inter_cluster().wait(self.id)?;
        Ok(())
    }

    /// Wait for every core of the fabric.
    pub fn global_barrier(&self) -> Result<(), FabricError> {
        self.fabric.barriers().global().wait(self.id)?;
        Ok(())
    }

    /// Retire outstanding floating-point work before continuing.
    #[inline]
    pub fn fpu_fence(&self) {
        fence(Ordering::SeqCst);
    }

    /// Nanoseconds since the launch started.
    pub fn mcycle(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    // === Hardware units ===

    /// This cluster's DMA engine. Only the DMA core may issue transfers.
    pub fn dma(&self) -> Result<Dma<'_>, DmaError> {
        if !self.is_dm_core() {
            return Err(DmaError::NotDmCore { core: self.id });
        }
        Ok(Dma::new(
            &self.fabric.dma[self.id.cluster],
            self.memory(),
            &self.dma_regs,
        ))
    }

    /// Operand-stream unit of this core.
    pub fn ssr(&self) -> RefMut<'_, SsrUnit> {
        self.ssr.borrow_mut()
    }

    /// Register-level driver for this cluster's matrix engine.
    pub fn hwpe(&self) -> HwpeDriver<'f> {
        HwpeDriver::new(self.fabric.hwpe(self.id.cluster), self.memory())
    }
}
