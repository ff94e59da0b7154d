//! Kernels that run on the fabric.
//!
//! Every kernel is an SPMD function `fn(&CoreContext, ...)` executed by all
//! cores of all clusters. Cores branch on their role: the DMA core moves
//! data between the global store and CLM, the compute cores do arithmetic,
//! and barriers separate the phases.

pub mod args;
pub mod axpy;
pub mod gemm;
pub mod hwpe_matmul;
pub mod inner;
pub mod kmeans;

use crate::fabric::{ClmAllocator, CoreContext, FabricError, View};
use args::JobArgs;

/// Stage an argument block from the global store into CLM.
///
/// The DMA core copies the block to the start of `alloc`; after the cluster
/// barrier every core reads its own copy from CLM.
pub fn stage_args<A: JobArgs>(core: &CoreContext<'_>, alloc: &mut ClmAllocator, args_addr: u64) -> Result<A, FabricError> {
    let local = alloc.alloc_aligned(View::ClusterPrivate, A::SIZE)?;
    if core.is_dm_core() {
        let dma = core.dma()?;
        dma.start_1d(local, args_addr, A::SIZE)?;
        dma.wait_all()?;
    }
    core.cluster_hw_barrier()?;
    Ok(A::load(core.memory(), local)?)
}
