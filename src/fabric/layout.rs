//! CLM placement of kernel buffers.
//!
//! Every core of a cluster runs the same allocation sequence from the same
//! starting address, so all of them agree on where each buffer lives without
//! communicating. Three views are available:
//!
//! | View              | Returned pointer               | Bytes consumed |
//! |-------------------|--------------------------------|----------------|
//! | cluster-private   | `base`                         | `size`         |
//! | core-private      | `base + slot * size`           | `size * P`     |
//! | common            | `base - k * S` (cluster 0 copy)| `size`         |
//!
//! Compute core `i` owns slot `i` of a core-private buffer; the DMA core
//! aliases slot 0. A core-private buffer whose slot 0 of cluster 0 is also
//! used as a common buffer forms a [`ReductionBuffer`]: partial results are
//! reduced into core 0's slot, which then holds the final value.

use super::{CoreId, FabricError, Topology};

/// Which cores share an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// One copy per cluster.
    ClusterPrivate,
    /// One copy per compute core.
    CorePrivate,
    /// One copy on the whole fabric, resident in cluster 0.
    Common,
}

/// Result of placing one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Address the calling core should use.
    pub ptr: u64,
    /// Next free address (always in the caller's own cluster).
    pub new_base: u64,
}

/// Placement rules for one core.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    topology: Topology,
    core: CoreId,
}

impl Layout {
    pub fn new(topology: Topology, core: CoreId) -> Self {
        Self { topology, core }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Slot a core uses in core-private buffers.
    #[inline]
    pub fn slot(&self) -> u64 {
        if self.topology.is_dm_core(self.core) {
            0
        } else {
            self.core.index as u64
        }
    }

    /// Place a buffer of `size` bytes at `base` in the given view.
    pub fn alloc(&self, view: View, base: u64, size: u64) -> Allocation {
        match view {
            View::ClusterPrivate => self.alloc_cluster_private(base, size),
            View::CorePrivate => self.alloc_core_private(base, size),
            View::Common => self.alloc_common(base, size),
        }
    }

    pub fn alloc_cluster_private(&self, base: u64, size: u64) -> Allocation {
        Allocation {
            ptr: base,
            new_base: base + size,
        }
    }

    pub fn alloc_core_private(&self, base: u64, size: u64) -> Allocation {
        Allocation {
            ptr: base + self.slot() * size,
            new_base: base + size * self.topology.compute_cores as u64,
        }
    }

    pub fn alloc_common(&self, base: u64, size: u64) -> Allocation {
        Allocation {
            ptr: base - self.core.cluster as u64 * self.topology.cluster_offset,
            new_base: base + size,
        }
    }

    /// Retarget a CLM pointer from one cluster to another.
    #[inline]
    pub fn remote(&self, ptr: u64, src_cluster: usize, dst_cluster: usize) -> u64 {
        self.topology.remote(ptr, src_cluster, dst_cluster)
    }
}

/// Cluster-independent name of a CLM buffer: its offset from the CLM base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    pub offset: u64,
    pub size: u64,
}

impl BufferHandle {
    /// Handle for the buffer at `ptr` in `cluster`'s CLM.
    pub fn from_local(topology: &Topology, cluster: usize, ptr: u64, size: u64) -> Self {
        Self {
            offset: ptr - topology.clm_base(cluster),
            size,
        }
    }
}

/// Per-core partials whose cluster-0, core-0 slot is the common result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionBuffer {
    handle: BufferHandle,
    slot_size: u64,
    slots: usize,
}

impl ReductionBuffer {
    /// Bytes per core slot.
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Slot of core `index` in `cluster`. The DMA core maps to slot 0.
    pub fn slot(&self, topology: &Topology, cluster: usize, index: usize) -> u64 {
        let slot = if index < self.slots { index } else { 0 };
        topology.cluster_address(self.handle, cluster) + slot as u64 * self.slot_size
    }

    /// The fabric-wide result: core 0's slot in cluster 0.
    pub fn common(&self, topology: &Topology) -> u64 {
        topology.cluster_address(self.handle, 0)
    }
}

/// Bump allocator over one cluster's CLM following [`Layout`] rules.
#[derive(Debug, Clone)]
pub struct ClmAllocator {
    layout: Layout,
    next: u64,
    limit: u64,
}

impl ClmAllocator {
    pub fn new(layout: Layout, start: u64) -> Self {
        let limit = layout.topology.clm_end(layout.core.cluster);
        Self {
            layout,
            next: start,
            limit,
        }
    }

    /// Next free address.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Bytes still free in this cluster's CLM.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.next)
    }

    /// Round the bump pointer up to `align` bytes.
    pub fn align(&mut self, align: u64) {
        self.next = self.next.next_multiple_of(align);
    }

    /// Place a buffer; fails if the cluster's CLM cannot hold it.
    pub fn alloc(&mut self, view: View, size: u64) -> Result<u64, FabricError> {
        let a = self.layout.alloc(view, self.next, size);
        if a.new_base > self.limit {
            return Err(FabricError::Precondition(format!(
                "CLM of cluster {} exhausted: need 0x{:x} bytes past 0x{:x}, end is 0x{:x}",
                self.layout.core.cluster, size, self.next, self.limit
            )));
        }
        self.next = a.new_base;
        Ok(a.ptr)
    }

    /// Place a buffer after aligning to 8 bytes.
    pub fn alloc_aligned(&mut self, view: View, size: u64) -> Result<u64, FabricError> {
        self.align(8);
        self.alloc(view, size)
    }

    /// Place a core-private buffer usable as a cross-cluster reduction.
    pub fn alloc_reduction(&mut self, slot_size: u64) -> Result<ReductionBuffer, FabricError> {
        self.align(8);
        let topology = self.layout.topology;
        let cluster = self.layout.core.cluster;
        let first_slot = self.next;
        self.alloc(View::CorePrivate, slot_size)?;
        Ok(ReductionBuffer {
            handle: BufferHandle::from_local(
                &topology,
                cluster,
                first_slot,
                slot_size * topology.compute_cores as u64,
            ),
            slot_size,
            slots: topology.compute_cores,
        })
    }
}
