//! Bulk DMA: asynchronous 1D/2D copies between the global store and CLM.
//!
//! Each cluster owns one [`engine::DmaEngine`] driven exclusively by its DMA
//! core. Transfers are issued through the ISA-level register front end in
//! [`isa`] and complete in the background as the engine is stepped; a core
//! waits for completion by polling the engine, which keeps it stepping.
//!
//! # Transfer shape
//!
//! A 2D transfer copies `repeat` lines of `size` bytes. Line `r` reads from
//! `src + r * src_stride` and writes to `dst + r * dst_stride`. A 1D
//! transfer is the special case `repeat = 1`.
//!
//! # Module Structure
//!
//! - `addressing`: multi-dimensional address generator (line starts, streams)
//! - `engine`: per-cluster engine with channel FIFOs and completion tracking
//! - `isa`: source/destination/stride/repeat registers and status selectors
//! - `tile`: tile load/store helpers built on 2D transfers

pub mod addressing;
pub mod engine;
pub mod isa;
pub mod tile;

use std::cell::RefCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::fabric::memory::{Memory, MemoryError};
use crate::fabric::CoreId;
use engine::DmaEngine;
use isa::{DmaRegisters, StatusSelector};

/// Transfer identifier. Ids are issued in increasing order starting at 1.
pub type TransferId = u32;

/// Bytes written with scalar stores before a memset is replicated by DMA.
pub const MEMSET_BLOCK: u64 = 64;

/// DMA error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    /// A compute core tried to use the DMA engine.
    #[error("{core} is not a DMA core")]
    NotDmCore { core: CoreId },

    /// Channel index out of range.
    #[error("DMA channel {channel} out of range (engine has {channels})")]
    InvalidChannel { channel: u32, channels: u32 },

    /// Waiting on an id that was never issued.
    #[error("unknown DMA transfer id {0}")]
    UnknownTransfer(TransferId),

    /// Line count wider than the engine's 32-bit repeat counter.
    #[error("DMA repeat count {0} exceeds the 32-bit line counter")]
    RepeatOverflow(u64),

    /// Status query with an unknown selector.
    #[error("invalid DMA status selector {0}")]
    InvalidStatusSelector(u32),

    /// memset length not a multiple of the replication block.
    #[error("memset length {0} is not a multiple of 64")]
    MemsetLength(u64),

    /// A transfer touched unmapped or misaligned memory.
    #[error("DMA transfer {id} failed: {source}")]
    Memory {
        id: TransferId,
        #[source]
        source: MemoryError,
    },

    /// Scalar access by the DMA core outside a transfer.
    #[error(transparent)]
    Access(#[from] MemoryError),
}

/// Convenience alias for DMA results.
pub type DmaResult<T> = Result<T, DmaError>;

/// 1D or 2D transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    OneD,
    TwoD,
}

/// A transfer as issued through the register front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub channel: u32,
    pub src: u64,
    pub dst: u64,
    /// Bytes per line.
    pub size: u64,
    pub src_stride: u64,
    pub dst_stride: u64,
    /// Number of lines.
    pub repeat: u64,
}

impl TransferRequest {
    /// Total bytes moved.
    pub fn total_bytes(&self) -> u64 {
        self.size * self.repeat
    }
}

/// Handle a DMA core uses to drive its cluster's engine.
///
/// Obtained from [`crate::fabric::CoreContext::dma`].
pub struct Dma<'c> {
    engine: &'c Mutex<DmaEngine>,
    memory: &'c Memory,
    regs: &'c RefCell<DmaRegisters>,
}

impl<'c> Dma<'c> {
    pub fn new(engine: &'c Mutex<DmaEngine>, memory: &'c Memory, regs: &'c RefCell<DmaRegisters>) -> Self {
        Self { engine, memory, regs }
    }

    fn engine(&self) -> MutexGuard<'_, DmaEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === ISA level ===

    /// Set the source address register.
    pub fn dmsrc(&self, lo: u32, hi: u32) {
        self.regs.borrow_mut().dmsrc(lo, hi);
    }

    /// Set the destination address register.
    pub fn dmdst(&self, lo: u32, hi: u32) {
        self.regs.borrow_mut().dmdst(lo, hi);
    }

    /// Set the stride registers.
    pub fn dmstr(&self, dst_stride: u64, src_stride: u64) {
        self.regs.borrow_mut().dmstr(dst_stride, src_stride);
    }

    /// Set the repeat register.
    pub fn dmrep(&self, repeat: u64) {
        self.regs.borrow_mut().dmrep(repeat);
    }

    /// Launch a transfer from the registers; `config` selects channel and shape.
    pub fn dmcpy(&self, size: u64, config: u32) -> DmaResult<TransferId> {
        let request = self.regs.borrow().request(size, config);
        self.engine().issue(request)
    }

    /// Same as [`Self::dmcpy`] with an immediate configuration.
    pub fn dmcpyi(&self, size: u64, config: u32) -> DmaResult<TransferId> {
        self.dmcpy(size, config)
    }

    /// Query the engine.
    pub fn dmstati(&self, selector: u32) -> DmaResult<u32> {
        let selector = StatusSelector::try_from(selector)?;
        Ok(self.engine().status(selector))
    }

    // === Library level ===

    /// Start an asynchronous 1D copy on channel 0.
    pub fn start_1d(&self, dst: u64, src: u64, size: u64) -> DmaResult<TransferId> {
        self.start_1d_channel(dst, src, size, 0)
    }

    /// Start an asynchronous 1D copy on a given channel.
    pub fn start_1d_channel(&self, dst: u64, src: u64, size: u64, channel: u32) -> DmaResult<TransferId> {
        self.set_addresses(dst, src);
        self.dmcpyi(size, isa::config_word(TransferKind::OneD, channel))
    }

    /// Start an asynchronous 2D copy on channel 0.
    pub fn start_2d(
        &self,
        dst: u64,
        src: u64,
        size: u64,
        dst_stride: u64,
        src_stride: u64,
        repeat: u64,
    ) -> DmaResult<TransferId> {
        self.start_2d_channel(dst, src, size, dst_stride, src_stride, repeat, 0)
    }

    /// Start an asynchronous 2D copy on a given channel.
    #[allow(clippy::too_many_arguments)]
    pub fn start_2d_channel(
        &self,
        dst: u64,
        src: u64,
        size: u64,
        dst_stride: u64,
        src_stride: u64,
        repeat: u64,
        channel: u32,
    ) -> DmaResult<TransferId> {
        self.set_addresses(dst, src);
        self.dmstr(dst_stride, src_stride);
        self.dmrep(repeat);
        self.dmcpy(size, isa::config_word(TransferKind::TwoD, channel))
    }

    fn set_addresses(&self, dst: u64, src: u64) {
        let (lo, hi) = isa::split_address(src);
        self.dmsrc(lo, hi);
        let (lo, hi) = isa::split_address(dst);
        self.dmdst(lo, hi);
    }

    /// Block until transfer `id` has completed.
    pub fn wait(&self, id: TransferId) -> DmaResult<()> {
        self.engine().wait(id, self.memory)
    }

    /// Block until the engine is idle.
    pub fn wait_all(&self) -> DmaResult<()> {
        self.engine().wait_all(self.memory)
    }

    /// Fill `len` bytes at `ptr` with `value`.
    ///
    /// The first 64 bytes are written directly, then replicated over the
    /// rest of the buffer by one 2D transfer with a zero source stride.
    /// Blocks until done.
    pub fn memset(&self, ptr: u64, value: u8, len: u64) -> DmaResult<()> {
        if len % MEMSET_BLOCK != 0 {
            return Err(DmaError::MemsetLength(len));
        }
        if len == 0 {
            return Ok(());
        }
        for i in 0..MEMSET_BLOCK {
            self.memory.write_u8(ptr + i, value)?;
        }
        self.start_2d(ptr, ptr, MEMSET_BLOCK, MEMSET_BLOCK, 0, len / MEMSET_BLOCK)?;
        self.wait_all()
    }
}
