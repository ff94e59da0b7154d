//! Job argument blocks.
//!
//! The host writes an argument block into the global store; the DMA core of
//! each cluster stages it into CLM before the compute cores read it. Blocks
//! are `#[repr(C)]` with explicit padding so their byte image is fixed.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::fabric::memory::{Memory, MemoryError};

/// An argument block that can be copied through fabric memory.
pub trait JobArgs: FromBytes + IntoBytes + Immutable + KnownLayout + Sized {
    /// Size of the byte image.
    const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Read a block from memory.
    fn load(memory: &Memory, addr: u64) -> Result<Self, MemoryError> {
        let mut args = Self::new_zeroed();
        memory.read_bytes(addr, args.as_mut_bytes())?;
        Ok(args)
    }

    /// Write the block to memory.
    fn store(&self, memory: &Memory, addr: u64) -> Result<(), MemoryError> {
        memory.write_bytes(addr, self.as_bytes())
    }
}

/// Element precision tag: the element size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp64 = 8,
    Fp32 = 4,
    Fp16 = 2,
    Fp8 = 1,
}

impl Precision {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            8 => Some(Self::Fp64),
            4 => Some(Self::Fp32),
            2 => Some(Self::Fp16),
            1 => Some(Self::Fp8),
            _ => None,
        }
    }

    /// Bytes per element.
    #[inline]
    pub fn bytes(self) -> usize {
        self as usize
    }
}

/// `z = a * x + y` over `l` doubles.
#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AxpyArgs {
    pub l: u32,
    _pad: u32,
    pub a: f64,
    pub x_addr: u64,
    pub y_addr: u64,
    pub z_addr: u64,
}

impl AxpyArgs {
    pub fn new(l: u32, a: f64, x_addr: u64, y_addr: u64, z_addr: u64) -> Self {
        Self {
            l,
            _pad: 0,
            a,
            x_addr,
            y_addr,
            z_addr,
        }
    }
}

impl JobArgs for AxpyArgs {}

/// `C = alpha * A * B + beta * C` with tiling and staging options.
///
/// Flags are 0/1 words. `kernel` selects the inner kernel (see
/// [`crate::kernels::inner::InnerKernelId`]).
#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct GemmArgs {
    pub alpha: f64,
    pub prec: u32,
    pub setup_ssr: u32,
    pub parallelize_m: u32,
    pub parallelize_k: u32,
    pub m_tiles: u32,
    pub n_tiles: u32,
    pub k_tiles: u32,
    pub load_a: u32,
    pub load_b: u32,
    pub load_c: u32,
    pub transa: u32,
    pub transb: u32,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    _pad0: u32,
    pub a: u64,
    pub b: u64,
    pub beta: u32,
    _pad1: u32,
    pub c: u64,
    pub kernel: u32,
    _pad2: u32,
}

impl GemmArgs {
    /// Untiled FP64 product `C = A * B` with everything staged through CLM.
    pub fn fp64(m: u32, n: u32, k: u32, a: u64, b: u64, c: u64) -> Self {
        Self {
            alpha: 1.0,
            prec: Precision::Fp64 as u32,
            setup_ssr: 1,
            parallelize_m: 0,
            parallelize_k: 0,
            m_tiles: 1,
            n_tiles: 1,
            k_tiles: 1,
            load_a: 1,
            load_b: 1,
            load_c: 1,
            transa: 0,
            transb: 0,
            m,
            n,
            k,
            _pad0: 0,
            a,
            b,
            beta: 0,
            _pad1: 0,
            c,
            kernel: 0,
            _pad2: 0,
        }
    }
}

impl JobArgs for GemmArgs {}

/// One matrix-engine job: `Z (+)= X * W` on `fmt` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HwpeMatmulArgs {
    pub x_addr: u64,
    pub w_addr: u64,
    pub z_addr: u64,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub op: u32,
    pub fmt: u32,
    _pad: u32,
}

impl HwpeMatmulArgs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(x_addr: u64, w_addr: u64, z_addr: u64, m: u32, n: u32, k: u32, op: u32, fmt: u32) -> Self {
        Self {
            x_addr,
            w_addr,
            z_addr,
            m,
            n,
            k,
            op,
            fmt,
            _pad: 0,
        }
    }
}

impl JobArgs for HwpeMatmulArgs {}
