//! Operand streams and hardware repeat of a compute core.
//!
//! Each compute core has three data movers. A mover is configured with up
//! to four loop dimensions (iteration count and byte stride each) and then
//! armed as a read or write stream at a base address. While streaming is
//! enabled, every pop from a read stream returns the next element and every
//! push to a write stream stores to the next address.
//!
//! [`frep`] runs a body `n + 1` times, mirroring the hardware repeat
//! instruction that replays a block of floating-point instructions.

use thiserror::Error;

use super::memory::{Memory, MemoryError};
use crate::dma::addressing::{AddressGenerator, DimensionConfig, MAX_DIMS};

/// Number of data movers per core.
pub const NUM_DATA_MOVERS: usize = 3;

/// One of the three data movers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMover {
    Dm0 = 0,
    Dm1 = 1,
    Dm2 = 2,
}

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SsrError {
    #[error("operand streaming is disabled")]
    Disabled,

    #[error("{0:?} is not armed")]
    NotArmed(DataMover),

    #[error("{0:?} stream exhausted")]
    Exhausted(DataMover),

    #[error("{0:?} is armed in the other direction")]
    WrongDirection(DataMover),

    #[error("stream dimensionality {0} out of range 1..=4")]
    InvalidDims(usize),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Clone, Default)]
struct Mover {
    dims: [DimensionConfig; MAX_DIMS],
    stream: Option<(Direction, AddressGenerator)>,
}

/// Stream unit of one compute core.
#[derive(Debug, Clone, Default)]
pub struct SsrUnit {
    movers: [Mover; NUM_DATA_MOVERS],
    enabled: bool,
    elements: u64,
}

impl SsrUnit {
    pub fn new() -> Self {
        Self::default()
    }

    fn mover(&mut self, dm: DataMover) -> &mut Mover {
        &mut self.movers[dm as usize]
    }

    /// Configure loop dimensions, innermost first, as (iterations, byte stride).
    pub fn loop_nd(&mut self, dm: DataMover, dims: &[(u32, i64)]) -> Result<(), SsrError> {
        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(SsrError::InvalidDims(dims.len()));
        }
        let mover = self.mover(dm);
        mover.dims = [DimensionConfig::default(); MAX_DIMS];
        for (slot, &(size, stride)) in mover.dims.iter_mut().zip(dims) {
            *slot = DimensionConfig::new(size, stride);
        }
        Ok(())
    }

    pub fn loop_1d(&mut self, dm: DataMover, b0: u32, s0: i64) {
        let mover = self.mover(dm);
        mover.dims = [DimensionConfig::default(); MAX_DIMS];
        mover.dims[0] = DimensionConfig::new(b0, s0);
    }

    pub fn loop_2d(&mut self, dm: DataMover, b0: u32, b1: u32, s0: i64, s1: i64) {
        let mover = self.mover(dm);
        mover.dims = [DimensionConfig::default(); MAX_DIMS];
        mover.dims[0] = DimensionConfig::new(b0, s0);
        mover.dims[1] = DimensionConfig::new(b1, s1);
    }

    /// Arm `dm` as a read stream over its first `dims` dimensions from `ptr`.
    pub fn read(&mut self, dm: DataMover, dims: usize, ptr: u64) -> Result<(), SsrError> {
        self.arm(dm, Direction::Read, dims, ptr)
    }

    /// Arm `dm` as a write stream over its first `dims` dimensions to `ptr`.
    pub fn write(&mut self, dm: DataMover, dims: usize, ptr: u64) -> Result<(), SsrError> {
        self.arm(dm, Direction::Write, dims, ptr)
    }

    fn arm(&mut self, dm: DataMover, dir: Direction, dims: usize, ptr: u64) -> Result<(), SsrError> {
        if dims == 0 || dims > MAX_DIMS {
            return Err(SsrError::InvalidDims(dims));
        }
        let mover = self.mover(dm);
        let generator = AddressGenerator::from_dims(ptr, &mover.dims[..dims]);
        mover.stream = Some((dir, generator));
        Ok(())
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Disable streaming and drop all armed streams.
    pub fn disable(&mut self) {
        self.enabled = false;
        for mover in &mut self.movers {
            mover.stream = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `dm` has loop dimensions from an earlier setup.
    pub fn is_configured(&self, dm: DataMover) -> bool {
        self.movers[dm as usize].dims[0].size != 0
    }

    /// Elements moved through streams so far.
    pub fn elements(&self) -> u64 {
        self.elements
    }

    fn next_address(&mut self, dm: DataMover, dir: Direction) -> Result<u64, SsrError> {
        if !self.enabled {
            return Err(SsrError::Disabled);
        }
        let (armed, generator) = self.mover(dm).stream.as_mut().ok_or(SsrError::NotArmed(dm))?;
        if *armed != dir {
            return Err(SsrError::WrongDirection(dm));
        }
        let addr = generator.next().ok_or(SsrError::Exhausted(dm))?;
        self.elements += 1;
        Ok(addr)
    }

    /// Next double of a read stream.
    pub fn pop(&mut self, dm: DataMover, memory: &Memory) -> Result<f64, SsrError> {
        let addr = self.next_address(dm, Direction::Read)?;
        Ok(memory.read_f64(addr)?)
    }

    /// Store a double to the next address of a write stream.
    pub fn push(&mut self, dm: DataMover, memory: &Memory, value: f64) -> Result<(), SsrError> {
        let addr = self.next_address(dm, Direction::Write)?;
        Ok(memory.write_f64(addr, value)?)
    }
}

/// Run `body` for iterations `0..=n_frep`.
pub fn frep<E>(n_frep: usize, mut body: impl FnMut(usize) -> Result<(), E>) -> Result<(), E> {
    for i in 0..=n_frep {
        body(i)?;
    }
    Ok(())
}
