//! Memory-mapped matrix engine (HWPE), one per cluster.
//!
//! The engine computes `Z = X·W` or `Z = Z + X·W` on FP16 or FP8 operands
//! where X is M×N, W is N×K and Z is M×K, all row-major in memory. Software
//! drives it through a small register window:
//!
//! | Offset | Register      | Access                                        |
//! |--------|---------------|-----------------------------------------------|
//! | 0x00   | TRIGGER       | write: start the configured job               |
//! | 0x04   | ACQUIRE       | read: 0 on success, -1 while a job is pending |
//! | 0x08   | EVT_CLEAR     | write: clear event bits                       |
//! | 0x0C   | STATUS        | read: 1 while busy, 0 when idle               |
//! | 0x10   | RUNNING_JOB   | read: jobs completed so far                   |
//! | 0x14   | SOFT_CLEAR    | write: abort and reset                        |
//! | 0x18   | CLK_GATE      | write: 1 enables the clock, 0 gates it        |
//! | 0x40+  | job registers | X/W/Z pointers, MCFG0/1, ARITH                |
//!
//! The job runs when status is first polled after the trigger; that poll
//! still reads busy and the following one reads idle.

pub mod compare;
pub mod driver;

use std::sync::{Mutex, MutexGuard, PoisonError};

use half::f16;
use thiserror::Error;

use crate::fabric::memory::{Memory, MemoryError};

pub const HWPE_TRIGGER: u32 = 0x00;
pub const HWPE_ACQUIRE: u32 = 0x04;
pub const HWPE_EVT_CLEAR: u32 = 0x08;
pub const HWPE_STATUS: u32 = 0x0C;
pub const HWPE_RUNNING_JOB: u32 = 0x10;
pub const HWPE_SOFT_CLEAR: u32 = 0x14;
pub const HWPE_CLK_GATE: u32 = 0x18;

/// Base of the job registers.
pub const REG_OFFS: u32 = 0x40;
pub const REG_X_PTR: u32 = 0x00;
pub const REG_W_PTR: u32 = 0x04;
pub const REG_Z_PTR: u32 = 0x08;
pub const REG_MCFG0: u32 = 0x0C;
pub const REG_MCFG1: u32 = 0x10;
pub const REG_ARITH: u32 = 0x14;

/// Size of the register window.
pub const ADDR_SPACE: u32 = 0x100;

const NUM_JOB_REGS: usize = 6;
const ACQUIRE_BUSY: u32 = u32::MAX;

/// Matrix operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmOp {
    /// `Z = X·W`
    Matmul = 0,
    /// `Z = Z + X·W`
    MatmulAccumulate = 1,
}

impl TryFrom<u32> for GemmOp {
    type Error = HwpeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Matmul),
            1 => Ok(Self::MatmulAccumulate),
            other => Err(HwpeError::UnsupportedOp(other)),
        }
    }
}

/// Element format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemmFormat {
    Fp16 = 0,
    /// E5M2: the upper byte of an FP16.
    Fp8 = 1,
}

impl GemmFormat {
    /// Bytes per element.
    pub fn bytes(self) -> u64 {
        match self {
            Self::Fp16 => 2,
            Self::Fp8 => 1,
        }
    }
}

impl TryFrom<u32> for GemmFormat {
    type Error = HwpeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Fp16),
            1 => Ok(Self::Fp8),
            other => Err(HwpeError::UnsupportedFormat(other)),
        }
    }
}

/// `MCFG0 = K << 16 | M`.
#[inline]
pub fn pack_mcfg0(m: u16, k: u16) -> u32 {
    (k as u32) << 16 | m as u32
}

/// `ARITH = op << 10 | fmt << 7`.
#[inline]
pub fn pack_arith(op: GemmOp, fmt: GemmFormat) -> u32 {
    (op as u32) << 10 | (fmt as u32) << 7
}

/// Encode an FP8 (E5M2) value by truncating an FP16 to its upper byte.
#[inline]
pub fn fp8_from_f32(value: f32) -> u8 {
    (f16::from_f32(value).to_bits() >> 8) as u8
}

/// Decode an FP8 (E5M2) value.
#[inline]
pub fn fp8_to_f32(bits: u8) -> f32 {
    f16::from_bits((bits as u16) << 8).to_f32()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwpeError {
    #[error("job triggered without a successful acquire")]
    NotAcquired,

    #[error("job triggered while the clock is gated")]
    ClockGated,

    #[error("unsupported GEMM operation {0}")]
    UnsupportedOp(u32),

    #[error("unsupported GEMM format {0}")]
    UnsupportedFormat(u32),

    #[error("no HWPE register at offset 0x{0:02x}")]
    InvalidOffset(u32),

    #[error("register at offset 0x{0:02x} is write-only")]
    WriteOnly(u32),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A memory-mapped device in a cluster's peripheral window.
pub trait Peripheral {
    /// Device name for logging.
    fn name(&self) -> &str;
    /// Load a 32-bit register.
    fn load(&self, memory: &Memory, offset: u32) -> Result<u32, HwpeError>;
    /// Store a 32-bit register.
    fn store(&self, memory: &Memory, offset: u32, value: u32) -> Result<(), HwpeError>;
}

/// One latched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwpeJob {
    pub x: u64,
    pub w: u64,
    pub z: u64,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub op: GemmOp,
    pub fmt: GemmFormat,
}

impl HwpeJob {
    fn from_regs(regs: &[u32; NUM_JOB_REGS]) -> Result<Self, HwpeError> {
        let reg = |off: u32| regs[(off / 4) as usize];
        let mcfg0 = reg(REG_MCFG0);
        let arith = reg(REG_ARITH);
        Ok(Self {
            x: reg(REG_X_PTR) as u64,
            w: reg(REG_W_PTR) as u64,
            z: reg(REG_Z_PTR) as u64,
            m: (mcfg0 & 0xFFFF) as usize,
            k: (mcfg0 >> 16) as usize,
            n: (reg(REG_MCFG1) & 0xFFFF) as usize,
            op: GemmOp::try_from((arith >> 10) & 0x7)?,
            fmt: GemmFormat::try_from((arith >> 7) & 0x7)?,
        })
    }

    fn load(&self, memory: &Memory, base: u64, idx: usize) -> Result<f32, MemoryError> {
        match self.fmt {
            GemmFormat::Fp16 => Ok(f16::from_bits(memory.read_u16(base + 2 * idx as u64)?).to_f32()),
            GemmFormat::Fp8 => Ok(fp8_to_f32(memory.read_u8(base + idx as u64)?)),
        }
    }

    fn store(&self, memory: &Memory, base: u64, idx: usize, value: f32) -> Result<(), MemoryError> {
        match self.fmt {
            GemmFormat::Fp16 => memory.write_u16(base + 2 * idx as u64, f16::from_f32(value).to_bits()),
            GemmFormat::Fp8 => memory.write_u8(base + idx as u64, fp8_from_f32(value)),
        }
    }

    /// Run the job to completion, accumulating in single precision.
    pub fn execute(&self, memory: &Memory) -> Result<(), MemoryError> {
        for i in 0..self.m {
            for j in 0..self.k {
                let mut acc = match self.op {
                    GemmOp::Matmul => 0.0f32,
                    GemmOp::MatmulAccumulate => self.load(memory, self.z, i * self.k + j)?,
                };
                for p in 0..self.n {
                    acc += self.load(memory, self.x, i * self.n + p)? * self.load(memory, self.w, p * self.k + j)?;
                }
                self.store(memory, self.z, i * self.k + j, acc)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct HwpeState {
    regs: [u32; NUM_JOB_REGS],
    acquired: bool,
    pending: Option<HwpeJob>,
    clock_enabled: bool,
    events: u32,
    jobs_done: u32,
}

/// Matrix engine of one cluster.
#[derive(Debug)]
pub struct Hwpe {
    cluster: usize,
    name: String,
    state: Mutex<HwpeState>,
}

impl Hwpe {
    pub fn new(cluster: usize) -> Self {
        Self {
            cluster,
            name: format!("hwpe{}", cluster),
            state: Mutex::new(HwpeState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HwpeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of jobs completed since creation or the last soft clear.
    pub fn jobs_completed(&self) -> u32 {
        self.lock().jobs_done
    }

    /// Pending event bits.
    pub fn events(&self) -> u32 {
        self.lock().events
    }
}

impl Peripheral for Hwpe {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, memory: &Memory, offset: u32) -> Result<u32, HwpeError> {
        let mut state = self.lock();
        let value = match offset {
            HWPE_ACQUIRE => {
                if state.pending.is_some() {
                    ACQUIRE_BUSY
                } else {
                    state.acquired = true;
                    0
                }
            }
            HWPE_STATUS => match state.pending.take() {
                Some(job) => {
                    log::debug!("{}: running {:?}", self.name, job);
                    job.execute(memory)?;
                    state.jobs_done += 1;
                    state.events |= 1;
                    1
                }
                None => 0,
            },
            HWPE_RUNNING_JOB => state.jobs_done,
            HWPE_TRIGGER | HWPE_EVT_CLEAR | HWPE_SOFT_CLEAR | HWPE_CLK_GATE => {
                return Err(HwpeError::WriteOnly(offset));
            }
            _ => job_reg_index(offset).map(|i| state.regs[i])?,
        };
        log::trace!("{}: load 0x{:02x} -> 0x{:08x}", self.name, offset, value);
        Ok(value)
    }

    fn store(&self, _memory: &Memory, offset: u32, value: u32) -> Result<(), HwpeError> {
        log::trace!("{}: store 0x{:02x} <- 0x{:08x}", self.name, offset, value);
        let mut state = self.lock();
        match offset {
            HWPE_TRIGGER => {
                if !state.clock_enabled {
                    return Err(HwpeError::ClockGated);
                }
                if !state.acquired {
                    return Err(HwpeError::NotAcquired);
                }
                let job = HwpeJob::from_regs(&state.regs)?;
                state.acquired = false;
                state.pending = Some(job);
            }
            HWPE_EVT_CLEAR => state.events &= !value,
            HWPE_SOFT_CLEAR => {
                log::debug!("{} (cluster {}): soft clear", self.name, self.cluster);
                let clock_enabled = state.clock_enabled;
                *state = HwpeState {
                    clock_enabled,
                    ..HwpeState::default()
                };
            }
            HWPE_CLK_GATE => state.clock_enabled = value != 0,
            HWPE_ACQUIRE | HWPE_STATUS | HWPE_RUNNING_JOB => {}
            _ => {
                let i = job_reg_index(offset)?;
                state.regs[i] = value;
            }
        }
        Ok(())
    }
}

fn job_reg_index(offset: u32) -> Result<usize, HwpeError> {
    let rel = offset.checked_sub(REG_OFFS).ok_or(HwpeError::InvalidOffset(offset))?;
    if rel % 4 != 0 || rel / 4 >= NUM_JOB_REGS as u32 {
        return Err(HwpeError::InvalidOffset(offset));
    }
    Ok((rel / 4) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory {
        let mut m = Memory::new();
        m.add_region("l1", 0x1000, 0x1000).unwrap();
        m
    }

    #[test]
    fn test_word_packing() {
        assert_eq!(pack_mcfg0(3, 5), 0x0005_0003);
        assert_eq!(pack_arith(GemmOp::MatmulAccumulate, GemmFormat::Fp8), 0x480);
        let regs = [0x1000, 0x1100, 0x1200, pack_mcfg0(2, 4), 3, pack_arith(GemmOp::Matmul, GemmFormat::Fp16)];
        let job = HwpeJob::from_regs(&regs).unwrap();
        assert_eq!((job.m, job.n, job.k), (2, 3, 4));
        assert_eq!(job.fmt, GemmFormat::Fp16);
    }

    #[test]
    fn test_fp8_is_fp16_upper_byte() {
        assert_eq!(fp8_from_f32(1.0), 0x3C);
        assert_eq!(fp8_to_f32(0x3C), 1.0);
        assert_eq!(fp8_to_f32(fp8_from_f32(-2.0)), -2.0);
        assert_eq!(fp8_to_f32(fp8_from_f32(0.5)), 0.5);
    }

    #[test]
    fn test_trigger_requires_clock_and_acquire() {
        let mem = memory();
        let hwpe = Hwpe::new(0);
        assert_eq!(hwpe.store(&mem, HWPE_TRIGGER, 0), Err(HwpeError::ClockGated));
        hwpe.store(&mem, HWPE_CLK_GATE, 1).unwrap();
        assert_eq!(hwpe.store(&mem, HWPE_TRIGGER, 0), Err(HwpeError::NotAcquired));
    }

    #[test]
    fn test_fp16_job_lifecycle() {
        let mem = memory();
        // X = [[1, 2]], W = [[3], [4]] -> Z = [[11]]
        for (i, v) in [1.0f32, 2.0].iter().enumerate() {
            mem.write_u16(0x1000 + 2 * i as u64, f16::from_f32(*v).to_bits()).unwrap();
        }
        for (i, v) in [3.0f32, 4.0].iter().enumerate() {
            mem.write_u16(0x1100 + 2 * i as u64, f16::from_f32(*v).to_bits()).unwrap();
        }

        let hwpe = Hwpe::new(0);
        hwpe.store(&mem, HWPE_CLK_GATE, 1).unwrap();
        assert_eq!(hwpe.load(&mem, HWPE_ACQUIRE).unwrap(), 0);
        for (off, v) in [
            (REG_X_PTR, 0x1000),
            (REG_W_PTR, 0x1100),
            (REG_Z_PTR, 0x1200),
            (REG_MCFG0, pack_mcfg0(1, 1)),
            (REG_MCFG1, 2),
            (REG_ARITH, pack_arith(GemmOp::Matmul, GemmFormat::Fp16)),
        ] {
            hwpe.store(&mem, REG_OFFS + off, v).unwrap();
        }
        hwpe.store(&mem, HWPE_TRIGGER, 0).unwrap();

        // Outstanding job blocks a second acquire
        assert_eq!(hwpe.load(&mem, HWPE_ACQUIRE).unwrap(), u32::MAX);
        assert_eq!(hwpe.load(&mem, HWPE_STATUS).unwrap(), 1);
        assert_eq!(hwpe.load(&mem, HWPE_STATUS).unwrap(), 0);
        assert_eq!(hwpe.load(&mem, HWPE_RUNNING_JOB).unwrap(), 1);
        assert_eq!(f16::from_bits(mem.read_u16(0x1200).unwrap()).to_f32(), 11.0);

        assert_eq!(hwpe.events(), 1);
        hwpe.store(&mem, HWPE_EVT_CLEAR, 1).unwrap();
        assert_eq!(hwpe.events(), 0);
    }

    #[test]
    fn test_accumulate_and_soft_clear() {
        let mem = memory();
        let one = f16::from_f32(1.0).to_bits();
        mem.write_u16(0x1000, one).unwrap();
        mem.write_u16(0x1100, one).unwrap();
        mem.write_u16(0x1200, f16::from_f32(5.0).to_bits()).unwrap();

        let job = HwpeJob {
            x: 0x1000,
            w: 0x1100,
            z: 0x1200,
            m: 1,
            n: 1,
            k: 1,
            op: GemmOp::MatmulAccumulate,
            fmt: GemmFormat::Fp16,
        };
        job.execute(&mem).unwrap();
        assert_eq!(f16::from_bits(mem.read_u16(0x1200).unwrap()).to_f32(), 6.0);

        let hwpe = Hwpe::new(1);
        hwpe.store(&mem, HWPE_CLK_GATE, 1).unwrap();
        hwpe.load(&mem, HWPE_ACQUIRE).unwrap();
        hwpe.store(&mem, REG_OFFS + REG_MCFG1, 7).unwrap();
        hwpe.store(&mem, HWPE_SOFT_CLEAR, 0).unwrap();
        assert_eq!(hwpe.load(&mem, REG_OFFS + REG_MCFG1).unwrap(), 0);
        assert_eq!(hwpe.store(&mem, HWPE_TRIGGER, 0), Err(HwpeError::NotAcquired));
    }

    #[test]
    fn test_bad_offsets() {
        let mem = memory();
        let hwpe = Hwpe::new(0);
        assert_eq!(hwpe.load(&mem, 0x20), Err(HwpeError::InvalidOffset(0x20)));
        assert_eq!(hwpe.load(&mem, REG_OFFS + 0x18), Err(HwpeError::InvalidOffset(0x58)));
        assert_eq!(hwpe.load(&mem, HWPE_TRIGGER), Err(HwpeError::WriteOnly(0)));
        assert_eq!(hwpe.name(), "hwpe0");
    }
}
