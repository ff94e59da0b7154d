//! Inner GEMM kernels.
//!
//! An inner kernel computes one core's share of a tile,
//! `C = alpha * A * B + beta * C`, with all three operands addressed
//! through leading dimensions (in elements). The tiled driver in
//! [`super::gemm`] selects a kernel once per job through [`resolve`].
//!
//! `beta == 0` never reads through to the product: the old value of C is
//! dropped instead of being multiplied, so stale NaNs in a freshly
//! allocated C buffer do not leak into the result.

use std::ops::{Add, Mul};

use half::f16;

use super::args::Precision;
use crate::fabric::memory::{Memory, MemoryError};
use crate::fabric::ssr::{frep, DataMover, SsrError};
use crate::fabric::{CoreContext, FabricError};

/// One core's view of a GEMM tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmTile {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub a: u64,
    pub lda: usize,
    /// A is stored K x M.
    pub transa: bool,
    pub b: u64,
    pub ldb: usize,
    /// B is stored N x K.
    pub transb: bool,
    pub c: u64,
    pub ldc: usize,
    pub alpha: f64,
    pub beta: f64,
    /// Reprogram the stream loops (streamed kernels only).
    pub setup_ssr: bool,
}

impl GemmTile {
    #[inline]
    fn a_index(&self, i: usize, kk: usize) -> usize {
        if self.transa {
            kk * self.lda + i
        } else {
            i * self.lda + kk
        }
    }

    #[inline]
    fn b_index(&self, kk: usize, j: usize) -> usize {
        if self.transb {
            j * self.ldb + kk
        } else {
            kk * self.ldb + j
        }
    }

    #[inline]
    fn c_index(&self, i: usize, j: usize) -> usize {
        i * self.ldc + j
    }

    fn is_empty(&self) -> bool {
        self.m == 0 || self.n == 0
    }
}

/// A precision-specific implementation of one core's tile product.
pub trait GemmInnerKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Element type the kernel reads and writes.
    fn precision(&self) -> Precision;

    fn run(&self, core: &CoreContext<'_>, tile: &GemmTile) -> Result<(), FabricError>;
}

/// Storage format plus accumulator type of one precision.
trait Element {
    type Acc: Copy + Default + PartialEq + Add<Output = Self::Acc> + Mul<Output = Self::Acc>;
    const PRECISION: Precision;

    fn scalar(x: f64) -> Self::Acc;
    fn load(memory: &Memory, addr: u64) -> Result<Self::Acc, MemoryError>;
    fn store(memory: &Memory, addr: u64, value: Self::Acc) -> Result<(), MemoryError>;
}

struct Double;
struct Single;
struct Half;

impl Element for Double {
    type Acc = f64;
    const PRECISION: Precision = Precision::Fp64;

    fn scalar(x: f64) -> f64 {
        x
    }

    fn load(memory: &Memory, addr: u64) -> Result<f64, MemoryError> {
        memory.read_f64(addr)
    }

    fn store(memory: &Memory, addr: u64, value: f64) -> Result<(), MemoryError> {
        memory.write_f64(addr, value)
    }
}

impl Element for Single {
    type Acc = f32;
    const PRECISION: Precision = Precision::Fp32;

    fn scalar(x: f64) -> f32 {
        x as f32
    }

    fn load(memory: &Memory, addr: u64) -> Result<f32, MemoryError> {
        memory.read_f32(addr)
    }

    fn store(memory: &Memory, addr: u64, value: f32) -> Result<(), MemoryError> {
        memory.write_f32(addr, value)
    }
}

// FP16 storage, FP32 accumulation.
impl Element for Half {
    type Acc = f32;
    const PRECISION: Precision = Precision::Fp16;

    fn scalar(x: f64) -> f32 {
        x as f32
    }

    fn load(memory: &Memory, addr: u64) -> Result<f32, MemoryError> {
        Ok(f16::from_bits(memory.read_u16(addr)?).to_f32())
    }

    fn store(memory: &Memory, addr: u64, value: f32) -> Result<(), MemoryError> {
        memory.write_u16(addr, f16::from_f32(value).to_bits())
    }
}

/// `multiplicand * multiplier`, or exactly zero when the multiplier is zero.
#[inline]
pub fn multiply_opt<T>(multiplicand: T, multiplier: T) -> T
where
    T: Copy + Default + PartialEq + Mul<Output = T>,
{
    if multiplier != T::default() {
        multiplicand * multiplier
    } else {
        T::default()
    }
}

fn gemm_baseline<E: Element>(memory: &Memory, tile: &GemmTile) -> Result<(), MemoryError> {
    let bytes = E::PRECISION.bytes() as u64;
    let alpha = E::scalar(tile.alpha);
    let beta = E::scalar(tile.beta);
    for i in 0..tile.m {
        for j in 0..tile.n {
            let mut acc = E::Acc::default();
            for kk in 0..tile.k {
                let a = E::load(memory, tile.a + tile.a_index(i, kk) as u64 * bytes)?;
                let b = E::load(memory, tile.b + tile.b_index(kk, j) as u64 * bytes)?;
                acc = acc + a * b;
            }
            let c_addr = tile.c + tile.c_index(i, j) as u64 * bytes;
            let c = multiply_opt(E::load(memory, c_addr)?, beta);
            E::store(memory, c_addr, alpha * acc + c)?;
        }
    }
    Ok(())
}

/// Scalar triple loop on doubles.
#[derive(Debug, Clone, Copy)]
pub struct Fp64Baseline;

impl GemmInnerKernel for Fp64Baseline {
    fn name(&self) -> &'static str {
        "fp64-baseline"
    }

    fn precision(&self) -> Precision {
        Precision::Fp64
    }

    fn run(&self, core: &CoreContext<'_>, tile: &GemmTile) -> Result<(), FabricError> {
        gemm_baseline::<Double>(core.memory(), tile)?;
        core.fpu_fence();
        Ok(())
    }
}

/// Scalar triple loop on singles.
#[derive(Debug, Clone, Copy)]
pub struct Fp32Baseline;

impl GemmInnerKernel for Fp32Baseline {
    fn name(&self) -> &'static str {
        "fp32-baseline"
    }

    fn precision(&self) -> Precision {
        Precision::Fp32
    }

    fn run(&self, core: &CoreContext<'_>, tile: &GemmTile) -> Result<(), FabricError> {
        gemm_baseline::<Single>(core.memory(), tile)?;
        core.fpu_fence();
        Ok(())
    }
}

/// Scalar triple loop on halves with single-precision accumulation.
#[derive(Debug, Clone, Copy)]
pub struct Fp16Baseline;

impl GemmInnerKernel for Fp16Baseline {
    fn name(&self) -> &'static str {
        "fp16-baseline"
    }

    fn precision(&self) -> Precision {
        Precision::Fp16
    }

    fn run(&self, core: &CoreContext<'_>, tile: &GemmTile) -> Result<(), FabricError> {
        gemm_baseline::<Half>(core.memory(), tile)?;
        core.fpu_fence();
        Ok(())
    }
}

/// Doubles with A and B fed by operand streams.
///
/// DM0 walks A and DM1 walks B over a three-level loop (k innermost, then
/// n, then m). A is replayed for every column with a zero n-stride and B
/// for every row with a zero m-stride, so each output element is one
/// repeated fused multiply-add of `k` stream pops. With `setup_ssr` off the
/// loop bounds of an earlier tile are reused and only the base pointers
/// are rearmed.
#[derive(Debug, Clone, Copy)]
pub struct Fp64Streamed;

impl GemmInnerKernel for Fp64Streamed {
    fn name(&self) -> &'static str {
        "fp64-streamed"
    }

    fn precision(&self) -> Precision {
        Precision::Fp64
    }

    fn run(&self, core: &CoreContext<'_>, tile: &GemmTile) -> Result<(), FabricError> {
        if tile.is_empty() {
            return Ok(());
        }
        if tile.k == 0 {
            // Nothing to stream; only the beta scaling remains.
            return Fp64Baseline.run(core, tile);
        }
        let mem = core.memory();
        let mut ssr = core.ssr();

        if tile.setup_ssr || !ssr.is_configured(DataMover::Dm0) {
            let (a_k, a_m) = if tile.transa { (tile.lda * 8, 8) } else { (8, tile.lda * 8) };
            let (b_k, b_n) = if tile.transb { (8, tile.ldb * 8) } else { (tile.ldb * 8, 8) };
            let (m, n, k) = (tile.m as u32, tile.n as u32, tile.k as u32);
            ssr.loop_nd(DataMover::Dm0, &[(k, a_k as i64), (n, 0), (m, a_m as i64)])?;
            ssr.loop_nd(DataMover::Dm1, &[(k, b_k as i64), (n, b_n as i64), (m, 0)])?;
        }
        ssr.read(DataMover::Dm0, 3, tile.a)?;
        ssr.read(DataMover::Dm1, 3, tile.b)?;
        ssr.enable();

        for i in 0..tile.m {
            for j in 0..tile.n {
                let mut acc = 0.0f64;
                frep(tile.k - 1, |_| -> Result<(), SsrError> {
                    let a = ssr.pop(DataMover::Dm0, mem)?;
                    let b = ssr.pop(DataMover::Dm1, mem)?;
                    acc = a.mul_add(b, acc);
                    Ok(())
                })?;
                let c_addr = tile.c + tile.c_index(i, j) as u64 * 8;
                let c = multiply_opt(mem.read_f64(c_addr)?, tile.beta);
                mem.write_f64(c_addr, tile.alpha.mul_add(acc, c))?;
            }
        }

        core.fpu_fence();
        ssr.disable();
        Ok(())
    }
}

/// Inner kernel selector stored in the job arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerKernelId {
    /// Pick by precision and stream support.
    Auto = 0,
    Fp64Baseline = 1,
    Fp64Streamed = 2,
    Fp32Baseline = 3,
    Fp16Baseline = 4,
}

impl TryFrom<u32> for InnerKernelId {
    type Error = FabricError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Auto),
            1 => Ok(Self::Fp64Baseline),
            2 => Ok(Self::Fp64Streamed),
            3 => Ok(Self::Fp32Baseline),
            4 => Ok(Self::Fp16Baseline),
            _ => Err(FabricError::Precondition(format!("unknown GEMM inner kernel {}", value))),
        }
    }
}

/// Select the inner kernel for a job of precision `prec`.
pub fn resolve(
    id: InnerKernelId,
    prec: Precision,
    streaming: bool,
) -> Result<&'static dyn GemmInnerKernel, FabricError> {
    let kernel: &'static dyn GemmInnerKernel = match id {
        InnerKernelId::Auto => match prec {
            Precision::Fp64 if streaming => &Fp64Streamed,
            Precision::Fp64 => &Fp64Baseline,
            Precision::Fp32 => &Fp32Baseline,
            Precision::Fp16 => &Fp16Baseline,
            Precision::Fp8 => {
                return Err(FabricError::Precondition(
                    "no GEMM inner kernel for FP8".to_string(),
                ))
            }
        },
        InnerKernelId::Fp64Baseline => &Fp64Baseline,
        InnerKernelId::Fp64Streamed => &Fp64Streamed,
        InnerKernelId::Fp32Baseline => &Fp32Baseline,
        InnerKernelId::Fp16Baseline => &Fp16Baseline,
    };
    if kernel.precision() != prec {
        return Err(FabricError::Precondition(format!(
            "inner kernel {} computes {:?}, job is {:?}",
            kernel.name(),
            kernel.precision(),
            prec
        )));
    }
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::test_support::small_fabric;
    use crate::fabric::{CoreId, Fabric};
    use std::time::Instant;

    fn reference(m: usize, n: usize, k: usize, a: &[f64], b: &[f64], c: &[f64], alpha: f64, beta: f64) -> Vec<f64> {
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                let acc: f64 = (0..k).map(|kk| a[i * k + kk] * b[kk * n + j]).sum();
                out[i * n + j] = alpha * acc + if beta != 0.0 { beta * c[i * n + j] } else { 0.0 };
            }
        }
        out
    }

    fn tile(m: usize, n: usize, k: usize, a: u64, b: u64, c: u64) -> GemmTile {
        GemmTile {
            m,
            n,
            k,
            a,
            lda: k,
            transa: false,
            b,
            ldb: n,
            transb: false,
            c,
            ldc: n,
            alpha: 1.0,
            beta: 0.0,
            setup_ssr: true,
        }
    }

    fn run_on_core0(fabric: &Fabric, kernel: &dyn GemmInnerKernel, tile: &GemmTile) {
        let core = CoreContext::new(fabric, CoreId::new(0, 0), Instant::now());
        kernel.run(&core, tile).unwrap();
    }

    #[test]
    fn test_multiply_opt_drops_nan() {
        assert_eq!(multiply_opt(f64::NAN, 0.0), 0.0);
        assert_eq!(multiply_opt(3.0, 2.0), 6.0);
    }

    #[test]
    fn test_fp64_kernels_match_reference() {
        let (m, n, k) = (3, 4, 5);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64 - 4.0).collect();
        let b: Vec<f64> = (0..k * n).map(|x| (x % 7) as f64).collect();
        let c: Vec<f64> = (0..m * n).map(|x| x as f64).collect();

        for kernel in [&Fp64Baseline as &dyn GemmInnerKernel, &Fp64Streamed] {
            let fabric = small_fabric(1, 2);
            let (aa, ba, ca) = (
                fabric.upload_f64s(&a).unwrap(),
                fabric.upload_f64s(&b).unwrap(),
                fabric.upload_f64s(&c).unwrap(),
            );
            let mut t = tile(m, n, k, aa, ba, ca);
            t.alpha = 2.0;
            t.beta = 0.5;
            run_on_core0(&fabric, kernel, &t);
            assert_eq!(
                fabric.memory().read_f64s(ca, m * n).unwrap(),
                reference(m, n, k, &a, &b, &c, 2.0, 0.5),
                "{}",
                kernel.name()
            );
        }
    }

    #[test]
    fn test_transposed_operands() {
        let (m, n, k) = (2, 3, 4);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64 + 1.0).collect();
        let b: Vec<f64> = (0..k * n).map(|x| 2.0 - x as f64).collect();
        let at: Vec<f64> = (0..k * m).map(|x| a[(x % m) * k + x / m]).collect();
        let bt: Vec<f64> = (0..n * k).map(|x| b[(x % k) * n + x / k]).collect();
        let expected = reference(m, n, k, &a, &b, &[], 1.0, 0.0);

        for kernel in [&Fp64Baseline as &dyn GemmInnerKernel, &Fp64Streamed] {
            let fabric = small_fabric(1, 1);
            let aa = fabric.upload_f64s(&at).unwrap();
            let ba = fabric.upload_f64s(&bt).unwrap();
            let ca = fabric.upload_f64s(&vec![f64::NAN; m * n]).unwrap();
            let mut t = tile(m, n, k, aa, ba, ca);
            t.transa = true;
            t.lda = m;
            t.transb = true;
            t.ldb = k;
            run_on_core0(&fabric, kernel, &t);
            assert_eq!(fabric.memory().read_f64s(ca, m * n).unwrap(), expected, "{}", kernel.name());
        }
    }

    #[test]
    fn test_streamed_reuses_loop_setup() {
        let fabric = small_fabric(1, 1);
        let a = fabric.upload_f64s(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = fabric.upload_f64s(&[1.0, 0.0, 0.0, 1.0]).unwrap();
        let c0 = fabric.upload_f64s(&[0.0; 4]).unwrap();
        let c1 = fabric.upload_f64s(&[0.0; 4]).unwrap();
        let core = CoreContext::new(&fabric, CoreId::new(0, 0), Instant::now());

        Fp64Streamed.run(&core, &tile(2, 2, 2, a, b, c0)).unwrap();
        let mut second = tile(2, 2, 2, a, b, c1);
        second.setup_ssr = false;
        Fp64Streamed.run(&core, &second).unwrap();
        assert_eq!(fabric.memory().read_f64s(c1, 4).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_fp32_and_fp16_baselines() {
        let fabric = small_fabric(1, 1);
        let mem = fabric.memory();
        let (m, n, k) = (2, 2, 3);
        let a = [1.0f32, 2.0, 3.0, -1.0, 0.5, 2.0];
        let b = [1.0f32, 2.0, 0.0, 1.0, 4.0, -2.0];
        // [1 2 3; -1 .5 2] * [1 2; 0 1; 4 -2]
        let expected = [13.0f32, -2.0, 7.0, -5.5];

        let base = fabric.global_alloc(3 * 64).unwrap();
        for (i, (&x, &y)) in a.iter().zip(&b).enumerate() {
            mem.write_f32(base + 4 * i as u64, x).unwrap();
            mem.write_f32(base + 64 + 4 * i as u64, y).unwrap();
        }
        run_on_core0(&fabric, &Fp32Baseline, &tile(m, n, k, base, base + 64, base + 128));
        for (i, &e) in expected.iter().enumerate() {
            assert_eq!(mem.read_f32(base + 128 + 4 * i as u64).unwrap(), e);
        }

        let base = fabric.global_alloc(3 * 64).unwrap();
        for (i, (&x, &y)) in a.iter().zip(&b).enumerate() {
            mem.write_u16(base + 2 * i as u64, f16::from_f32(x).to_bits()).unwrap();
            mem.write_u16(base + 64 + 2 * i as u64, f16::from_f32(y).to_bits()).unwrap();
        }
        run_on_core0(&fabric, &Fp16Baseline, &tile(m, n, k, base, base + 64, base + 128));
        for (i, &e) in expected.iter().enumerate() {
            let got = f16::from_bits(mem.read_u16(base + 128 + 2 * i as u64).unwrap()).to_f32();
            assert_eq!(got, e);
        }
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve(InnerKernelId::Auto, Precision::Fp64, true).unwrap().name(), "fp64-streamed");
        assert_eq!(resolve(InnerKernelId::Auto, Precision::Fp64, false).unwrap().name(), "fp64-baseline");
        assert_eq!(resolve(InnerKernelId::Auto, Precision::Fp16, true).unwrap().name(), "fp16-baseline");
        assert!(matches!(
            resolve(InnerKernelId::Auto, Precision::Fp8, true),
            Err(FabricError::Precondition(_))
        ));
        assert!(matches!(
            resolve(InnerKernelId::Fp32Baseline, Precision::Fp64, true),
            Err(FabricError::Precondition(_))
        ));
        assert_eq!(InnerKernelId::try_from(2).unwrap(), InnerKernelId::Fp64Streamed);
        assert!(InnerKernelId::try_from(9).is_err());
    }
}
