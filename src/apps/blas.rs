//! AXPY and GEMM scenarios.

use crate::fabric::{Fabric, FabricError};
use crate::kernels::args::{AxpyArgs, GemmArgs, JobArgs};
use crate::kernels::axpy::axpy_job;
use crate::kernels::gemm::gemm_job;
use crate::verify::{axpy_golden, count_mismatches, gemm_golden, AppOutcome, Tolerance};

const AXPY_LEN: usize = 256;
const AXPY_TOLERANCE: Tolerance = Tolerance { abs: 1e-12, rel: 1e-12 };

/// `z = 2x + y` with `x = 1..=L`, `y = 0..L`.
pub fn axpy(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let a = 2.0;
    let x: Vec<f64> = (1..=AXPY_LEN).map(|i| i as f64).collect();
    let y: Vec<f64> = (0..AXPY_LEN).map(|i| i as f64).collect();

    let x_addr = fabric.upload_f64s(&x)?;
    let y_addr = fabric.upload_f64s(&y)?;
    let z_addr = fabric.global_alloc((8 * AXPY_LEN) as u64)?;
    let args_addr = fabric.global_alloc(AxpyArgs::SIZE)?;
    AxpyArgs::new(AXPY_LEN as u32, a, x_addr, y_addr, z_addr).store(fabric.memory(), args_addr)?;

    fabric.launch(|core| axpy_job(core, args_addr))?;

    let z = fabric.memory().read_f64s(z_addr, AXPY_LEN)?;
    let golden = axpy_golden(a, &x, &y);
    Ok(AppOutcome::new(count_mismatches(&z, &golden, AXPY_TOLERANCE), AXPY_LEN))
}

fn run_gemm(fabric: &Fabric, mut args: GemmArgs, a: &[f64], b: &[f64]) -> Result<AppOutcome, FabricError> {
    let (m, n, k) = (args.m as usize, args.n as usize, args.k as usize);
    args.a = fabric.upload_f64s(a)?;
    args.b = fabric.upload_f64s(b)?;
    args.c = fabric.upload_f64s(&vec![0.0; m * n])?;
    let args_addr = fabric.global_alloc(GemmArgs::SIZE)?;
    args.store(fabric.memory(), args_addr)?;

    let report = fabric.launch(|core| gemm_job(core, args_addr))?;
    log::debug!("gemm {}x{}x{} took {:?}", m, n, k, report.elapsed);

    let c = fabric.memory().read_f64s(args.c, m * n)?;
    let golden = gemm_golden(m, n, k, args.alpha, a, args.transa != 0, b, args.transb != 0, args.beta as f64, &[]);
    Ok(AppOutcome::new(count_mismatches(&c, &golden, Tolerance::EXACT), m * n))
}

/// Untiled 16 x 16 x 16 product of ones and the identity.
pub fn gemm(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let dim = 16;
    let a = vec![1.0; dim * dim];
    let b = identity(dim);
    run_gemm(fabric, GemmArgs::fp64(dim as u32, dim as u32, dim as u32, 0, 0, 0), &a, &b)
}

/// 32 x 16 x 32 product on a 2 x 2 tile grid: identity times ones.
pub fn gemm_tiled(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let (m, n, k) = (32, 16, 32);
    let a = identity(m);
    let b = vec![1.0; k * n];
    let mut args = GemmArgs::fp64(m as u32, n as u32, k as u32, 0, 0, 0);
    args.m_tiles = 2;
    args.k_tiles = 2;
    args.parallelize_m = 1;
    run_gemm(fabric, args, &a, &b)
}

fn identity(dim: usize) -> Vec<f64> {
    (0..dim * dim)
        .map(|i| if i / dim == i % dim { 1.0 } else { 0.0 })
        .collect()
}
