//! Matrix-engine scenario: an FP16 product and an FP8 accumulation.

use crate::fabric::{Fabric, FabricError};
use crate::hwpe::compare::{compare_fp16_words, compare_fp8_words, pack_fp16_words, pack_fp8_words};
use crate::hwpe::{GemmFormat, GemmOp};
use crate::kernels::args::{HwpeMatmulArgs, JobArgs};
use crate::kernels::hwpe_matmul::hwpe_matmul_job;
use crate::verify::{hwpe_matmul_golden, AppOutcome};

fn operand(len: usize, seed: usize) -> Vec<f32> {
    // Small integers are exact in both FP16 and FP8
    (0..len).map(|i| ((i * 3 + seed) % 5) as f32 - 2.0).collect()
}

fn run_job(fabric: &Fabric, fmt: GemmFormat, op: GemmOp, (m, n, k): (usize, usize, usize)) -> Result<AppOutcome, FabricError> {
    let pack = match fmt {
        GemmFormat::Fp16 => pack_fp16_words,
        GemmFormat::Fp8 => pack_fp8_words,
    };
    let x = operand(m * n, 1);
    let w = operand(n * k, 2);
    let z0 = match op {
        GemmOp::Matmul => Vec::new(),
        GemmOp::MatmulAccumulate => operand(m * k, 3),
    };
    let golden = pack(&hwpe_matmul_golden(&x, &w, &z0, m, n, k));

    let x_addr = fabric.upload_u32s(&pack(&x))?;
    let w_addr = fabric.upload_u32s(&pack(&w))?;
    let mut z_init = z0.clone();
    z_init.resize(m * k, 0.0);
    let z_addr = fabric.upload_u32s(&pack(&z_init))?;
    let args_addr = fabric.global_alloc(HwpeMatmulArgs::SIZE)?;
    HwpeMatmulArgs::new(x_addr, w_addr, z_addr, m as u32, n as u32, k as u32, op as u32, fmt as u32)
        .store(fabric.memory(), args_addr)?;

    fabric.launch(|core| hwpe_matmul_job(core, args_addr))?;

    let z = fabric.memory().read_u32s(z_addr, golden.len())?;
    let errors = match fmt {
        GemmFormat::Fp16 => compare_fp16_words(&z, &golden),
        GemmFormat::Fp8 => compare_fp8_words(&z, &golden),
    };
    Ok(AppOutcome::new(errors, golden.len()))
}

pub fn hwpe(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let fp16 = run_job(fabric, GemmFormat::Fp16, GemmOp::Matmul, (16, 16, 16))?;
    let fp8 = run_job(fabric, GemmFormat::Fp8, GemmOp::MatmulAccumulate, (8, 8, 8))?;
    Ok(fp16 + fp8)
}
