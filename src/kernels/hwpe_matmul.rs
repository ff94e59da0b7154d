//! Matrix product offloaded to the cluster's HWPE.
//!
//! Only cluster 0 takes part. Its DMA core stages X and W (and Z when
//! accumulating) into CLM, compute core 0 drives the engine through the
//! register interface, and the DMA core drains Z back to the global store.

use super::args::HwpeMatmulArgs;
use super::stage_args;
use crate::fabric::{CoreContext, FabricError, View};
use crate::hwpe::{GemmFormat, GemmOp};

fn dim16(what: &str, value: u32) -> Result<u16, FabricError> {
    u16::try_from(value).map_err(|_| FabricError::Precondition(format!("HWPE {} = {} exceeds 16 bits", what, value)))
}

fn ptr32(addr: u64) -> Result<u32, FabricError> {
    u32::try_from(addr).map_err(|_| FabricError::Precondition(format!("HWPE pointer 0x{:x} exceeds 32 bits", addr)))
}

/// Run one HWPE job described by the [`HwpeMatmulArgs`] block at `args_addr`.
pub fn hwpe_matmul_job(core: &CoreContext<'_>, args_addr: u64) -> Result<(), FabricError> {
    let mut alloc = core.allocator();
    let args: HwpeMatmulArgs = stage_args(core, &mut alloc, args_addr)?;
    if core.cluster_idx() != 0 {
        return Ok(());
    }

    let op = GemmOp::try_from(args.op)?;
    let fmt = GemmFormat::try_from(args.fmt)?;
    let (m, n, k) = (dim16("M", args.m)?, dim16("N", args.n)?, dim16("K", args.k)?);
    let elem = fmt.bytes();
    let x_bytes = m as u64 * n as u64 * elem;
    let w_bytes = n as u64 * k as u64 * elem;
    let z_bytes = m as u64 * k as u64 * elem;

    let x = alloc.alloc_aligned(View::ClusterPrivate, x_bytes)?;
    let w = alloc.alloc_aligned(View::ClusterPrivate, w_bytes)?;
    let z = alloc.alloc_aligned(View::ClusterPrivate, z_bytes)?;

    if core.is_dm_core() {
        let dma = core.dma()?;
        dma.start_1d(x, args.x_addr, x_bytes)?;
        dma.start_1d(w, args.w_addr, w_bytes)?;
        if op == GemmOp::MatmulAccumulate {
            dma.start_1d(z, args.z_addr, z_bytes)?;
        }
        dma.wait_all()?;
    }
    core.cluster_hw_barrier()?;

    if core.cluster_core_idx() == 0 && core.is_compute_core() {
        let hwpe = core.hwpe();
        hwpe.cg_enable()?;
        hwpe.soft_clear()?;
        while hwpe.acquire_job()? < 0 {}
        hwpe.configure(ptr32(x)?, ptr32(w)?, ptr32(z)?, m, n, k, op, fmt)?;
        hwpe.trigger_job()?;
        let polls = hwpe.wait_idle()?;
        log::debug!("{}: HWPE {}x{}x{} {:?} done after {} polls", core.id(), m, n, k, fmt, polls);
        hwpe.evt_clear(1)?;
        hwpe.cg_disable()?;
    }
    core.cluster_hw_barrier()?;

    if core.is_dm_core() {
        let dma = core.dma()?;
        dma.start_1d(args.z_addr, z, z_bytes)?;
        dma.wait_all()?;
    }
    core.cluster_hw_barrier()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::test_support::small_fabric;
    use crate::fabric::Fabric;
    use crate::hwpe::compare::{compare_fp16_words, compare_fp8_words, pack_fp16_words, pack_fp8_words};
    use crate::hwpe::HwpeError;
    use crate::kernels::args::JobArgs;
    use crate::verify::hwpe_matmul_golden;

    fn values(len: usize, seed: usize) -> Vec<f32> {
        (0..len).map(|i| ((i * 5 + seed) % 7) as f32 - 3.0).collect()
    }

    fn upload_words(fabric: &Fabric, words: &[u32]) -> u64 {
        fabric.upload_u32s(words).unwrap()
    }

    fn run(fabric: &Fabric, args: HwpeMatmulArgs) -> Result<(), FabricError> {
        let addr = fabric.global_alloc(HwpeMatmulArgs::SIZE)?;
        args.store(fabric.memory(), addr)?;
        fabric.launch(|core| hwpe_matmul_job(core, addr))?;
        Ok(())
    }

    #[test]
    fn test_fp16_matmul() {
        let fabric = small_fabric(2, 2);
        let (m, n, k) = (4, 8, 6);
        let x = values(m * n, 1);
        let w = values(n * k, 4);
        let golden = pack_fp16_words(&hwpe_matmul_golden(&x, &w, &[], m, n, k));

        let xa = upload_words(&fabric, &pack_fp16_words(&x));
        let wa = upload_words(&fabric, &pack_fp16_words(&w));
        let za = fabric.global_alloc((m * k * 2) as u64).unwrap();
        let args = HwpeMatmulArgs::new(xa, wa, za, m as u32, n as u32, k as u32, 0, 0);
        run(&fabric, args).unwrap();

        let z = fabric.memory().read_u32s(za, golden.len()).unwrap();
        assert_eq!(compare_fp16_words(&z, &golden), 0);
        assert_eq!(fabric.hwpe(0).jobs_completed(), 1);
        assert_eq!(fabric.hwpe(1).jobs_completed(), 0);
        assert_eq!(fabric.hwpe(0).events(), 0);
    }

    #[test]
    fn test_fp8_accumulate() {
        let fabric = small_fabric(1, 2);
        let (m, n, k) = (4, 4, 4);
        let x = values(m * n, 2);
        let w = values(n * k, 3);
        let z0 = values(m * k, 6);
        let golden = pack_fp8_words(&hwpe_matmul_golden(&x, &w, &z0, m, n, k));

        let xa = upload_words(&fabric, &pack_fp8_words(&x));
        let wa = upload_words(&fabric, &pack_fp8_words(&w));
        let za = upload_words(&fabric, &pack_fp8_words(&z0));
        let args = HwpeMatmulArgs::new(xa, wa, za, m as u32, n as u32, k as u32, 1, 1);
        run(&fabric, args).unwrap();

        let z = fabric.memory().read_u32s(za, golden.len()).unwrap();
        assert_eq!(compare_fp8_words(&z, &golden), 0);
    }

    #[test]
    fn test_unsupported_format() {
        let fabric = small_fabric(1, 1);
        let args = HwpeMatmulArgs::new(0, 0, 0, 1, 1, 1, 0, 5);
        assert!(matches!(
            run(&fabric, args),
            Err(FabricError::Hwpe(HwpeError::UnsupportedFormat(5)))
        ));
    }
}
