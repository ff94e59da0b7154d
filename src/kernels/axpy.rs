//! `z = a * x + y` on doubles.
//!
//! Each cluster stages its contiguous slice of x and y into CLM, its compute
//! cores each process a contiguous fraction of the slice, and the DMA core
//! drains the slice of z back to the global store.

use super::args::AxpyArgs;
use super::stage_args;
use crate::fabric::partition::{self, check_divisible};
use crate::fabric::ssr::{frep, DataMover};
use crate::fabric::{CoreContext, FabricError, View};

/// How the per-core inner loop is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxpyStrategy {
    /// Plain scalar loop.
    Baseline,
    /// Three operand streams with a repeated fused multiply-add.
    Streamed,
}

impl AxpyStrategy {
    /// Strategy matching the fabric's streaming support.
    pub fn for_core(core: &CoreContext<'_>) -> Self {
        if core.config().streaming {
            Self::Streamed
        } else {
            Self::Baseline
        }
    }
}

/// Inner loop: this compute core's fraction of a cluster slice of `l` doubles.
pub fn axpy(
    core: &CoreContext<'_>,
    l: usize,
    a: f64,
    x: u64,
    y: u64,
    z: u64,
    strategy: AxpyStrategy,
) -> Result<(), FabricError> {
    let range = partition::core_range(l, core.topology(), core.cluster_core_idx());
    let frac = range.len();
    let offset = (range.start * 8) as u64;
    if frac == 0 {
        return Ok(());
    }
    let mem = core.memory();

    match strategy {
        AxpyStrategy::Baseline => {
            for i in 0..frac as u64 {
                let xi = mem.read_f64(x + offset + 8 * i)?;
                let yi = mem.read_f64(y + offset + 8 * i)?;
                mem.write_f64(z + offset + 8 * i, a * xi + yi)?;
            }
            core.fpu_fence();
        }
        AxpyStrategy::Streamed => {
            let bound = u32::try_from(frac)
                .map_err(|_| FabricError::Precondition(format!("stream bound {} exceeds 32 bits", frac)))?;
            let mut ssr = core.ssr();
            for dm in [DataMover::Dm0, DataMover::Dm1, DataMover::Dm2] {
                ssr.loop_1d(dm, bound, 8);
            }
            ssr.read(DataMover::Dm0, 1, x + offset)?;
            ssr.read(DataMover::Dm1, 1, y + offset)?;
            ssr.write(DataMover::Dm2, 1, z + offset)?;
            ssr.enable();
            frep(frac - 1, |_| -> Result<(), FabricError> {
                let xi = ssr.pop(DataMover::Dm0, mem)?;
                let yi = ssr.pop(DataMover::Dm1, mem)?;
                ssr.push(DataMover::Dm2, mem, a.mul_add(xi, yi))?;
                Ok(())
            })?;
            core.fpu_fence();
            ssr.disable();
        }
    }
    Ok(())
}

/// Full AXPY job over the whole fabric. `args_addr` points at an
/// [`AxpyArgs`] block in the global store.
pub fn axpy_job(core: &CoreContext<'_>, args_addr: u64) -> Result<(), FabricError> {
    let mut alloc = core.allocator();
    let args: AxpyArgs = stage_args(core, &mut alloc, args_addr)?;

    let topo = core.topology();
    let l = args.l as usize;
    check_divisible("AXPY length", l, topo.clusters * topo.compute_cores)?;

    let range = partition::cluster_range(l, topo, core.cluster_idx());
    let frac = range.len();
    let bytes = (frac * 8) as u64;
    let offset = (range.start * 8) as u64;
    let remote_x = args.x_addr + offset;
    let remote_y = args.y_addr + offset;
    let remote_z = args.z_addr + offset;

    let local_x = alloc.alloc_aligned(View::ClusterPrivate, bytes)?;
    let local_y = alloc.alloc(View::ClusterPrivate, bytes)?;
    let local_z = alloc.alloc(View::ClusterPrivate, bytes)?;

    if core.is_dm_core() {
        let dma = core.dma()?;
        dma.start_1d(local_x, remote_x, bytes)?;
        dma.start_1d(local_y, remote_y, bytes)?;
        dma.wait_all()?;
    }
    core.cluster_hw_barrier()?;

    if core.is_compute_core() {
        let start = core.mcycle();
        axpy(core, frac, args.a, local_x, local_y, local_z, AxpyStrategy::for_core(core))?;
        log::trace!("{}: axpy of {} elements in {} ns", core.id(), frac, core.mcycle() - start);
    }
    core.cluster_hw_barrier()?;

    if core.is_dm_core() {
        let dma = core.dma()?;
        dma.start_1d(remote_z, local_z, bytes)?;
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
    use crate::kernels::args::JobArgs;
    use crate::FabricConfig;

    fn run_axpy(fabric: &Fabric, a: f64, x: &[f64], y: &[f64]) -> Result<Vec<f64>, FabricError> {
        let xa = fabric.upload_f64s(x)?;
        let ya = fabric.upload_f64s(y)?;
        let za = fabric.global_alloc(8 * x.len() as u64)?;
        let args = fabric.global_alloc(AxpyArgs::SIZE)?;
        AxpyArgs::new(x.len() as u32, a, xa, ya, za).store(fabric.memory(), args)?;
        fabric.launch(|core| axpy_job(core, args))?;
        Ok(fabric.memory().read_f64s(za, x.len())?)
    }

    #[test]
    fn test_axpy_streamed_and_baseline_agree() {
        let x: Vec<f64> = (1..=64).map(f64::from).collect();
        let y: Vec<f64> = (0..64).map(f64::from).collect();
        let expected: Vec<f64> = (0..64).map(|j| 3.0 * j as f64 + 2.0).collect();

        for streaming in [true, false] {
            let fabric = Fabric::new(FabricConfig {
                clusters: 2,
                compute_cores: 4,
                streaming,
                ..FabricConfig::default()
            })
            .unwrap();
            assert_eq!(run_axpy(&fabric, 2.0, &x, &y).unwrap(), expected);
        }
    }

    #[test]
    fn test_axpy_identities() {
        let fabric = small_fabric(2, 2);
        let x: Vec<f64> = (0..16).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = (0..16).map(|i| 100.0 - i as f64).collect();
        assert_eq!(run_axpy(&fabric, 0.0, &x, &y).unwrap(), y);
        fabric.global_reset();
        assert_eq!(run_axpy(&fabric, 1.0, &x, &vec![0.0; 16]).unwrap(), x);
    }

    #[test]
    fn test_axpy_rejects_indivisible_length() {
        let fabric = small_fabric(2, 2);
        let err = run_axpy(&fabric, 1.0, &[1.0; 6], &[1.0; 6]).unwrap_err();
        assert!(matches!(err, FabricError::Precondition(_)));
    }

    #[test]
    fn test_streamed_bound_beyond_32_bits_is_rejected() {
        let fabric = small_fabric(1, 1);
        let l = u32::MAX as usize + 1;
        let err = fabric
            .launch(|core| {
                if core.is_compute_core() {
                    axpy(core, l, 1.0, 0, 0, 0, AxpyStrategy::Streamed)?;
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, FabricError::Precondition(ref m) if m.contains("32 bits")));
    }
}
