//! Tiled GEMM: `C = alpha * A * B + beta * C`.
//!
//! The M and K axes are cut into `m_tiles x k_tiles` tiles; N is never
//! tiled. Each cluster walks its m-tiles (all of them, or a round-robin
//! share with `parallelize_m`) in row-major (m, k) order through a
//! three-stage software pipeline:
//!
//! ```text
//! stage i:  DMA core   store C of tile i-2 (last k-tile of its row only)
//!                      load A, B of tile i (slot i % 2), C on k-tile 0
//!           compute    tile i-1
//!           ----------- cluster barrier -----------
//! ```
//!
//! A and B are double-buffered by tile. C is double-buffered by m-row so
//! that every k-tile of a row accumulates into the same buffer: the first
//! k-tile applies `beta`, the following ones run with `beta = 1`.

use super::args::{GemmArgs, Precision};
use super::inner::{self, GemmInnerKernel, GemmTile, InnerKernelId};
use super::stage_args;
use crate::dma::MEMSET_BLOCK;
use crate::fabric::partition::{self, check_divisible, TileIndex};
use crate::fabric::{ClmAllocator, CoreContext, FabricError, View};

/// A validated GEMM job.
#[derive(Clone, Copy)]
pub struct GemmJob {
    pub prec: Precision,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub m_tiles: usize,
    pub k_tiles: usize,
    pub parallelize_m: bool,
    pub load_a: bool,
    pub load_b: bool,
    pub load_c: bool,
    pub transa: bool,
    pub transb: bool,
    pub setup_ssr: bool,
    pub alpha: f64,
    pub beta: f64,
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub kernel: &'static dyn GemmInnerKernel,
}

impl std::fmt::Debug for GemmJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GemmJob")
            .field("prec", &self.prec)
            .field("shape", &(self.m, self.n, self.k))
            .field("tiles", &(self.m_tiles, self.k_tiles))
            .field("kernel", &self.kernel.name())
            .finish_non_exhaustive()
    }
}

fn precondition(msg: impl Into<String>) -> FabricError {
    FabricError::Precondition(msg.into())
}

impl GemmJob {
    /// Validate an argument block. `streaming` is the fabric's stream support.
    pub fn from_args(args: &GemmArgs, streaming: bool) -> Result<Self, FabricError> {
        let prec = Precision::from_tag(args.prec)
            .ok_or_else(|| precondition(format!("unknown precision tag {}", args.prec)))?;
        if args.n_tiles != 1 {
            return Err(precondition(format!("the N axis is not tiled (n_tiles = {})", args.n_tiles)));
        }
        if args.parallelize_k != 0 {
            return Err(precondition("K-axis parallelization is not supported"));
        }
        if args.transa != 0 && args.load_a == 0 {
            return Err(precondition("transposed A must be staged through CLM (load_a = 1)"));
        }
        if args.m_tiles == 0 || args.k_tiles == 0 {
            return Err(precondition("tile counts must be non-zero"));
        }
        check_divisible("GEMM M", args.m as usize, args.m_tiles as usize)?;
        check_divisible("GEMM K", args.k as usize, args.k_tiles as usize)?;
        let kernel = inner::resolve(InnerKernelId::try_from(args.kernel)?, prec, streaming)?;

        Ok(Self {
            prec,
            m: args.m as usize,
            n: args.n as usize,
            k: args.k as usize,
            m_tiles: args.m_tiles as usize,
            k_tiles: args.k_tiles as usize,
            parallelize_m: args.parallelize_m != 0,
            load_a: args.load_a != 0,
            load_b: args.load_b != 0,
            load_c: args.load_c != 0,
            transa: args.transa != 0,
            transb: args.transb != 0,
            setup_ssr: args.setup_ssr != 0,
            alpha: args.alpha,
            beta: args.beta as f64,
            a: args.a,
            b: args.b,
            c: args.c,
            kernel,
        })
    }

    /// Rows of one m-tile.
    pub fn frac_m(&self) -> usize {
        self.m / self.m_tiles
    }

    /// Depth of one k-tile.
    pub fn frac_k(&self) -> usize {
        self.k / self.k_tiles
    }

    fn elem(&self) -> usize {
        self.prec.bytes()
    }
}

/// Double-buffered CLM slabs; `None` when the operand stays in the global store.
#[derive(Debug, Clone, Copy)]
struct Slabs {
    a: Option<[u64; 2]>,
    b: Option<[u64; 2]>,
    c: Option<[u64; 2]>,
    c_bytes: u64,
}

impl Slabs {
    fn alloc(job: &GemmJob, alloc: &mut ClmAllocator) -> Result<Self, FabricError> {
        let p = job.elem() as u64;
        let (fm, fk, n) = (job.frac_m() as u64, job.frac_k() as u64, job.n as u64);
        let c_bytes = (fm * n * p).next_multiple_of(MEMSET_BLOCK);
        let mut pair = |enabled: bool, bytes: u64| -> Result<Option<[u64; 2]>, FabricError> {
            if !enabled {
                return Ok(None);
            }
            alloc.align(MEMSET_BLOCK);
            let first = alloc.alloc(View::ClusterPrivate, bytes)?;
            alloc.align(MEMSET_BLOCK);
            let second = alloc.alloc(View::ClusterPrivate, bytes)?;
            Ok(Some([first, second]))
        };
        Ok(Self {
            a: pair(job.load_a, fm * fk * p)?,
            b: pair(job.load_b, fk * n * p)?,
            c: pair(job.load_c, c_bytes)?,
            c_bytes,
        })
    }
}

/// One cluster-level tile: all `frac_m` rows, split over the compute cores.
///
/// Compute core `i` takes rows `i, i + P, ...` and sees A and C with their
/// leading dimensions multiplied by `P`.
pub fn sc_st_gemm(core: &CoreContext<'_>, kernel: &dyn GemmInnerKernel, tile: &GemmTile) -> Result<(), FabricError> {
    if tile.transa {
        return Err(precondition("row-interleaved GEMM needs a row-major A"));
    }
    let p = core.cluster_compute_core_num();
    let rows = partition::strided_rows(tile.m, p, core.cluster_core_idx());
    if rows.count == 0 {
        return Ok(());
    }
    let elem = kernel.precision().bytes();
    let core_tile = GemmTile {
        m: rows.count,
        a: tile.a + (rows.first * tile.lda * elem) as u64,
        lda: tile.lda * p,
        c: tile.c + (rows.first * tile.ldc * elem) as u64,
        ldc: tile.ldc * p,
        ..*tile
    };
    kernel.run(core, &core_tile)
}

/// Full GEMM job over the fabric. `args_addr` points at a [`GemmArgs`]
/// block in the global store.
pub fn gemm_job(core: &CoreContext<'_>, args_addr: u64) -> Result<(), FabricError> {
    let mut alloc = core.allocator();
    let args: GemmArgs = stage_args(core, &mut alloc, args_addr)?;
    let job = GemmJob::from_args(&args, core.config().streaming)?;
    gemm(core, &job, &mut alloc)
}

/// Run a validated job; CLM slabs are placed with `alloc`.
pub fn gemm(core: &CoreContext<'_>, job: &GemmJob, alloc: &mut ClmAllocator) -> Result<(), FabricError> {
    let topo = core.topology();
    let slabs = Slabs::alloc(job, alloc)?;
    let rows = partition::cluster_m_tiles(job.m_tiles, topo.clusters, core.cluster_idx(), job.parallelize_m);
    let schedule = partition::tile_schedule(rows.len(), job.k_tiles);
    let n_tiles = schedule.len();

    if core.is_dm_core() {
        if let Some(c) = slabs.c {
            let dma = core.dma()?;
            dma.memset(c[0], 0, slabs.c_bytes)?;
            dma.memset(c[1], 0, slabs.c_bytes)?;
        }
        log::debug!(
            "{}: gemm {:?}, {} tiles over m-rows {:?}",
            core.id(),
            job,
            n_tiles,
            rows
        );
    }
    core.cluster_hw_barrier()?;

    for i in 0..n_tiles + 2 {
        if core.is_dm_core() {
            if i >= 2 {
                store_c(core, job, &slabs, &rows, schedule[i - 2])?;
            }
            if i < n_tiles {
                load_tile(core, job, &slabs, &rows, schedule[i])?;
            }
        } else if (1..=n_tiles).contains(&i) {
            let t = schedule[i - 1];
            let tile = cluster_tile(job, &slabs, rows[t.i_m], t);
            sc_st_gemm(core, job.kernel, &tile)?;
        }
        log::trace!("{}: gemm stage {} done", core.id(), i);
        core.cluster_hw_barrier()?;
    }
    Ok(())
}

/// Tile `t` of m-row `i_m` as seen by the compute cores.
fn cluster_tile(job: &GemmJob, slabs: &Slabs, i_m: usize, t: TileIndex) -> GemmTile {
    let p = job.elem() as u64;
    let (fm, fk, n, k) = (job.frac_m(), job.frac_k(), job.n, job.k);
    let ab = t.linear % 2;

    let (a, lda) = match slabs.a {
        Some(slot) => (slot[ab], fk),
        None => (job.a + ((i_m * fm * k + t.i_k * fk) as u64) * p, k),
    };
    let (b, ldb) = match (slabs.b, job.transb) {
        (Some(slot), true) => (slot[ab], fk),
        (Some(slot), false) => (slot[ab], n),
        (None, true) => (job.b + (t.i_k * fk) as u64 * p, k),
        (None, false) => (job.b + (t.i_k * fk * n) as u64 * p, n),
    };
    let c = match slabs.c {
        Some(slot) => slot[t.i_m % 2],
        None => job.c + (i_m * fm * n) as u64 * p,
    };

    GemmTile {
        m: fm,
        n,
        k: fk,
        a,
        lda,
        transa: false,
        b,
        ldb,
        transb: job.transb,
        c,
        ldc: n,
        alpha: job.alpha,
        beta: if t.i_k == 0 { job.beta } else { 1.0 },
        setup_ssr: job.setup_ssr,
    }
}

fn load_tile(core: &CoreContext<'_>, job: &GemmJob, slabs: &Slabs, rows: &[usize], t: TileIndex) -> Result<(), FabricError> {
    let dma = core.dma()?;
    let p = job.elem();
    let (fm, fk, n) = (job.frac_m(), job.frac_k(), job.n);
    let i_m = rows[t.i_m];
    let ab = t.linear % 2;

    if let Some(slot) = slabs.a {
        if job.transa {
            // Gather one row of the tile per transfer: consecutive k of a
            // row are `m` elements apart in the K x M source.
            for r in 0..fm {
                let src = job.a + ((t.i_k * fk * job.m + i_m * fm + r) * p) as u64;
                let dst = slot[ab] + (r * fk * p) as u64;
                dma.start_2d(dst, src, p as u64, p as u64, (job.m * p) as u64, fk as u64)?;
            }
        } else {
            dma.load_2d_tile(slot[ab], job.a, (i_m, t.i_k), (fm, fk), job.k, p)?;
        }
    }
    if let Some(slot) = slabs.b {
        if job.transb {
            dma.load_2d_tile(slot[ab], job.b, (0, t.i_k), (n, fk), job.k, p)?;
        } else {
            dma.load_2d_tile(slot[ab], job.b, (t.i_k, 0), (fk, n), n, p)?;
        }
    }
    if let Some(slot) = slabs.c {
        if t.i_k == 0 {
            dma.load_2d_tile(slot[t.i_m % 2], job.c, (i_m, 0), (fm, n), n, p)?;
        }
    }
    dma.wait_all()?;
    Ok(())
}

fn store_c(core: &CoreContext<'_>, job: &GemmJob, slabs: &Slabs, rows: &[usize], t: TileIndex) -> Result<(), FabricError> {
    let Some(slot) = slabs.c else {
        return Ok(());
    };
    let c_move = t.i_k == job.k_tiles - 1;
    if !c_move {
        return Ok(());
    }
    let dma = core.dma()?;
    dma.store_2d_tile(job.c, slot[t.i_m % 2], (rows[t.i_m], 0), (job.frac_m(), job.n), job.n, job.elem())?;
    dma.wait_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::test_support::small_fabric;
    use crate::fabric::Fabric;
    use crate::kernels::args::JobArgs;
    use crate::verify::gemm_golden;
    use crate::FabricConfig;

    fn matrix(rows: usize, cols: usize, seed: usize) -> Vec<f64> {
        (0..rows * cols).map(|x| ((x * 7 + seed) % 11) as f64 - 5.0).collect()
    }

    fn run_gemm(fabric: &Fabric, mut args: GemmArgs, a: &[f64], b: &[f64], c: &[f64]) -> Result<Vec<f64>, FabricError> {
        args.a = fabric.upload_f64s(a)?;
        args.b = fabric.upload_f64s(b)?;
        args.c = fabric.upload_f64s(c)?;
        let addr = fabric.global_alloc(GemmArgs::SIZE)?;
        args.store(fabric.memory(), addr)?;
        fabric.launch(|core| gemm_job(core, addr))?;
        Ok(fabric.memory().read_f64s(args.c, c.len())?)
    }

    #[test]
    fn test_identity_b() {
        let fabric = small_fabric(2, 4);
        let a = matrix(16, 16, 3);
        let b: Vec<f64> = (0..256).map(|x| if x % 17 == 0 { 1.0 } else { 0.0 }).collect();
        let got = run_gemm(&fabric, GemmArgs::fp64(16, 16, 16, 0, 0, 0), &a, &b, &[7.0; 256]).unwrap();
        assert_eq!(got, a);
    }

    #[test]
    fn test_tiled_pipeline_matches_golden() {
        let (m, n, k) = (32, 16, 32);
        let a = matrix(m, k, 1);
        let b = matrix(k, n, 2);
        let c = matrix(m, n, 5);
        for (parallelize_m, streaming) in [(true, true), (false, true), (true, false)] {
            let fabric = Fabric::new(FabricConfig {
                clusters: 2,
                compute_cores: 4,
                streaming,
                ..FabricConfig::default()
            })
            .unwrap();
            let mut args = GemmArgs::fp64(m as u32, n as u32, k as u32, 0, 0, 0);
            args.m_tiles = 4;
            args.k_tiles = 2;
            args.parallelize_m = u32::from(parallelize_m);
            args.beta = 1;
            args.alpha = 2.0;
            let got = run_gemm(&fabric, args, &a, &b, &c).unwrap();
            assert_eq!(got, gemm_golden(m, n, k, 2.0, &a, false, &b, false, 1.0, &c));
        }
    }

    #[test]
    fn test_pipeline_moves_each_tile_once() {
        let (m, n, k) = (16, 8, 16);
        let a = matrix(m, k, 2);
        let b = matrix(k, n, 3);
        let golden = gemm_golden(m, n, k, 1.0, &a, false, &b, false, 0.0, &[]);
        let transfers = |fabric: &Fabric, cluster: usize| -> u64 {
            fabric.dma_stats(cluster).iter().map(|s| s.transfers_completed).sum()
        };

        // Arguments, two C memsets, then per tile A and B, per m-row one C
        // load and one C store (last k-tile only)
        let cases: [(bool, [u64; 2]); 2] = [
            (false, [1 + 2 + 4 * 2 + 2 + 2, 1 + 2]),
            (true, [1 + 2 + 2 * 2 + 1 + 1; 2]),
        ];
        for (parallelize_m, expected) in cases {
            let fabric = small_fabric(2, 2);
            let mut args = GemmArgs::fp64(m as u32, n as u32, k as u32, 0, 0, 0);
            args.m_tiles = 2;
            args.k_tiles = 2;
            args.parallelize_m = u32::from(parallelize_m);
            let got = run_gemm(&fabric, args, &a, &b, &[0.0; 128]).unwrap();
            assert_eq!(got, golden);
            assert_eq!([transfers(&fabric, 0), transfers(&fabric, 1)], expected, "parallelize_m = {parallelize_m}");
        }
    }

    #[test]
    fn test_single_k_tile_reuses_c_slots() {
        let (m, n, k) = (24, 8, 8);
        let a = matrix(m, k, 4);
        let b = matrix(k, n, 6);
        let fabric = small_fabric(1, 3);
        let mut args = GemmArgs::fp64(m as u32, n as u32, k as u32, 0, 0, 0);
        args.m_tiles = 6;
        let got = run_gemm(&fabric, args, &a, &b, &[0.0; 192]).unwrap();
        assert_eq!(got, gemm_golden(m, n, k, 1.0, &a, false, &b, false, 0.0, &[]));
    }

    #[test]
    fn test_transposed_operands() {
        let (m, n, k) = (8, 8, 16);
        let at = matrix(k, m, 2);
        let bt = matrix(n, k, 9);
        let fabric = small_fabric(2, 2);
        let mut args = GemmArgs::fp64(m as u32, n as u32, k as u32, 0, 0, 0);
        args.m_tiles = 2;
        args.k_tiles = 4;
        args.parallelize_m = 1;
        args.transa = 1;
        args.transb = 1;
        let got = run_gemm(&fabric, args, &at, &bt, &[0.0; 64]).unwrap();
        assert_eq!(got, gemm_golden(m, n, k, 1.0, &at, true, &bt, true, 0.0, &[]));
    }

    #[test]
    fn test_operands_in_global_store() {
        let (m, n, k) = (8, 4, 8);
        let a = matrix(m, k, 3);
        let b = matrix(n, k, 8);
        let c = matrix(m, n, 1);
        let fabric = small_fabric(2, 2);
        let mut args = GemmArgs::fp64(m as u32, n as u32, k as u32, 0, 0, 0);
        args.m_tiles = 2;
        args.k_tiles = 2;
        args.parallelize_m = 1;
        args.load_a = 0;
        args.load_b = 0;
        args.load_c = 0;
        args.transb = 1;
        args.beta = 1;
        let got = run_gemm(&fabric, args, &a, &b, &c).unwrap();
        assert_eq!(got, gemm_golden(m, n, k, 1.0, &a, false, &b, true, 1.0, &c));
    }

    #[test]
    fn test_fp32_job() {
        let (m, n, k) = (8, 8, 8);
        let fabric = small_fabric(1, 4);
        let mem = fabric.memory();
        let a = matrix(m, k, 1);
        let b = matrix(k, n, 2);
        let golden = gemm_golden(m, n, k, 1.0, &a, false, &b, false, 0.0, &[]);

        let mut args = GemmArgs::fp64(m as u32, n as u32, k as u32, 0, 0, 0);
        args.prec = Precision::Fp32 as u32;
        args.k_tiles = 2;
        args.a = fabric.global_alloc(256).unwrap();
        args.b = fabric.global_alloc(256).unwrap();
        args.c = fabric.global_alloc(256).unwrap();
        for i in 0..64 {
            mem.write_f32(args.a + 4 * i as u64, a[i] as f32).unwrap();
            mem.write_f32(args.b + 4 * i as u64, b[i] as f32).unwrap();
        }
        let addr = fabric.global_alloc(GemmArgs::SIZE).unwrap();
        args.store(mem, addr).unwrap();
        fabric.launch(|core| gemm_job(core, addr)).unwrap();
        for (i, &g) in golden.iter().enumerate() {
            assert_eq!(mem.read_f32(args.c + 4 * i as u64).unwrap(), g as f32);
        }
    }

    #[test]
    fn test_rejected_configurations() {
        let a = vec![1.0; 64];
        let cases: [fn(&mut GemmArgs); 6] = [
            |g: &mut GemmArgs| g.n_tiles = 2,
            |g: &mut GemmArgs| g.parallelize_k = 1,
            |g: &mut GemmArgs| {
                g.transa = 1;
                g.load_a = 0;
            },
            |g: &mut GemmArgs| g.prec = Precision::Fp8 as u32,
            |g: &mut GemmArgs| g.m_tiles = 3,
            |g: &mut GemmArgs| g.kernel = InnerKernelId::Fp16Baseline as u32,
        ];
        for tweak in cases {
            let fabric = small_fabric(1, 2);
            let mut args = GemmArgs::fp64(8, 8, 8, 0, 0, 0);
            tweak(&mut args);
            let err = run_gemm(&fabric, args, &a, &a, &a).unwrap_err();
            assert!(matches!(err, FabricError::Precondition(_)), "{:?}", err);
        }
    }
}
