//! Runtime scenarios: DMA fill and copy, barrier stress.

use crate::fabric::{Fabric, FabricError};
use crate::verify::AppOutcome;

const MEMSET_LEN: u64 = 1024;
const MEMSET_BYTE: u8 = 0xAB;

/// Each cluster fills 1 KiB of CLM with `0xAB` and copies it out.
pub fn memset(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let clusters = fabric.topology().clusters as u64;
    let out = fabric.global_alloc(MEMSET_LEN * clusters)?;

    fabric.launch(|core| {
        if core.is_dm_core() {
            let dma = core.dma()?;
            let buf = core.l1_next();
            dma.memset(buf, MEMSET_BYTE, MEMSET_LEN)?;
            dma.start_1d(out + core.cluster_idx() as u64 * MEMSET_LEN, buf, MEMSET_LEN)?;
            dma.wait_all()?;
        }
        Ok(())
    })?;

    let mut bytes = vec![0u8; (MEMSET_LEN * clusters) as usize];
    fabric.memory().read_bytes(out, &mut bytes)?;
    let errors = bytes.iter().filter(|&&b| b != MEMSET_BYTE).count();
    Ok(AppOutcome::new(errors, bytes.len()))
}

const ROUNDTRIP_WORDS: usize = 1024;

/// Global -> CLM -> global through two channels; the copy must match.
pub fn dma_roundtrip(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let clusters = fabric.topology().clusters;
    let channels = u64::from(fabric.config().dma_channels.clamp(1, 2));
    let data: Vec<u32> = (0..ROUNDTRIP_WORDS * clusters)
        .map(|i| (i as u32).wrapping_mul(0x9E37_79B9))
        .collect();
    let src = fabric.upload_u32s(&data)?;
    let dst = fabric.global_alloc(4 * data.len() as u64)?;
    let slice = (4 * ROUNDTRIP_WORDS) as u64;
    let part = slice / channels;

    fabric.launch(|core| {
        if core.is_dm_core() {
            let dma = core.dma()?;
            let l1 = core.l1_next();
            let offset = core.cluster_idx() as u64 * slice;
            for ch in 0..channels {
                dma.start_1d_channel(l1 + ch * part, src + offset + ch * part, part, ch as u32)?;
            }
            dma.wait_all()?;
            let id = dma.start_1d(dst + offset, l1, slice)?;
            dma.wait(id)?;
        }
        Ok(())
    })?;

    let copy = fabric.memory().read_u32s(dst, data.len())?;
    let errors = copy.iter().zip(&data).filter(|(a, b)| a != b).count();
    Ok(AppOutcome::new(errors, data.len()))
}

const STRESS_ITERATIONS: u32 = 1000;

/// Compute cores bump a shared counter between two global barriers.
pub fn barrier_stress(fabric: &Fabric) -> Result<AppOutcome, FabricError> {
    let counter = fabric.upload_u32s(&[0])?;
    let report = fabric.launch(|core| {
        for _ in 0..STRESS_ITERATIONS {
            core.global_barrier()?;
            if core.is_compute_core() {
                core.memory().fetch_add_u32(counter, 1)?;
            }
            core.global_barrier()?;
        }
        Ok(())
    })?;

    let topo = fabric.topology();
    let expected = (topo.clusters * topo.compute_cores) as u32 * STRESS_ITERATIONS;
    let got = fabric.memory().read_u32(counter)?;
    log::debug!(
        "barrier-stress: counter {} (expected {}), {} global barriers in {:?}",
        got,
        expected,
        report.global_barriers,
        report.elapsed
    );
    let errors = usize::from(got != expected) + usize::from(report.global_barriers != 2 * STRESS_ITERATIONS as u64);
    Ok(AppOutcome::new(errors, 2))
}
