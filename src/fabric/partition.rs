//! Work splitting across clusters and cores.

use std::ops::Range;

use super::{FabricError, Topology};

/// Contiguous block `idx` of `len` items split into `parts` blocks.
///
/// Block boundaries are `idx * len / parts`, so blocks differ in size by at
/// most one and always cover `[0, len)` exactly.
pub fn block_range(len: usize, parts: usize, idx: usize) -> Range<usize> {
    (idx * len / parts)..((idx + 1) * len / parts)
}

/// Error unless `len` splits evenly into `parts`.
pub fn check_divisible(what: &str, len: usize, parts: usize) -> Result<(), FabricError> {
    if parts == 0 || len % parts != 0 {
        return Err(FabricError::Precondition(format!(
            "{} ({}) must be a multiple of {}",
            what, len, parts
        )));
    }
    Ok(())
}

/// Slice of a fabric-wide vector owned by `cluster`.
pub fn cluster_range(len: usize, topology: &Topology, cluster: usize) -> Range<usize> {
    block_range(len, topology.clusters, cluster)
}

/// Slice of a cluster-level vector owned by compute core `core`.
pub fn core_range(len: usize, topology: &Topology, core: usize) -> Range<usize> {
    block_range(len, topology.compute_cores, core)
}

/// Rows `first, first + step, ...` assigned to one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedRows {
    pub first: usize,
    pub step: usize,
    pub count: usize,
}

impl StridedRows {
    pub fn rows(&self) -> impl Iterator<Item = usize> {
        let Self { first, step, count } = *self;
        (0..count).map(move |r| first + r * step)
    }
}

/// Row-interleaved split of `m` rows over `cores` cores.
///
/// Core `c` gets rows `c, c + cores, ...`; the first `m % cores` cores get
/// one extra row.
pub fn strided_rows(m: usize, cores: usize, core: usize) -> StridedRows {
    StridedRows {
        first: core,
        step: cores,
        count: m / cores + usize::from(core < m % cores),
    }
}

/// Position of one tile in a row-major (m-tile, k-tile) iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileIndex {
    pub linear: usize,
    pub i_m: usize,
    pub i_k: usize,
}

/// All (m, k) tiles in row-major order.
pub fn tile_schedule(m_tiles: usize, k_tiles: usize) -> Vec<TileIndex> {
    (0..m_tiles * k_tiles)
        .map(|linear| TileIndex {
            linear,
            i_m: linear / k_tiles,
            i_k: linear % k_tiles,
        })
        .collect()
}

/// M-tiles processed by `cluster`.
///
/// With `parallelize` the tiles are dealt round-robin over clusters;
/// otherwise cluster 0 processes all of them.
pub fn cluster_m_tiles(m_tiles: usize, clusters: usize, cluster: usize, parallelize: bool) -> Vec<usize> {
    if parallelize {
        (cluster..m_tiles).step_by(clusters).collect()
    } else if cluster == 0 {
        (0..m_tiles).collect()
    } else {
        Vec::new()
    }
}
