//! Tile load/store helpers.
//!
//! A 2D tile `(i1, i0)` of shape `(t1, t0)` inside a row-major array whose
//! rows are `full_x0` elements long starts at element
//! `i0 * t0 + i1 * t1 * full_x0` and spans `t1` rows of `t0` elements.
//! Loading packs it densely at the destination; storing scatters a dense
//! tile back into the full array.

use super::{Dma, DmaResult, TransferId};

/// Geometry of one 2D tile transfer, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
    /// Byte offset of the tile's first element in the full array.
    pub offset: u64,
    /// Bytes per tile row.
    pub line: u64,
    /// Bytes between rows of the full array.
    pub full_stride: u64,
    /// Tile rows.
    pub rows: u64,
}

impl TileGeometry {
    /// Geometry of tile `index = (i1, i0)` of shape `shape = (t1, t0)`.
    pub fn new(index: (usize, usize), shape: (usize, usize), full_x0: usize, prec: usize) -> Self {
        let (i1, i0) = index;
        let (t1, t0) = shape;
        Self {
            offset: ((i0 * t0 + i1 * t1 * full_x0) * prec) as u64,
            line: (t0 * prec) as u64,
            full_stride: (full_x0 * prec) as u64,
            rows: t1 as u64,
        }
    }
}

impl Dma<'_> {
    /// Copy 1D tile `tile_idx` of `tile_size` elements from `src` to `dst`.
    pub fn load_1d_tile(&self, dst: u64, src: u64, tile_idx: usize, tile_size: usize, prec: usize) -> DmaResult<TransferId> {
        let bytes = (tile_size * prec) as u64;
        self.start_1d(dst, src + tile_idx as u64 * bytes, bytes)
    }

    /// Copy a dense 1D tile from `src` into slot `tile_idx` of `dst`.
    pub fn store_1d_tile(&self, dst: u64, src: u64, tile_idx: usize, tile_size: usize, prec: usize) -> DmaResult<TransferId> {
        let bytes = (tile_size * prec) as u64;
        self.start_1d(dst + tile_idx as u64 * bytes, src, bytes)
    }

    /// Gather tile `index` of shape `shape` from a full array at `src` into
    /// a dense buffer at `dst`.
    pub fn load_2d_tile(
        &self,
        dst: u64,
        src: u64,
        index: (usize, usize),
        shape: (usize, usize),
        full_x0: usize,
        prec: usize,
    ) -> DmaResult<TransferId> {
        let g = TileGeometry::new(index, shape, full_x0, prec);
        self.start_2d(dst, src + g.offset, g.line, g.line, g.full_stride, g.rows)
    }

    /// Scatter a dense tile at `src` into tile `index` of a full array at `dst`.
    pub fn store_2d_tile(
        &self,
        dst: u64,
        src: u64,
        index: (usize, usize),
        shape: (usize, usize),
        full_x0: usize,
        prec: usize,
    ) -> DmaResult<TransferId> {
        let g = TileGeometry::new(index, shape, full_x0, prec);
        self.start_2d(dst + g.offset, src, g.line, g.full_stride, g.line, g.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::test_support::small_fabric;

    #[test]
    fn test_geometry() {
        // Tile (1, 2) of shape (2, 4) in rows of 16 doubles
        let g = TileGeometry::new((1, 2), (2, 4), 16, 8);
        assert_eq!(g.offset, ((2 * 4 + 1 * 2 * 16) * 8) as u64);
        assert_eq!(g.line, 32);
        assert_eq!(g.full_stride, 128);
        assert_eq!(g.rows, 2);
    }

    #[test]
    fn test_load_then_store_tile() {
        let fabric = small_fabric(1, 1);
        // 4 x 6 matrix of u32, element value = row * 100 + col
        let full: Vec<u32> = (0..4).flat_map(|r| (0..6).map(move |c| r * 100 + c)).collect();
        let src = fabric.upload_u32s(&full).unwrap();
        let out = fabric.global_alloc(4 * 24).unwrap();

        fabric
            .launch(|core| {
                if core.is_dm_core() {
                    let dma = core.dma()?;
                    let l1 = core.l1_next();
                    // Tile (1, 1) of shape (2, 3): rows 2..4, cols 3..6
                    dma.load_2d_tile(l1, src, (1, 1), (2, 3), 6, 4)?;
                    dma.wait_all()?;
                    let tile = core.memory().read_u32s(l1, 6)?;
                    assert_eq!(tile, vec![203, 204, 205, 303, 304, 305]);

                    dma.store_2d_tile(out, l1, (1, 1), (2, 3), 6, 4)?;
                    dma.wait_all()?;
                }
                Ok(())
            })
            .unwrap();

        let result = fabric.memory().read_u32s(out, 24).unwrap();
        assert_eq!(result[2 * 6 + 3], 203);
        assert_eq!(result[3 * 6 + 5], 305);
        assert_eq!(result[0], 0);
    }

    #[test]
    fn test_1d_tiles() {
        let fabric = small_fabric(1, 1);
        let data: Vec<u32> = (0..32).collect();
        let src = fabric.upload_u32s(&data).unwrap();
        let out = fabric.global_alloc(128).unwrap();
        fabric
            .launch(|core| {
                if core.is_dm_core() {
                    let dma = core.dma()?;
                    let l1 = core.l1_next();
                    dma.load_1d_tile(l1, src, 2, 8, 4)?;
                    dma.wait_all()?;
                    dma.store_1d_tile(out, l1, 1, 8, 4)?;
                    dma.wait_all()?;
                }
                Ok(())
            })
            .unwrap();
        let result = fabric.memory().read_u32s(out + 32, 8).unwrap();
        assert_eq!(result, (16..24).collect::<Vec<u32>>());
    }
}
