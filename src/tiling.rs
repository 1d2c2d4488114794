//! Tile grid computation with halo overlap.
//!
//! A volume too large for one machine's memory is decomposed into a grid of
//! rectangular tiles. Each tile is padded with an overlap halo on any side
//! that has a neighbor, so per-tile processing (classification, morphology)
//! sees enough context at tile borders. The halo is trimmed again before
//! reassembly, which makes the trimmed placements an exact partition of the
//! volume's index space: every voxel is owned by exactly one tile.

use crate::error::{Result, VoxtileError};
use crate::types::Shape3;

/// Maximum halo radius representable in the tile wire format (u8 per axis).
pub const MAX_OVERLAP: usize = u8::MAX as usize;

/// Placement of one tile in the volume's coordinate space.
///
/// `origin_start..origin_end` is the region this tile owns in the output;
/// the stored payload additionally covers `left_overlap` voxels before the
/// start and `right_overlap` voxels after the end on each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpec {
    pub origin_start: Shape3,
    pub origin_end: Shape3,
    pub left_overlap: Shape3,
    pub right_overlap: Shape3,
}

impl TileSpec {
    /// Shape of the stored payload, halo included.
    pub fn padded_shape(&self) -> Shape3 {
        let mut shape = [0; 3];
        for axis in 0..3 {
            shape[axis] = self.origin_end[axis] - self.origin_start[axis]
                + self.left_overlap[axis]
                + self.right_overlap[axis];
        }
        shape
    }

    /// Shape of the owned region, halo excluded.
    pub fn trimmed_shape(&self) -> Shape3 {
        let mut shape = [0; 3];
        for axis in 0..3 {
            shape[axis] = self.origin_end[axis] - self.origin_start[axis];
        }
        shape
    }

    /// First voxel covered by the padded payload on each axis.
    pub fn padded_start(&self) -> Shape3 {
        let mut start = [0; 3];
        for axis in 0..3 {
            start[axis] = self.origin_start[axis] - self.left_overlap[axis];
        }
        start
    }

    /// One past the last voxel covered by the padded payload on each axis.
    pub fn padded_end(&self) -> Shape3 {
        let mut end = [0; 3];
        for axis in 0..3 {
            end[axis] = self.origin_end[axis] + self.right_overlap[axis];
        }
        end
    }
}

/// The complete tile decomposition of a volume.
///
/// Tiles are ordered x-major, then y, then z (z varies fastest). The order
/// is the sole coordination key between phases: workers and later re-runs
/// re-derive identical grids from the same configuration, so the index of a
/// tile in this sequence doubles as its file number.
#[derive(Debug, Clone)]
pub struct TileGrid {
    volume_shape: Shape3,
    tile_dims: Shape3,
    overlap: usize,
    tiles_per_axis: Shape3,
    tiles: Vec<TileSpec>,
}

impl TileGrid {
    /// Compute the grid for a volume shape, tile dimensions, and uniform
    /// overlap radius.
    ///
    /// Per axis there are `ceil(shape / dim)` tiles; tile `i` owns
    /// `[i*dim, min((i+1)*dim, shape))`. The right halo is `overlap` when it
    /// fits strictly inside the volume and 0 otherwise; the left halo is
    /// `overlap` when the tile starts beyond `overlap` and 0 otherwise. A
    /// shape smaller than the tile dimensions yields a single tile with no
    /// halo at all.
    pub fn compute(volume_shape: Shape3, tile_dims: Shape3, overlap: usize) -> Result<Self> {
        for axis in 0..3 {
            if volume_shape[axis] == 0 {
                return Err(VoxtileError::config(format!(
                    "volume shape {:?} has an empty axis",
                    volume_shape
                )));
            }
            if tile_dims[axis] == 0 {
                return Err(VoxtileError::config(format!(
                    "tile dimensions {:?} have an empty axis",
                    tile_dims
                )));
            }
        }
        if overlap > MAX_OVERLAP {
            return Err(VoxtileError::config(format!(
                "overlap radius {} exceeds the maximum of {}",
                overlap, MAX_OVERLAP
            )));
        }

        let mut tiles_per_axis = [0; 3];
        for axis in 0..3 {
            tiles_per_axis[axis] = volume_shape[axis].div_ceil(tile_dims[axis]);
        }

        let mut tiles =
            Vec::with_capacity(tiles_per_axis[0] * tiles_per_axis[1] * tiles_per_axis[2]);
        for xi in 0..tiles_per_axis[0] {
            for yi in 0..tiles_per_axis[1] {
                for zi in 0..tiles_per_axis[2] {
                    tiles.push(Self::tile_spec(
                        volume_shape,
                        tile_dims,
                        overlap,
                        [xi, yi, zi],
                    ));
                }
            }
        }

        Ok(TileGrid {
            volume_shape,
            tile_dims,
            overlap,
            tiles_per_axis,
            tiles,
        })
    }

    fn tile_spec(
        volume_shape: Shape3,
        tile_dims: Shape3,
        overlap: usize,
        block: Shape3,
    ) -> TileSpec {
        let mut origin_start = [0; 3];
        let mut origin_end = [0; 3];
        let mut left_overlap = [0; 3];
        let mut right_overlap = [0; 3];

        for axis in 0..3 {
            let start = block[axis] * tile_dims[axis];
            let end = (start + tile_dims[axis]).min(volume_shape[axis]);
            origin_start[axis] = start;
            origin_end[axis] = end;
            // No halo past the volume boundary.
            right_overlap[axis] = if end + overlap < volume_shape[axis] {
                overlap
            } else {
                0
            };
            left_overlap[axis] = if start > overlap { overlap } else { 0 };
        }

        TileSpec {
            origin_start,
            origin_end,
            left_overlap,
            right_overlap,
        }
    }

    pub fn volume_shape(&self) -> Shape3 {
        self.volume_shape
    }

    pub fn tile_dims(&self) -> Shape3 {
        self.tile_dims
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Number of tiles along each axis.
    pub fn tiles_per_axis(&self) -> Shape3 {
        self.tiles_per_axis
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn tiles(&self) -> &[TileSpec] {
        &self.tiles
    }

    pub fn get(&self, index: usize) -> Option<&TileSpec> {
        self.tiles.get(index)
    }

    /// Largest padded payload size (in voxels) over all tiles. Drives the
    /// memory-budget precondition.
    pub fn max_padded_voxels(&self) -> usize {
        self.tiles
            .iter()
            .map(|t| {
                let s = t.padded_shape();
                s[0] * s[1] * s[2]
            })
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_uneven_cube_grid() {
        // shape (1000,1000,1000), tiles (400,400,600), overlap 20
        let grid = TileGrid::compute([1000, 1000, 1000], [400, 400, 600], 20).unwrap();
        assert_eq!(grid.tiles_per_axis(), [3, 3, 2]);
        assert_eq!(grid.len(), 18);

        let first = grid.get(0).unwrap();
        assert_eq!(first.origin_start, [0, 0, 0]);
        assert_eq!(first.origin_end, [400, 400, 600]);
        assert_eq!(first.left_overlap, [0, 0, 0]);
        assert_eq!(first.right_overlap, [20, 20, 20]);

        let last = grid.get(17).unwrap();
        assert_eq!(last.origin_start, [800, 800, 600]);
        assert_eq!(last.origin_end, [1000, 1000, 1000]);
        assert_eq!(last.right_overlap, [0, 0, 0]);
        assert_eq!(last.left_overlap, [20, 20, 20]);
    }

    #[test]
    fn test_tile_ordering_is_x_major() {
        let grid = TileGrid::compute([4, 4, 4], [2, 2, 2], 0).unwrap();
        assert_eq!(grid.len(), 8);
        // z varies fastest, x slowest
        assert_eq!(grid.get(0).unwrap().origin_start, [0, 0, 0]);
        assert_eq!(grid.get(1).unwrap().origin_start, [0, 0, 2]);
        assert_eq!(grid.get(2).unwrap().origin_start, [0, 2, 0]);
        assert_eq!(grid.get(4).unwrap().origin_start, [2, 0, 0]);
    }

    #[test]
    fn test_degenerate_single_tile() {
        let grid = TileGrid::compute([10, 8, 5], [32, 32, 32], 4).unwrap();
        assert_eq!(grid.len(), 1);
        let tile = grid.get(0).unwrap();
        assert_eq!(tile.origin_start, [0, 0, 0]);
        assert_eq!(tile.origin_end, [10, 8, 5]);
        assert_eq!(tile.left_overlap, [0, 0, 0]);
        assert_eq!(tile.right_overlap, [0, 0, 0]);
        assert_eq!(tile.padded_shape(), [10, 8, 5]);
    }

    #[test]
    fn test_boundary_halo_suppressed() {
        // Right halo only where tile_end + overlap fits strictly inside.
        let grid = TileGrid::compute([10, 10, 10], [5, 5, 5], 5).unwrap();
        for tile in grid.tiles() {
            for axis in 0..3 {
                // With overlap == tile dim, end + overlap never fits strictly.
                assert_eq!(tile.right_overlap[axis], 0);
                // Left halo requires start > overlap; start is 0 or 5 here.
                assert_eq!(tile.left_overlap[axis], 0);
            }
        }
    }

    #[test]
    fn test_overlap_exceeds_wire_limit() {
        assert!(TileGrid::compute([100, 100, 100], [10, 10, 10], 256).is_err());
    }

    #[test]
    fn test_empty_axis_rejected() {
        assert!(TileGrid::compute([0, 10, 10], [4, 4, 4], 1).is_err());
        assert!(TileGrid::compute([10, 10, 10], [4, 0, 4], 1).is_err());
    }

    /// Core correctness invariant: the trimmed placements of all tiles cover
    /// every voxel exactly once, for a spread of shapes and overlaps.
    #[test]
    fn test_partition_invariant() {
        let cases: &[(Shape3, Shape3, usize)] = &[
            ([7, 5, 4], [3, 2, 4], 1),
            ([16, 16, 16], [4, 8, 16], 2),
            ([9, 9, 9], [4, 4, 4], 3),
            ([1, 1, 1], [1, 1, 1], 0),
            ([13, 6, 11], [5, 5, 5], 20),
            ([20, 20, 20], [7, 9, 20], 0),
        ];

        for &(shape, dims, overlap) in cases {
            let grid = TileGrid::compute(shape, dims, overlap).unwrap();
            let mut coverage = Array3::<u32>::zeros((shape[0], shape[1], shape[2]));

            for tile in grid.tiles() {
                // The trimmed payload lands exactly on the origin bounds.
                assert_eq!(tile.trimmed_shape(), {
                    let padded = tile.padded_shape();
                    [
                        padded[0] - tile.left_overlap[0] - tile.right_overlap[0],
                        padded[1] - tile.left_overlap[1] - tile.right_overlap[1],
                        padded[2] - tile.left_overlap[2] - tile.right_overlap[2],
                    ]
                });
                for x in tile.origin_start[0]..tile.origin_end[0] {
                    for y in tile.origin_start[1]..tile.origin_end[1] {
                        for z in tile.origin_start[2]..tile.origin_end[2] {
                            coverage[[x, y, z]] += 1;
                        }
                    }
                }
            }

            assert!(
                coverage.iter().all(|&c| c == 1),
                "partition invariant violated for shape {:?} dims {:?} overlap {}",
                shape,
                dims,
                overlap
            );
        }
    }

    #[test]
    fn test_padded_bounds_stay_in_volume() {
        let grid = TileGrid::compute([50, 40, 30], [16, 16, 16], 6).unwrap();
        for tile in grid.tiles() {
            let start = tile.padded_start();
            let end = tile.padded_end();
            for axis in 0..3 {
                assert!(end[axis] <= grid.volume_shape()[axis]);
                assert!(start[axis] <= tile.origin_start[axis]);
            }
        }
    }

    #[test]
    fn test_max_padded_voxels() {
        let grid = TileGrid::compute([1000, 1000, 1000], [400, 400, 600], 20).unwrap();
        // Largest tile is x/y-interior (two halos) with the first z block
        // (600 owned + right halo only).
        assert_eq!(grid.max_padded_voxels(), 440 * 440 * 620);
    }
}
