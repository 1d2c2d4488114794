//! Halo-trim stitching of tile payloads into a shared volume.
//!
//! A tile carries its owned region plus halo padding on each side. The
//! stitcher slices the halo off and writes only the owned `[origin_start,
//! origin_end)` region, so the trimmed placements of a full grid partition
//! the volume exactly: every voxel is written once and no halo voxel is
//! written at all.

use ndarray::{s, ArrayView3};

use crate::element::Element;
use crate::error::{Result, VoxtileError};
use crate::tiling::TileSpec;
use crate::volume::SharedVolume;

/// Writes halo-trimmed tile payloads into one volume store.
pub struct VolumeStitcher<'a> {
    volume: &'a SharedVolume,
}

impl<'a> VolumeStitcher<'a> {
    pub fn new(volume: &'a SharedVolume) -> Self {
        Self { volume }
    }

    /// Trim `payload` to the tile's owned region and write it. The payload
    /// must have the tile's full padded shape; anything else means the
    /// tile file and the grid disagree and the run must stop.
    pub fn write_tile<T: Element>(
        &self,
        dataset: &str,
        spec: &TileSpec,
        payload: ArrayView3<'_, T>,
    ) -> Result<()> {
        let padded = spec.padded_shape();
        let (px, py, pz) = payload.dim();
        if [px, py, pz] != padded {
            return Err(VoxtileError::shape_mismatch(
                format!("tile payload for dataset '{}'", dataset),
                padded,
                [px, py, pz],
            ));
        }

        let l = spec.left_overlap;
        let r = spec.right_overlap;
        let trimmed = payload.slice(s![
            l[0]..px - r[0],
            l[1]..py - r[1],
            l[2]..pz - r[2]
        ]);
        self.volume
            .write_region(dataset, spec.origin_start, spec.origin_end, trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Dtype;
    use crate::tiling::TileGrid;
    use crate::volume::{DatasetInfo, SharedVolume};
    use ndarray::Array3;
    use tempfile::tempdir;

    fn cell_volume(dir: &std::path::Path, shape: [usize; 3]) -> SharedVolume {
        SharedVolume::create(
            dir.join("vol"),
            shape,
            [1, shape[1], shape[2]],
            &[DatasetInfo {
                name: "CELL".into(),
                dtype: Dtype::U8,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_halo_is_trimmed() -> Result<()> {
        let dir = tempdir().unwrap();
        let vol = cell_volume(dir.path(), [10, 10, 10]);
        let grid = TileGrid::compute([10, 10, 10], [4, 10, 10], 2)?;
        let stitcher = VolumeStitcher::new(&vol);

        // The middle x-tile owns [4, 8) and has 2 voxels of halo each side.
        let spec = grid.get(1).unwrap().clone();
        assert_eq!(spec.left_overlap, [2, 0, 0]);
        assert_eq!(spec.right_overlap, [0, 0, 0]);

        let padded = spec.padded_shape();
        let payload = Array3::from_elem((padded[0], padded[1], padded[2]), 7u8);
        stitcher.write_tile("CELL", &spec, payload.view())?;

        let full = vol.read_dataset::<u8>("CELL")?;
        for (idx, &v) in full.indexed_iter() {
            let expected = if idx.0 >= 4 && idx.0 < 8 { 7 } else { 0 };
            assert_eq!(v, expected, "voxel {:?}", idx);
        }
        Ok(())
    }

    #[test]
    fn test_full_grid_partitions_volume() -> Result<()> {
        let dir = tempdir().unwrap();
        let shape = [9, 7, 8];
        let vol = cell_volume(dir.path(), shape);
        let grid = TileGrid::compute(shape, [4, 3, 5], 1)?;
        let stitcher = VolumeStitcher::new(&vol);

        // Every tile writes its own index + 1 everywhere; after stitching
        // each voxel holds the id of the tile that owns it.
        for (i, spec) in grid.tiles().iter().enumerate() {
            let p = spec.padded_shape();
            let payload = Array3::from_elem((p[0], p[1], p[2]), (i + 1) as u8);
            stitcher.write_tile("CELL", spec, payload.view())?;
        }

        let full = vol.read_dataset::<u8>("CELL")?;
        for (idx, &v) in full.indexed_iter() {
            assert_ne!(v, 0, "voxel {:?} never written", idx);
            let spec = grid.get(v as usize - 1).unwrap();
            for axis in 0..3 {
                let pos = [idx.0, idx.1, idx.2][axis];
                assert!(
                    pos >= spec.origin_start[axis] && pos < spec.origin_end[axis],
                    "voxel {:?} written by non-owning tile {}",
                    idx,
                    v - 1
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_wrong_payload_shape_is_fatal() -> Result<()> {
        let dir = tempdir().unwrap();
        let vol = cell_volume(dir.path(), [10, 10, 10]);
        let grid = TileGrid::compute([10, 10, 10], [4, 10, 10], 2)?;
        let stitcher = VolumeStitcher::new(&vol);

        let payload = Array3::<u8>::zeros((3, 3, 3));
        let err = stitcher
            .write_tile("CELL", grid.get(0).unwrap(), payload.view())
            .unwrap_err();
        assert!(matches!(err, VoxtileError::ShapeMismatch { .. }));
        Ok(())
    }
}
