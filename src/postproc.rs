//! Morphological post-processing of stitched class volumes.
//!
//! A stitched cell volume is turned into a labeled instance volume in four
//! steps: binarize (any positive intensity counts), fill enclosed holes,
//! drop connected components below a minimum voxel count, and assign each
//! surviving component a distinct positive id. All steps use
//! 26-connectivity so diagonal touches join components.

use ndarray::{Array3, ArrayView3};

use crate::element::Element;
use crate::error::{Result, VoxtileError};

/// The 26 neighbor offsets of a voxel.
fn offsets26() -> Vec<(isize, isize, isize)> {
    let mut offsets = Vec::with_capacity(26);
    for dx in -1isize..=1 {
        for dy in -1isize..=1 {
            for dz in -1isize..=1 {
                if (dx, dy, dz) != (0, 0, 0) {
                    offsets.push((dx, dy, dz));
                }
            }
        }
    }
    offsets
}

/// Binarize: every strictly positive voxel becomes foreground.
pub fn threshold<T: Element>(volume: ArrayView3<'_, T>) -> Array3<bool> {
    volume.map(|&v| v.to_f32() > 0.0)
}

/// Fill holes: background regions not reachable from the volume boundary
/// become foreground. Reachability is a 26-connected flood from every
/// background boundary voxel; foreground is never removed, so the result
/// is a superset of the input.
pub fn fill_holes(mask: &Array3<bool>) -> Array3<bool> {
    let (nx, ny, nz) = mask.dim();
    if nx == 0 || ny == 0 || nz == 0 {
        return mask.clone();
    }
    let offsets = offsets26();

    let mut outside = Array3::from_elem((nx, ny, nz), false);
    let mut queue: Vec<(usize, usize, usize)> = Vec::new();
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                let on_boundary =
                    x == 0 || y == 0 || z == 0 || x == nx - 1 || y == ny - 1 || z == nz - 1;
                if on_boundary && !mask[[x, y, z]] {
                    outside[[x, y, z]] = true;
                    queue.push((x, y, z));
                }
            }
        }
    }

    while let Some((x, y, z)) = queue.pop() {
        for &(dx, dy, dz) in &offsets {
            let (px, py, pz) = (x as isize + dx, y as isize + dy, z as isize + dz);
            if px < 0 || py < 0 || pz < 0 {
                continue;
            }
            let (px, py, pz) = (px as usize, py as usize, pz as usize);
            if px >= nx || py >= ny || pz >= nz {
                continue;
            }
            if !mask[[px, py, pz]] && !outside[[px, py, pz]] {
                outside[[px, py, pz]] = true;
                queue.push((px, py, pz));
            }
        }
    }

    // Everything that is not reachable background is foreground.
    Array3::from_shape_fn((nx, ny, nz), |idx| mask[idx] || !outside[idx])
}

/// Label 26-connected foreground components with ids `1..=count`.
/// Background stays 0. Ids are assigned in scan order of the component's
/// first voxel, so labeling is deterministic.
pub fn label_components(mask: &Array3<bool>) -> (Array3<u32>, u32) {
    let (nx, ny, nz) = mask.dim();
    let mut labels = Array3::<u32>::zeros((nx, ny, nz));
    let offsets = offsets26();
    let mut next = 0u32;
    let mut queue: Vec<(usize, usize, usize)> = Vec::new();

    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                if !mask[[x, y, z]] || labels[[x, y, z]] != 0 {
                    continue;
                }
                next += 1;
                labels[[x, y, z]] = next;
                queue.push((x, y, z));
                while let Some((cx, cy, cz)) = queue.pop() {
                    for &(dx, dy, dz) in &offsets {
                        let (px, py, pz) =
                            (cx as isize + dx, cy as isize + dy, cz as isize + dz);
                        if px < 0 || py < 0 || pz < 0 {
                            continue;
                        }
                        let (px, py, pz) = (px as usize, py as usize, pz as usize);
                        if px >= nx || py >= ny || pz >= nz {
                            continue;
                        }
                        if mask[[px, py, pz]] && labels[[px, py, pz]] == 0 {
                            labels[[px, py, pz]] = next;
                            queue.push((px, py, pz));
                        }
                    }
                }
            }
        }
    }
    (labels, next)
}

/// Drop connected components with fewer than `min_size` voxels.
/// `min_size <= 1` is the identity.
pub fn remove_small_objects(mask: &Array3<bool>, min_size: usize) -> Array3<bool> {
    if min_size <= 1 {
        return mask.clone();
    }
    let (labels, count) = label_components(mask);
    let mut sizes = vec![0usize; count as usize + 1];
    for &id in labels.iter() {
        sizes[id as usize] += 1;
    }
    labels.map(|&id| id != 0 && sizes[id as usize] >= min_size)
}

/// Full consolidation of one tile's cell intensities into labeled
/// instances: threshold, fill holes, remove specks, label.
pub fn consolidate<T: Element>(
    volume: ArrayView3<'_, T>,
    min_object_size: usize,
) -> Result<Array3<u32>> {
    let binary = threshold(volume);
    let filled = fill_holes(&binary);
    let cleaned = remove_small_objects(&filled, min_object_size);
    let (labels, count) = label_components(&cleaned);
    log::debug!(
        "consolidated tile {:?}: {} objects (min size {})",
        volume.dim(),
        count,
        min_object_size
    );
    if count == u32::MAX {
        return Err(VoxtileError::format(
            "consolidation",
            "component id space exhausted",
        ));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn blob(shape: (usize, usize, usize), voxels: &[(usize, usize, usize)]) -> Array3<bool> {
        let mut mask = Array3::from_elem(shape, false);
        for &idx in voxels {
            mask[[idx.0, idx.1, idx.2]] = true;
        }
        mask
    }

    #[test]
    fn test_threshold_positive_only() {
        let vol = ndarray::array![[[0.0f32, 0.5, -1.0]]];
        let mask = threshold(vol.view());
        assert_eq!(mask, ndarray::array![[[false, true, false]]]);
    }

    #[test]
    fn test_fill_holes_fills_enclosed_cavity() {
        // A 5^3 volume with a solid 3^3 shell around a single hollow voxel.
        let mut mask = Array3::from_elem((5, 5, 5), false);
        for x in 1..4 {
            for y in 1..4 {
                for z in 1..4 {
                    mask[[x, y, z]] = true;
                }
            }
        }
        mask[[2, 2, 2]] = false;
        let filled = fill_holes(&mask);
        assert!(filled[[2, 2, 2]]);
        // Exterior background is untouched.
        assert!(!filled[[0, 0, 0]]);
    }

    #[test]
    fn test_fill_holes_is_monotone() {
        let mask = blob((4, 4, 4), &[(1, 1, 1), (2, 2, 2)]);
        let filled = fill_holes(&mask);
        for (idx, &v) in mask.indexed_iter() {
            if v {
                assert!(filled[idx], "foreground removed at {:?}", idx);
            }
        }
    }

    #[test]
    fn test_open_notch_is_not_filled() {
        // Background channel reaching the boundary must stay background.
        let mut mask = Array3::from_elem((3, 3, 3), true);
        mask[[1, 1, 0]] = false;
        mask[[1, 1, 1]] = false;
        let filled = fill_holes(&mask);
        assert!(!filled[[1, 1, 0]]);
        assert!(!filled[[1, 1, 1]]);
    }

    #[test]
    fn test_remove_small_objects_keeps_large() {
        let mut mask = Array3::from_elem((6, 6, 6), false);
        // A 2x2x2 blob (8 voxels) and an isolated speck.
        for x in 0..2 {
            for y in 0..2 {
                for z in 0..2 {
                    mask[[x, y, z]] = true;
                }
            }
        }
        mask[[5, 5, 5]] = true;
        let cleaned = remove_small_objects(&mask, 4);
        assert!(cleaned[[0, 0, 0]]);
        assert!(!cleaned[[5, 5, 5]]);
    }

    #[test]
    fn test_remove_small_objects_min_size_one_is_identity() {
        let mask = blob((3, 3, 3), &[(0, 0, 0), (2, 2, 2)]);
        assert_eq!(remove_small_objects(&mask, 1), mask);
        assert_eq!(remove_small_objects(&mask, 0), mask);
    }

    #[test]
    fn test_diagonal_voxels_form_one_component() {
        let mask = blob((3, 3, 3), &[(0, 0, 0), (1, 1, 1), (2, 2, 2)]);
        let (labels, count) = label_components(&mask);
        assert_eq!(count, 1);
        assert_eq!(labels[[0, 0, 0]], labels[[2, 2, 2]]);
    }

    #[test]
    fn test_separate_blobs_get_distinct_ids() {
        let mask = blob((5, 5, 5), &[(0, 0, 0), (4, 4, 4)]);
        let (labels, count) = label_components(&mask);
        assert_eq!(count, 2);
        assert_ne!(labels[[0, 0, 0]], labels[[4, 4, 4]]);
        assert_ne!(labels[[0, 0, 0]], 0);
    }

    #[test]
    fn test_label_ids_are_scan_order_deterministic() {
        let mask = blob((4, 4, 4), &[(0, 0, 1), (3, 3, 3)]);
        let (labels, _) = label_components(&mask);
        assert_eq!(labels[[0, 0, 1]], 1);
        assert_eq!(labels[[3, 3, 3]], 2);
    }

    #[test]
    fn test_consolidate_end_to_end() -> Result<()> {
        // A hollow 3^3 cube of intensity plus a below-threshold speck.
        let mut vol = Array3::<f32>::zeros((6, 6, 6));
        for x in 1..4 {
            for y in 1..4 {
                for z in 1..4 {
                    vol[[x, y, z]] = 0.9;
                }
            }
        }
        vol[[2, 2, 2]] = 0.0;
        vol[[5, 5, 5]] = 0.9;

        let labels = consolidate(vol.view(), 5)?;
        // The cavity was filled and belongs to the cube's component.
        assert_ne!(labels[[2, 2, 2]], 0);
        assert_eq!(labels[[2, 2, 2]], labels[[1, 1, 1]]);
        // The speck was removed.
        assert_eq!(labels[[5, 5, 5]], 0);
        Ok(())
    }
}
