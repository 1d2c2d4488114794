//! One-hot mask reduction.
//!
//! Probability maps are collapsed to a per-voxel winner-take-all mask:
//! for each voxel, the class with the highest probability gets 1 and all
//! others get 0. Ties go to the lowest class index, so the reduction is
//! deterministic for any input. Non-finite probabilities indicate a broken
//! classifier and abort the run.

use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::{Array4, ArrayView4, Axis, Zip};

use crate::error::{Result, VoxtileError};

/// Collapse per-class probabilities to a one-hot u8 mask of the same shape.
///
/// The class axis is the last axis. Every voxel of the result has exactly
/// one set channel; [`check_one_hot`] re-verifies this before the mask is
/// persisted.
pub fn reduce_to_mask(probabilities: ArrayView4<'_, f32>) -> Result<Array4<u8>> {
    let (x, y, z, classes) = probabilities.dim();
    if classes == 0 {
        return Err(VoxtileError::mask_invariant(
            "mask reduction",
            "probability map has zero class channels",
        ));
    }

    let mut mask = Array4::<u8>::zeros((x, y, z, classes));
    let non_finite = AtomicBool::new(false);

    Zip::from(mask.lanes_mut(Axis(3)))
        .and(probabilities.lanes(Axis(3)))
        .par_for_each(|mut mask_lane, prob_lane| {
            let mut best_idx = 0usize;
            let mut best = prob_lane[0];
            for (idx, &p) in prob_lane.iter().enumerate() {
                if !p.is_finite() {
                    non_finite.store(true, Ordering::Relaxed);
                }
                // Strict comparison keeps ties on the lowest index.
                if p > best {
                    best = p;
                    best_idx = idx;
                }
            }
            mask_lane[best_idx] = 1;
        });

    if non_finite.load(Ordering::Relaxed) {
        return Err(VoxtileError::mask_invariant(
            "mask reduction",
            "probability map contains NaN or infinite values",
        ));
    }
    Ok(mask)
}

/// Verify the one-hot invariant: every voxel has exactly one set channel.
pub fn check_one_hot(mask: &Array4<u8>) -> Result<()> {
    for lane in mask.lanes(Axis(3)) {
        let set: u32 = lane.iter().map(|&v| u32::from(v)).sum();
        if set != 1 {
            return Err(VoxtileError::mask_invariant(
                "one-hot check",
                format!("voxel has {} set channels, expected exactly 1", set),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array4};

    #[test]
    fn test_argmax_picks_highest_class() -> Result<()> {
        // One voxel, three classes.
        let probs = array![[[[0.1f32, 0.7, 0.2]]]];
        let mask = reduce_to_mask(probs.view())?;
        assert_eq!(mask, array![[[[0u8, 1, 0]]]]);
        Ok(())
    }

    #[test]
    fn test_ties_go_to_lowest_index() -> Result<()> {
        let probs = array![[[[0.5f32, 0.5, 0.0]]]];
        let mask = reduce_to_mask(probs.view())?;
        assert_eq!(mask, array![[[[1u8, 0, 0]]]]);
        Ok(())
    }

    #[test]
    fn test_every_voxel_is_one_hot() -> Result<()> {
        let probs = Array4::from_shape_fn((3, 4, 5, 4), |(x, y, z, c)| {
            ((x * 31 + y * 17 + z * 7 + c * 3) % 13) as f32 / 13.0
        });
        let mask = reduce_to_mask(probs.view())?;
        check_one_hot(&mask)?;
        Ok(())
    }

    #[test]
    fn test_nan_probability_is_fatal() {
        let probs = array![[[[0.5f32, f32::NAN]]]];
        let err = reduce_to_mask(probs.view()).unwrap_err();
        assert!(matches!(err, VoxtileError::MaskInvariant { .. }));
    }

    #[test]
    fn test_zero_classes_is_fatal() {
        let probs = Array4::<f32>::zeros((2, 2, 2, 0));
        assert!(reduce_to_mask(probs.view()).is_err());
    }

    #[test]
    fn test_check_one_hot_rejects_double_set() {
        let mut mask = Array4::<u8>::zeros((1, 1, 1, 3));
        mask[[0, 0, 0, 0]] = 1;
        mask[[0, 0, 0, 2]] = 1;
        assert!(check_one_hot(&mask).is_err());
    }
}
