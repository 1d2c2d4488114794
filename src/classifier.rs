//! Classifier integration seam.
//!
//! The engine treats the voxel classifier as an opaque function from a
//! padded tile to per-class probabilities. Implementations wrap whatever
//! inference backend is in use; the pipeline only relies on the output
//! contract checked by [`check_output_contract`].

use ndarray::{Array4, ArrayView3};

use crate::error::{Result, VoxtileError};
use crate::types::ClassLabel;

/// A per-voxel probability classifier.
///
/// `classify` maps a padded tile of normalized intensities to an array of
/// shape `(x, y, z, num_labels)` where channel `i` holds the probability
/// of `labels()[i]`. Implementations must be callable from multiple worker
/// threads at once.
pub trait PixelClassifier: Sync {
    /// Output classes, in channel order.
    fn labels(&self) -> &[ClassLabel];

    /// Classify one padded tile.
    fn classify(&self, tile: ArrayView3<'_, f32>) -> Result<Array4<f32>>;
}

/// Verify that classifier output matches its input tile and label set.
/// A violation is fatal: downstream masks and stitched volumes would be
/// silently misaligned.
pub fn check_output_contract(
    tile_shape: (usize, usize, usize),
    num_labels: usize,
    output: &Array4<f32>,
) -> Result<()> {
    let (ox, oy, oz, oc) = output.dim();
    if (ox, oy, oz) != tile_shape {
        return Err(VoxtileError::shape_mismatch(
            "classifier output spatial shape",
            [tile_shape.0, tile_shape.1, tile_shape.2],
            [ox, oy, oz],
        ));
    }
    if oc != num_labels {
        return Err(VoxtileError::config(format!(
            "classifier produced {} class channels, expected {}",
            oc, num_labels
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_contract_accepts_matching_output() {
        let out = Array4::<f32>::zeros((4, 5, 6, 3));
        assert!(check_output_contract((4, 5, 6), 3, &out).is_ok());
    }

    #[test]
    fn test_contract_rejects_spatial_mismatch() {
        let out = Array4::<f32>::zeros((4, 5, 5, 3));
        let err = check_output_contract((4, 5, 6), 3, &out).unwrap_err();
        assert!(matches!(err, VoxtileError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_contract_rejects_channel_mismatch() {
        let out = Array4::<f32>::zeros((4, 5, 6, 2));
        assert!(check_output_contract((4, 5, 6), 3, &out).is_err());
    }
}
