//! Core types used throughout the voxtile library.

/// Shape of a volume, tile, or region in (x, y, z) index order.
///
/// Axis convention follows the slice-stack layout: x is the slice axis,
/// y columns, z rows; arrays are row-major with z varying fastest.
pub type Shape3 = [usize; 3];

/// A named output category defined by the external classifier's training
/// configuration. `index` is the authoritative position on the class axis
/// of probability maps and masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabel {
    pub name: String,
    pub index: usize,
}

impl ClassLabel {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// Elementwise `end - start` for a `[start, end)` region.
pub fn region_shape(start: Shape3, end: Shape3) -> Shape3 {
    [end[0] - start[0], end[1] - start[1], end[2] - start[2]]
}
