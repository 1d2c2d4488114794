//! voxtile: distributed tiling, dispatch, and stitching for volumetric
//! segmentation.
//!
//! Volumes too large for one machine's memory are cut into a grid of tiles
//! with halo overlap, statically partitioned over a fixed worker pool,
//! classified per voxel behind the [`classifier::PixelClassifier`] trait,
//! reduced to one-hot masks, morphologically consolidated, and stitched
//! back into shared output volumes with the halos trimmed away. Tiles are
//! exchanged through self-describing files, so the only coordination
//! between phases is the tile index.

pub mod classifier;
pub mod config;
pub mod dispatch;
pub mod element;
pub mod error;
pub mod logging;
pub mod mask;
pub mod memory;
pub mod pipeline;
pub mod postproc;
pub mod stitch;
pub mod store;
pub mod tiling;
pub mod types;
pub mod volume;

pub use classifier::PixelClassifier;
pub use config::SegmentationConfig;
pub use element::{Dtype, Element};
pub use error::{Result, VoxtileError};
pub use pipeline::Orchestrator;
pub use tiling::{TileGrid, TileSpec};
pub use types::{ClassLabel, Shape3};
