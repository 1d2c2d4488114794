use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::element::Dtype;
use crate::error::{Result, VoxtileError};
use crate::memory::parse_byte_suffix;
use crate::types::{ClassLabel, Shape3};

/// Raw TOML layout of a segmentation run configuration.
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub volume: VolumeSettings,
    pub tiles: TileSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    pub classes: ClassSettings,
}

#[derive(Debug, Deserialize)]
pub struct VolumeSettings {
    /// Stem for all run directories: `<base_dir>_volume`, `<base_dir>_tiles`,
    /// and so on.
    pub base_dir: PathBuf,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Element type of the raw intensity volume.
    pub element: String,
}

fn default_dataset() -> String {
    "raw".to_string()
}

#[derive(Debug, Deserialize)]
pub struct TileSettings {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

fn default_overlap() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct WorkerSettings {
    /// Defaults to the number of available CPUs.
    pub count: Option<usize>,
    #[serde(default = "default_memory_budget")]
    pub memory_budget: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: None,
            memory_budget: default_memory_budget(),
        }
    }
}

fn default_memory_budget() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ClassSettings {
    /// Output classes in the classifier's channel order.
    pub labels: Vec<String>,
    #[serde(default = "default_cell_label")]
    pub cell_label: String,
    #[serde(default = "default_min_object_size")]
    pub min_object_size: usize,
    #[serde(default)]
    pub save_probability_maps: Vec<String>,
    /// Store masks as 0/1 instead of mask-gated intensities.
    #[serde(default)]
    pub binary_output: bool,
}

fn default_cell_label() -> String {
    "CELL".to_string()
}

fn default_min_object_size() -> usize {
    100
}

/// A validated segmentation run configuration.
#[derive(Debug)]
pub struct SegmentationConfig {
    base_dir: PathBuf,
    pub dataset: String,
    pub element: Dtype,
    pub tile_dims: Shape3,
    pub overlap: usize,
    pub workers: usize,
    /// `None` means auto-detect.
    pub memory_budget: Option<usize>,
    pub labels: Vec<String>,
    pub cell_label: String,
    pub min_object_size: usize,
    pub save_probability_maps: Vec<String>,
    pub binary_output: bool,
}

fn valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !name.starts_with('.')
}

impl SegmentationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).map_err(|e| VoxtileError::io(path, "read config", e))?;
        let file: ConfigFile = toml::from_str(&contents)
            .map_err(|e| VoxtileError::config(format!("failed to parse TOML config: {}", e)))?;
        Self::from_file(file)
    }

    pub fn from_file(file: ConfigFile) -> Result<Self> {
        let element = Dtype::parse(&file.volume.element)?;

        if !valid_dataset_name(&file.volume.dataset) {
            return Err(VoxtileError::config(format!(
                "invalid dataset name '{}'",
                file.volume.dataset
            )));
        }

        let tile_dims = [file.tiles.x, file.tiles.y, file.tiles.z];
        if tile_dims.iter().any(|&d| d == 0) {
            return Err(VoxtileError::config(format!(
                "tile dimensions {:?} must all be positive",
                tile_dims
            )));
        }
        if file.tiles.overlap > u8::MAX as usize {
            return Err(VoxtileError::config(format!(
                "overlap {} exceeds the maximum of {}",
                file.tiles.overlap,
                u8::MAX
            )));
        }

        let workers = match file.workers.count {
            Some(0) => return Err(VoxtileError::config("worker count must be positive")),
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        let memory_budget = parse_byte_suffix(&file.workers.memory_budget)?;

        if file.classes.labels.is_empty() {
            return Err(VoxtileError::config("at least one class label is required"));
        }
        for label in &file.classes.labels {
            if !valid_dataset_name(label) {
                return Err(VoxtileError::config(format!(
                    "invalid class label '{}'",
                    label
                )));
            }
        }
        let mut sorted = file.classes.labels.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != file.classes.labels.len() {
            return Err(VoxtileError::config("class labels must be unique"));
        }
        if !file.classes.labels.contains(&file.classes.cell_label) {
            return Err(VoxtileError::config(format!(
                "cell label '{}' is not one of the class labels",
                file.classes.cell_label
            )));
        }

        Ok(Self {
            base_dir: file.volume.base_dir,
            dataset: file.volume.dataset,
            element,
            tile_dims,
            overlap: file.tiles.overlap,
            workers,
            memory_budget,
            labels: file.classes.labels,
            cell_label: file.classes.cell_label,
            min_object_size: file.classes.min_object_size,
            save_probability_maps: file.classes.save_probability_maps,
            binary_output: file.classes.binary_output,
        })
    }

    fn suffixed(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .base_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(suffix);
        match self.base_dir.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    /// The raw intensity volume store.
    pub fn volume_dir(&self) -> PathBuf {
        self.suffixed("_volume")
    }

    /// Padded raw tiles produced by the decompose phase.
    pub fn tiles_dir(&self) -> PathBuf {
        self.suffixed("_tiles")
    }

    /// Classified tiles (masks and probability maps).
    pub fn classified_dir(&self) -> PathBuf {
        self.suffixed("_classified")
    }

    /// Stitched per-class volume store.
    pub fn volume_maps_dir(&self) -> PathBuf {
        self.suffixed("_volume_maps")
    }

    /// Consolidated instance-labeled volume store.
    pub fn post_seg_dir(&self) -> PathBuf {
        self.suffixed("_post_seg")
    }

    /// Classes with their channel indices, in channel order.
    pub fn class_labels(&self) -> Vec<ClassLabel> {
        self.labels
            .iter()
            .enumerate()
            .map(|(index, name)| ClassLabel::new(name.clone(), index))
            .collect()
    }

    /// Channel indices of classes whose probability maps should be kept.
    /// A requested label that matches no class is skipped with a warning,
    /// not an error.
    pub fn probability_map_indices(&self) -> Vec<usize> {
        let mut indices = Vec::new();
        for requested in &self.save_probability_maps {
            match self.labels.iter().position(|l| l == requested) {
                Some(idx) => indices.push(idx),
                None => log::warn!(
                    "probability map label '{}' matches no class, skipping",
                    requested
                ),
            }
        }
        indices
    }
}
