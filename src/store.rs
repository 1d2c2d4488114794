//! File-based tile exchange.
//!
//! Tiles move between pipeline phases as self-describing files: each file
//! carries its placement metadata (origin bounds plus halo widths) alongside
//! one named dataset per class label, so any later phase can re-derive where
//! a payload belongs without out-of-band coordination.
//!
//! Tile file format v1, little-endian:
//! - magic `VTIL` (4 bytes), version (u32)
//! - `origin_indices`: 6 x u64 `(x0, x1, y0, y1, z0, z1)`
//! - `right_overlap`: 3 x u8, `left_overlap`: 3 x u8
//! - dataset count (u32), then per dataset:
//!   name length (u64) + UTF-8 name, dtype tag (u8), shape 3 x u64,
//!   raw little-endian payload.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView3};

use crate::element::{Dtype, Element};
use crate::error::{Result, VoxtileError};
use crate::tiling::{TileGrid, TileSpec};

const TILE_MAGIC: &[u8; 4] = b"VTIL";
const TILE_VERSION: u32 = 1;

/// Upper bounds rejected at parse time as sanity checks on corrupt files.
const MAX_DATASETS: u32 = 256;
const MAX_NAME_LEN: u64 = 4096;

/// Tile files are numbered with five digits, so grids are capped there.
pub const MAX_TILES: usize = 100_000;

fn read_u32(reader: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

// ============================================================================
// Writing
// ============================================================================

/// Streaming writer for one tile file.
///
/// Datasets are appended one at a time; `finish` patches the dataset count
/// into the header. Dropping a writer without calling `finish` leaves a
/// file that readers reject.
pub struct TileWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    count: u32,
    count_pos: u64,
}

impl TileWriter {
    /// Create a tile file and write its placement header.
    pub fn create(path: impl Into<PathBuf>, spec: &TileSpec) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| VoxtileError::io(&path, "create", e))?;
        let mut writer = BufWriter::new(file);

        let io_err = |e| VoxtileError::io(&path, "write", e);

        writer.write_all(TILE_MAGIC).map_err(io_err)?;
        writer.write_all(&TILE_VERSION.to_le_bytes()).map_err(io_err)?;
        for axis in 0..3 {
            writer
                .write_all(&(spec.origin_start[axis] as u64).to_le_bytes())
                .map_err(io_err)?;
            writer
                .write_all(&(spec.origin_end[axis] as u64).to_le_bytes())
                .map_err(io_err)?;
        }
        for axis in 0..3 {
            writer
                .write_all(&[spec.right_overlap[axis] as u8])
                .map_err(io_err)?;
        }
        for axis in 0..3 {
            writer
                .write_all(&[spec.left_overlap[axis] as u8])
                .map_err(io_err)?;
        }

        let count_pos = writer
            .stream_position()
            .map_err(|e| VoxtileError::io(&path, "seek", e))?;
        writer.write_all(&0u32.to_le_bytes()).map_err(io_err)?;

        Ok(Self {
            writer,
            path,
            count: 0,
            count_pos,
        })
    }

    /// Append one named dataset with the tile's payload.
    pub fn add_dataset<T: Element>(&mut self, name: &str, data: ArrayView3<'_, T>) -> Result<()> {
        if name.is_empty() || name.len() as u64 > MAX_NAME_LEN {
            return Err(VoxtileError::config(format!(
                "invalid dataset name length: {}",
                name.len()
            )));
        }
        if self.count >= MAX_DATASETS {
            return Err(VoxtileError::config(format!(
                "too many datasets in one tile (max {})",
                MAX_DATASETS
            )));
        }

        let path = self.path.clone();
        let io_err = |e| VoxtileError::io(&path, "write", e);

        let name_bytes = name.as_bytes();
        self.writer
            .write_all(&(name_bytes.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        self.writer.write_all(name_bytes).map_err(io_err)?;
        self.writer.write_all(&[T::DTYPE.tag()]).map_err(io_err)?;

        let (dx, dy, dz) = data.dim();
        for dim in [dx, dy, dz] {
            self.writer
                .write_all(&(dim as u64).to_le_bytes())
                .map_err(io_err)?;
        }

        let values: Vec<T> = data.iter().copied().collect();
        let mut payload = Vec::with_capacity(values.len() * T::DTYPE.size());
        T::encode(&values, &mut payload);
        self.writer.write_all(&payload).map_err(io_err)?;

        self.count += 1;
        Ok(())
    }

    /// Patch the dataset count and flush.
    pub fn finish(mut self) -> Result<()> {
        let path = self.path.clone();
        self.writer
            .seek(SeekFrom::Start(self.count_pos))
            .map_err(|e| VoxtileError::io(&path, "seek", e))?;
        self.writer
            .write_all(&self.count.to_le_bytes())
            .map_err(|e| VoxtileError::io(&path, "write", e))?;
        self.writer
            .flush()
            .map_err(|e| VoxtileError::io(&path, "flush", e))?;
        Ok(())
    }
}

// ============================================================================
// Reading
// ============================================================================

#[derive(Debug, Clone)]
struct DatasetEntry {
    name: String,
    dtype: Dtype,
    shape: [usize; 3],
    offset: u64,
}

/// An open tile file: parsed placement header plus a directory of its
/// datasets. Payloads are read on demand, by name, with the caller's
/// expected element type checked against the stored dtype tag.
#[derive(Debug)]
pub struct TileFile {
    path: PathBuf,
    spec: TileSpec,
    datasets: Vec<DatasetEntry>,
    reader: BufReader<File>,
}

impl TileFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| VoxtileError::io(&path, "open", e))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| VoxtileError::io(&path, "read", e))?;
        if &magic != TILE_MAGIC {
            return Err(VoxtileError::format(&path, "bad magic (expected VTIL)"));
        }
        let version = read_u32(&mut reader).map_err(|e| VoxtileError::io(&path, "read", e))?;
        if version != TILE_VERSION {
            return Err(VoxtileError::format(
                &path,
                format!("unsupported tile version {} (expected {})", version, TILE_VERSION),
            ));
        }

        let mut bounds = [0u64; 6];
        for b in bounds.iter_mut() {
            *b = read_u64(&mut reader).map_err(|e| VoxtileError::io(&path, "read", e))?;
        }
        let mut right = [0u8; 3];
        reader
            .read_exact(&mut right)
            .map_err(|e| VoxtileError::io(&path, "read", e))?;
        let mut left = [0u8; 3];
        reader
            .read_exact(&mut left)
            .map_err(|e| VoxtileError::io(&path, "read", e))?;

        for axis in 0..3 {
            if bounds[axis * 2] > bounds[axis * 2 + 1] {
                return Err(VoxtileError::format(
                    &path,
                    format!("origin bounds inverted on axis {}", axis),
                ));
            }
        }

        let spec = TileSpec {
            origin_start: [bounds[0] as usize, bounds[2] as usize, bounds[4] as usize],
            origin_end: [bounds[1] as usize, bounds[3] as usize, bounds[5] as usize],
            left_overlap: [left[0] as usize, left[1] as usize, left[2] as usize],
            right_overlap: [right[0] as usize, right[1] as usize, right[2] as usize],
        };

        let count = read_u32(&mut reader).map_err(|e| VoxtileError::io(&path, "read", e))?;
        if count > MAX_DATASETS {
            return Err(VoxtileError::format(
                &path,
                format!("dataset count {} exceeds limit {}", count, MAX_DATASETS),
            ));
        }

        let mut datasets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = read_u64(&mut reader).map_err(|e| VoxtileError::io(&path, "read", e))?;
            if name_len == 0 || name_len > MAX_NAME_LEN {
                return Err(VoxtileError::format(
                    &path,
                    format!("invalid dataset name length {}", name_len),
                ));
            }
            let mut name_bytes = vec![0u8; name_len as usize];
            reader
                .read_exact(&mut name_bytes)
                .map_err(|e| VoxtileError::io(&path, "read", e))?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| VoxtileError::format(&path, "dataset name is not UTF-8"))?;

            let mut tag = [0u8; 1];
            reader
                .read_exact(&mut tag)
                .map_err(|e| VoxtileError::io(&path, "read", e))?;
            let dtype = Dtype::from_tag(tag[0])
                .ok_or_else(|| VoxtileError::format(&path, format!("unknown dtype tag {}", tag[0])))?;

            let mut shape = [0usize; 3];
            for dim in shape.iter_mut() {
                *dim = read_u64(&mut reader).map_err(|e| VoxtileError::io(&path, "read", e))?
                    as usize;
            }

            let payload_bytes = shape[0]
                .checked_mul(shape[1])
                .and_then(|v| v.checked_mul(shape[2]))
                .and_then(|v| v.checked_mul(dtype.size()))
                .ok_or_else(|| VoxtileError::format(&path, "dataset shape overflows"))?;

            let offset = reader
                .stream_position()
                .map_err(|e| VoxtileError::io(&path, "seek", e))?;
            reader
                .seek_relative(payload_bytes as i64)
                .map_err(|e| VoxtileError::io(&path, "seek", e))?;

            datasets.push(DatasetEntry {
                name,
                dtype,
                shape,
                offset,
            });
        }

        Ok(Self {
            path,
            spec,
            datasets,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spec(&self) -> &TileSpec {
        &self.spec
    }

    /// Dataset names in file order (one per class label for classified tiles).
    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.datasets.iter().any(|d| d.name == name)
    }

    /// Stored dtype of a dataset, if present.
    pub fn dataset_dtype(&self, name: &str) -> Option<Dtype> {
        self.datasets.iter().find(|d| d.name == name).map(|d| d.dtype)
    }

    /// Read one dataset as a dense array. The stored dtype must match `T`
    /// exactly; a mismatch means the store was produced under a different
    /// configuration and is fatal.
    pub fn read_dataset<T: Element>(&mut self, name: &str) -> Result<Array3<T>> {
        let entry = self
            .datasets
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| {
                VoxtileError::format(&self.path, format!("no dataset named '{}'", name))
            })?;
        if entry.dtype != T::DTYPE {
            return Err(VoxtileError::format(
                &self.path,
                format!(
                    "dataset '{}' has dtype {} but {} was requested",
                    name,
                    entry.dtype.name(),
                    T::DTYPE.name()
                ),
            ));
        }

        let payload_bytes = entry.shape[0] * entry.shape[1] * entry.shape[2] * entry.dtype.size();
        self.reader
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| VoxtileError::io(&self.path, "seek", e))?;
        let mut bytes = vec![0u8; payload_bytes];
        self.reader
            .read_exact(&mut bytes)
            .map_err(|e| VoxtileError::io(&self.path, "read", e))?;

        let values = T::decode(&bytes);
        Array3::from_shape_vec((entry.shape[0], entry.shape[1], entry.shape[2]), values)
            .map_err(|e| VoxtileError::format(&self.path, format!("dataset shape invalid: {}", e)))
    }
}

// ============================================================================
// Store directory
// ============================================================================

/// A directory of numbered tile files for one pipeline phase.
pub struct TileStore {
    dir: PathBuf,
}

impl TileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Open the directory, creating it if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| VoxtileError::io(&dir, "create directory", e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for the tile at a grid index (`tile_00042.vtil`).
    pub fn tile_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("tile_{:05}.vtil", index))
    }

    /// Path for a probability-map tile at a grid index.
    pub fn prob_map_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("prob_map_{:05}.vtil", index))
    }

    /// Sorted list of tile files in the store. Zero-padded numbering makes
    /// lexicographic order equal grid order.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&self.dir).map_err(|e| VoxtileError::io(&self.dir, "read directory", e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VoxtileError::io(&self.dir, "read directory", e))?;
            let path = entry.path();
            let is_tile = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("tile_") && n.ends_with(".vtil"))
                .unwrap_or(false);
            if is_tile {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Check that a listing covers tile indices `0..len` with no gaps.
    ///
    /// A store missing an interior tile would otherwise stitch silent
    /// zeros into that tile's region.
    pub fn validate_contiguous(listed: &[PathBuf]) -> Result<()> {
        for (position, path) in listed.iter().enumerate() {
            let expected = format!("tile_{:05}.vtil", position);
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name != expected {
                return Err(VoxtileError::config(format!(
                    "tile store is missing tile {}: found '{}' in its place",
                    position,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Remove all tile and probability-map files from a previous run.
    pub fn clear(&self) -> Result<()> {
        if !self.dir.exists() {
            return Ok(());
        }
        let entries =
            fs::read_dir(&self.dir).map_err(|e| VoxtileError::io(&self.dir, "read directory", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| VoxtileError::io(&self.dir, "read directory", e))?;
            let path = entry.path();
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| {
                    (n.starts_with("tile_") || n.starts_with("prob_map_")) && n.ends_with(".vtil")
                })
                .unwrap_or(false);
            if stale {
                log::info!("removing stale tile file {}", path.display());
                fs::remove_file(&path).map_err(|e| VoxtileError::io(&path, "remove", e))?;
            }
        }
        Ok(())
    }

    /// Check that the store's contents were produced by the given grid.
    ///
    /// Guards against reusing tile files left behind by a run with different
    /// tiling parameters: the tile count must match and every file's stored
    /// placement must equal the freshly computed spec at its index.
    pub fn validate_grid(&self, grid: &TileGrid) -> Result<()> {
        let paths = self.list()?;
        if paths.len() != grid.len() {
            return Err(VoxtileError::config(format!(
                "tile store '{}' holds {} tiles but the current configuration produces {}; \
                 the store is stale",
                self.dir.display(),
                paths.len(),
                grid.len()
            )));
        }
        for (index, path) in paths.iter().enumerate() {
            let file = TileFile::open(path)?;
            let expected = grid.get(index).copied();
            if expected != Some(*file.spec()) {
                return Err(VoxtileError::config(format!(
                    "tile file '{}' was produced with different tiling parameters",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn sample_spec() -> TileSpec {
        TileSpec {
            origin_start: [0, 4, 8],
            origin_end: [4, 8, 12],
            left_overlap: [0, 2, 2],
            right_overlap: [2, 2, 0],
        }
    }

    #[test]
    fn test_tile_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile_00000.vtil");
        let spec = sample_spec();

        let padded = spec.padded_shape();
        let cell = Array3::from_shape_fn((padded[0], padded[1], padded[2]), |(x, y, z)| {
            (x * 100 + y * 10 + z) as u16
        });
        let vessel = Array3::from_elem((padded[0], padded[1], padded[2]), 7u16);

        let mut writer = TileWriter::create(&path, &spec)?;
        writer.add_dataset("CELL", cell.view())?;
        writer.add_dataset("VESSEL", vessel.view())?;
        writer.finish()?;

        let mut file = TileFile::open(&path)?;
        assert_eq!(*file.spec(), spec);
        assert_eq!(file.dataset_names(), vec!["CELL", "VESSEL"]);
        assert_eq!(file.dataset_dtype("CELL"), Some(Dtype::U16));

        let cell_back = file.read_dataset::<u16>("CELL")?;
        assert_eq!(cell_back, cell);
        let vessel_back = file.read_dataset::<u16>("VESSEL")?;
        assert_eq!(vessel_back, vessel);
        Ok(())
    }

    #[test]
    fn test_mixed_dtypes_in_one_tile() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile_00001.vtil");
        let spec = sample_spec();
        let padded = spec.padded_shape();
        let dim = (padded[0], padded[1], padded[2]);

        let mask = Array3::<u8>::ones(dim);
        let probs = Array3::from_elem(dim, 0.5f32);

        let mut writer = TileWriter::create(&path, &spec)?;
        writer.add_dataset("mask", mask.view())?;
        writer.add_dataset("probs", probs.view())?;
        writer.finish()?;

        let mut file = TileFile::open(&path)?;
        assert_eq!(file.read_dataset::<u8>("mask")?, mask);
        assert_eq!(file.read_dataset::<f32>("probs")?, probs);
        Ok(())
    }

    #[test]
    fn test_dtype_mismatch_is_fatal() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile_00000.vtil");
        let spec = sample_spec();
        let padded = spec.padded_shape();

        let mut writer = TileWriter::create(&path, &spec)?;
        writer.add_dataset(
            "CELL",
            Array3::<u8>::zeros((padded[0], padded[1], padded[2])).view(),
        )?;
        writer.finish()?;

        let mut file = TileFile::open(&path)?;
        let err = file.read_dataset::<u32>("CELL").unwrap_err();
        assert!(err.to_string().contains("dtype"));
        Ok(())
    }

    #[test]
    fn test_missing_dataset() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile_00000.vtil");
        let writer = TileWriter::create(&path, &sample_spec())?;
        writer.finish()?;

        let mut file = TileFile::open(&path)?;
        assert!(!file.has_dataset("CELL"));
        assert!(file.read_dataset::<u8>("CELL").is_err());
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile_00000.vtil");
        fs::write(&path, b"NOPE").unwrap();
        let err = TileFile::open(&path).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_unfinished_writer_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile_00000.vtil");
        let spec = sample_spec();
        let padded = spec.padded_shape();
        {
            let mut writer = TileWriter::create(&path, &spec).unwrap();
            writer
                .add_dataset(
                    "CELL",
                    Array3::<u8>::zeros((padded[0], padded[1], padded[2])).view(),
                )
                .unwrap();
            // finish() never called: header still claims zero datasets.
        }
        let file = TileFile::open(&path).unwrap();
        assert!(!file.has_dataset("CELL"));
    }

    #[test]
    fn test_store_list_is_sorted() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = TileStore::create(dir.path())?;
        for index in [3usize, 0, 11] {
            let writer = TileWriter::create(store.tile_path(index), &sample_spec())?;
            writer.finish()?;
        }
        // A probability-map file must not show up in the tile listing.
        let writer = TileWriter::create(store.prob_map_path(0), &sample_spec())?;
        writer.finish()?;

        let listed = store.list()?;
        let names: Vec<_> = listed
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["tile_00000.vtil", "tile_00003.vtil", "tile_00011.vtil"]);
        Ok(())
    }

    #[test]
    fn test_store_clear() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = TileStore::create(dir.path())?;
        TileWriter::create(store.tile_path(0), &sample_spec())?.finish()?;
        TileWriter::create(store.prob_map_path(0), &sample_spec())?.finish()?;
        fs::write(dir.path().join("unrelated.txt"), b"keep me").unwrap();

        store.clear()?;
        assert!(store.list()?.is_empty());
        assert!(dir.path().join("unrelated.txt").exists());
        Ok(())
    }

    #[test]
    fn test_validate_contiguous_detects_gaps() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = TileStore::create(dir.path())?;
        for index in 0..3 {
            TileWriter::create(store.tile_path(index), &sample_spec())?.finish()?;
        }
        TileStore::validate_contiguous(&store.list()?)?;

        // Removing an interior tile leaves a sorted but gapped listing.
        fs::remove_file(store.tile_path(1)).unwrap();
        let listed = store.list()?;
        assert_eq!(listed.len(), 2);
        assert!(TileStore::validate_contiguous(&listed).is_err());
        Ok(())
    }

    #[test]
    fn test_validate_grid_detects_stale_store() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = TileStore::create(dir.path())?;
        let grid = TileGrid::compute([8, 8, 8], [4, 4, 8], 1)?;

        for (index, spec) in grid.tiles().iter().enumerate() {
            TileWriter::create(store.tile_path(index), spec)?.finish()?;
        }
        store.validate_grid(&grid)?;

        // A different overlap radius must be detected.
        let other = TileGrid::compute([8, 8, 8], [4, 4, 8], 2)?;
        assert!(store.validate_grid(&other).is_err());

        // Missing tiles must be detected.
        fs::remove_file(store.tile_path(0)).unwrap();
        assert!(store.validate_grid(&grid).is_err());
        Ok(())
    }
}
