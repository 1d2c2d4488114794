//! Shared volume store with disjoint-region access.
//!
//! The whole-volume input and the stitched outputs live in directory-backed
//! stores: a small manifest describing shape, chunking hint, and datasets,
//! plus one flat row-major data file per dataset (x, y, z order with z
//! varying fastest). Region reads and writes address `[start, end)` boxes
//! and touch only the bytes of their own z-runs, so concurrent writers on
//! disjoint regions need no locking. Any storage backend with the same
//! contract could replace this one; the pipeline only relies on
//! create-once-then-disjoint-writes.
//!
//! Manifest format v1, little-endian:
//! - magic `VVOL` (4 bytes), version (u32)
//! - volume shape 3 x u64, chunk shape 3 x u64
//! - dataset count (u32), then per dataset: name length (u64) + UTF-8 name,
//!   dtype tag (u8).

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView3};

use crate::element::{Dtype, Element};
use crate::error::{Result, VoxtileError};
use crate::types::{region_shape, Shape3};

const VOLUME_MAGIC: &[u8; 4] = b"VVOL";
const VOLUME_VERSION: u32 = 1;
const MANIFEST_NAME: &str = "volume.manifest";
const MAX_DATASETS: u32 = 256;
const MAX_NAME_LEN: u64 = 4096;

fn valid_dataset_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() as u64 <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !name.starts_with('.')
}

/// One dataset in a volume store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub name: String,
    pub dtype: Dtype,
}

/// A directory-backed volume: manifest plus one data file per dataset.
#[derive(Debug)]
pub struct SharedVolume {
    dir: PathBuf,
    shape: Shape3,
    chunk: Shape3,
    datasets: Vec<DatasetInfo>,
}

impl SharedVolume {
    /// Create a volume store at full shape.
    ///
    /// Must be called exactly once, by the coordinating worker, before any
    /// region write: data files are preallocated here so that concurrent
    /// writers find the store at its final size. The chunk shape is a
    /// locality hint recorded for readers (the stitch phases pass the
    /// configured tile y/z dimensions).
    pub fn create(
        dir: impl Into<PathBuf>,
        shape: Shape3,
        chunk: Shape3,
        datasets: &[DatasetInfo],
    ) -> Result<Self> {
        let dir = dir.into();
        if shape.iter().any(|&d| d == 0) {
            return Err(VoxtileError::config(format!(
                "volume shape {:?} has an empty axis",
                shape
            )));
        }
        if datasets.is_empty() {
            return Err(VoxtileError::config("volume store needs at least one dataset"));
        }
        if datasets.len() as u32 > MAX_DATASETS {
            return Err(VoxtileError::config(format!(
                "too many datasets (max {})",
                MAX_DATASETS
            )));
        }
        for ds in datasets {
            if !valid_dataset_name(&ds.name) {
                return Err(VoxtileError::config(format!(
                    "invalid dataset name '{}'",
                    ds.name
                )));
            }
        }

        fs::create_dir_all(&dir).map_err(|e| VoxtileError::io(&dir, "create directory", e))?;

        let volume = Self {
            dir,
            shape,
            chunk,
            datasets: datasets.to_vec(),
        };
        volume.write_manifest()?;

        let voxels = shape[0]
            .checked_mul(shape[1])
            .and_then(|v| v.checked_mul(shape[2]))
            .ok_or_else(|| VoxtileError::config(format!("volume shape {:?} overflows", shape)))?;
        for ds in &volume.datasets {
            let path = volume.data_path(&ds.name);
            let file = File::create(&path).map_err(|e| VoxtileError::io(&path, "create", e))?;
            let bytes = voxels.checked_mul(ds.dtype.size()).ok_or_else(|| {
                VoxtileError::config(format!("dataset '{}' size overflows", ds.name))
            })?;
            file.set_len(bytes as u64)
                .map_err(|e| VoxtileError::io(&path, "preallocate", e))?;
        }

        Ok(volume)
    }

    /// Open an existing volume store by reading its manifest.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let manifest_path = dir.join(MANIFEST_NAME);
        let file =
            File::open(&manifest_path).map_err(|e| VoxtileError::io(&manifest_path, "open", e))?;
        let mut reader = BufReader::new(file);

        let io_err = |e| VoxtileError::io(&manifest_path, "read", e);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(io_err)?;
        if &magic != VOLUME_MAGIC {
            return Err(VoxtileError::format(&manifest_path, "bad magic (expected VVOL)"));
        }
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4).map_err(io_err)?;
        let version = u32::from_le_bytes(buf4);
        if version != VOLUME_VERSION {
            return Err(VoxtileError::format(
                &manifest_path,
                format!("unsupported volume version {}", version),
            ));
        }

        let mut buf8 = [0u8; 8];
        let mut shape = [0usize; 3];
        for dim in shape.iter_mut() {
            reader.read_exact(&mut buf8).map_err(io_err)?;
            *dim = u64::from_le_bytes(buf8) as usize;
        }
        let mut chunk = [0usize; 3];
        for dim in chunk.iter_mut() {
            reader.read_exact(&mut buf8).map_err(io_err)?;
            *dim = u64::from_le_bytes(buf8) as usize;
        }

        reader.read_exact(&mut buf4).map_err(io_err)?;
        let count = u32::from_le_bytes(buf4);
        if count == 0 || count > MAX_DATASETS {
            return Err(VoxtileError::format(
                &manifest_path,
                format!("invalid dataset count {}", count),
            ));
        }

        let mut datasets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            reader.read_exact(&mut buf8).map_err(io_err)?;
            let name_len = u64::from_le_bytes(buf8);
            if name_len == 0 || name_len > MAX_NAME_LEN {
                return Err(VoxtileError::format(
                    &manifest_path,
                    format!("invalid dataset name length {}", name_len),
                ));
            }
            let mut name_bytes = vec![0u8; name_len as usize];
            reader.read_exact(&mut name_bytes).map_err(io_err)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| VoxtileError::format(&manifest_path, "dataset name is not UTF-8"))?;
            if !valid_dataset_name(&name) {
                return Err(VoxtileError::format(
                    &manifest_path,
                    format!("invalid dataset name '{}'", name),
                ));
            }

            let mut tag = [0u8; 1];
            reader.read_exact(&mut tag).map_err(io_err)?;
            let dtype = Dtype::from_tag(tag[0]).ok_or_else(|| {
                VoxtileError::format(&manifest_path, format!("unknown dtype tag {}", tag[0]))
            })?;
            datasets.push(DatasetInfo { name, dtype });
        }

        Ok(Self {
            dir,
            shape,
            chunk,
            datasets,
        })
    }

    fn write_manifest(&self) -> Result<()> {
        let path = self.dir.join(MANIFEST_NAME);
        let file = File::create(&path).map_err(|e| VoxtileError::io(&path, "create", e))?;
        let mut writer = BufWriter::new(file);
        let io_err = |e| VoxtileError::io(&path, "write", e);

        writer.write_all(VOLUME_MAGIC).map_err(io_err)?;
        writer.write_all(&VOLUME_VERSION.to_le_bytes()).map_err(io_err)?;
        for dim in self.shape {
            writer.write_all(&(dim as u64).to_le_bytes()).map_err(io_err)?;
        }
        for dim in self.chunk {
            writer.write_all(&(dim as u64).to_le_bytes()).map_err(io_err)?;
        }
        writer
            .write_all(&(self.datasets.len() as u32).to_le_bytes())
            .map_err(io_err)?;
        for ds in &self.datasets {
            let name_bytes = ds.name.as_bytes();
            writer
                .write_all(&(name_bytes.len() as u64).to_le_bytes())
                .map_err(io_err)?;
            writer.write_all(name_bytes).map_err(io_err)?;
            writer.write_all(&[ds.dtype.tag()]).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn chunk(&self) -> Shape3 {
        self.chunk
    }

    pub fn datasets(&self) -> &[DatasetInfo] {
        &self.datasets
    }

    pub fn dataset_dtype(&self, name: &str) -> Option<Dtype> {
        self.datasets.iter().find(|d| d.name == name).map(|d| d.dtype)
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.dat", name))
    }

    fn check_dataset<T: Element>(&self, name: &str) -> Result<()> {
        match self.dataset_dtype(name) {
            None => Err(VoxtileError::config(format!(
                "volume store '{}' has no dataset '{}'",
                self.dir.display(),
                name
            ))),
            Some(dtype) if dtype != T::DTYPE => Err(VoxtileError::config(format!(
                "dataset '{}' has dtype {} but {} was requested",
                name,
                dtype.name(),
                T::DTYPE.name()
            ))),
            Some(_) => Ok(()),
        }
    }

    fn check_region(&self, start: Shape3, end: Shape3) -> Result<()> {
        for axis in 0..3 {
            if start[axis] > end[axis] || end[axis] > self.shape[axis] {
                return Err(VoxtileError::config(format!(
                    "region [{:?}, {:?}) is outside the volume shape {:?}",
                    start, end, self.shape
                )));
            }
        }
        Ok(())
    }

    /// Byte offset of voxel `(x, y, z)` in a dataset file.
    fn voxel_offset(&self, x: usize, y: usize, z: usize, elem_size: usize) -> u64 {
        (((x * self.shape[1] + y) * self.shape[2] + z) * elem_size) as u64
    }

    /// Write a block into `[start, end)`. The block shape must equal
    /// `end - start`; callers on disjoint regions may write concurrently.
    pub fn write_region<T: Element>(
        &self,
        name: &str,
        start: Shape3,
        end: Shape3,
        block: ArrayView3<'_, T>,
    ) -> Result<()> {
        self.check_dataset::<T>(name)?;
        self.check_region(start, end)?;
        let shape = region_shape(start, end);
        let (bx, by, bz) = block.dim();
        if [bx, by, bz] != shape {
            return Err(VoxtileError::shape_mismatch(
                format!("region write to dataset '{}'", name),
                shape,
                [bx, by, bz],
            ));
        }
        if shape.iter().any(|&d| d == 0) {
            return Ok(());
        }

        let path = self.data_path(name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| VoxtileError::io(&path, "open", e))?;

        // One write per z-run; runs of one region never interleave with
        // runs of a disjoint region.
        let mut run: Vec<T> = Vec::with_capacity(bz);
        let mut bytes: Vec<u8> = Vec::with_capacity(bz * T::DTYPE.size());
        for x in 0..bx {
            for y in 0..by {
                run.clear();
                run.extend(block.slice(ndarray::s![x, y, ..]).iter().copied());
                bytes.clear();
                T::encode(&run, &mut bytes);

                let offset =
                    self.voxel_offset(start[0] + x, start[1] + y, start[2], T::DTYPE.size());
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| VoxtileError::io(&path, "seek", e))?;
                file.write_all(&bytes)
                    .map_err(|e| VoxtileError::io(&path, "write", e))?;
            }
        }
        Ok(())
    }

    /// Read the block covering `[start, end)`.
    pub fn read_region<T: Element>(&self, name: &str, start: Shape3, end: Shape3) -> Result<Array3<T>> {
        self.check_dataset::<T>(name)?;
        self.check_region(start, end)?;
        let shape = region_shape(start, end);
        let mut out = Array3::from_elem((shape[0], shape[1], shape[2]), T::ZERO);
        if shape.iter().any(|&d| d == 0) {
            return Ok(out);
        }

        let path = self.data_path(name);
        let file = File::open(&path).map_err(|e| VoxtileError::io(&path, "open", e))?;
        let mut reader = BufReader::new(file);

        let mut bytes = vec![0u8; shape[2] * T::DTYPE.size()];
        for x in 0..shape[0] {
            for y in 0..shape[1] {
                let offset =
                    self.voxel_offset(start[0] + x, start[1] + y, start[2], T::DTYPE.size());
                reader
                    .seek(SeekFrom::Start(offset))
                    .map_err(|e| VoxtileError::io(&path, "seek", e))?;
                reader
                    .read_exact(&mut bytes)
                    .map_err(|e| VoxtileError::io(&path, "read", e))?;
                let run = T::decode(&bytes);
                out.slice_mut(ndarray::s![x, y, ..])
                    .iter_mut()
                    .zip(run)
                    .for_each(|(dst, src)| *dst = src);
            }
        }
        Ok(out)
    }

    /// Read one full dataset. Intended for verification and small volumes.
    pub fn read_dataset<T: Element>(&self, name: &str) -> Result<Array3<T>> {
        self.read_region(name, [0, 0, 0], self.shape)
    }
}
