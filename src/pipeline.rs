//! Phase orchestration.
//!
//! Four phases, each a full barrier apart (joining the worker pool is the
//! barrier): decompose the raw volume into padded tiles, classify tiles
//! into per-class masks, combine classified tiles into a stitched volume,
//! and consolidate the cell class into labeled instances. Phases share no
//! state except the files on disk; every phase re-derives the same static
//! tile assignment, so tile index is the only coordination key.
//!
//! Setup that must happen exactly once per phase (creating an output store,
//! clearing stale tile files) runs on the orchestrating thread before the
//! pool starts.

use ndarray::{Array3, Axis, Zip};

use crate::classifier::{check_output_contract, PixelClassifier};
use crate::config::SegmentationConfig;
use crate::dispatch::{WorkerCtx, WorkerPool};
use crate::element::{Dtype, Element};
use crate::error::{Result, VoxtileError};
use crate::mask::{check_one_hot, reduce_to_mask};
use crate::memory::{check_budget, resolve_worker_budget};
use crate::postproc;
use crate::stitch::VolumeStitcher;
use crate::store::{TileFile, TileStore, TileWriter, MAX_TILES};
use crate::tiling::TileGrid;
use crate::volume::{DatasetInfo, SharedVolume};

/// Drives the segmentation phases over a fixed worker pool.
pub struct Orchestrator<'a> {
    cfg: &'a SegmentationConfig,
    pool: WorkerPool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(cfg: &'a SegmentationConfig) -> Result<Self> {
        let pool = WorkerPool::new(cfg.workers)?;
        Ok(Self { cfg, pool })
    }

    fn grid_for(&self, volume: &SharedVolume) -> Result<TileGrid> {
        let grid = TileGrid::compute(volume.shape(), self.cfg.tile_dims, self.cfg.overlap)?;
        if grid.len() > MAX_TILES {
            return Err(VoxtileError::config(format!(
                "grid of {} tiles exceeds the store limit of {}",
                grid.len(),
                MAX_TILES
            )));
        }
        Ok(grid)
    }

    /// Chunking hint recorded on output volumes: one x-slice, tile-sized
    /// in y and z.
    fn chunk(&self) -> [usize; 3] {
        [1, self.cfg.tile_dims[1], self.cfg.tile_dims[2]]
    }

    /// Phase 1: cut the raw volume into padded tiles.
    pub fn decompose(&self) -> Result<()> {
        match self.cfg.element {
            Dtype::U8 => self.decompose_typed::<u8>(),
            Dtype::U16 => self.decompose_typed::<u16>(),
            Dtype::U32 => self.decompose_typed::<u32>(),
            Dtype::F32 => self.decompose_typed::<f32>(),
        }
    }

    fn decompose_typed<T: Element>(&self) -> Result<()> {
        let volume = SharedVolume::open(self.cfg.volume_dir())?;
        match volume.dataset_dtype(&self.cfg.dataset) {
            None => {
                return Err(VoxtileError::config(format!(
                    "raw volume has no dataset '{}'",
                    self.cfg.dataset
                )))
            }
            Some(dtype) if dtype != T::DTYPE => {
                return Err(VoxtileError::config(format!(
                    "raw dataset '{}' is {} but the configured element is {}",
                    self.cfg.dataset,
                    dtype.name(),
                    T::DTYPE.name()
                )))
            }
            Some(_) => {}
        }
        let grid = self.grid_for(&volume)?;
        let store = TileStore::create(self.cfg.tiles_dir())?;
        store.clear()?;
        log::info!(
            "decomposing {:?} volume into {} tiles ({:?} per axis, overlap {})",
            volume.shape(),
            grid.len(),
            grid.tiles_per_axis(),
            grid.overlap()
        );

        self.pool.run(|ctx: WorkerCtx<'_>| {
            for idx in ctx.assigned(grid.len()) {
                let spec = &grid.tiles()[idx];
                let padded = volume.read_region::<T>(
                    &self.cfg.dataset,
                    spec.padded_start(),
                    spec.padded_end(),
                )?;
                let mut writer = TileWriter::create(store.tile_path(idx), spec)?;
                writer.add_dataset(&self.cfg.dataset, padded.view())?;
                writer.finish()?;
                log::debug!("worker {} wrote raw tile {}", ctx.worker_id, idx);
            }
            Ok(())
        })
    }

    /// Phase 2: classify every raw tile into per-class mask tiles, plus
    /// probability-map tiles for the configured save list.
    pub fn classify<C: PixelClassifier>(&self, classifier: &C) -> Result<()> {
        match self.cfg.element {
            Dtype::U8 => self.classify_typed::<u8, C>(classifier),
            Dtype::U16 => self.classify_typed::<u16, C>(classifier),
            Dtype::U32 => self.classify_typed::<u32, C>(classifier),
            Dtype::F32 => self.classify_typed::<f32, C>(classifier),
        }
    }

    fn classify_typed<T: Element, C: PixelClassifier>(&self, classifier: &C) -> Result<()> {
        let tiles = TileStore::new(self.cfg.tiles_dir());
        if tiles.list()?.is_empty() {
            log::warn!(
                "no raw tiles in {}, nothing to classify",
                tiles.dir().display()
            );
            return Ok(());
        }

        let volume = SharedVolume::open(self.cfg.volume_dir())?;
        let grid = self.grid_for(&volume)?;
        tiles.validate_grid(&grid)?;

        let labels = classifier.labels();
        let expected = self.cfg.class_labels();
        if labels != expected.as_slice() {
            return Err(VoxtileError::config(format!(
                "classifier labels {:?} do not match configured labels {:?}",
                labels.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
                self.cfg.labels
            )));
        }

        let budget = resolve_worker_budget(self.cfg.memory_budget, self.pool.workers());
        check_budget(&grid, labels.len(), budget)?;

        let classified = TileStore::create(self.cfg.classified_dir())?;
        classified.clear()?;
        let prob_indices = self.cfg.probability_map_indices();
        log::info!(
            "classifying {} tiles into {} classes with {} workers",
            grid.len(),
            labels.len(),
            self.pool.workers()
        );

        self.pool.run(|ctx: WorkerCtx<'_>| {
            for idx in ctx.assigned(grid.len()) {
                self.classify_tile::<T, C>(classifier, &tiles, &classified, idx, &prob_indices)?;
                log::debug!("worker {} classified tile {}", ctx.worker_id, idx);
            }
            Ok(())
        })
    }

    fn classify_tile<T: Element, C: PixelClassifier>(
        &self,
        classifier: &C,
        tiles: &TileStore,
        classified: &TileStore,
        idx: usize,
        prob_indices: &[usize],
    ) -> Result<()> {
        let mut tile = TileFile::open(tiles.tile_path(idx))?;
        let spec = tile.spec().clone();
        let raw = tile.read_dataset::<T>(&self.cfg.dataset)?;

        let intensities = raw.map(|&v| v.to_f32());
        let probabilities = classifier.classify(intensities.view())?;
        check_output_contract(raw.dim(), classifier.labels().len(), &probabilities)?;

        let mask = reduce_to_mask(probabilities.view())?;
        check_one_hot(&mask)?;

        let mut writer = TileWriter::create(classified.tile_path(idx), &spec)?;
        for label in classifier.labels() {
            let channel = mask.index_axis(Axis(3), label.index);
            if self.cfg.binary_output {
                writer.add_dataset(&label.name, channel)?;
            } else {
                // Mask-gated intensities keep the raw element type.
                let gated = Zip::from(&channel)
                    .and(&raw)
                    .map_collect(|&m, &v| if m != 0 { v } else { T::ZERO });
                writer.add_dataset(&label.name, gated.view())?;
            }
        }
        writer.finish()?;

        if !prob_indices.is_empty() {
            let mut writer = TileWriter::create(classified.prob_map_path(idx), &spec)?;
            for &channel_idx in prob_indices {
                let name = &classifier.labels()[channel_idx].name;
                writer.add_dataset(name, probabilities.index_axis(Axis(3), channel_idx))?;
            }
            writer.finish()?;
        }
        Ok(())
    }

    /// Phase 3: stitch classified tiles into one shared volume, one pass
    /// per class with a barrier between passes.
    pub fn combine(&self) -> Result<()> {
        let classified = TileStore::new(self.cfg.classified_dir());
        let listed = classified.list()?;
        if listed.is_empty() {
            log::warn!(
                "no classified tiles in {}, nothing to combine",
                classified.dir().display()
            );
            return Ok(());
        }
        TileStore::validate_contiguous(&listed)?;

        // Tiles are ordered x-major with z fastest, so the last tile's
        // owned region ends at the volume corner. The first tile's
        // directory names the class datasets.
        let last = TileFile::open(&listed[listed.len() - 1])?;
        let shape = last.spec().origin_end;

        let first = TileFile::open(&listed[0])?;
        let mut datasets = Vec::new();
        for name in first.dataset_names() {
            let dtype = first.dataset_dtype(name).ok_or_else(|| {
                VoxtileError::format(first.path(), format!("dataset '{}' has no dtype", name))
            })?;
            datasets.push(DatasetInfo {
                name: name.to_string(),
                dtype,
            });
        }

        let volume =
            SharedVolume::create(self.cfg.volume_maps_dir(), shape, self.chunk(), &datasets)?;
        let stitcher = VolumeStitcher::new(&volume);
        log::info!(
            "combining {} tiles into {:?} volume across {} classes",
            listed.len(),
            shape,
            datasets.len()
        );

        self.pool.run(|ctx: WorkerCtx<'_>| {
            for ds in &datasets {
                for idx in ctx.assigned(listed.len()) {
                    let mut tile = TileFile::open(&listed[idx])?;
                    match ds.dtype {
                        Dtype::U8 => stitch_dataset::<u8>(&stitcher, &mut tile, &ds.name)?,
                        Dtype::U16 => stitch_dataset::<u16>(&stitcher, &mut tile, &ds.name)?,
                        Dtype::U32 => stitch_dataset::<u32>(&stitcher, &mut tile, &ds.name)?,
                        Dtype::F32 => stitch_dataset::<f32>(&stitcher, &mut tile, &ds.name)?,
                    }
                }
                // All workers finish a class before the next one starts.
                ctx.checkpoint()?;
                log::debug!("worker {} finished class '{}'", ctx.worker_id, ds.name);
            }
            Ok(())
        })
    }

    /// Phase 4: post-process each tile's cell dataset into labeled
    /// instances and stitch them. Instance ids are unique within a tile's
    /// owned region.
    pub fn consolidate(&self) -> Result<()> {
        let classified = TileStore::new(self.cfg.classified_dir());
        let listed = classified.list()?;
        if listed.is_empty() {
            log::warn!(
                "no classified tiles in {}, nothing to consolidate",
                classified.dir().display()
            );
            return Ok(());
        }
        TileStore::validate_contiguous(&listed)?;

        let last = TileFile::open(&listed[listed.len() - 1])?;
        let shape = last.spec().origin_end;

        let cell = self.cfg.cell_label.clone();
        let volume = SharedVolume::create(
            self.cfg.post_seg_dir(),
            shape,
            self.chunk(),
            &[DatasetInfo {
                name: cell.clone(),
                dtype: Dtype::U32,
            }],
        )?;
        let stitcher = VolumeStitcher::new(&volume);
        let min_size = self.cfg.min_object_size;
        log::info!(
            "consolidating '{}' across {} tiles (min object size {})",
            cell,
            listed.len(),
            min_size
        );

        self.pool.run(|ctx: WorkerCtx<'_>| {
            for idx in ctx.assigned(listed.len()) {
                let mut tile = TileFile::open(&listed[idx])?;
                let dtype = tile.dataset_dtype(&cell).ok_or_else(|| {
                    VoxtileError::format(
                        tile.path(),
                        format!("classified tile has no '{}' dataset", cell),
                    )
                })?;
                let spec = tile.spec().clone();
                let labeled: Array3<u32> = match dtype {
                    Dtype::U8 => postproc::consolidate(
                        tile.read_dataset::<u8>(&cell)?.view(),
                        min_size,
                    )?,
                    Dtype::U16 => postproc::consolidate(
                        tile.read_dataset::<u16>(&cell)?.view(),
                        min_size,
                    )?,
                    Dtype::U32 => postproc::consolidate(
                        tile.read_dataset::<u32>(&cell)?.view(),
                        min_size,
                    )?,
                    Dtype::F32 => postproc::consolidate(
                        tile.read_dataset::<f32>(&cell)?.view(),
                        min_size,
                    )?,
                };
                stitcher.write_tile(&cell, &spec, labeled.view())?;
                log::debug!("worker {} consolidated tile {}", ctx.worker_id, idx);
            }
            Ok(())
        })
    }

    /// Check the raw tile store against the current configuration.
    pub fn validate(&self) -> Result<()> {
        let volume = SharedVolume::open(self.cfg.volume_dir())?;
        let grid = self.grid_for(&volume)?;
        let tiles = TileStore::new(self.cfg.tiles_dir());
        tiles.validate_grid(&grid)?;
        log::info!(
            "tile store {} matches the configured grid ({} tiles)",
            tiles.dir().display(),
            grid.len()
        );
        Ok(())
    }

    /// Volume and grid summary for the `info` subcommand.
    pub fn describe(&self) -> Result<String> {
        use std::fmt::Write;

        let volume = SharedVolume::open(self.cfg.volume_dir())?;
        let grid = self.grid_for(&volume)?;
        let mut out = String::new();
        let _ = writeln!(out, "volume:   {}", self.cfg.volume_dir().display());
        let _ = writeln!(out, "shape:    {:?}", volume.shape());
        for ds in volume.datasets() {
            let _ = writeln!(out, "dataset:  {} ({})", ds.name, ds.dtype.name());
        }
        let _ = writeln!(
            out,
            "tiles:    {} ({:?} per axis, dims {:?}, overlap {})",
            grid.len(),
            grid.tiles_per_axis(),
            grid.tile_dims(),
            grid.overlap()
        );
        let _ = writeln!(out, "workers:  {}", self.cfg.workers);
        let _ = writeln!(
            out,
            "classes:  {} (cell '{}')",
            self.cfg.labels.join(", "),
            self.cfg.cell_label
        );
        Ok(out)
    }
}

fn stitch_dataset<T: Element>(
    stitcher: &VolumeStitcher<'_>,
    tile: &mut TileFile,
    name: &str,
) -> Result<()> {
    let spec = tile.spec().clone();
    let data = tile.read_dataset::<T>(name)?;
    stitcher.write_tile(name, &spec, data.view())
}
