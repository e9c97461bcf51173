//! Integer-factor 3-D binning.
//!
//! Output shape is `(W / N, H / N, ceil(D / N))`. Output slice `d` averages
//! source slices `d * N .. min((d + 1) * N, D)`, each resized to the output
//! width and height with a Lanczos3 filter first. Values are the rounded,
//! saturated mean of the resized luma.
//!
//! The result replaces the dataset in the output directory: `volume.bin`
//! and its sidecar, a blank `labels.bin` at the new chunk-aligned shape and
//! a `binned_<N>.txt` marker. A directory carrying a marker for the same
//! factor is loaded instead of recomputed; one carrying a different factor
//! is only rebinned with `force`.

use crate::config::{HeaderFormat, RetryPolicy, VaultConfig};
use crate::error::{Result, VolError};
use crate::format::{self, Backing, DatasetPaths, LoadOptions, VolumeHeader};
use crate::layout::ChunkLayout;
use crate::loader::{luma, to_u8};
use crate::store::{ChunkStore, LabelChunkStore, MapMode, MappedChunks, VoxelAccess};
use crate::types::{MaterialTable, VolumeInfo};
use crate::utils::{retry_transient, CancelFlag, ProgressFn};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array2;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where source slices come from
#[derive(Clone, Copy)]
pub enum BinSource<'a> {
    Store(&'a (dyn VoxelAccess + Sync)),
    /// Slice images, already in stack order
    Images(&'a [PathBuf]),
}

impl BinSource<'_> {
    fn dimensions(&self) -> Result<(usize, usize, usize)> {
        match self {
            BinSource::Store(store) => Ok(store.dimensions()),
            BinSource::Images(images) => {
                let first = images
                    .first()
                    .ok_or_else(|| VolError::Configuration("empty image stack".to_string()))?;
                let (w, h) = image::image_dimensions(first)?;
                Ok((w as usize, h as usize, images.len()))
            }
        }
    }

    /// Slice `z` resized to `width` x `height`, as row-major luma
    fn resized_luma(&self, z: usize, width: u32, height: u32) -> Result<Vec<f32>> {
        match self {
            BinSource::Store(store) => {
                let (w, h, _) = store.dimensions();
                let mut buf = vec![0u8; w * h];
                store.read_slice(z, &mut buf)?;
                let slice = GrayImage::from_raw(w as u32, h as u32, buf)
                    .ok_or_else(|| VolError::Configuration(format!("slice {} has the wrong length", z)))?;
                let resized = imageops::resize(&slice, width, height, FilterType::Lanczos3);
                Ok(resized.pixels().map(|p| p.0[0] as f32).collect())
            }
            BinSource::Images(images) => {
                let rgb = image::open(&images[z])?.to_rgb8();
                let resized = imageops::resize(&rgb, width, height, FilterType::Lanczos3);
                Ok(resized.pixels().map(luma).collect())
            }
        }
    }
}

/// Result of a binning pass
#[derive(Debug)]
pub struct BinnedVolume {
    pub volume: ChunkStore,
    pub labels: LabelChunkStore,
    pub info: VolumeInfo,
    pub materials: MaterialTable,
    /// True when a matching marker was found and nothing was recomputed
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct Binner {
    factor: usize,
    force: bool,
    chunk_dim: usize,
    threads: Option<usize>,
    header_format: HeaderFormat,
    options: LoadOptions,
    cancel: Option<CancelFlag>,
}

impl Binner {
    pub fn new(config: &VaultConfig, factor: usize) -> Result<Self> {
        if factor < 2 {
            return Err(VolError::Configuration(format!(
                "binning factor must be at least 2, got {}",
                factor
            )));
        }
        Ok(Self {
            factor,
            force: false,
            chunk_dim: config.store.chunk_dim,
            threads: config.binning.threads,
            header_format: config.store.header_format,
            options: LoadOptions::from_config(config),
            cancel: None,
        })
    }

    /// Rebin even when the directory was binned with another factor
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_chunk_dim(mut self, chunk_dim: usize) -> Self {
        self.chunk_dim = chunk_dim;
        self
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.options = self.options.with_backing(backing);
        self
    }

    /// Map mode for the returned volume and labels when they are mapped
    pub fn with_map_mode(mut self, mode: MapMode) -> Self {
        self.options = self.options.with_map_mode(mode);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Output shape for a source of the given extents
    pub fn output_layout(&self, width: usize, height: usize, depth: usize) -> Result<ChunkLayout> {
        let n = self.factor;
        if width < n || height < n {
            return Err(VolError::Configuration(format!(
                "{}x{} is too small to bin by {}",
                width, height, n
            )));
        }
        ChunkLayout::new(width / n, height / n, depth.div_ceil(n), self.chunk_dim)
    }

    /// Bin `source` into the dataset at `out_dir`.
    ///
    /// Label stores mapped from `out_dir` must be released first; the old
    /// `labels.bin` is unlinked and recreated blank.
    pub fn run(
        &self,
        source: BinSource<'_>,
        pixel_size: f64,
        out_dir: impl AsRef<Path>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BinnedVolume> {
        let paths = DatasetPaths::new(out_dir.as_ref());
        if self.check_markers(&paths)? {
            info!(dir = %paths.dir().display(), factor = self.factor, "already binned, loading");
            return self.reuse(&paths);
        }

        let (width, height, depth) = source.dimensions()?;
        let layout = self.output_layout(width, height, depth)?;
        let info = VolumeInfo::new(layout, pixel_size * self.factor as f64);
        info!(
            factor = self.factor,
            from = %format!("{}x{}x{}", width, height, depth),
            to = %layout.summary(),
            "binning"
        );

        fs::create_dir_all(paths.dir())?;
        let volume = match self.threads {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| VolError::Configuration(format!("binning thread pool: {}", e)))?
                .install(|| self.write_volume(source, &info, &paths, progress))?,
            None => self.write_volume(source, &info, &paths, progress)?,
        };

        if paths.labels().exists() {
            retry_transient(&self.options.retry, "remove labels", || fs::remove_file(paths.labels()))?;
        }
        format::create_blank_labels(paths.labels(), &layout)?;
        let labels = format::load_labels(paths.labels(), &self.options)?;
        let materials = if paths.materials().exists() {
            format::load_materials(paths.materials())?
        } else {
            let table = MaterialTable::default();
            format::save_materials(paths.materials(), &table)?;
            table
        };

        self.write_marker(&paths, width, height, depth)?;
        Ok(BinnedVolume {
            volume,
            labels,
            info,
            materials,
            reused: false,
        })
    }

    /// True when this factor's marker exists and no rebinning is needed
    fn check_markers(&self, paths: &DatasetPaths) -> Result<bool> {
        let others = existing_markers(paths.dir())?;
        if self.force {
            for factor in others {
                let marker = paths.binned_marker(factor);
                if let Err(err) = fs::remove_file(&marker) {
                    warn!(path = %marker.display(), error = %err, "could not remove old marker");
                }
            }
            return Ok(false);
        }
        if others.contains(&self.factor) {
            return Ok(paths.volume().exists());
        }
        if let Some(factor) = others.first() {
            return Err(VolError::Configuration(format!(
                "{} was already binned by {}; force is required to bin by {}",
                paths.dir().display(),
                factor,
                self.factor
            )));
        }
        Ok(false)
    }

    fn reuse(&self, paths: &DatasetPaths) -> Result<BinnedVolume> {
        let (volume, info) = format::load_volume(paths.volume(), &self.options)?;
        let labels = format::load_labels(paths.labels(), &self.options)?;
        let materials = if paths.materials().exists() {
            format::load_materials(paths.materials())?
        } else {
            MaterialTable::default()
        };
        Ok(BinnedVolume {
            volume,
            labels,
            info,
            materials,
            reused: true,
        })
    }

    fn write_marker(&self, paths: &DatasetPaths, width: usize, height: usize, depth: usize) -> Result<()> {
        let body = format!(
            "factor={}\nsource={}x{}x{}\nbinned_at={}\n",
            self.factor,
            width,
            height,
            depth,
            chrono::Utc::now().to_rfc3339()
        );
        fs::write(paths.binned_marker(self.factor), body)?;
        Ok(())
    }

    fn write_volume(
        &self,
        source: BinSource<'_>,
        info: &VolumeInfo,
        paths: &DatasetPaths,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<ChunkStore> {
        let layout = info.layout;
        let mapped = match self.options.backing {
            Backing::Auto => layout.raw_data_size() > self.options.mmap_threshold,
            Backing::Memory => false,
            Backing::Mapped => true,
        };
        let staging = paths.dir().join(format!("{}.binning", crate::VOLUME_FILE));
        let mut store = if mapped {
            let header = VolumeHeader::from_info(info).to_bytes(self.header_format);
            let chunks = MappedChunks::create(&staging, &layout, &header, &self.options.retry)?;
            ChunkStore::with_storage(layout, Box::new(chunks))
        } else {
            ChunkStore::new(layout)
        };

        if let Err(err) = self.fill(&mut store, source, progress) {
            drop(store);
            if mapped {
                if let Err(cleanup) = fs::remove_file(&staging) {
                    warn!(path = %staging.display(), error = %cleanup, "failed to remove staging volume");
                }
            }
            return Err(err);
        }

        if !mapped {
            format::save_volume(&store, info.pixel_size, paths.volume(), self.header_format, &self.options.retry)?;
            return Ok(store);
        }
        store.flush()?;
        drop(store);
        promote(&staging, &paths.volume(), &self.options.retry)?;
        format::write_sidecar(&paths.volume_sidecar(), info)?;
        let (store, _) = format::load_volume(paths.volume(), &self.options)?;
        Ok(store)
    }

    /// Compute output slices one chunk layer at a time. Within a layer,
    /// slices are computed in parallel batches of one per rayon thread and
    /// each batch is written before the next starts.
    fn fill(&self, store: &mut ChunkStore, source: BinSource<'_>, progress: Option<ProgressFn<'_>>) -> Result<()> {
        let layout = *store.layout();
        let (_, _, src_depth) = source.dimensions()?;
        let (ow, oh) = (layout.width as u32, layout.height as u32);
        let n = self.factor;
        let cd = layout.chunk_dim;
        let layers = layout.chunk_counts()[2];
        let batch = rayon::current_num_threads().max(1);

        for layer in 0..layers {
            let slices: Vec<usize> = (layer * cd..((layer + 1) * cd).min(layout.depth)).collect();
            for group in slices.chunks(batch) {
                let results: Vec<Vec<u8>> = group
                    .par_iter()
                    .map(|&d| -> Result<Vec<u8>> {
                        if let Some(cancel) = &self.cancel {
                            cancel.check()?;
                        }
                        let first = d * n;
                        let last = ((d + 1) * n).min(src_depth);
                        let mut acc = Array2::<f32>::zeros((oh as usize, ow as usize));
                        for z in first..last {
                            let resized = source.resized_luma(z, ow, oh)?;
                            acc.iter_mut().zip(resized).for_each(|(a, v)| *a += v);
                        }
                        let count = (last - first) as f32;
                        Ok(acc.iter().map(|&sum| to_u8(sum / count)).collect())
                    })
                    .collect::<Result<_>>()?;

                for (&d, slice) in group.iter().zip(&results) {
                    store.write_slice(d, slice)?;
                }
            }
            debug!(layer, layers, "binned chunk layer");
            if let Some(report) = progress {
                report((layer + 1) as f32 / layers as f32);
            }
        }
        Ok(())
    }
}

/// Factors of the `binned_<N>.txt` markers in `dir`, ascending
pub fn existing_markers(dir: &Path) -> Result<Vec<usize>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut factors: Vec<usize> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            name.strip_prefix("binned_")?.strip_suffix(".txt")?.parse().ok()
        })
        .collect();
    factors.sort_unstable();
    Ok(factors)
}

fn promote(staging: &Path, target: &Path, retry: &RetryPolicy) -> Result<()> {
    retry_transient(retry, "rename", || fs::rename(staging, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::write_stack;
    use tempfile::TempDir;

    fn config() -> VaultConfig {
        let mut config = VaultConfig::default();
        config.store.chunk_dim = 16;
        config
    }

    /// 30x30x10 volume whose slice z is uniformly 10 * z
    fn layered_store() -> ChunkStore {
        let layout = ChunkLayout::new(30, 30, 10, 16).unwrap();
        let mut store = ChunkStore::new(layout);
        for z in 0..10 {
            store.write_slice(z, &vec![(10 * z) as u8; 900]).unwrap();
        }
        store
    }

    fn close(actual: u8, expected: u8) -> bool {
        (actual as i16 - expected as i16).abs() <= 1
    }

    #[test]
    fn test_factor_must_be_at_least_two() {
        assert!(Binner::new(&config(), 1).is_err());
        assert!(Binner::new(&config(), 2).is_ok());
    }

    #[test]
    fn test_depth_ten_by_three() {
        let dir = TempDir::new().unwrap();
        let source = layered_store();
        let binner = Binner::new(&config(), 3).unwrap();
        let out = binner
            .run(BinSource::Store(&source), 2e-6, dir.path(), None)
            .unwrap();

        assert!(!out.reused);
        assert_eq!(
            (out.info.layout.width, out.info.layout.height, out.info.layout.depth),
            (10, 10, 4)
        );
        assert!((out.info.pixel_size - 6e-6).abs() < 1e-12);
        // Slices 0..3 average to 10, the last output slice comes from slice 9 alone
        assert!(close(out.volume.get(5, 5, 0).unwrap(), 10));
        assert!(close(out.volume.get(5, 5, 1).unwrap(), 40));
        assert!(close(out.volume.get(5, 5, 3).unwrap(), 90));

        let labels = out.labels.layout();
        assert_eq!((labels.width, labels.height, labels.depth), (16, 16, 16));
        assert_eq!(out.labels.get(9, 9, 3).unwrap(), 0);
        assert!(dir.path().join("binned_3.txt").exists());
    }

    #[test]
    fn test_marker_reuse_and_force() {
        let dir = TempDir::new().unwrap();
        let source = layered_store();
        let progress_calls = std::sync::atomic::AtomicUsize::new(0);
        let progress = |_: f32| {
            progress_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        };

        Binner::new(&config(), 2)
            .unwrap()
            .run(BinSource::Store(&source), 1e-6, dir.path(), Some(&progress as ProgressFn<'_>))
            .unwrap();
        assert_eq!(progress_calls.load(std::sync::atomic::Ordering::Relaxed), 1);

        let again = Binner::new(&config(), 2)
            .unwrap()
            .run(BinSource::Store(&source), 1e-6, dir.path(), None)
            .unwrap();
        assert!(again.reused);
        assert_eq!(again.info.layout.depth, 5);

        assert!(matches!(
            Binner::new(&config(), 3)
                .unwrap()
                .run(BinSource::Store(&source), 1e-6, dir.path(), None),
            Err(VolError::Configuration(_))
        ));

        let forced = Binner::new(&config(), 3)
            .unwrap()
            .force(true)
            .run(BinSource::Store(&source), 1e-6, dir.path(), None)
            .unwrap();
        assert_eq!(forced.info.layout.depth, 4);
        assert_eq!(existing_markers(dir.path()).unwrap(), vec![3]);
    }

    #[test]
    fn test_bin_image_stack_mapped_with_pool() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_stack(src.path(), 32, 32, 4);
        let images = crate::loader::list_image_stack(src.path()).unwrap();

        let mut cfg = config();
        cfg.binning.threads = Some(2);
        let binned = Binner::new(&cfg, 2)
            .unwrap()
            .with_backing(Backing::Mapped)
            .run(BinSource::Images(&images), 1e-6, out.path(), None)
            .unwrap();
        assert!(binned.volume.is_mapped());
        assert_eq!(
            (binned.info.layout.width, binned.info.layout.height, binned.info.layout.depth),
            (16, 16, 2)
        );
        assert!(!out.path().join("volume.bin.binning").exists());
        // Bright corner stays brighter than the dark corner
        assert!(binned.volume.get(15, 15, 1).unwrap() > binned.volume.get(0, 0, 1).unwrap());
    }

    #[test]
    fn test_single_thread_batches_cover_whole_layer() {
        // 34 slices by 2 gives 17 output slices: one full 16-slice layer
        // plus a second layer, each written one slice per batch
        let layout = ChunkLayout::new(20, 20, 34, 16).unwrap();
        let mut source = ChunkStore::new(layout);
        for z in 0..34 {
            source.write_slice(z, &vec![(5 * z) as u8; 400]).unwrap();
        }
        let dir = TempDir::new().unwrap();
        let mut cfg = config();
        cfg.binning.threads = Some(1);
        let out = Binner::new(&cfg, 2)
            .unwrap()
            .run(BinSource::Store(&source), 1e-6, dir.path(), None)
            .unwrap();

        assert_eq!(out.info.layout.depth, 17);
        for d in 0..17 {
            let expected = (5 * 2 * d) as f32 + 2.5;
            let actual = out.volume.get(4, 7, d).unwrap();
            assert!((actual as f32 - expected).abs() <= 1.0, "slice {}: {}", d, actual);
        }
    }

    #[test]
    fn test_reuse_reports_corrupt_materials() {
        let dir = TempDir::new().unwrap();
        let source = layered_store();
        Binner::new(&config(), 2)
            .unwrap()
            .run(BinSource::Store(&source), 1e-6, dir.path(), None)
            .unwrap();
        fs::write(dir.path().join(crate::LABELS_SIDECAR), [0xFFu8; 3]).unwrap();

        assert!(Binner::new(&config(), 2)
            .unwrap()
            .run(BinSource::Store(&source), 1e-6, dir.path(), None)
            .is_err());

        fs::remove_file(dir.path().join(crate::LABELS_SIDECAR)).unwrap();
        let reused = Binner::new(&config(), 2)
            .unwrap()
            .run(BinSource::Store(&source), 1e-6, dir.path(), None)
            .unwrap();
        assert!(reused.reused);
        assert_eq!(reused.materials, MaterialTable::default());
    }

    #[test]
    fn test_cancel_leaves_no_dataset() {
        let dir = TempDir::new().unwrap();
        let source = layered_store();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = Binner::new(&config(), 2)
            .unwrap()
            .with_backing(Backing::Mapped)
            .with_cancel(cancel)
            .run(BinSource::Store(&source), 1e-6, dir.path(), None);
        assert!(matches!(result, Err(VolError::Cancelled)));
        assert!(!dir.path().join("volume.bin").exists());
        assert!(!dir.path().join("volume.bin.binning").exists());
        assert!(existing_markers(dir.path()).unwrap().is_empty());
    }
}
