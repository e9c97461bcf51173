//! End-to-end volume loading.
//!
//! A directory is treated as a dataset: `volume.bin` is loaded when present,
//! otherwise it is built from the image stack in the directory. Missing
//! `labels.bin` / `labels.chk` are synthesized blank. A single file is loaded
//! by name: `volume*` and `labels*` pick up their siblings, anything else is
//! read as a combined export.

use crate::config::VaultConfig;
use crate::error::{RecoveryPath, Result, VolError};
use crate::format::{self, Backing, DatasetPaths, LoadOptions, VolumeHeader};
use crate::layout::ChunkLayout;
use crate::store::{ChunkStore, LabelChunkStore, MapMode, MappedChunks};
use crate::types::{MaterialTable, VolumeInfo};
use crate::utils::{format_bytes, sequence_number, CancelFlag, ProgressFn};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Image extensions accepted in a slice stack
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "bmp", "jpg", "jpeg"];

/// Pixel size assumed for image stacks, which carry none (1 µm)
pub const DEFAULT_PIXEL_SIZE: f64 = 1e-6;

/// Everything a consumer needs from a dataset
#[derive(Debug)]
pub struct LoadedVolume {
    pub volume: ChunkStore,
    pub labels: LabelChunkStore,
    pub info: VolumeInfo,
    pub materials: MaterialTable,
}

/// Progress callback shared with a blocking task
pub type SharedProgress = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct VolumeLoader {
    config: VaultConfig,
    options: LoadOptions,
    pixel_size: f64,
}

impl VolumeLoader {
    pub fn new(config: VaultConfig) -> Self {
        let options = LoadOptions::from_config(&config);
        Self {
            config,
            options,
            pixel_size: DEFAULT_PIXEL_SIZE,
        }
    }

    /// Pixel size recorded when building from images
    pub fn with_pixel_size(mut self, pixel_size: f64) -> Self {
        self.pixel_size = pixel_size;
        self
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.options = self.options.with_backing(backing);
        self
    }

    /// Mapped datasets open read-only by default; ask for write to edit labels in place
    pub fn with_map_mode(mut self, mode: MapMode) -> Self {
        self.options = self.options.with_map_mode(mode);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.options = self.options.with_cancel(cancel);
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Load a dataset directory or a single file.
    ///
    /// A busy or sharing failure (typically a file whose writer has only just
    /// closed it) is retried once after the configured delay.
    pub fn load(&self, path: impl AsRef<Path>, progress: Option<ProgressFn<'_>>) -> Result<LoadedVolume> {
        let path = path.as_ref();
        retry_once(path, self.config.retry.loader_retry_delay(), || self.load_once(path, progress))
    }

    /// [`load`](Self::load) on the blocking pool
    pub async fn load_async(
        &self,
        path: impl Into<PathBuf>,
        progress: Option<SharedProgress>,
    ) -> Result<LoadedVolume> {
        let loader = self.clone();
        let path = path.into();
        tokio::task::spawn_blocking(move || loader.load(&path, progress.as_deref()))
            .await
            .map_err(|e| VolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    fn load_once(&self, path: &Path, progress: Option<ProgressFn<'_>>) -> Result<LoadedVolume> {
        if path.is_dir() {
            return self.load_directory(path, progress);
        }
        if !path.exists() {
            return Err(VolError::NotFound(path.display().to_string()));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        if name.starts_with("volume") {
            let (volume, info) = format::load_volume(path, &self.options)?;
            self.attach_labels(dir, volume, info)
        } else if name.starts_with("labels") {
            let labels = format::load_labels(path, &self.options)?;
            let paths = DatasetPaths::new(dir);
            let (volume, info) = format::load_volume(paths.volume(), &self.options)?;
            check_label_grid(&labels, &info)?;
            let materials = self.load_or_create_materials(&paths)?;
            Ok(LoadedVolume {
                volume,
                labels,
                info,
                materials,
            })
        } else {
            let combined = format::load_combined(path, &self.options)?;
            let volume = combined
                .volume
                .unwrap_or_else(|| ChunkStore::new(combined.info.layout));
            Ok(LoadedVolume {
                volume,
                labels: combined.labels,
                info: combined.info,
                materials: combined.materials,
            })
        }
    }

    fn load_directory(&self, dir: &Path, progress: Option<ProgressFn<'_>>) -> Result<LoadedVolume> {
        let paths = DatasetPaths::new(dir);
        let (volume, info) = if paths.volume().exists() {
            format::load_volume(paths.volume(), &self.options)?
        } else {
            let images = list_image_stack(dir)?;
            if images.is_empty() {
                return Err(VolError::NotFound(format!(
                    "{} has neither {} nor slice images",
                    dir.display(),
                    crate::VOLUME_FILE
                )));
            }
            self.build_from_images(&images, &paths, progress)?
        };
        self.attach_labels(dir, volume, info)
    }

    fn attach_labels(&self, dir: &Path, volume: ChunkStore, info: VolumeInfo) -> Result<LoadedVolume> {
        let paths = DatasetPaths::new(dir);
        if !paths.labels().exists() {
            let aligned = format::create_blank_labels(paths.labels(), &info.layout)?;
            info!(path = %paths.labels().display(), layout = %aligned.summary(), "created blank labels");
        }
        // `volume` drops (releasing any mapping) if anything below fails
        let labels = format::load_labels(paths.labels(), &self.options)?;
        check_label_grid(&labels, &info)?;
        let materials = self.load_or_create_materials(&paths)?;
        Ok(LoadedVolume {
            volume,
            labels,
            info,
            materials,
        })
    }

    fn load_or_create_materials(&self, paths: &DatasetPaths) -> Result<MaterialTable> {
        if paths.materials().exists() {
            return format::load_materials(paths.materials());
        }
        let table = MaterialTable::default();
        format::save_materials(paths.materials(), &table)?;
        Ok(table)
    }

    /// Build and persist `volume.bin` from sorted slice images
    fn build_from_images(
        &self,
        images: &[PathBuf],
        paths: &DatasetPaths,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<(ChunkStore, VolumeInfo)> {
        let (width, height) = image::image_dimensions(&images[0])?;
        let layout = ChunkLayout::new(
            width as usize,
            height as usize,
            images.len(),
            self.config.store.chunk_dim,
        )?;
        let info = VolumeInfo::new(layout, self.pixel_size);
        let format = self.config.store.header_format;
        let mapped = match self.options.backing {
            Backing::Auto => layout.raw_data_size() > self.options.mmap_threshold,
            Backing::Memory => false,
            Backing::Mapped => true,
        };
        info!(
            dir = %paths.dir().display(),
            slices = images.len(),
            layout = %layout.summary(),
            raw = %format_bytes(layout.raw_data_size()),
            mapped,
            "building volume from images"
        );

        let mut store = if mapped {
            let header = VolumeHeader::from_info(&info).to_bytes(format);
            let chunks = MappedChunks::create(paths.volume(), &layout, &header, &self.options.retry)?;
            ChunkStore::with_storage(layout, Box::new(chunks))
        } else {
            ChunkStore::new(layout)
        };

        let result = self.fill_from_images(&mut store, images, progress).and_then(|()| {
            if mapped {
                store.flush()?;
                format::write_sidecar(&paths.volume_sidecar(), &info)
            } else {
                format::save_volume(&store, info.pixel_size, paths.volume(), format, &self.options.retry)
            }
        });
        if let Err(err) = result {
            drop(store);
            if mapped {
                if let Err(remove) = std::fs::remove_file(paths.volume()) {
                    warn!(error = %remove, "could not remove partial volume file");
                }
            }
            return Err(err);
        }
        Ok((store, info))
    }

    fn fill_from_images(
        &self,
        store: &mut ChunkStore,
        images: &[PathBuf],
        progress: Option<ProgressFn<'_>>,
    ) -> Result<()> {
        let layout = *store.layout();
        for (z, path) in images.iter().enumerate() {
            if let Some(cancel) = &self.options.cancel {
                cancel.check()?;
            }
            let rgb = image::open(path)?.to_rgb8();
            if (rgb.width() as usize, rgb.height() as usize) != (layout.width, layout.height) {
                return Err(VolError::Configuration(format!(
                    "{} is {}x{}, stack is {}x{}",
                    path.display(),
                    rgb.width(),
                    rgb.height(),
                    layout.width,
                    layout.height
                )));
            }
            store.write_slice(z, &luma_slice(&rgb))?;
            if let Some(report) = progress {
                report((z + 1) as f32 / images.len() as f32);
            }
        }
        debug!(slices = images.len(), "image stack written");
        Ok(())
    }
}

impl Default for VolumeLoader {
    fn default() -> Self {
        Self::new(VaultConfig::default())
    }
}

fn check_label_grid(labels: &LabelChunkStore, info: &VolumeInfo) -> Result<()> {
    let expected = info.layout.aligned();
    if *labels.layout() != expected {
        return Err(VolError::Configuration(format!(
            "label grid {} does not cover volume {}",
            labels.layout().summary(),
            info.layout.summary()
        )));
    }
    Ok(())
}

/// Slice images in `dir`, ordered by the number in each file name.
///
/// Names without digits sort after numbered ones, lexically.
pub fn list_image_stack(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    images.sort_by_cached_key(|path| {
        let seq = sequence_number(path);
        (seq.is_none(), seq, path.file_name().map(|n| n.to_os_string()))
    });
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// ITU-R BT.601 luma
pub fn luma(pixel: &Rgb<u8>) -> f32 {
    let [r, g, b] = pixel.0;
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Run `attempt`, and run it once more after `delay` if it fails
/// transiently. A second transient failure is tagged
/// [`RecoveryPath::LoaderRetry`].
pub(crate) fn retry_once<T>(path: &Path, delay: Duration, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    match attempt() {
        Err(err) if err.is_transient() => {
            warn!(
                path = %path.display(),
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "load hit a transient failure, retrying once"
            );
            thread::sleep(delay);
            attempt().map_err(|err| match err {
                VolError::TransientIo { source, attempts, .. } => VolError::TransientIo {
                    source,
                    attempts,
                    recovery: RecoveryPath::LoaderRetry,
                },
                VolError::Io(source) if crate::error::is_transient_io(&source) => VolError::TransientIo {
                    source,
                    attempts: 2,
                    recovery: RecoveryPath::LoaderRetry,
                },
                other => other,
            })
        }
        other => other,
    }
}

pub(crate) fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Row-major luma bytes of an RGB image
pub fn luma_slice(rgb: &RgbImage) -> Vec<u8> {
    rgb.pixels().map(|p| to_u8(luma(p))).collect()
}
