//! On-disk dataset format.
//!
//! A dataset directory holds:
//!
//! | file                  | contents                                                  |
//! |-----------------------|-----------------------------------------------------------|
//! | `volume.bin`          | optional 36/40-byte header, then grayscale chunk payloads |
//! | `volume.chk`          | 36-byte sidecar with the authoritative grayscale shape    |
//! | `labels.bin`          | 16-byte chunk grid header, then label chunk payloads      |
//! | `labels.chk`          | material table                                            |
//! | `binned_<factor>.txt` | marker left by a finished binning pass                    |
//!
//! All integers are little-endian. Payloads are stored in chunk index order.

mod combined;
mod header;
mod materials;

pub use combined::{load_combined, save_combined, CombinedVolume};
pub use header::{
    read_grid_header, read_label_layout, write_grid_header, VolumeHeader, BITS_PER_VOXEL,
    EXTENDED_HEADER_SIZE, LABEL_HEADER_SIZE, LEGACY_HEADER_SIZE, SIDECAR_SIZE,
};
pub use materials::{read_materials, write_materials};

use crate::config::{HeaderFormat, RetryPolicy, VaultConfig};
use crate::error::{RecoveryPath, Result, VolError};
use crate::layout::ChunkLayout;
use crate::store::{ChunkStore, LabelChunkStore, MapMode, MemoryChunks};
use crate::types::{MaterialTable, VolumeInfo};
use crate::utils::{open_shared_read, retry_transient, CancelFlag};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File locations inside a dataset directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    dir: PathBuf,
}

impl DatasetPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn volume(&self) -> PathBuf {
        self.dir.join(crate::VOLUME_FILE)
    }

    pub fn volume_sidecar(&self) -> PathBuf {
        self.dir.join(crate::VOLUME_SIDECAR)
    }

    pub fn labels(&self) -> PathBuf {
        self.dir.join(crate::LABELS_FILE)
    }

    pub fn materials(&self) -> PathBuf {
        self.dir.join(crate::LABELS_SIDECAR)
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(crate::METADATA_FILE)
    }

    pub fn binned_marker(&self, factor: usize) -> PathBuf {
        self.dir.join(crate::utils::binned_marker_name(factor))
    }
}

/// Sidecar path for a data file: same stem, `.chk` extension
pub fn sidecar_path(data_file: &Path) -> PathBuf {
    data_file.with_extension("chk")
}

/// Where loaded chunks live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Map when the raw size exceeds the configured threshold
    Auto,
    Memory,
    Mapped,
}

/// Options shared by every load path
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub backing: Backing,
    pub map_mode: MapMode,
    pub mmap_threshold: u64,
    pub retry: RetryPolicy,
    pub cancel: Option<CancelFlag>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::from_config(&VaultConfig::default())
    }
}

impl LoadOptions {
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            backing: Backing::Auto,
            map_mode: MapMode::ReadOnly,
            mmap_threshold: config.store.mmap_threshold,
            retry: config.retry.clone(),
            cancel: None,
        }
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    /// Mapped loads are read-only unless `MapMode::ReadWrite` is asked for
    pub fn with_map_mode(mut self, mode: MapMode) -> Self {
        self.map_mode = mode;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn use_mapping(&self, layout: &ChunkLayout) -> bool {
        match self.backing {
            Backing::Auto => layout.raw_data_size() > self.mmap_threshold,
            Backing::Memory => false,
            Backing::Mapped => true,
        }
    }
}

// ============================================================================
// Grayscale volume
// ============================================================================

/// Write `volume.bin` (header + payloads) and its `volume.chk` sidecar.
///
/// Chunks reaching past the declared shape are written with the out-of-shape
/// voxels zeroed. The data file is written next to the target and renamed
/// into place so a reader never sees a half-written file.
pub fn save_volume(
    store: &ChunkStore,
    pixel_size: f64,
    path: impl AsRef<Path>,
    format: HeaderFormat,
    retry: &RetryPolicy,
) -> Result<()> {
    let path = path.as_ref();
    let layout = *store.layout();
    let info = VolumeInfo::new(layout, pixel_size);
    let header = VolumeHeader::from_info(&info);
    header.validate()?;

    let tmp = path.with_extension("bin.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        header.write(&mut writer, format)?;
        write_padded_chunks(&mut writer, store)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    retry_transient(retry, "rename", || fs::rename(&tmp, path))?;
    write_sidecar(&sidecar_path(path), &info)?;

    info!(
        path = %path.display(),
        ?format,
        layout = %layout.summary(),
        "saved volume"
    );
    Ok(())
}

fn write_padded_chunks<W: Write>(writer: &mut W, store: &ChunkStore) -> Result<()> {
    let layout = store.layout();
    let mut scratch = vec![0u8; layout.chunk_volume()];
    for index in 0..layout.total_chunks() {
        let chunk = store.chunk(index)?;
        if pad_chunk(layout, index, chunk, &mut scratch) {
            writer.write_all(&scratch)?;
        } else {
            writer.write_all(chunk)?;
        }
    }
    Ok(())
}

/// Copy `chunk` into `scratch` with voxels outside the declared shape zeroed.
///
/// Returns false, leaving `scratch` untouched, for chunks fully inside the shape.
fn pad_chunk(layout: &ChunkLayout, index: usize, chunk: &[u8], scratch: &mut [u8]) -> bool {
    let cd = layout.chunk_dim;
    let [(x0, x1), (y0, y1), (z0, z1)] = layout.chunk_data_range(layout.chunk_coord(index));
    let (nx, ny, nz) = (x1 - x0, y1 - y0, z1 - z0);
    if nx == cd && ny == cd && nz == cd {
        return false;
    }
    scratch.copy_from_slice(chunk);
    for lz in 0..cd {
        for ly in 0..cd {
            let row = lz * cd * cd + ly * cd;
            if lz >= nz || ly >= ny {
                scratch[row..row + cd].fill(0);
            } else {
                scratch[row + nx..row + cd].fill(0);
            }
        }
    }
    true
}

/// Write the 36-byte `volume.chk` sidecar
pub fn write_sidecar(path: &Path, info: &VolumeInfo) -> Result<()> {
    let bytes = VolumeHeader::from_info(info).to_bytes(HeaderFormat::Legacy);
    fs::write(path, bytes)?;
    Ok(())
}

/// Read and validate a `volume.chk` sidecar
pub fn read_sidecar(path: &Path) -> Result<VolumeInfo> {
    let mut file = open_shared_read(path)?;
    let mut bytes = [0u8; SIDECAR_SIZE];
    file.read_exact(&mut bytes)?;
    VolumeHeader::parse(&bytes, HeaderFormat::Legacy)
        .ok_or_else(|| VolError::corrupt("sidecar too short"))?
        .validate()
}

/// Load a grayscale volume whose shape comes from its own header.
///
/// The embedded header is accepted when it validates and the file length is
/// exactly header + payload. Otherwise the shape is taken from the sidecar
/// next to the file and the header length is re-derived from the file size.
pub fn load_volume(path: impl AsRef<Path>, options: &LoadOptions) -> Result<(ChunkStore, VolumeInfo)> {
    let path = path.as_ref();
    let (info, header_size) = resolve_volume_header(path)?;
    let store = open_chunks(path, &info.layout, header_size, options)?;
    Ok((store, info))
}

/// Load a grayscale volume whose shape is known out of band.
pub fn load_volume_raw(
    path: impl AsRef<Path>,
    layout: &ChunkLayout,
    options: &LoadOptions,
) -> Result<ChunkStore> {
    let path = path.as_ref();
    let file_len = fs::metadata(path)?.len();
    let leading = read_leading(path, EXTENDED_HEADER_SIZE)?;
    let header_size = detect_header_size(file_len, layout, &leading)?;
    open_chunks(path, layout, header_size, options)
}

/// Find the header length for a file holding `layout`'s payloads.
///
/// Exact lengths raw, raw + 36 and raw + 40 are checked first; failing that
/// the leading bytes are inspected for a header describing the same grid.
pub fn detect_header_size(file_len: u64, layout: &ChunkLayout, leading: &[u8]) -> Result<usize> {
    let raw = layout.raw_data_size();
    for size in [0, LEGACY_HEADER_SIZE, EXTENDED_HEADER_SIZE] {
        if file_len == raw + size as u64 {
            return Ok(size);
        }
    }
    for format in [HeaderFormat::Extended, HeaderFormat::Legacy] {
        let size = format.size();
        if file_len < raw + size as u64 {
            continue;
        }
        if let Some(header) = VolumeHeader::parse(leading, format) {
            if header.matches(layout) && header.validate().is_ok() {
                debug!(size, file_len, "header found by probing");
                return Ok(size);
            }
        }
    }
    Err(VolError::SizeMismatch {
        actual: file_len,
        expected: vec![
            raw,
            raw + LEGACY_HEADER_SIZE as u64,
            raw + EXTENDED_HEADER_SIZE as u64,
        ],
    })
}

fn resolve_volume_header(path: &Path) -> Result<(VolumeInfo, usize)> {
    let file_len = fs::metadata(path)?.len();
    let leading = read_leading(path, EXTENDED_HEADER_SIZE)?;

    let mut reasons = Vec::new();
    for format in [HeaderFormat::Extended, HeaderFormat::Legacy] {
        let size = format.size();
        let Some(header) = VolumeHeader::parse(&leading, format) else {
            reasons.push(format!("{:?}: file too short", format));
            continue;
        };
        match header.validate() {
            Ok(info) if info.layout.raw_data_size() + size as u64 == file_len => {
                return Ok((info, size))
            }
            Ok(info) => reasons.push(format!(
                "{:?}: length {} != {}",
                format,
                file_len,
                info.layout.raw_data_size() + size as u64
            )),
            Err(err) => reasons.push(format!("{:?}: {}", format, err)),
        }
    }

    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Err(VolError::CorruptHeader {
            reason: format!("{} ({})", path.display(), reasons.join("; ")),
            recovery: RecoveryPath::None,
        });
    }
    warn!(
        path = %path.display(),
        sidecar = %sidecar.display(),
        "embedded header rejected, falling back to sidecar"
    );
    let info = read_sidecar(&sidecar).map_err(|err| VolError::CorruptHeader {
        reason: format!(
            "{} ({}); sidecar: {}",
            path.display(),
            reasons.join("; "),
            err
        ),
        recovery: RecoveryPath::SidecarFallback,
    })?;
    let header_size = detect_header_size(file_len, &info.layout, &leading)?;
    Ok((info, header_size))
}

fn read_leading(path: &Path, max: usize) -> Result<Vec<u8>> {
    let file = open_shared_read(path)?;
    let mut leading = Vec::with_capacity(max);
    file.take(max as u64).read_to_end(&mut leading)?;
    Ok(leading)
}

fn open_chunks(
    path: &Path,
    layout: &ChunkLayout,
    header_size: usize,
    options: &LoadOptions,
) -> Result<ChunkStore> {
    if let Some(cancel) = &options.cancel {
        cancel.check()?;
    }
    if options.use_mapping(layout) {
        return ChunkStore::map_file(path, *layout, header_size, options.map_mode, &options.retry);
    }
    let mut file = open_shared_read(path)?;
    file.seek(SeekFrom::Start(header_size as u64))?;
    let mut reader = BufReader::new(file);
    let chunks = MemoryChunks::read_from(&mut reader, layout, options.cancel.as_ref())?;
    debug!(path = %path.display(), header_size, "read chunks into memory");
    Ok(ChunkStore::with_storage(*layout, Box::new(chunks)))
}

// ============================================================================
// Labels
// ============================================================================

/// Write `labels.bin`: grid header then every chunk as stored
pub fn save_labels(labels: &LabelChunkStore, path: impl AsRef<Path>, retry: &RetryPolicy) -> Result<()> {
    let path = path.as_ref();
    let layout = *labels.layout();
    let tmp = path.with_extension("bin.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        write_grid_header(&mut writer, &layout)?;
        for index in 0..layout.total_chunks() {
            writer.write_all(labels.chunk(index)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    retry_transient(retry, "rename", || fs::rename(&tmp, path))?;
    debug!(path = %path.display(), chunks = layout.total_chunks(), "saved labels");
    Ok(())
}

/// Create an all-zero `labels.bin` covering `layout` without writing payloads
pub fn create_blank_labels(path: impl AsRef<Path>, layout: &ChunkLayout) -> Result<ChunkLayout> {
    let path = path.as_ref();
    let aligned = layout.aligned();
    let mut file = File::create(path)?;
    write_grid_header(&mut file, &aligned)?;
    let total = LABEL_HEADER_SIZE as u64 + aligned.raw_data_size();
    file.set_len(total).map_err(|e| {
        VolError::Allocation(format!("cannot size {} to {} bytes: {}", path.display(), total, e))
    })?;
    Ok(aligned)
}

/// Load `labels.bin`; the shape is derived from the chunk grid header
pub fn load_labels(path: impl AsRef<Path>, options: &LoadOptions) -> Result<LabelChunkStore> {
    let path = path.as_ref();
    let mut file = open_shared_read(path)?;
    let layout = read_label_layout(&mut file)?;
    drop(file);

    let expected = LABEL_HEADER_SIZE as u64 + layout.raw_data_size();
    let actual = fs::metadata(path)?.len();
    if actual != expected {
        return Err(VolError::SizeMismatch {
            actual,
            expected: vec![expected],
        });
    }
    let store = open_chunks(path, &layout, LABEL_HEADER_SIZE, options)?;
    Ok(LabelChunkStore::from(store))
}

/// Write `labels.chk`
pub fn save_materials(path: impl AsRef<Path>, table: &MaterialTable) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_materials(&mut writer, table)?;
    writer.flush()?;
    Ok(())
}

/// Read `labels.chk`
pub fn load_materials(path: impl AsRef<Path>) -> Result<MaterialTable> {
    let mut reader = BufReader::new(open_shared_read(path.as_ref())?);
    read_materials(&mut reader)
}
