//! ctvault - chunked storage for CT-scan voxel volumes
//!
//! Grayscale and material-label volumes that routinely exceed RAM are kept
//! as dense 3-D byte arrays cut into cubic chunks, backed either by heap
//! buffers or by a memory-mapped file.
//!
//! # Features
//!
//! - Chunk-addressed voxel stores with bounds-checked voxel, slice and chunk access
//! - Self-describing on-disk format with sidecar recovery and legacy header detection
//! - Loading from slice image stacks, dataset directories or combined exports
//! - Integer-factor 3-D binning
//! - Order-independent, resumable chunk transfer with optional wire compression
//!
//! # Example
//!
//! ```rust,ignore
//! use ctvault::{VaultConfig, VolumeLoader, VoxelAccess};
//!
//! # fn example() -> ctvault::Result<()> {
//! let loaded = VolumeLoader::new(VaultConfig::from_env()).load("/data/scan-0042", None)?;
//! let (w, h, _) = loaded.volume.dimensions();
//! let mut slice = vec![0u8; w * h];
//! loaded.volume.read_slice(100, &mut slice)?;
//! # Ok(())
//! # }
//! ```

pub mod binning;
pub mod compression;
pub mod config;
pub mod error;
pub mod format;
pub mod layout;
pub mod loader;
pub mod logging;
pub mod metadata;
pub mod store;
pub mod transfer;
pub mod types;
pub mod utils;

// Re-exports
pub use binning::{BinSource, Binner, BinnedVolume};
pub use compression::{CompressionMethod, Compressor};
pub use config::{HeaderFormat, RetryPolicy, VaultConfig};
pub use error::{RecoveryPath, Result, VolError};
pub use format::{Backing, DatasetPaths, LoadOptions};
pub use layout::{ChunkCoord, ChunkLayout};
pub use loader::{LoadedVolume, VolumeLoader};
pub use metadata::TransferMetadata;
pub use store::{ChunkStore, LabelChunkStore, MapMode, VoxelAccess, VoxelChunkStore};
pub use transfer::{ChunkTransferService, TransferSnapshot, TransferStatus};
pub use types::{Channel, IntensityRange, Material, MaterialTable, VolumeInfo};
pub use utils::CancelFlag;

/// Crate version
pub const CTVAULT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grayscale chunk payloads, optionally behind a header
pub const VOLUME_FILE: &str = "volume.bin";

/// Grayscale shape sidecar
pub const VOLUME_SIDECAR: &str = "volume.chk";

/// Label chunk payloads behind a chunk grid header
pub const LABELS_FILE: &str = "labels.bin";

/// Material table
pub const LABELS_SIDECAR: &str = "labels.chk";

/// Transfer metadata
pub const METADATA_FILE: &str = "metadata.json";
