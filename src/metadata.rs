//! Transfer metadata (`metadata.json`)

use crate::compression::CompressionMethod;
use crate::error::{Result, VolError};
use crate::format::BITS_PER_VOXEL;
use crate::layout::ChunkLayout;
use crate::types::VolumeInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Shape and bookkeeping for a dataset moved by the transfer service.
///
/// Written to `metadata.json` when a receive starts; from then on it is the
/// authoritative description of the dataset, so the received `volume.bin`
/// carries no header of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub chunk_dim: usize,
    pub total_chunks: usize,
    /// chunk_dim³ for 8-bit voxels
    pub chunk_byte_size: usize,
    pub bits_per_voxel: u32,
    pub pixel_size: f64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Encoding of chunk payloads on the wire
    #[serde(default)]
    pub compression: CompressionMethod,
}

impl TransferMetadata {
    pub fn new(name: impl Into<String>, info: &VolumeInfo) -> Self {
        let layout = &info.layout;
        let now = Utc::now();
        Self {
            name: name.into(),
            width: layout.width,
            height: layout.height,
            depth: layout.depth,
            chunk_dim: layout.chunk_dim,
            total_chunks: layout.total_chunks(),
            chunk_byte_size: layout.chunk_volume(),
            bits_per_voxel: BITS_PER_VOXEL as u32,
            pixel_size: info.pixel_size,
            created_at: now,
            modified_at: now,
            properties: HashMap::new(),
            compression: CompressionMethod::None,
        }
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Validated grid, checking the derived fields agree with the shape
    pub fn layout(&self) -> Result<ChunkLayout> {
        let layout = ChunkLayout::new(self.width, self.height, self.depth, self.chunk_dim)?;
        if self.bits_per_voxel != BITS_PER_VOXEL as u32 {
            return Err(VolError::Configuration(format!(
                "bits per voxel {} unsupported",
                self.bits_per_voxel
            )));
        }
        if self.total_chunks != layout.total_chunks() {
            return Err(VolError::Configuration(format!(
                "total_chunks {} does not match {} ({} expected)",
                self.total_chunks,
                layout.summary(),
                layout.total_chunks()
            )));
        }
        if self.chunk_byte_size != layout.chunk_volume() {
            return Err(VolError::Configuration(format!(
                "chunk_byte_size {} does not match chunk dim {}",
                self.chunk_byte_size, self.chunk_dim
            )));
        }
        if !self.pixel_size.is_finite() || self.pixel_size <= 0.0 {
            return Err(VolError::Configuration(format!(
                "pixel size {} is not a positive length",
                self.pixel_size
            )));
        }
        Ok(layout)
    }

    pub fn volume_info(&self) -> Result<VolumeInfo> {
        Ok(VolumeInfo::new(self.layout()?, self.pixel_size))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read(path.as_ref())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransferMetadata {
        let layout = ChunkLayout::new(300, 300, 300, 256).unwrap();
        TransferMetadata::new("core-17", &VolumeInfo::new(layout, 4.2e-6))
    }

    #[test]
    fn test_derived_fields() {
        let meta = sample();
        assert_eq!(meta.total_chunks, 8);
        assert_eq!(meta.chunk_byte_size, 256 * 256 * 256);
        assert_eq!(meta.bits_per_voxel, 8);
        assert_eq!(meta.compression, CompressionMethod::None);
        assert!(meta.layout().is_ok());
    }

    #[test]
    fn test_json_roundtrip_keeps_properties() {
        let mut meta = sample().with_compression(CompressionMethod::Zstd);
        meta.set_property("scanner", "micro-ct");
        let decoded = TransferMetadata::from_json(&meta.to_json().unwrap()).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.property("scanner"), Some("micro-ct"));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let mut value = serde_json::to_value(sample()).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("properties");
        object.remove("compression");
        let decoded: TransferMetadata = serde_json::from_value(value).unwrap();
        assert!(decoded.properties.is_empty());
        assert_eq!(decoded.compression, CompressionMethod::None);
    }

    #[test]
    fn test_inconsistent_fields_rejected() {
        let mut meta = sample();
        meta.total_chunks = 9;
        assert!(matches!(meta.layout(), Err(VolError::Configuration(_))));

        let mut meta = sample();
        meta.chunk_byte_size = 1;
        assert!(meta.layout().is_err());

        let mut meta = sample();
        meta.width = 0;
        assert!(meta.layout().is_err());
    }
}
