//! Core data types: channels, materials and volume descriptors

use crate::error::{Result, VolError};
use crate::layout::ChunkLayout;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label id reserved for exterior/unlabeled voxels
pub const EXTERIOR_ID: u8 = 0;

/// The two byte channels a dataset carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    /// Grayscale intensity, 0-255
    Volume = 0,
    /// Material label id, 0 = exterior
    Labels = 1,
}

impl Channel {
    /// Data file name for this channel inside a dataset directory
    pub fn file_name(&self) -> &'static str {
        match self {
            Channel::Volume => crate::VOLUME_FILE,
            Channel::Labels => crate::LABELS_FILE,
        }
    }

    /// Bytes in front of chunk 0 for files written by the transfer service
    pub fn payload_offset(&self) -> u64 {
        match self {
            Channel::Volume => 0,
            Channel::Labels => crate::format::LABEL_HEADER_SIZE as u64,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Volume => write!(f, "volume"),
            Channel::Labels => write!(f, "labels"),
        }
    }
}

/// Inclusive intensity range mapped to a material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntensityRange {
    pub min: u8,
    pub max: u8,
}

impl IntensityRange {
    pub fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }

    pub fn contains(&self, value: u8) -> bool {
        value >= self.min && value <= self.max
    }
}

/// A labelled material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    /// Display name
    pub name: String,
    /// Packed ARGB color
    pub color: u32,
    /// Intensity range the material was segmented from
    pub range: IntensityRange,
    /// Whether this is the exterior material
    pub is_exterior: bool,
    /// Label byte written into the label volume
    pub id: u8,
}

impl Material {
    pub fn new(name: impl Into<String>, color: u32, range: IntensityRange, id: u8) -> Self {
        Self {
            name: name.into(),
            color,
            range,
            is_exterior: false,
            id,
        }
    }

    /// The built-in exterior material with id 0
    pub fn exterior() -> Self {
        Self {
            name: "Exterior".to_string(),
            color: 0xFF00_0000,
            range: IntensityRange::new(0, 0),
            is_exterior: true,
            id: EXTERIOR_ID,
        }
    }
}

/// Materials of a dataset, keyed by id.
///
/// Always contains the exterior material; id 0 is never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialTable {
    materials: Vec<Material>,
}

impl Default for MaterialTable {
    fn default() -> Self {
        Self {
            materials: vec![Material::exterior()],
        }
    }
}

impl MaterialTable {
    /// Build a table from decoded entries, inserting the exterior if absent
    pub fn from_materials(materials: Vec<Material>) -> Result<Self> {
        let mut table = Self {
            materials: Vec::with_capacity(materials.len() + 1),
        };
        for material in materials {
            if material.id == EXTERIOR_ID {
                if !material.is_exterior {
                    return Err(VolError::Configuration(format!(
                        "material '{}' claims reserved id 0",
                        material.name
                    )));
                }
                if table.get(EXTERIOR_ID).is_some() {
                    continue;
                }
                table.materials.push(material);
                continue;
            }
            table.add(material)?;
        }
        if table.get(EXTERIOR_ID).is_none() {
            table.materials.insert(0, Material::exterior());
        }
        Ok(table)
    }

    /// Add a material; fails on id 0 or a duplicate id
    pub fn add(&mut self, material: Material) -> Result<()> {
        if material.id == EXTERIOR_ID || material.is_exterior {
            return Err(VolError::Configuration(
                "id 0 is reserved for the exterior material".to_string(),
            ));
        }
        if self.get(material.id).is_some() {
            return Err(VolError::Configuration(format!(
                "material id {} already in use",
                material.id
            )));
        }
        self.materials.push(material);
        Ok(())
    }

    /// Remove a material by id; the exterior cannot be removed
    pub fn remove(&mut self, id: u8) -> Result<Material> {
        if id == EXTERIOR_ID {
            return Err(VolError::Configuration(
                "the exterior material cannot be removed".to_string(),
            ));
        }
        let pos = self
            .materials
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| VolError::NotFound(format!("material id {}", id)))?;
        Ok(self.materials.remove(pos))
    }

    pub fn get(&self, id: u8) -> Option<&Material> {
        self.materials.iter().find(|m| m.id == id)
    }

    /// Lowest unused id above 0
    pub fn next_free_id(&self) -> Option<u8> {
        (1..=u8::MAX).find(|id| self.get(*id).is_none())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Material> {
        self.materials.iter()
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}

/// Shape plus physical voxel size of a loaded dataset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub layout: ChunkLayout,
    /// Edge length of one voxel in meters
    pub pixel_size: f64,
}

impl VolumeInfo {
    pub fn new(layout: ChunkLayout, pixel_size: f64) -> Self {
        Self { layout, pixel_size }
    }
}
