//! Fixed-size little-endian header records

use crate::config::HeaderFormat;
use crate::error::{Result, VolError};
use crate::layout::ChunkLayout;
use crate::types::VolumeInfo;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

/// Legacy header: width, height, depth, chunk dim, pixel size, three chunk counts
pub const LEGACY_HEADER_SIZE: usize = 36;

/// Extended header: the legacy fields plus bits per voxel after the chunk dim
pub const EXTENDED_HEADER_SIZE: usize = 40;

/// `labels.bin` header: chunk dim and three chunk counts
pub const LABEL_HEADER_SIZE: usize = 16;

/// `volume.chk` is the legacy header layout
pub const SIDECAR_SIZE: usize = LEGACY_HEADER_SIZE;

/// Only one byte per voxel is supported
pub const BITS_PER_VOXEL: i32 = 8;

/// Header fields exactly as stored on disk, before validation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeHeader {
    pub width: i32,
    pub height: i32,
    pub depth: i32,
    pub chunk_dim: i32,
    pub bits_per_voxel: i32,
    pub pixel_size: f64,
    pub chunk_counts: [i32; 3],
}

impl VolumeHeader {
    pub fn from_info(info: &VolumeInfo) -> Self {
        let layout = &info.layout;
        let [cx, cy, cz] = layout.chunk_counts();
        Self {
            width: layout.width as i32,
            height: layout.height as i32,
            depth: layout.depth as i32,
            chunk_dim: layout.chunk_dim as i32,
            bits_per_voxel: BITS_PER_VOXEL,
            pixel_size: info.pixel_size,
            chunk_counts: [cx as i32, cy as i32, cz as i32],
        }
    }

    pub fn read_legacy<R: Read>(reader: &mut R) -> io::Result<Self> {
        let width = reader.read_i32::<LittleEndian>()?;
        let height = reader.read_i32::<LittleEndian>()?;
        let depth = reader.read_i32::<LittleEndian>()?;
        let chunk_dim = reader.read_i32::<LittleEndian>()?;
        let pixel_size = reader.read_f64::<LittleEndian>()?;
        let chunk_counts = read_counts(reader)?;
        Ok(Self {
            width,
            height,
            depth,
            chunk_dim,
            bits_per_voxel: BITS_PER_VOXEL,
            pixel_size,
            chunk_counts,
        })
    }

    pub fn read_extended<R: Read>(reader: &mut R) -> io::Result<Self> {
        let width = reader.read_i32::<LittleEndian>()?;
        let height = reader.read_i32::<LittleEndian>()?;
        let depth = reader.read_i32::<LittleEndian>()?;
        let chunk_dim = reader.read_i32::<LittleEndian>()?;
        let bits_per_voxel = reader.read_i32::<LittleEndian>()?;
        let pixel_size = reader.read_f64::<LittleEndian>()?;
        let chunk_counts = read_counts(reader)?;
        Ok(Self {
            width,
            height,
            depth,
            chunk_dim,
            bits_per_voxel,
            pixel_size,
            chunk_counts,
        })
    }

    /// Parse leading bytes in the given layout; `None` when too short
    pub fn parse(bytes: &[u8], format: HeaderFormat) -> Option<Self> {
        let mut cursor = Cursor::new(bytes);
        match format {
            HeaderFormat::Legacy => Self::read_legacy(&mut cursor).ok(),
            HeaderFormat::Extended => Self::read_extended(&mut cursor).ok(),
            HeaderFormat::None => None,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W, format: HeaderFormat) -> io::Result<()> {
        if format == HeaderFormat::None {
            return Ok(());
        }
        writer.write_i32::<LittleEndian>(self.width)?;
        writer.write_i32::<LittleEndian>(self.height)?;
        writer.write_i32::<LittleEndian>(self.depth)?;
        writer.write_i32::<LittleEndian>(self.chunk_dim)?;
        if format == HeaderFormat::Extended {
            writer.write_i32::<LittleEndian>(self.bits_per_voxel)?;
        }
        writer.write_f64::<LittleEndian>(self.pixel_size)?;
        for count in self.chunk_counts {
            writer.write_i32::<LittleEndian>(count)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self, format: HeaderFormat) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(format.size());
        // Writing into a Vec cannot fail.
        let _ = self.write(&mut bytes, format);
        bytes
    }

    /// Check every field against the sanity bounds
    pub fn validate(&self) -> Result<VolumeInfo> {
        let to_usize = |name: &str, v: i32| {
            usize::try_from(v).map_err(|_| VolError::corrupt(format!("{} {} is negative", name, v)))
        };
        let layout = ChunkLayout::new(
            to_usize("width", self.width)?,
            to_usize("height", self.height)?,
            to_usize("depth", self.depth)?,
            to_usize("chunk dim", self.chunk_dim)?,
        )
        .map_err(|e| VolError::corrupt(e.to_string()))?;

        if self.bits_per_voxel != BITS_PER_VOXEL {
            return Err(VolError::corrupt(format!(
                "bits per voxel {} unsupported",
                self.bits_per_voxel
            )));
        }
        if !self.pixel_size.is_finite() || self.pixel_size <= 0.0 {
            return Err(VolError::corrupt(format!(
                "pixel size {} is not a positive length",
                self.pixel_size
            )));
        }
        let expected = layout.chunk_counts().map(|c| c as i32);
        if self.chunk_counts != expected {
            return Err(VolError::corrupt(format!(
                "chunk counts {:?} do not match shape (expected {:?})",
                self.chunk_counts, expected
            )));
        }
        Ok(VolumeInfo::new(layout, self.pixel_size))
    }

    /// True when the header describes the same grid as `layout`
    pub fn matches(&self, layout: &ChunkLayout) -> bool {
        self.width as i64 == layout.width as i64
            && self.height as i64 == layout.height as i64
            && self.depth as i64 == layout.depth as i64
            && self.chunk_dim as i64 == layout.chunk_dim as i64
    }
}

fn read_counts<R: Read>(reader: &mut R) -> io::Result<[i32; 3]> {
    Ok([
        reader.read_i32::<LittleEndian>()?,
        reader.read_i32::<LittleEndian>()?,
        reader.read_i32::<LittleEndian>()?,
    ])
}

/// Write the 16-byte chunk grid header used by label files and combined sections
pub fn write_grid_header<W: Write>(writer: &mut W, layout: &ChunkLayout) -> io::Result<()> {
    writer.write_i32::<LittleEndian>(layout.chunk_dim as i32)?;
    for count in layout.chunk_counts() {
        writer.write_i32::<LittleEndian>(count as i32)?;
    }
    Ok(())
}

/// Read a chunk grid header as `(chunk_dim, counts)`
pub fn read_grid_header<R: Read>(reader: &mut R) -> Result<(usize, [usize; 3])> {
    let mut fields = [0i32; 4];
    for field in fields.iter_mut() {
        *field = reader.read_i32::<LittleEndian>()?;
    }
    if fields.iter().any(|&f| f <= 0) {
        return Err(VolError::corrupt(format!(
            "chunk grid header {:?} has non-positive fields",
            fields
        )));
    }
    Ok((
        fields[0] as usize,
        [fields[1] as usize, fields[2] as usize, fields[3] as usize],
    ))
}

/// Label layout from a grid header; always chunk-aligned
pub fn read_label_layout<R: Read>(reader: &mut R) -> Result<ChunkLayout> {
    let (chunk_dim, counts) = read_grid_header(reader)?;
    ChunkLayout::from_chunk_counts(chunk_dim, counts).map_err(|e| VolError::corrupt(e.to_string()))
}
