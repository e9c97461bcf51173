//! Combined single-file export.
//!
//! Layout: i32 width, i32 height, i32 depth, f64 pixel size, material
//! table, u8 has-grayscale flag, the grayscale section if flagged, then the
//! label section. Each section is a 16-byte chunk grid header followed by
//! payloads in chunk index order.

use super::{
    open_chunks, read_grid_header, read_materials, write_grid_header,
    write_materials, write_padded_chunks, LoadOptions, LABEL_HEADER_SIZE,
};
use crate::config::RetryPolicy;
use crate::error::{Result, VolError};
use crate::layout::ChunkLayout;
use crate::store::{ChunkStore, LabelChunkStore};
use crate::types::{MaterialTable, VolumeInfo};
use crate::utils::{open_shared_read, retry_transient};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

/// Everything stored in a combined export
#[derive(Debug)]
pub struct CombinedVolume {
    pub info: VolumeInfo,
    pub materials: MaterialTable,
    pub volume: Option<ChunkStore>,
    pub labels: LabelChunkStore,
}

pub fn save_combined(
    path: impl AsRef<Path>,
    pixel_size: f64,
    materials: &MaterialTable,
    volume: Option<&ChunkStore>,
    labels: &LabelChunkStore,
    retry: &RetryPolicy,
) -> Result<()> {
    let path = path.as_ref();
    let label_layout = *labels.layout();
    let shape = match volume {
        Some(store) => *store.layout(),
        None => label_layout,
    };
    if shape.aligned() != label_layout {
        return Err(VolError::Configuration(format!(
            "label grid {:?} does not cover volume {:?}",
            label_layout, shape
        )));
    }

    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        writer.write_i32::<LittleEndian>(shape.width as i32)?;
        writer.write_i32::<LittleEndian>(shape.height as i32)?;
        writer.write_i32::<LittleEndian>(shape.depth as i32)?;
        writer.write_f64::<LittleEndian>(pixel_size)?;
        write_materials(&mut writer, materials)?;
        writer.write_u8(volume.is_some() as u8)?;
        if let Some(store) = volume {
            write_grid_header(&mut writer, store.layout())?;
            write_padded_chunks(&mut writer, store)?;
        }
        write_grid_header(&mut writer, &label_layout)?;
        for index in 0..label_layout.total_chunks() {
            writer.write_all(labels.chunk(index)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    retry_transient(retry, "rename", || fs::rename(&tmp, path))?;

    info!(
        path = %path.display(),
        grayscale = volume.is_some(),
        materials = materials.len(),
        "saved combined volume"
    );
    Ok(())
}

pub fn load_combined(path: impl AsRef<Path>, options: &LoadOptions) -> Result<CombinedVolume> {
    let path = path.as_ref();
    let file_len = fs::metadata(path)?.len();
    let mut reader = BufReader::new(open_shared_read(path)?);

    let width = read_extent(&mut reader, "width")?;
    let height = read_extent(&mut reader, "height")?;
    let depth = read_extent(&mut reader, "depth")?;
    let pixel_size = reader.read_f64::<LittleEndian>()?;
    if !pixel_size.is_finite() || pixel_size <= 0.0 {
        return Err(VolError::corrupt(format!("pixel size {}", pixel_size)));
    }
    let materials = read_materials(&mut reader)?;
    let has_grayscale = reader.read_u8()? != 0;

    let mut shape = None;
    let mut volume = None;
    if has_grayscale {
        let (chunk_dim, counts) = read_grid_header(&mut reader)?;
        let layout = ChunkLayout::new(width, height, depth, chunk_dim)
            .map_err(|e| VolError::corrupt(e.to_string()))?;
        if layout.chunk_counts() != counts {
            return Err(VolError::corrupt(format!(
                "grayscale chunk counts {:?} do not match {}x{}x{}",
                counts, width, height, depth
            )));
        }
        let offset = reader.stream_position()?;
        volume = Some(open_chunks(path, &layout, offset as usize, options)?);
        reader.seek(SeekFrom::Start(offset + layout.raw_data_size()))?;
        shape = Some(layout);
    }

    let label_start = reader.stream_position()?;
    let label_layout = {
        let (chunk_dim, counts) = read_grid_header(&mut reader)?;
        ChunkLayout::from_chunk_counts(chunk_dim, counts)
            .map_err(|e| VolError::corrupt(e.to_string()))?
    };
    let label_offset = label_start + LABEL_HEADER_SIZE as u64;
    let expected = label_offset + label_layout.raw_data_size();
    if file_len != expected {
        return Err(VolError::SizeMismatch {
            actual: file_len,
            expected: vec![expected],
        });
    }
    drop(reader);

    let shape = match shape {
        Some(layout) => layout,
        None => ChunkLayout::new(width, height, depth, label_layout.chunk_dim)
            .map_err(|e| VolError::corrupt(e.to_string()))?,
    };
    if shape.aligned() != label_layout {
        return Err(VolError::corrupt(format!(
            "label grid {:?} does not cover {}x{}x{}",
            label_layout.chunk_counts(),
            width,
            height,
            depth
        )));
    }
    let labels = LabelChunkStore::from(open_chunks(
        path,
        &label_layout,
        label_offset as usize,
        options,
    )?);

    Ok(CombinedVolume {
        info: VolumeInfo::new(shape, pixel_size),
        materials,
        volume,
        labels,
    })
}

fn read_extent<R: ReadBytesExt>(reader: &mut R, name: &str) -> Result<usize> {
    let value = reader.read_i32::<LittleEndian>()?;
    usize::try_from(value).map_err(|_| VolError::corrupt(format!("{} {} is negative", name, value)))
}
