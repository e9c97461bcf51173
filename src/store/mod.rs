//! Chunk-addressed voxel stores.
//!
//! A [`ChunkStore`] is a dense 3-D byte array cut into cubic chunks. The
//! chunks live behind a [`ChunkStorage`] backing, either one heap buffer
//! per chunk ([`MemoryChunks`]) or a single memory-mapped file
//! ([`MappedChunks`]) in which chunk `i` occupies
//! `[header + i * chunk_volume, header + (i + 1) * chunk_volume)`.
//!
//! Code outside this crate should only need [`VoxelAccess`].

mod label;
mod mapped;
mod memory;

pub use label::LabelChunkStore;
pub use mapped::{MapMode, MappedChunks};
pub use memory::MemoryChunks;

use crate::config::RetryPolicy;
use crate::error::{Result, VolError};
use crate::layout::ChunkLayout;
use std::path::Path;

/// Backing storage for chunk payloads
pub trait ChunkStorage: Send + Sync {
    /// Borrow chunk `index`
    fn chunk(&self, index: usize) -> Result<&[u8]>;

    /// Borrow chunk `index` mutably
    fn chunk_mut(&mut self, index: usize) -> Result<&mut [u8]>;

    /// Persist pending writes
    fn flush(&mut self) -> Result<()>;

    /// Drop any file handle and mapping. Later access fails.
    fn release(&mut self) -> Result<()>;

    /// Backing file, if any
    fn path(&self) -> Option<&Path>;

    fn is_mapped(&self) -> bool;
}

/// Voxel and slice access used by consumers of a store
pub trait VoxelAccess {
    /// `(width, height, depth)`
    fn dimensions(&self) -> (usize, usize, usize);

    fn get(&self, x: usize, y: usize, z: usize) -> Result<u8>;

    fn set(&mut self, x: usize, y: usize, z: usize, value: u8) -> Result<()>;

    /// Copy Z slice `z` into `out`, row-major with stride `width`
    fn read_slice(&self, z: usize, out: &mut [u8]) -> Result<()>;

    /// Overwrite Z slice `z` from `data`, row-major with stride `width`
    fn write_slice(&mut self, z: usize, data: &[u8]) -> Result<()>;
}

/// Grayscale voxel store
pub type VoxelChunkStore = ChunkStore;

/// Dense chunked byte volume
pub struct ChunkStore {
    layout: ChunkLayout,
    storage: Box<dyn ChunkStorage>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("layout", &self.layout)
            .field("mapped", &self.storage.is_mapped())
            .field("path", &self.storage.path())
            .finish()
    }
}

impl ChunkStore {
    /// Zero-filled store held in memory
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout,
            storage: Box::new(MemoryChunks::zeroed(&layout)),
        }
    }

    /// Wrap an existing backing
    pub fn with_storage(layout: ChunkLayout, storage: Box<dyn ChunkStorage>) -> Self {
        Self { layout, storage }
    }

    /// Map an existing chunk file whose payload starts at `header_size`
    pub fn map_file(
        path: impl AsRef<Path>,
        layout: ChunkLayout,
        header_size: usize,
        mode: MapMode,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let mapped = MappedChunks::open(path, &layout, header_size, mode, retry)?;
        Ok(Self::with_storage(layout, Box::new(mapped)))
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn is_mapped(&self) -> bool {
        self.storage.is_mapped()
    }

    pub fn backing_path(&self) -> Option<&Path> {
        self.storage.path()
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Result<u8> {
        let (chunk, offset) = self.layout.locate(x, y, z)?;
        Ok(self.storage.chunk(chunk)?[offset])
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, value: u8) -> Result<()> {
        let (chunk, offset) = self.layout.locate(x, y, z)?;
        self.storage.chunk_mut(chunk)?[offset] = value;
        Ok(())
    }

    /// Borrow a whole chunk payload
    pub fn chunk(&self, index: usize) -> Result<&[u8]> {
        self.check_chunk_index(index)?;
        self.storage.chunk(index)
    }

    /// Replace a whole chunk payload; `data` must be exactly one chunk
    pub fn replace_chunk(&mut self, index: usize, data: &[u8]) -> Result<()> {
        self.check_chunk_index(index)?;
        let expected = self.layout.chunk_volume();
        if data.len() != expected {
            return Err(VolError::OutOfBounds(format!(
                "chunk payload is {} bytes, expected {}",
                data.len(),
                expected
            )));
        }
        self.storage.chunk_mut(index)?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_slice(&self, z: usize, out: &mut [u8]) -> Result<()> {
        self.check_slice(z, out.len())?;
        let layout = self.layout;
        let cd = layout.chunk_dim;
        let local_z = (z % cd) * cd * cd;
        for_each_slice_run(&layout, z, |chunk, row, x0, x1, y| {
            let src = self.storage.chunk(chunk)?;
            let start = local_z + row * cd;
            let dst = y * layout.width;
            out[dst + x0..dst + x1].copy_from_slice(&src[start..start + (x1 - x0)]);
            Ok(())
        })
    }

    pub fn write_slice(&mut self, z: usize, data: &[u8]) -> Result<()> {
        self.check_slice(z, data.len())?;
        let layout = self.layout;
        let cd = layout.chunk_dim;
        let local_z = (z % cd) * cd * cd;
        let storage = &mut self.storage;
        for_each_slice_run(&layout, z, |chunk, row, x0, x1, y| {
            let dst = storage.chunk_mut(chunk)?;
            let start = local_z + row * cd;
            let src = y * layout.width;
            dst[start..start + (x1 - x0)].copy_from_slice(&data[src + x0..src + x1]);
            Ok(())
        })
    }

    /// Set every voxel, padding included, to `value`
    pub fn fill(&mut self, value: u8) -> Result<()> {
        for index in 0..self.layout.total_chunks() {
            self.storage.chunk_mut(index)?.fill(value);
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()
    }

    pub(crate) fn release(&mut self) -> Result<()> {
        self.storage.release()
    }

    fn check_chunk_index(&self, index: usize) -> Result<()> {
        let total = self.layout.total_chunks();
        if index >= total {
            return Err(VolError::OutOfBounds(format!(
                "chunk {} outside 0..{}",
                index, total
            )));
        }
        Ok(())
    }

    fn check_slice(&self, z: usize, len: usize) -> Result<()> {
        if z >= self.layout.depth {
            return Err(VolError::OutOfBounds(format!(
                "slice {} outside 0..{}",
                z, self.layout.depth
            )));
        }
        if len != self.layout.slice_len() {
            return Err(VolError::OutOfBounds(format!(
                "slice buffer is {} bytes, expected {}",
                len,
                self.layout.slice_len()
            )));
        }
        Ok(())
    }
}

/// Visit every contiguous row segment of slice `z`.
///
/// The callback gets `(chunk index, row inside chunk, x start, x end, y)`;
/// only the chunks of that slice's chunk layer are visited.
fn for_each_slice_run<F>(layout: &ChunkLayout, z: usize, mut visit: F) -> Result<()>
where
    F: FnMut(usize, usize, usize, usize, usize) -> Result<()>,
{
    let cd = layout.chunk_dim;
    let [cnt_x, cnt_y, _] = layout.chunk_counts();
    let cz = z / cd;
    for cy in 0..cnt_y {
        let y_end = ((cy + 1) * cd).min(layout.height);
        for cx in 0..cnt_x {
            let chunk = layout.chunk_index(crate::layout::ChunkCoord::new(cx, cy, cz));
            let x0 = cx * cd;
            let x1 = (x0 + cd).min(layout.width);
            for y in cy * cd..y_end {
                visit(chunk, y - cy * cd, x0, x1, y)?;
            }
        }
    }
    Ok(())
}

impl VoxelAccess for ChunkStore {
    fn dimensions(&self) -> (usize, usize, usize) {
        (self.layout.width, self.layout.height, self.layout.depth)
    }

    fn get(&self, x: usize, y: usize, z: usize) -> Result<u8> {
        ChunkStore::get(self, x, y, z)
    }

    fn set(&mut self, x: usize, y: usize, z: usize, value: u8) -> Result<()> {
        ChunkStore::set(self, x, y, z, value)
    }

    fn read_slice(&self, z: usize, out: &mut [u8]) -> Result<()> {
        ChunkStore::read_slice(self, z, out)
    }

    fn write_slice(&mut self, z: usize, data: &[u8]) -> Result<()> {
        ChunkStore::write_slice(self, z, data)
    }
}
