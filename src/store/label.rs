//! Label volume store

use super::{ChunkStorage, ChunkStore, VoxelAccess};
use crate::error::Result;
use crate::layout::ChunkLayout;
use std::ops::{Deref, DerefMut};

/// Chunk store holding material ids.
///
/// Label volumes are always chunk-aligned: their extents are
/// `chunk_count * chunk_dim` on every axis, so they may be larger than the
/// grayscale volume they annotate. Voxels in that padding are stored and
/// round-tripped like any other but are never written by this crate.
#[derive(Debug)]
pub struct LabelChunkStore {
    inner: ChunkStore,
}

impl LabelChunkStore {
    /// Zero-filled (all exterior) label store covering `layout`
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            inner: ChunkStore::new(layout.aligned()),
        }
    }

    /// Wrap a backing; `layout` is aligned first
    pub fn with_storage(layout: ChunkLayout, storage: Box<dyn ChunkStorage>) -> Self {
        Self {
            inner: ChunkStore::with_storage(layout.aligned(), storage),
        }
    }

    /// Flush and drop the mapping and file handle so the backing file can be
    /// deleted or recreated. Every later voxel or chunk access fails.
    pub fn release_file_lock(&mut self) -> Result<()> {
        self.inner.release()
    }

    pub fn into_inner(self) -> ChunkStore {
        self.inner
    }
}

/// Wraps a store whose layout is already chunk-aligned, e.g. one read from
/// a `labels.bin` grid header.
impl From<ChunkStore> for LabelChunkStore {
    fn from(inner: ChunkStore) -> Self {
        debug_assert_eq!(*inner.layout(), inner.layout().aligned());
        Self { inner }
    }
}

impl Deref for LabelChunkStore {
    type Target = ChunkStore;

    fn deref(&self) -> &ChunkStore {
        &self.inner
    }
}

impl DerefMut for LabelChunkStore {
    fn deref_mut(&mut self) -> &mut ChunkStore {
        &mut self.inner
    }
}

impl VoxelAccess for LabelChunkStore {
    fn dimensions(&self) -> (usize, usize, usize) {
        self.inner.dimensions()
    }

    fn get(&self, x: usize, y: usize, z: usize) -> Result<u8> {
        self.inner.get(x, y, z)
    }

    fn set(&mut self, x: usize, y: usize, z: usize, value: u8) -> Result<()> {
        self.inner.set(x, y, z, value)
    }

    fn read_slice(&self, z: usize, out: &mut [u8]) -> Result<()> {
        self.inner.read_slice(z, out)
    }

    fn write_slice(&mut self, z: usize, data: &[u8]) -> Result<()> {
        self.inner.write_slice(z, data)
    }
}
