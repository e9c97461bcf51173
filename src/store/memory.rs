//! In-process backing: one heap buffer per chunk

use super::ChunkStorage;
use crate::error::{Result, VolError};
use crate::layout::ChunkLayout;
use crate::utils::CancelFlag;
use std::io::Read;
use std::path::Path;

#[derive(Debug)]
pub struct MemoryChunks {
    chunks: Vec<Vec<u8>>,
}

impl MemoryChunks {
    /// All chunks zero-filled
    pub fn zeroed(layout: &ChunkLayout) -> Self {
        let volume = layout.chunk_volume();
        Self {
            chunks: (0..layout.total_chunks()).map(|_| vec![0u8; volume]).collect(),
        }
    }

    /// Stream `total_chunks` payloads in index order from `reader`.
    ///
    /// Cancellation is checked between chunks.
    pub fn read_from<R: Read>(
        reader: &mut R,
        layout: &ChunkLayout,
        cancel: Option<&CancelFlag>,
    ) -> Result<Self> {
        let volume = layout.chunk_volume();
        let total = layout.total_chunks();
        let mut chunks = Vec::with_capacity(total);
        for _ in 0..total {
            if let Some(flag) = cancel {
                flag.check()?;
            }
            let mut chunk = vec![0u8; volume];
            reader.read_exact(&mut chunk)?;
            chunks.push(chunk);
        }
        Ok(Self { chunks })
    }

    fn get_index(&self, index: usize) -> Result<usize> {
        if index < self.chunks.len() {
            Ok(index)
        } else {
            Err(VolError::OutOfBounds(format!(
                "chunk {} outside 0..{}",
                index,
                self.chunks.len()
            )))
        }
    }
}

impl ChunkStorage for MemoryChunks {
    fn chunk(&self, index: usize) -> Result<&[u8]> {
        let i = self.get_index(index)?;
        Ok(&self.chunks[i])
    }

    fn chunk_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let i = self.get_index(index)?;
        Ok(&mut self.chunks[i])
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn is_mapped(&self) -> bool {
        false
    }
}
