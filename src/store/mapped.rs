//! Memory-mapped backing: one mapping over a chunk file

use super::ChunkStorage;
use crate::config::RetryPolicy;
use crate::error::{Result, VolError};
use crate::layout::ChunkLayout;
use crate::utils::{open_shared_read, open_shared_write, retry_transient};
use memmap2::{Mmap, MmapMut};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Access requested for a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Shared read; chunk writes are rejected
    ReadOnly,
    /// Writes go straight to the file
    ReadWrite,
}

#[derive(Debug)]
enum Mapping {
    ReadOnly { map: Mmap, _file: File },
    ReadWrite { map: MmapMut, _file: File },
}

#[derive(Debug)]
pub struct MappedChunks {
    path: PathBuf,
    header_size: usize,
    chunk_volume: usize,
    total_chunks: usize,
    mapping: Option<Mapping>,
}

impl MappedChunks {
    /// Map an existing file whose payload starts at `header_size`.
    ///
    /// The file must hold at least `header_size + raw_data_size` bytes.
    /// Busy or sharing failures (a handle from a just-finished writer or a
    /// previous mapping the OS has not released) are retried with back-off.
    pub fn open(
        path: impl AsRef<Path>,
        layout: &ChunkLayout,
        header_size: usize,
        mode: MapMode,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let required = header_size as u64 + layout.raw_data_size();

        let mapping = retry_transient(retry, "map", || {
            let file = match mode {
                MapMode::ReadOnly => open_shared_read(&path)?,
                MapMode::ReadWrite => open_shared_write(&path, false)?,
            };
            let len = file.metadata()?.len();
            if len < required {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("file is {} bytes, mapping needs {}", len, required),
                ));
            }
            // SAFETY: the mapping is only read or written through bounds-checked
            // slices of at most `required` bytes, which the length check above
            // guarantees exist. Writers to the same file are excluded by convention.
            let mapping = match mode {
                MapMode::ReadOnly => Mapping::ReadOnly {
                    map: unsafe { Mmap::map(&file)? },
                    _file: file,
                },
                MapMode::ReadWrite => Mapping::ReadWrite {
                    map: unsafe { MmapMut::map_mut(&file)? },
                    _file: file,
                },
            };
            Ok(mapping)
        })
        .map_err(|err| match err {
            VolError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                VolError::SizeMismatch {
                    actual: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
                    expected: vec![required],
                }
            }
            other => other,
        })?;

        debug!(
            path = %path.display(),
            header_size,
            chunks = layout.total_chunks(),
            ?mode,
            "mapped chunk file"
        );

        Ok(Self {
            path,
            header_size,
            chunk_volume: layout.chunk_volume(),
            total_chunks: layout.total_chunks(),
            mapping: Some(mapping),
        })
    }

    /// Create (or truncate) a file sized for `layout`, write `header` at the
    /// front and map it read-write. Payload bytes start zeroed.
    pub fn create(
        path: impl AsRef<Path>,
        layout: &ChunkLayout,
        header: &[u8],
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let path = path.as_ref();
        let total = header.len() as u64 + layout.raw_data_size();
        {
            let file = retry_transient(retry, "create", || {
                let file = open_shared_write(path, true)?;
                file.set_len(0)?;
                Ok(file)
            })?;
            file.set_len(total).map_err(|e| {
                VolError::Allocation(format!(
                    "cannot size {} to {} bytes: {}",
                    path.display(),
                    total,
                    e
                ))
            })?;
        }
        let mut mapped = Self::open(path, layout, header.len(), MapMode::ReadWrite, retry)?;
        if let Some(Mapping::ReadWrite { map, .. }) = mapped.mapping.as_mut() {
            map[..header.len()].copy_from_slice(header);
        }
        Ok(mapped)
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    fn range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        if index >= self.total_chunks {
            return Err(VolError::OutOfBounds(format!(
                "chunk {} outside 0..{}",
                index, self.total_chunks
            )));
        }
        let start = self.header_size + index * self.chunk_volume;
        Ok(start..start + self.chunk_volume)
    }
}

fn released(path: &Path) -> VolError {
    VolError::Configuration(format!("backing file {} was released", path.display()))
}

impl ChunkStorage for MappedChunks {
    fn chunk(&self, index: usize) -> Result<&[u8]> {
        let range = self.range(index)?;
        match &self.mapping {
            Some(Mapping::ReadOnly { map, .. }) => Ok(&map[range]),
            Some(Mapping::ReadWrite { map, .. }) => Ok(&map[range]),
            None => Err(released(&self.path)),
        }
    }

    fn chunk_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let range = self.range(index)?;
        let path = &self.path;
        match &mut self.mapping {
            Some(Mapping::ReadWrite { map, .. }) => Ok(&mut map[range]),
            Some(Mapping::ReadOnly { .. }) => Err(VolError::Configuration(format!(
                "{} is mapped read-only",
                path.display()
            ))),
            None => Err(released(path)),
        }
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(Mapping::ReadWrite { map, .. }) = &self.mapping {
            map.flush()?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.flush()?;
        if self.mapping.take().is_some() {
            debug!(path = %self.path.display(), "released chunk file");
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

impl Drop for MappedChunks {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(path = %self.path.display(), error = %err, "flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> ChunkLayout {
        ChunkLayout::new(20, 16, 16, 16).unwrap()
    }

    #[test]
    fn test_create_write_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.bin");
        let layout = layout();
        let retry = RetryPolicy::default();

        let mut mapped = MappedChunks::create(&path, &layout, b"HDR!", &retry).unwrap();
        mapped.chunk_mut(1).unwrap()[0] = 42;
        mapped.release().unwrap();
        assert!(!mapped.is_mapped());
        assert!(mapped.chunk(0).is_err());

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, 4 + layout.raw_data_size());
        assert_eq!(&bytes[..4], b"HDR!");
        assert_eq!(bytes[4 + layout.chunk_volume()], 42);

        let reopened = MappedChunks::open(&path, &layout, 4, MapMode::ReadOnly, &retry).unwrap();
        assert_eq!(reopened.chunk(1).unwrap()[0], 42);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.bin");
        let layout = layout();
        let retry = RetryPolicy::default();
        drop(MappedChunks::create(&path, &layout, &[], &retry).unwrap());

        let mut mapped = MappedChunks::open(&path, &layout, 0, MapMode::ReadOnly, &retry).unwrap();
        assert!(matches!(
            mapped.chunk_mut(0),
            Err(VolError::Configuration(_))
        ));
    }

    #[test]
    fn test_short_file_is_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        let err = MappedChunks::open(
            &path,
            &layout(),
            0,
            MapMode::ReadOnly,
            &RetryPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, VolError::SizeMismatch { actual: 100, .. }));
    }
}
