//! Storage seam for the transfer service

use crate::error::{Result, VolError};
use crate::utils::{open_shared_read, open_shared_write};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Byte-level operations on dataset files, addressed relative to a root.
///
/// Positioned reads and writes open their own shared handles so concurrent
/// chunk calls on the same file never share a cursor.
#[async_trait]
pub trait DatasetStorage: Send + Sync {
    async fn create_dir(&self, path: &str) -> Result<()>;

    async fn remove_dir_all(&self, path: &str) -> Result<()>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Bytes>;

    /// Create `path` at exactly `len` bytes with `header` at the front.
    /// The rest is left for the filesystem to zero-fill lazily.
    async fn allocate(&self, path: &str, header: &[u8], len: u64) -> Result<()>;

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()>;

    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes>;

    /// fsync
    async fn sync(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Local path for synchronous loaders, when the backend has one
    fn local_path(&self, path: &str) -> Option<PathBuf>;
}

/// Datasets under a local base directory
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    base_path: PathBuf,
}

impl FileSystemStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

async fn blocking<T, F>(op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| VolError::Io(io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(VolError::Io)
}

#[async_trait]
impl DatasetStorage for FileSystemStorage {
    async fn create_dir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path)).await?;
        Ok(())
    }

    async fn remove_dir_all(&self, path: &str) -> Result<()> {
        fs::remove_dir_all(self.full_path(path)).await?;
        Ok(())
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, data).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(VolError::NotFound(full_path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn allocate(&self, path: &str, header: &[u8], len: u64) -> Result<()> {
        let full_path = self.full_path(path);
        let header = header.to_vec();
        let display = full_path.display().to_string();
        blocking(move || {
            let mut file = open_shared_write(&full_path, true)?;
            file.set_len(0)?;
            file.write_all(&header)?;
            file.set_len(len)
        })
        .await
        .map_err(|e| VolError::Allocation(format!("cannot size {} to {} bytes: {}", display, len, e)))
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        let data = data.to_vec();
        blocking(move || {
            let mut file = open_shared_write(&full_path, false)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)
        })
        .await
    }

    async fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        let full_path = self.full_path(path);
        let data = blocking(move || {
            let mut file = open_shared_read(&full_path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut data = vec![0u8; len];
            file.read_exact(&mut data)?;
            Ok(data)
        })
        .await?;
        Ok(Bytes::from(data))
    }

    async fn sync(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        blocking(move || open_shared_write(&full_path, false)?.sync_all()).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.full_path(path))
    }
}
