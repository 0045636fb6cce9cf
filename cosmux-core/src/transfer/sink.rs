//! Positional download destinations

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{Result, TransferError};

/// Destination accepting writes at absolute offsets
///
/// Parts of a multipart download arrive concurrently and out of order; each
/// call writes one contiguous chunk of one part.
#[async_trait]
pub trait WriteAt: Send + Sync {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;
}

/// File opened for positional writes
pub struct FileWriteAt {
    file: tokio::sync::Mutex<File>,
}

impl FileWriteAt {
    pub fn new(file: File) -> Self {
        Self {
            file: tokio::sync::Mutex::new(file),
        }
    }

    /// Create (or truncate) `path`, creating missing parent directories
    pub async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self::new(File::create(path).await?))
    }

    /// Flush and sync written data
    pub async fn sync(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl WriteAt for FileWriteAt {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }
}

/// Fixed-size in-memory destination
pub struct SharedBuffer {
    data: Mutex<Vec<u8>>,
}

impl SharedBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
        }
    }

    /// Take the assembled bytes, leaving the buffer empty
    pub fn take(&self) -> Bytes {
        Bytes::from(std::mem::take(&mut *self.data.lock()))
    }
}

#[async_trait]
impl WriteAt for SharedBuffer {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buf = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| out_of_bounds(offset, data.len(), buf.len()))?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| out_of_bounds(offset, data.len(), buf.len()))?;
        buf[start..end].copy_from_slice(data);
        Ok(())
    }
}

fn out_of_bounds(offset: u64, len: usize, capacity: usize) -> TransferError {
    TransferError::internal(format!(
        "write of {} bytes at {} exceeds buffer of {} bytes",
        len, offset, capacity
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_buffer_out_of_order() {
        let buf = SharedBuffer::new(6);
        buf.write_at(3, b"def").await.unwrap();
        buf.write_at(0, b"abc").await.unwrap();
        assert!(buf.write_at(4, b"xyz").await.is_err());
        assert_eq!(buf.take().as_ref(), b"abcdef");
    }

    #[tokio::test]
    async fn test_file_write_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.bin");

        let sink = FileWriteAt::create(&path).await.unwrap();
        sink.write_at(5, b"world").await.unwrap();
        sink.write_at(0, b"hello").await.unwrap();
        sink.sync().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"helloworld");
    }
}
