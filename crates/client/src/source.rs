//! Byte sources the engine reads chunks from.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use stowage_core::ContentHash;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

/// Random-access, fixed-length input for an upload.
#[async_trait]
pub trait ChunkSource: Send + Sync + 'static {
    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `len` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;
}

#[async_trait]
impl ChunkSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = usize::try_from(offset)
            .map_err(|_| ClientError::Protocol(format!("offset {offset} out of range")))?;
        let end = start.saturating_add(len);
        if end > Bytes::len(self) {
            return Err(ClientError::Source(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("range {start}..{end} past end of {} bytes", Bytes::len(self)),
            )));
        }
        Ok(self.slice(start..end))
    }
}

/// A file on disk. The length is fixed when opened.
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// SHA-256 of the whole source, read `chunk_size` bytes at a time.
pub async fn checksum(source: &dyn ChunkSource, chunk_size: usize) -> Result<ContentHash> {
    let chunk_size = chunk_size.max(1) as u64;
    let mut hasher = ContentHash::hasher();
    let mut offset = 0;
    while offset < source.len() {
        let len = chunk_size.min(source.len() - offset);
        let chunk = source.read_at(offset, len as usize).await?;
        hasher.update(&chunk);
        offset += len;
    }
    Ok(hasher.finalize())
}
