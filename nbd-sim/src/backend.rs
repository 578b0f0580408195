//! Export storage behind the simulated server.
//!
//! Backends compose as middleware: [`FaultyBackend`] wraps another backend
//! and fails selected requests, the way a fault-injection layer would wrap
//! real storage.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;

use nbd_client::protocol::{
    CONTEXT_BASE_ALLOCATION, NBD_EINVAL, NBD_EIO, NBD_STATE_HOLE, NBD_STATE_ZERO,
};

/// Allocation granularity of [`MemoryBackend`].
pub const BLOCK_BYTES: u64 = 4096;

#[derive(Debug, Error)]
#[error("{message} (nbd error {errno})")]
pub struct BackendError {
    /// NBD error code sent to the client.
    pub errno: u32,
    pub message: String,
}

impl BackendError {
    pub fn new(errno: u32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A `(length, status)` run reported by block status.
pub type StatusRun = (u32, u32);

#[async_trait]
pub trait Backend: Send + Sync {
    async fn read(&self, offset: u64, length: usize) -> BackendResult<Bytes>;

    async fn write(&self, offset: u64, data: Bytes) -> BackendResult<()>;

    /// Discard a range. Discarded bytes read back as zero.
    async fn trim(&self, offset: u64, length: u64) -> BackendResult<()>;

    async fn write_zeroes(&self, offset: u64, length: u64) -> BackendResult<()>;

    async fn flush(&self) -> BackendResult<()>;

    async fn cache(&self, _offset: u64, _length: u64) -> BackendResult<()> {
        Ok(())
    }

    /// Status runs for `context` covering `[offset, offset + length)`, the
    /// first run starting exactly at `offset`. The runs may extend past the
    /// end of the range.
    async fn extents(&self, context: &str, offset: u64, length: u64)
    -> BackendResult<Vec<StatusRun>>;
}

/// Sparse in-memory storage in [`BLOCK_BYTES`] blocks. Blocks never
/// written (or fully trimmed) are holes.
pub struct MemoryBackend {
    size: u64,
    blocks: Mutex<BTreeMap<u64, Vec<u8>>>,
    /// Fixed `base:allocation` layout, reported instead of the real one.
    layout: Option<Vec<(u64, u32)>>,
}

impl MemoryBackend {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            blocks: Mutex::new(BTreeMap::new()),
            layout: None,
        }
    }

    /// Report a fixed `base:allocation` map of `(length, status)` runs
    /// starting at offset 0.
    pub fn with_layout(mut self, layout: Vec<(u64, u32)>) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, offset: u64, length: u64) -> BackendResult<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BackendError::new(
                NBD_EINVAL,
                format!("range {offset}+{length} beyond export size {}", self.size),
            )),
        }
    }

    /// Apply `f` to each block piece of the range: block index, range within
    /// the block, and range within the request.
    fn for_each_piece(offset: u64, length: u64, mut f: impl FnMut(u64, Range<usize>, Range<usize>)) {
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let index = pos / BLOCK_BYTES;
            let in_block = (pos % BLOCK_BYTES) as usize;
            let take = (BLOCK_BYTES as usize - in_block).min((end - pos) as usize);
            let at = (pos - offset) as usize;
            f(index, in_block..in_block + take, at..at + take);
            pos += take as u64;
        }
    }

    fn zero_range(&self, offset: u64, length: u64) {
        let mut blocks = self.blocks.lock();
        Self::for_each_piece(offset, length, |index, piece, _| {
            if piece.len() == BLOCK_BYTES as usize {
                blocks.remove(&index);
            } else if let Some(block) = blocks.get_mut(&index) {
                block[piece].fill(0);
            }
        });
    }

    fn allocation_runs(&self, offset: u64, length: u64) -> Vec<StatusRun> {
        let mut runs: Vec<StatusRun> = Vec::new();
        let blocks = self.blocks.lock();
        Self::for_each_piece(offset, length, |index, piece, _| {
            let status = if blocks.contains_key(&index) {
                0
            } else {
                NBD_STATE_HOLE | NBD_STATE_ZERO
            };
            let len = piece.len() as u32;
            match runs.last_mut() {
                Some((run, last)) if *last == status => *run += len,
                _ => runs.push((len, status)),
            }
        });
        runs
    }

    fn layout_runs(layout: &[(u64, u32)], offset: u64, length: u64) -> Vec<StatusRun> {
        let end = offset + length;
        let mut runs = Vec::new();
        let mut start = 0u64;
        for &(len, status) in layout {
            let stop = start + len;
            if stop > offset && start < end {
                let from = start.max(offset);
                runs.push(((stop - from) as u32, status));
            }
            start = stop;
        }
        runs
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn read(&self, offset: u64, length: usize) -> BackendResult<Bytes> {
        self.check_range(offset, length as u64)?;
        let mut out = BytesMut::zeroed(length);
        let blocks = self.blocks.lock();
        Self::for_each_piece(offset, length as u64, |index, piece, at| {
            if let Some(block) = blocks.get(&index) {
                out[at].copy_from_slice(&block[piece]);
            }
        });
        Ok(out.freeze())
    }

    async fn write(&self, offset: u64, data: Bytes) -> BackendResult<()> {
        self.check_range(offset, data.len() as u64)?;
        let mut blocks = self.blocks.lock();
        Self::for_each_piece(offset, data.len() as u64, |index, piece, at| {
            blocks
                .entry(index)
                .or_insert_with(|| vec![0u8; BLOCK_BYTES as usize])[piece]
                .copy_from_slice(&data[at]);
        });
        Ok(())
    }

    async fn trim(&self, offset: u64, length: u64) -> BackendResult<()> {
        self.check_range(offset, length)?;
        self.zero_range(offset, length);
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, length: u64) -> BackendResult<()> {
        self.check_range(offset, length)?;
        self.zero_range(offset, length);
        Ok(())
    }

    async fn flush(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn extents(
        &self,
        context: &str,
        offset: u64,
        length: u64,
    ) -> BackendResult<Vec<StatusRun>> {
        self.check_range(offset, length)?;
        if context != CONTEXT_BASE_ALLOCATION {
            let length = u32::try_from(length).unwrap_or(u32::MAX);
            return Ok(vec![(length, 0)]);
        }
        Ok(match &self.layout {
            Some(layout) => Self::layout_runs(layout, offset, length),
            None => self.allocation_runs(offset, length),
        })
    }
}

/// Fails reads and writes that touch `range` with `errno`.
pub struct FaultyBackend {
    inner: Arc<dyn Backend>,
    range: Range<u64>,
    errno: u32,
}

impl FaultyBackend {
    pub fn new(inner: Arc<dyn Backend>, range: Range<u64>) -> Self {
        Self {
            inner,
            range,
            errno: NBD_EIO,
        }
    }

    pub fn with_errno(mut self, errno: u32) -> Self {
        self.errno = errno;
        self
    }

    fn check(&self, offset: u64, length: u64) -> BackendResult<()> {
        if offset < self.range.end && offset + length > self.range.start {
            return Err(BackendError::new(
                self.errno,
                format!("injected failure at offset {}", offset.max(self.range.start)),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FaultyBackend {
    async fn read(&self, offset: u64, length: usize) -> BackendResult<Bytes> {
        self.check(offset, length as u64)?;
        self.inner.read(offset, length).await
    }

    async fn write(&self, offset: u64, data: Bytes) -> BackendResult<()> {
        self.check(offset, data.len() as u64)?;
        self.inner.write(offset, data).await
    }

    async fn trim(&self, offset: u64, length: u64) -> BackendResult<()> {
        self.inner.trim(offset, length).await
    }

    async fn write_zeroes(&self, offset: u64, length: u64) -> BackendResult<()> {
        self.inner.write_zeroes(offset, length).await
    }

    async fn flush(&self) -> BackendResult<()> {
        self.inner.flush().await
    }

    async fn extents(
        &self,
        context: &str,
        offset: u64,
        length: u64,
    ) -> BackendResult<Vec<StatusRun>> {
        self.inner.extents(context, offset, length).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_across_blocks() {
        let backend = MemoryBackend::new(4 * BLOCK_BYTES);
        let pattern = Bytes::from(vec![0xAB; 6000]);
        backend.write(1000, pattern.clone()).await.unwrap();

        assert_eq!(backend.read(1000, 6000).await.unwrap(), pattern);
        assert!(backend.read(0, 1000).await.unwrap().iter().all(|&b| b == 0));
        assert!(backend.read(BLOCK_BYTES * 3, 100).await.is_ok());
        assert!(backend.read(4 * BLOCK_BYTES - 10, 20).await.is_err());
    }

    #[tokio::test]
    async fn trim_punches_whole_blocks() {
        let backend = MemoryBackend::new(4 * BLOCK_BYTES);
        backend
            .write(0, Bytes::from(vec![1u8; 3 * BLOCK_BYTES as usize]))
            .await
            .unwrap();
        backend.trim(100, 2 * BLOCK_BYTES).await.unwrap();

        let runs = backend
            .extents(CONTEXT_BASE_ALLOCATION, 0, 4 * BLOCK_BYTES)
            .await
            .unwrap();
        assert_eq!(
            runs,
            vec![
                (BLOCK_BYTES as u32, 0),
                (BLOCK_BYTES as u32, NBD_STATE_HOLE | NBD_STATE_ZERO),
                (BLOCK_BYTES as u32, 0),
                (BLOCK_BYTES as u32, NBD_STATE_HOLE | NBD_STATE_ZERO),
            ]
        );
        let data = backend.read(0, 3 * BLOCK_BYTES as usize).await.unwrap();
        assert!(data[..100].iter().all(|&b| b == 1));
        assert!(data[100..100 + 2 * BLOCK_BYTES as usize].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn fixed_layout_is_clipped_to_query_start() {
        let backend = MemoryBackend::new(65536).with_layout(vec![
            (8192, 0),
            (8192, 1),
            (16384, 3),
            (16384, 2),
            (16384, 0),
        ]);
        let runs = backend
            .extents(CONTEXT_BASE_ALLOCATION, 32256, 1024)
            .await
            .unwrap();
        assert_eq!(runs, vec![(512, 3), (16384, 2)]);
    }

    #[tokio::test]
    async fn faulty_backend_fails_overlapping_reads() {
        let inner: Arc<dyn Backend> = Arc::new(MemoryBackend::new(BLOCK_BYTES * 2));
        let backend = FaultyBackend::new(inner, 4096..4608);
        assert!(backend.read(0, 4096).await.is_ok());
        let err = backend.read(4000, 200).await.unwrap_err();
        assert_eq!(err.errno, NBD_EIO);
        assert!(err.message.contains("4096"));
    }
}
