//! Caller-visible byte buffers used by read and write commands.
//!
//! A [`Buffer`] is a fixed-length byte container. It is created either by
//! copying caller bytes (the buffer owns a private snapshot) or lazily from a
//! length alone, and can hand out further handles onto the same storage with
//! [`Buffer::share`]. Commands and [`BufferSlice`]s hold the buffer while they
//! are alive; a held buffer cannot be resized.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Whether a buffer's storage is private or visible through other handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Only this handle references the storage.
    Owned,
    /// Storage is aliased by other [`Buffer`] handles; writes through any of
    /// them are visible to all.
    Shared,
}

enum Storage {
    /// Size-only buffer. Reads as zero until first written.
    Lazy(usize),
    Bytes(Vec<u8>),
}

impl Storage {
    fn len(&self) -> usize {
        match self {
            Storage::Lazy(len) => *len,
            Storage::Bytes(bytes) => bytes.len(),
        }
    }

    fn materialize(&mut self) -> &mut Vec<u8> {
        if let Storage::Lazy(len) = *self {
            *self = Storage::Bytes(vec![0; len]);
        }
        match self {
            Storage::Bytes(bytes) => bytes,
            Storage::Lazy(_) => unreachable!("storage materialized above"),
        }
    }
}

struct Inner {
    storage: Mutex<Storage>,
    shared: AtomicBool,
    holds: AtomicUsize,
}

/// Fixed-length byte buffer with explicit ownership and hold tracking.
pub struct Buffer {
    inner: Arc<Inner>,
}

impl Buffer {
    fn with_storage(storage: Storage) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage: Mutex::new(storage),
                shared: AtomicBool::new(false),
                holds: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a size-only buffer. No memory is allocated until the buffer is
    /// first written; until then it reads as zero.
    pub fn new(len: usize) -> Self {
        Self::with_storage(Storage::Lazy(len))
    }

    /// Create a buffer holding a private copy of `data`. Later changes to
    /// `data` are not visible through the buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::with_storage(Storage::Bytes(data.to_vec()))
    }

    /// Create a buffer taking ownership of `data` without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::with_storage(Storage::Bytes(data))
    }

    /// Return another handle aliasing this buffer's storage.
    ///
    /// Both handles report [`Ownership::Shared`] from then on.
    pub fn share(&self) -> Buffer {
        self.inner.shared.store(true, Ordering::Release);
        Buffer {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn ownership(&self) -> Ownership {
        if self.inner.shared.load(Ordering::Acquire) {
            Ownership::Shared
        } else {
            Ownership::Owned
        }
    }

    pub fn len(&self) -> usize {
        self.inner.storage.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether backing memory has been allocated.
    pub fn is_materialized(&self) -> bool {
        matches!(*self.inner.storage.lock(), Storage::Bytes(_))
    }

    /// Number of commands and slices currently holding the buffer.
    pub fn holds(&self) -> usize {
        self.inner.holds.load(Ordering::Acquire)
    }

    /// Change the buffer length. New bytes read as zero.
    ///
    /// Fails with [`Error::BufferInUse`] while any command or slice holds the
    /// buffer.
    pub fn resize(&self, new_len: usize) -> Result<()> {
        let mut storage = self.inner.storage.lock();
        let holds = self.holds();
        if holds > 0 {
            return Err(Error::BufferInUse { holds });
        }
        match &mut *storage {
            Storage::Lazy(len) => *len = new_len,
            Storage::Bytes(bytes) => bytes.resize(new_len, 0),
        }
        Ok(())
    }

    /// Copy the full contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        match &*self.inner.storage.lock() {
            Storage::Lazy(len) => vec![0; *len],
            Storage::Bytes(bytes) => bytes.clone(),
        }
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let storage = self.inner.storage.lock();
        let range = checked_range(offset, out.len(), storage.len())?;
        match &*storage {
            Storage::Lazy(_) => out.fill(0),
            Storage::Bytes(bytes) => out.copy_from_slice(&bytes[range]),
        }
        Ok(())
    }

    /// Copy `data` into the buffer at `offset`, materializing it if needed.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut storage = self.inner.storage.lock();
        let range = checked_range(offset, data.len(), storage.len())?;
        storage.materialize()[range].copy_from_slice(data);
        Ok(())
    }

    /// Set every byte to `value`.
    pub fn fill(&self, value: u8) {
        let mut storage = self.inner.storage.lock();
        if value == 0 {
            if let Storage::Lazy(_) = *storage {
                return;
            }
        }
        storage.materialize().fill(value);
    }

    /// Whether `length` bytes starting at `offset` are all zero.
    ///
    /// `length` defaults to the rest of the buffer. The part of the range
    /// lying past the end of the buffer counts as zero, so ranges entirely
    /// beyond the end report true. Never allocates.
    pub fn is_zero(&self, offset: usize, length: Option<usize>) -> bool {
        let storage = self.inner.storage.lock();
        let bytes = match &*storage {
            Storage::Lazy(_) => return true,
            Storage::Bytes(bytes) => bytes,
        };
        if offset >= bytes.len() {
            return true;
        }
        let end = match length {
            Some(length) => offset.saturating_add(length).min(bytes.len()),
            None => bytes.len(),
        };
        bytes[offset..end].iter().all(|&b| b == 0)
    }

    /// Hold a sub-range of the buffer. The buffer cannot be resized until the
    /// returned slice is dropped.
    pub fn slice(&self, offset: usize, len: usize) -> Result<BufferSlice> {
        let storage = self.inner.storage.lock();
        let range = checked_range(offset, len, storage.len())?;
        drop(storage);
        Ok(BufferSlice {
            hold: self.hold(),
            range,
        })
    }

    /// Hold the whole buffer for the lifetime of a command.
    pub(crate) fn hold(&self) -> BufferHold {
        self.inner.holds.fetch_add(1, Ordering::AcqRel);
        BufferHold {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("ownership", &self.ownership())
            .field("materialized", &self.is_materialized())
            .field("holds", &self.holds())
            .finish()
    }
}

fn checked_range(offset: usize, len: usize, buf_len: usize) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= buf_len => Ok(offset..end),
        _ => Err(Error::invalid_argument(format!(
            "range {offset}+{len} exceeds buffer length {buf_len}"
        ))),
    }
}

/// A counted reference keeping a buffer's length frozen.
pub(crate) struct BufferHold {
    inner: Arc<Inner>,
}

impl BufferHold {
    /// Apply server data at `offset`.
    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut storage = self.inner.storage.lock();
        let range = checked_range(offset, data.len(), storage.len())?;
        storage.materialize()[range].copy_from_slice(data);
        Ok(())
    }

    /// Zero-fill `len` bytes at `offset`. A lazy buffer stays lazy.
    pub(crate) fn zero(&self, offset: usize, len: usize) -> Result<()> {
        let mut storage = self.inner.storage.lock();
        let range = checked_range(offset, len, storage.len())?;
        if let Storage::Bytes(bytes) = &mut *storage {
            bytes[range].fill(0);
        }
        Ok(())
    }

    /// Snapshot the contents for framing a write request.
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        match &*self.inner.storage.lock() {
            Storage::Lazy(len) => vec![0; *len],
            Storage::Bytes(bytes) => bytes.clone(),
        }
    }
}

impl Drop for BufferHold {
    fn drop(&mut self) {
        self.inner.holds.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A held view of part of a [`Buffer`].
pub struct BufferSlice {
    hold: BufferHold,
    range: Range<usize>,
}

impl BufferSlice {
    pub fn offset(&self) -> usize {
        self.range.start
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        match &*self.hold.inner.storage.lock() {
            Storage::Lazy(_) => vec![0; self.range.len()],
            Storage::Bytes(bytes) => bytes[self.range.clone()].to_vec(),
        }
    }

    pub fn is_zero(&self) -> bool {
        match &*self.hold.inner.storage.lock() {
            Storage::Lazy(_) => true,
            Storage::Bytes(bytes) => bytes[self.range.clone()].iter().all(|&b| b == 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_is_a_snapshot() {
        let mut source = vec![1u8, 2, 3, 4];
        let buf = Buffer::from_slice(&source);
        source[0] = 9;
        assert_eq!(buf.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(buf.ownership(), Ownership::Owned);
    }

    #[test]
    fn shared_handles_alias_storage() {
        let buf = Buffer::from_vec(vec![0; 8]);
        let alias = buf.share();
        alias.write_at(2, &[7, 7]).unwrap();
        assert_eq!(buf.to_vec(), vec![0, 0, 7, 7, 0, 0, 0, 0]);
        buf.write_at(0, &[1]).unwrap();
        assert_eq!(alias.to_vec()[0], 1);
        assert_eq!(buf.ownership(), Ownership::Shared);
        assert_eq!(alias.ownership(), Ownership::Shared);
    }

    #[test]
    fn lazy_buffer_reads_zero_until_written() {
        let buf = Buffer::new(4096);
        assert!(!buf.is_materialized());
        assert!(buf.is_zero(0, None));
        let mut out = [0xffu8; 16];
        buf.read_at(100, &mut out).unwrap();
        assert_eq!(out, [0u8; 16]);
        assert!(!buf.is_materialized());

        buf.write_at(10, &[1]).unwrap();
        assert!(buf.is_materialized());
        assert!(!buf.is_zero(0, None));
    }

    #[test]
    fn zero_fill_keeps_lazy_buffer_lazy() {
        let buf = Buffer::new(64);
        buf.fill(0);
        assert!(!buf.is_materialized());
        buf.fill(0xaa);
        assert!(buf.is_materialized());
        assert!(buf.to_vec().iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn is_zero_over_sub_ranges() {
        let buf = Buffer::from_vec(vec![0; 1024]);
        assert!(buf.is_zero(0, None));
        for offset in (0..1024).step_by(97) {
            assert!(buf.is_zero(offset, Some(13)));
        }

        buf.write_at(500, &[1]).unwrap();
        assert!(!buf.is_zero(500, Some(1)));
        assert!(!buf.is_zero(0, None));
        assert!(buf.is_zero(0, Some(500)));
        assert!(buf.is_zero(501, None));
        assert!(buf.is_zero(499, Some(1)));
    }

    #[test]
    fn is_zero_past_the_end_is_true() {
        let buf = Buffer::from_slice(&[0, 0, 0, 1]);
        assert!(buf.is_zero(4, Some(100)));
        assert!(buf.is_zero(1000, None));
        assert!(buf.is_zero(0, Some(3)));
        assert!(!buf.is_zero(2, Some(100)));
        assert!(buf.is_zero(0, Some(0)));
    }

    #[test]
    fn resize_blocked_while_held() {
        let buf = Buffer::new(16);
        let slice = buf.slice(4, 4).unwrap();
        assert_eq!(buf.holds(), 1);
        assert!(matches!(buf.resize(32), Err(Error::BufferInUse { holds: 1 })));

        let hold = buf.hold();
        assert!(matches!(buf.resize(32), Err(Error::BufferInUse { holds: 2 })));
        drop(hold);
        drop(slice);

        buf.resize(32).unwrap();
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn resize_extends_with_zeroes() {
        let buf = Buffer::from_slice(&[1, 2]);
        buf.resize(4).unwrap();
        assert_eq!(buf.to_vec(), vec![1, 2, 0, 0]);
        buf.resize(1).unwrap();
        assert_eq!(buf.to_vec(), vec![1]);
    }

    #[test]
    fn slice_views_current_contents() {
        let buf = Buffer::from_vec((0u8..16).collect());
        let slice = buf.slice(8, 4).unwrap();
        assert_eq!(slice.to_vec(), vec![8, 9, 10, 11]);
        buf.write_at(8, &[0, 0, 0, 0]).unwrap();
        assert!(slice.is_zero());
        assert!(buf.slice(14, 4).is_err());
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let buf = Buffer::new(8);
        assert!(buf.write_at(6, &[0; 4]).is_err());
        let mut out = [0u8; 9];
        assert!(buf.read_at(0, &mut out).is_err());
        assert!(buf.read_at(usize::MAX, &mut [0u8; 2]).is_err());
    }

    #[test]
    fn hold_writes_and_zeroes() {
        let buf = Buffer::from_vec(vec![0xff; 8]);
        let hold = buf.hold();
        hold.zero(2, 4).unwrap();
        hold.write(0, &[1]).unwrap();
        assert_eq!(buf.to_vec(), vec![1, 0xff, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(hold.snapshot(), buf.to_vec());
        assert!(hold.write(7, &[0, 0]).is_err());
    }
}
