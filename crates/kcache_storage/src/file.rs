//! Memory-mapped, append-only segment files.
//!
//! A [`SegmentFile`] is created at a fixed maximum size and filled from the
//! front. Readers see bytes up to the current capacity; the single writer
//! appends past it and may overwrite bytes it has already written (flags,
//! acknowledge values, descendant links).
//!
//! ```text
//! 0                capacity                 max_capacity
//! +----------------+------------------------+
//! | written bytes  |   reserved, zeroed     |
//! +----------------+------------------------+
//! ```
//!
//! `freeze()` clamps the maximum to the capacity and truncates the file, so a
//! frozen file on disk is exactly as long as its contents.

use crate::error::{StorageError, StorageResult};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A memory-mapped file with an append cursor.
///
/// All multi-byte values are big-endian.
///
/// # Thread Safety
///
/// One writer and any number of readers may share a file. Appended bytes are
/// published by a release store of the capacity, so a reader that observes a
/// capacity also observes every byte below it.
#[derive(Debug)]
pub struct SegmentFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
    map: RwLock<Option<MmapMut>>,
    capacity: AtomicU32,
    max_capacity: AtomicU32,
    mark: AtomicU32,
    frozen: AtomicBool,
}

impl SegmentFile {
    /// Creates a new appendable file of `max_capacity` bytes, replacing any
    /// file already at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, sized or mapped.
    pub fn create(path: &Path, max_capacity: u32) -> StorageResult<Self> {
        remove_if_exists(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(u64::from(max_capacity))?;

        let map = map_file(&file, max_capacity)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            map: RwLock::new(map),
            capacity: AtomicU32::new(0),
            max_capacity: AtomicU32::new(max_capacity),
            mark: AtomicU32::new(0),
            frozen: AtomicBool::new(false),
        })
    }

    /// Opens an existing file as frozen, with capacity equal to its length.
    ///
    /// The mapping stays writable so that already-written bytes can still be
    /// patched in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, or if it is
    /// larger than a segment file can address.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let len = u32::try_from(len).map_err(|_| {
            StorageError::Corrupted(format!(
                "{} is {len} bytes, larger than a segment file",
                path.display()
            ))
        })?;

        let map = map_file(&file, len)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            map: RwLock::new(map),
            capacity: AtomicU32::new(len),
            max_capacity: AtomicU32::new(len),
            mark: AtomicU32::new(len),
            frozen: AtomicBool::new(true),
        })
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of bytes written.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Returns the maximum number of bytes this file can hold.
    #[must_use]
    pub fn max_capacity(&self) -> u32 {
        self.max_capacity.load(Ordering::Acquire)
    }

    /// Returns the number of bytes that can still be appended.
    #[must_use]
    pub fn available(&self) -> u32 {
        self.max_capacity().saturating_sub(self.capacity())
    }

    /// Returns `true` if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capacity() == 0
    }

    /// Returns `true` once the file has been frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Records the current capacity as the position of the next record.
    pub fn mark(&self) {
        self.mark.store(self.capacity(), Ordering::Release);
    }

    /// Returns the capacity recorded by the last [`mark`](Self::mark).
    #[must_use]
    pub fn mark_value(&self) -> u32 {
        self.mark.load(Ordering::Acquire)
    }

    /// Appends raw bytes.
    ///
    /// Returns `false` without writing anything if fewer than `bytes.len()`
    /// bytes are available.
    pub fn append_bytes(&self, bytes: &[u8]) -> bool {
        let mut guard = self.map.write();
        let capacity = self.capacity.load(Ordering::Acquire);
        let Some(end) = end_of(capacity, bytes.len()) else {
            return false;
        };
        if end > self.max_capacity() {
            return false;
        }
        if let Some(map) = guard.as_mut() {
            map[capacity as usize..end as usize].copy_from_slice(bytes);
        } else if !bytes.is_empty() {
            return false;
        }
        self.capacity.store(end, Ordering::Release);
        true
    }

    /// Appends a big-endian `i64`.
    pub fn append_long(&self, value: i64) -> bool {
        self.append_bytes(&value.to_be_bytes())
    }

    /// Appends a big-endian `i32`.
    pub fn append_int(&self, value: i32) -> bool {
        self.append_bytes(&value.to_be_bytes())
    }

    /// Moves the capacity forward to `position`, zero-filling the gap.
    ///
    /// Used to reserve space that will be written in place later. Returns
    /// `false` if `position` is behind the capacity or past the maximum.
    pub fn advance(&self, position: u32) -> bool {
        let mut guard = self.map.write();
        let capacity = self.capacity.load(Ordering::Acquire);
        if position < capacity || position > self.max_capacity() {
            return false;
        }
        if let Some(map) = guard.as_mut() {
            map[capacity as usize..position as usize].fill(0);
        }
        self.capacity.store(position, Ordering::Release);
        true
    }

    /// Overwrites already-written bytes at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WritePastEnd`] if the range extends beyond the
    /// capacity.
    pub fn write_bytes(&self, position: u32, bytes: &[u8]) -> StorageResult<()> {
        let mut guard = self.map.write();
        let capacity = self.capacity();
        let past_end = || StorageError::WritePastEnd {
            position,
            len: bytes.len(),
            capacity,
        };
        let end = end_of(position, bytes.len()).ok_or_else(past_end)?;
        if end > capacity {
            return Err(past_end());
        }
        if let Some(map) = guard.as_mut() {
            map[position as usize..end as usize].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Overwrites a big-endian `i64` at `position`.
    ///
    /// # Errors
    ///
    /// See [`write_bytes`](Self::write_bytes).
    pub fn write_long(&self, position: u32, value: i64) -> StorageResult<()> {
        self.write_bytes(position, &value.to_be_bytes())
    }

    /// Overwrites a big-endian `i32` at `position`.
    ///
    /// # Errors
    ///
    /// See [`write_bytes`](Self::write_bytes).
    pub fn write_int(&self, position: u32, value: i32) -> StorageResult<()> {
        self.write_bytes(position, &value.to_be_bytes())
    }

    /// Calls `visitor` with a view of the written bytes from `position` to
    /// the current capacity. The view is empty if `position` is at or past
    /// the capacity.
    pub fn read_bytes<T>(&self, position: u32, visitor: impl FnOnce(&[u8]) -> T) -> T {
        let guard = self.map.read();
        let capacity = self.capacity() as usize;
        let start = (position as usize).min(capacity);
        match guard.as_ref() {
            Some(map) => visitor(&map[start..capacity]),
            None => visitor(&[]),
        }
    }

    /// Reads a big-endian `i64` at `position`, if it has been written.
    #[must_use]
    pub fn read_long(&self, position: u32) -> Option<i64> {
        self.read_bytes(position, |bytes| {
            bytes
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .map(i64::from_be_bytes)
        })
    }

    /// Reads a big-endian `i32` at `position`, if it has been written.
    #[must_use]
    pub fn read_int(&self, position: u32) -> Option<i32> {
        self.read_bytes(position, |bytes| {
            bytes
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(i32::from_be_bytes)
        })
    }

    /// Flushes written bytes to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> StorageResult<()> {
        let guard = self.map.read();
        if let Some(map) = guard.as_ref() {
            let capacity = self.capacity() as usize;
            if capacity > 0 {
                map.flush_range(0, capacity)?;
            }
        }
        Ok(())
    }

    /// Stops accepting appends and truncates the file to its capacity.
    ///
    /// Freezing an already frozen file does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or truncation fails.
    pub fn freeze(&self) -> StorageResult<()> {
        self.freeze_with(|file, len| {
            file.set_len(len)?;
            file.sync_all()
        })
    }

    /// Freezes with `truncate` fixing the file length. The file stays
    /// appendable unless every step succeeds.
    fn freeze_with(&self, truncate: impl FnOnce(&File, u64) -> io::Result<()>) -> StorageResult<()> {
        if self.is_frozen() {
            return Ok(());
        }

        self.flush()?;
        let capacity = self.capacity();
        {
            let mut file = self.file.lock();
            if let Some(handle) = file.as_ref() {
                truncate(handle, u64::from(capacity))?;
            }
            file.take();
        }
        self.max_capacity.store(capacity, Ordering::Release);
        self.frozen.store(true, Ordering::Release);

        tracing::trace!(path = %self.path.display(), capacity, "froze segment file");
        Ok(())
    }

    /// Removes the file from disk. Existing mappings stay readable.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn delete(&self) -> StorageResult<()> {
        self.file.lock().take();
        remove_if_exists(&self.path)
    }
}

fn end_of(position: u32, len: usize) -> Option<u32> {
    u32::try_from(len).ok().and_then(|len| position.checked_add(len))
}

fn map_file(file: &File, len: u32) -> StorageResult<Option<MmapMut>> {
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: the file is owned by this process and never resized below the
    // mapped length while readers can observe bytes past the capacity.
    #[allow(unsafe_code)]
    let map = unsafe { MmapMut::map_mut(file)? };
    Ok(Some(map))
}

pub(crate) fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_is_empty() {
        let dir = tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.log"), 64).unwrap();

        assert!(file.is_empty());
        assert_eq!(file.capacity(), 0);
        assert_eq!(file.available(), 64);
        assert_eq!(
            std::fs::metadata(dir.path().join("0.log")).unwrap().len(),
            64
        );
    }

    #[test]
    fn append_and_read() {
        let dir = tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.log"), 64).unwrap();

        file.mark();
        assert!(file.append_long(42));
        assert_eq!(file.mark_value(), 0);

        file.mark();
        assert!(file.append_int(-7));
        assert!(file.append_bytes(b"abc"));
        assert_eq!(file.mark_value(), 8);

        assert_eq!(file.capacity(), 15);
        assert_eq!(file.read_long(0), Some(42));
        assert_eq!(file.read_int(8), Some(-7));
        file.read_bytes(12, |bytes| assert_eq!(bytes, b"abc"));
    }

    #[test]
    fn append_without_room_fails() {
        let dir = tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.log"), 10).unwrap();

        assert!(file.append_long(1));
        assert!(!file.append_long(2));
        assert_eq!(file.capacity(), 8);
        assert!(file.append_bytes(b"xy"));
        assert_eq!(file.available(), 0);
    }

    #[test]
    fn failed_freeze_stays_appendable() {
        let dir = tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.log"), 64).unwrap();
        file.append_long(1);

        let err = file.freeze_with(|_, _| Err(io::Error::other("disk full")));
        assert!(matches!(err, Err(StorageError::Io(_))));
        assert!(!file.is_frozen());
        assert_eq!(file.max_capacity(), 64);
        assert!(file.append_long(2));

        file.freeze().unwrap();
        assert!(file.is_frozen());
        assert_eq!(file.max_capacity(), 16);
        assert_eq!(std::fs::metadata(dir.path().join("0.log")).unwrap().len(), 16);
    }

    #[test]
    fn reads_stop_at_capacity() {
        let dir = tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.log"), 64).unwrap();
        file.append_int(1);

        assert_eq!(file.read_long(0), None);
        file.read_bytes(100, |bytes| assert!(bytes.is_empty()));
    }

    #[test]
    fn write_in_place() {
        let dir = tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.log"), 64).unwrap();
        file.append_long(1);
        file.append_int(2);

        file.write_long(0, 99).unwrap();
        file.write_int(8, 3).unwrap();
        assert_eq!(file.read_long(0), Some(99));
        assert_eq!(file.read_int(8), Some(3));

        let result = file.write_long(8, 1);
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn advance_reserves_zeroed_space() {
        let dir = tempdir().unwrap();
        let file = SegmentFile::create(&dir.path().join("0.log"), 64).unwrap();
        file.append_int(5);

        assert!(file.advance(20));
        assert_eq!(file.capacity(), 20);
        file.read_bytes(4, |bytes| assert!(bytes.iter().all(|b| *b == 0)));
        assert!(!file.advance(10));
        assert!(!file.advance(65));
    }

    #[test]
    fn freeze_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let file = SegmentFile::create(&path, 64).unwrap();
        file.append_bytes(b"frozen");

        file.freeze().unwrap();
        assert!(file.is_frozen());
        assert_eq!(file.available(), 0);
        assert!(!file.append_int(1));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 6);

        // still patchable in place
        file.write_bytes(0, b"F").unwrap();
        file.read_bytes(0, |bytes| assert_eq!(bytes, b"Frozen"));
    }

    #[test]
    fn open_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        {
            let file = SegmentFile::create(&path, 64).unwrap();
            file.append_long(7);
            file.freeze().unwrap();
        }

        let file = SegmentFile::open(&path).unwrap();
        assert!(file.is_frozen());
        assert_eq!(file.capacity(), 8);
        assert_eq!(file.read_long(0), Some(7));
    }

    #[test]
    fn open_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.delta");
        SegmentFile::create(&path, 16).unwrap().freeze().unwrap();

        let file = SegmentFile::open(&path).unwrap();
        assert!(file.is_empty());
        assert!(!file.append_int(1));
        file.read_bytes(0, |bytes| assert!(bytes.is_empty()));
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let file = SegmentFile::create(&path, 16).unwrap();
        file.append_int(9);

        file.delete().unwrap();
        assert!(!path.exists());
        assert_eq!(file.read_int(0), Some(9));
        file.delete().unwrap();
    }
}
