//! Record collections over a data set byte region
//!
//! Everything the engines read goes through a [`Collection`]. A collection is
//! a typed window onto one section of a [`Source`]:
//!
//! - fixed-width records are addressed by index,
//! - variable-width records are addressed by byte offset and carry their own
//!   `u32` length prefix.
//!
//! Sources are either memory resident (an owned buffer or a memory map) or
//! file backed. File backed sources read through a bounded pool of file
//! handles, so a reader blocks only when every handle is busy. Collections
//! may keep an LRU cache of decoded records; the cache lock is held only for
//! the lookup and insert, never across I/O.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};

use crate::dataset::{read_u32_le, DataSetError, SectionInfo, SECTION_COUNT_SIZE};

// =============================================================================
// Source
// =============================================================================

/// The byte region a data set is read from.
pub enum Source {
    /// Entire data set copied into one owned buffer.
    Memory(Vec<u8>),
    /// Entire data set memory mapped; no file handle retained.
    Mapped(Mmap),
    /// Lazily read through a pool of file handles.
    File(FilePool),
}

impl Source {
    /// Open a file and map it into memory.
    pub fn map_file(path: &Path) -> Result<Self, DataSetError> {
        let file = open_file(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(Source::Mapped(mmap))
    }

    /// Open a file for lazy reads with at most `max_handles` open handles.
    pub fn open_file(path: &Path, max_handles: usize) -> Result<Self, DataSetError> {
        Ok(Source::File(FilePool::open(path, max_handles)?))
    }

    /// Total byte length of the region.
    pub fn len(&self) -> u64 {
        match self {
            Source::Memory(v) => v.len() as u64,
            Source::Mapped(m) => m.len() as u64,
            Source::File(pool) => pool.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole region as a slice, if memory resident.
    pub fn as_slice(&self) -> Option<&[u8]> {
        match self {
            Source::Memory(v) => Some(v.as_slice()),
            Source::Mapped(m) => Some(&m[..]),
            Source::File(_) => None,
        }
    }

    /// Read `len` bytes at `offset`. Borrowed for memory resident sources.
    pub fn read(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>, DataSetError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| DataSetError::CorruptData(format!("read overflow at {offset}")))?;
        if end > self.len() {
            return Err(DataSetError::CorruptData(format!(
                "read of {len} bytes at {offset} exceeds data set length {}",
                self.len()
            )));
        }
        match self {
            Source::Memory(v) => Ok(Cow::Borrowed(&v[offset as usize..end as usize])),
            Source::Mapped(m) => Ok(Cow::Borrowed(&m[offset as usize..end as usize])),
            Source::File(pool) => pool.read(offset, len).map(Cow::Owned),
        }
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, DataSetError> {
        let bytes = self.read(offset, 4)?;
        Ok(read_u32_le(&bytes, 0))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Source::Memory(_) => "memory",
            Source::Mapped(_) => "mapped",
            Source::File(_) => "file",
        }
    }
}

fn open_file(path: &Path) -> Result<File, DataSetError> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => DataSetError::FileNotFound(path.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => DataSetError::PermissionDenied(path.to_path_buf()),
        _ => DataSetError::Io(e),
    })
}

// =============================================================================
// File handle pool
// =============================================================================

struct PoolState {
    idle: Vec<File>,
    open: usize,
}

/// Bounded pool of read handles onto one file.
pub struct FilePool {
    path: PathBuf,
    len: u64,
    max_handles: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl FilePool {
    pub fn open(path: &Path, max_handles: usize) -> Result<Self, DataSetError> {
        if max_handles == 0 {
            return Err(DataSetError::InvalidCollectionConfig(
                "file handle pool needs at least one handle".to_string(),
            ));
        }
        let file = open_file(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            len,
            max_handles,
            state: Mutex::new(PoolState { idle: vec![file], open: 1 }),
            available: Condvar::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_handles(&self) -> usize {
        self.max_handles
    }

    fn acquire(&self) -> Result<PooledFile<'_>, DataSetError> {
        let mut state = self.state.lock();
        loop {
            if let Some(file) = state.idle.pop() {
                return Ok(PooledFile { pool: self, file: Some(file) });
            }
            if state.open < self.max_handles {
                state.open += 1;
                drop(state);
                return match open_file(&self.path) {
                    Ok(file) => Ok(PooledFile { pool: self, file: Some(file) }),
                    Err(e) => {
                        self.state.lock().open -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            self.available.wait(&mut state);
        }
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DataSetError> {
        let mut handle = self.acquire()?;
        let file = handle.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Handle borrowed from a [`FilePool`]; returned on drop.
struct PooledFile<'a> {
    pool: &'a FilePool,
    file: Option<File>,
}

impl PooledFile<'_> {
    fn file_mut(&mut self) -> Result<&mut File, DataSetError> {
        self.file.as_mut().ok_or_else(|| {
            DataSetError::InvalidCollectionConfig("file handle already returned to pool".to_string())
        })
    }
}

impl Drop for PooledFile<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.state.lock().idle.push(file);
            self.pool.available.notify_one();
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A record stored in a collection.
pub trait Record: Sized + Send + Sync + 'static {
    /// Byte size of fixed-width records; `None` for length-prefixed records.
    const FIXED_SIZE: Option<usize>;

    /// Decode from exactly the record's bytes.
    fn decode(bytes: &[u8]) -> Result<Self, DataSetError>;
}

impl Record for u32 {
    const FIXED_SIZE: Option<usize> = Some(4);

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        Ok(read_u32_le(bytes, 0))
    }
}

// =============================================================================
// Memory tracking
// =============================================================================

/// Accumulates an estimate of resident bytes while a data set is built.
#[derive(Debug, Default, Clone)]
pub struct MemoryTracker {
    bytes: usize,
    caches: usize,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bytes: usize) {
        self.bytes = self.bytes.saturating_add(bytes);
    }

    pub fn add_cache(&mut self, entries: usize, entry_size: usize) {
        self.caches = self.caches.saturating_add(entries.saturating_mul(entry_size));
    }

    /// Bytes allocated up front.
    pub fn resident(&self) -> usize {
        self.bytes
    }

    /// Upper bound for cache growth.
    pub fn cache_bound(&self) -> usize {
        self.caches
    }

    pub fn total(&self) -> usize {
        self.bytes.saturating_add(self.caches)
    }
}

// =============================================================================
// Collection
// =============================================================================

/// Typed view onto one section of a [`Source`].
pub struct Collection<T: Record> {
    source: Arc<Source>,
    start: u64,
    length: u64,
    count: u32,
    cache: Option<Mutex<LruCache<u32, Arc<T>>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Collection<T> {
    /// Create a collection over `section`, caching up to `cache_capacity`
    /// decoded records (0 disables the cache).
    pub fn new(
        source: Arc<Source>,
        section: &SectionInfo,
        cache_capacity: usize,
        tracker: &mut MemoryTracker,
    ) -> Result<Self, DataSetError> {
        if section.length < SECTION_COUNT_SIZE {
            return Err(DataSetError::CorruptData(format!(
                "section {:?} shorter than its count",
                section.id
            )));
        }
        let count = source.read_u32(section.offset as u64)?;
        let start = (section.offset + SECTION_COUNT_SIZE) as u64;
        let length = (section.length - SECTION_COUNT_SIZE) as u64;

        if let Some(size) = T::FIXED_SIZE {
            if (count as u64) * (size as u64) > length {
                return Err(DataSetError::CorruptData(format!(
                    "section {:?} holds {} bytes, {} records of {} bytes declared",
                    section.id, length, count, size
                )));
            }
        }

        let cache = NonZeroUsize::new(cache_capacity).map(|cap| {
            tracker.add_cache(cap.get(), T::FIXED_SIZE.unwrap_or(64) + 32);
            Mutex::new(LruCache::new(cap))
        });

        Ok(Self {
            source,
            start,
            length,
            count,
            cache,
            _marker: PhantomData,
        })
    }

    /// Number of records.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Bytes covered by the records.
    pub fn byte_length(&self) -> u64 {
        self.length
    }

    /// Fetch a record by index (fixed width) or byte offset (variable width).
    pub fn get(&self, key: u32) -> Result<Arc<T>, DataSetError> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(&key) {
                return Ok(Arc::clone(hit));
            }
        }

        let record = Arc::new(self.read(key)?);

        if let Some(cache) = &self.cache {
            cache.lock().put(key, Arc::clone(&record));
        }
        Ok(record)
    }

    fn read(&self, key: u32) -> Result<T, DataSetError> {
        match T::FIXED_SIZE {
            Some(size) => {
                if key >= self.count {
                    return Err(DataSetError::OutOfRange { index: key, count: self.count });
                }
                let bytes = self.source.read(self.start + key as u64 * size as u64, size)?;
                T::decode(&bytes)
            }
            None => {
                let offset = key as u64;
                if offset + 4 > self.length {
                    return Err(DataSetError::CorruptData(format!(
                        "record offset {offset} beyond section length {}",
                        self.length
                    )));
                }
                let len = self.source.read_u32(self.start + offset)? as u64;
                if len < 4 || offset + len > self.length {
                    return Err(DataSetError::CorruptData(format!(
                        "record at {offset} declares invalid length {len}"
                    )));
                }
                let bytes = self.source.read(self.start + offset, len as usize)?;
                T::decode(&bytes)
            }
        }
    }

    /// Binary search over a fixed-width, sorted collection.
    ///
    /// Mirrors `slice::binary_search_by`: `Ok(index)` when `f` returns
    /// `Equal`, otherwise `Err(insertion_point)`.
    pub fn binary_search_by<F>(&self, mut f: F) -> Result<Result<u32, u32>, DataSetError>
    where
        F: FnMut(&T) -> Result<Ordering, DataSetError>,
    {
        let mut lo = 0u32;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = self.get(mid)?;
            match f(&record)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Iterate variable-width records in storage order as `(offset, record)`.
    pub fn iter_offsets(&self) -> VariableIter<'_, T> {
        VariableIter { collection: self, next: 0, remaining: self.count }
    }
}

impl<T: Record + Copy> Collection<T> {
    /// Fetch a small copyable record without going through the cache.
    pub fn value(&self, key: u32) -> Result<T, DataSetError> {
        self.read(key)
    }
}

/// Sequential walk over a variable-width collection.
pub struct VariableIter<'a, T: Record> {
    collection: &'a Collection<T>,
    next: u64,
    remaining: u32,
}

impl<T: Record> Iterator for VariableIter<'_, T> {
    type Item = Result<(u32, Arc<T>), DataSetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.next >= self.collection.length {
            return None;
        }
        self.remaining -= 1;
        let offset = self.next as u32;
        let result = self
            .collection
            .source
            .read_u32(self.collection.start + self.next)
            .and_then(|len| {
                if len < 4 {
                    return Err(DataSetError::CorruptData(format!(
                        "record at {offset} declares invalid length {len}"
                    )));
                }
                self.next += len as u64;
                self.collection.get(offset)
            })
            .map(|record| (offset, record));
        if result.is_err() {
            self.remaining = 0;
        }
        Some(result)
    }
}

// =============================================================================
// String pool
// =============================================================================

/// Reads interned strings out of the string pool section.
pub struct StringPool {
    source: Arc<Source>,
    start: u64,
    length: u64,
    cache: Option<Mutex<LruCache<(u32, u32), Arc<str>>>>,
}

impl StringPool {
    pub fn new(
        source: Arc<Source>,
        section: &SectionInfo,
        cache_capacity: usize,
        tracker: &mut MemoryTracker,
    ) -> Result<Self, DataSetError> {
        if section.length < 4 {
            return Err(DataSetError::CorruptData("string pool too short".to_string()));
        }
        let declared = source.read_u32(section.offset as u64)? as u64;
        let available = (section.length - 4) as u64;
        if declared > available {
            return Err(DataSetError::CorruptData(format!(
                "string pool declares {declared} bytes, {available} present"
            )));
        }
        let cache = NonZeroUsize::new(cache_capacity).map(|cap| {
            tracker.add_cache(cap.get(), 48);
            Mutex::new(LruCache::new(cap))
        });
        Ok(Self {
            source,
            start: (section.offset + 4) as u64,
            length: declared,
            cache,
        })
    }

    pub fn get(&self, offset: u32, len: u32) -> Result<Arc<str>, DataSetError> {
        let key = (offset, len);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lock().get(&key) {
                return Ok(Arc::clone(hit));
            }
        }
        if offset as u64 + len as u64 > self.length {
            return Err(DataSetError::CorruptData(format!(
                "string {offset}+{len} beyond pool length {}",
                self.length
            )));
        }
        let bytes = self.source.read(self.start + offset as u64, len as usize)?;
        let s: Arc<str> = std::str::from_utf8(&bytes)
            .map_err(|_| DataSetError::CorruptData(format!("string at {offset} is not UTF-8")))?
            .into();
        if let Some(cache) = &self.cache {
            cache.lock().put(key, Arc::clone(&s));
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::SectionId;
    use std::io::Write;

    fn section(offset: usize, length: usize) -> SectionInfo {
        SectionInfo {
            id: SectionId::SignatureNodeOffsets,
            flags: 0,
            offset,
            length,
            uncompressed_length: 0,
            crc32: 0,
        }
    }

    fn u32_section(values: &[u32]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        data
    }

    #[test]
    fn fixed_collection_reads_by_index() {
        let data = u32_section(&[3, 5, 9, 12]);
        let len = data.len();
        let source = Arc::new(Source::Memory(data));
        let mut tracker = MemoryTracker::new();
        let coll: Collection<u32> = Collection::new(source, &section(0, len), 0, &mut tracker).unwrap();

        assert_eq!(coll.count(), 4);
        assert_eq!(*coll.get(2).unwrap(), 9);
        assert_eq!(coll.value(3).unwrap(), 12);
        assert!(matches!(coll.get(4), Err(DataSetError::OutOfRange { index: 4, count: 4 })));
    }

    #[test]
    fn fixed_collection_binary_search() {
        let data = u32_section(&[3, 5, 9, 12]);
        let len = data.len();
        let source = Arc::new(Source::Memory(data));
        let mut tracker = MemoryTracker::new();
        let coll: Collection<u32> = Collection::new(source, &section(0, len), 2, &mut tracker).unwrap();

        assert_eq!(coll.binary_search_by(|v| Ok(v.cmp(&9))).unwrap(), Ok(2));
        assert_eq!(coll.binary_search_by(|v| Ok(v.cmp(&6))).unwrap(), Err(2));
        assert_eq!(coll.binary_search_by(|v| Ok(v.cmp(&100))).unwrap(), Err(4));
        assert!(tracker.cache_bound() > 0);
    }

    #[test]
    fn truncated_fixed_section_is_corrupt() {
        let mut data = u32_section(&[1, 2, 3]);
        data.truncate(data.len() - 2);
        let len = data.len();
        let source = Arc::new(Source::Memory(data));
        let mut tracker = MemoryTracker::new();
        let result: Result<Collection<u32>, _> = Collection::new(source, &section(0, len), 0, &mut tracker);
        assert!(matches!(result, Err(DataSetError::CorruptData(_))));
    }

    #[test]
    fn file_source_reads_through_pool() {
        let data = u32_section(&[7, 8, 9]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let source = Arc::new(Source::open_file(file.path(), 2).unwrap());
        assert_eq!(source.kind(), "file");
        let mut tracker = MemoryTracker::new();
        let coll: Collection<u32> =
            Collection::new(Arc::clone(&source), &section(0, data.len()), 4, &mut tracker).unwrap();

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4).map(|_| s.spawn(|| *coll.get(1).unwrap())).collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), 8);
            }
        });
        assert!(source.read(10, 100).is_err());
    }

    #[test]
    fn missing_file_is_distinct_error() {
        let result = Source::open_file(Path::new("/definitely/not/here.dds"), 1);
        assert!(matches!(result, Err(DataSetError::FileNotFound(_))));
    }

    #[test]
    fn zero_handles_is_invalid_config() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = Source::open_file(file.path(), 0);
        assert!(matches!(result, Err(DataSetError::InvalidCollectionConfig(_))));
    }
}
