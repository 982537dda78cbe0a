//! In-memory storage backend.
//!
//! [`MemoryStorage`] is a growable byte buffer. [`MemoryFolder`] hands out
//! storages by name and keeps their buffers, so closing and reloading a name
//! sees the same bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use bytes::Bytes;

use super::{RandomAccess, Stat};
use crate::capability::CapabilitySet;
use crate::error::{RamuxError, Result};

type Buffer = Arc<Mutex<Vec<u8>>>;
type Files = Mutex<HashMap<String, Buffer>>;

fn lock(buffer: &Buffer) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(|e| e.into_inner())
}

/// Default size limit of a memory storage (1 GiB).
pub const DEFAULT_MAX_SIZE: u64 = 1 << 30;

fn to_index(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| RamuxError::ShortRead(format!("offset {} out of range", value)))
}

/// Growable in-memory byte buffer.
pub struct MemoryStorage {
    name: String,
    data: Option<Buffer>,
    capabilities: CapabilitySet,
    max_size: u64,
    closed: AtomicBool,
    folder: Mutex<Option<Weak<Files>>>,
}

impl MemoryStorage {
    /// Empty storage with every capability.
    pub fn new() -> Self {
        Self::from_bytes(Vec::new())
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: String::new(),
            data: Some(Arc::new(Mutex::new(data.into()))),
            capabilities: CapabilitySet::ALL,
            max_size: DEFAULT_MAX_SIZE,
            closed: AtomicBool::new(false),
            folder: Mutex::new(None),
        }
    }

    /// Restrict the declared capabilities.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Refuse writes and truncates that would grow past `max_size` bytes.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Name within its folder (empty when standalone).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.as_ref().map(|d| lock(d).clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn buffer(&self) -> Result<&Buffer> {
        if self.is_closed() {
            return Err(RamuxError::StorageClosed);
        }
        self.data
            .as_ref()
            .ok_or_else(|| RamuxError::NotFound(self.name.clone()))
    }

    /// Check a requested size against the limit.
    fn fits(&self, size: Option<u64>) -> Result<usize> {
        match size {
            Some(size) if size <= self.max_size => to_index(size),
            size => Err(RamuxError::TooLarge {
                size: size.unwrap_or(u64::MAX),
                limit: self.max_size,
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RandomAccess for MemoryStorage {
    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn open(&self) -> Result<()> {
        self.buffer().map(|_| ())
    }

    async fn read(&self, offset: u64, size: u64) -> Result<Bytes> {
        let data = lock(self.buffer()?);
        let end = offset.checked_add(size);
        match end {
            Some(end) if end <= data.len() as u64 => {
                Ok(Bytes::copy_from_slice(&data[to_index(offset)?..to_index(end)?]))
            }
            _ => Err(RamuxError::ShortRead(format!(
                "read of {} bytes at {} past end ({})",
                size,
                offset,
                data.len()
            ))),
        }
    }

    async fn write(&self, offset: u64, bytes: Bytes) -> Result<()> {
        let mut data = lock(self.buffer()?);
        let end = self.fits(offset.checked_add(bytes.len() as u64))?;
        let start = end - bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(&bytes);
        Ok(())
    }

    async fn del(&self, offset: u64, size: u64) -> Result<()> {
        let mut data = lock(self.buffer()?);
        let len = data.len() as u64;
        if offset >= len {
            return Ok(());
        }
        if offset.saturating_add(size) >= len {
            data.truncate(to_index(offset)?);
        } else {
            let start = to_index(offset)?;
            let end = to_index(offset + size)?;
            data[start..end].fill(0);
        }
        Ok(())
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        let size = self.fits(Some(size))?;
        lock(self.buffer()?).resize(size, 0);
        Ok(())
    }

    async fn stat(&self) -> Result<Stat> {
        let data = lock(self.buffer()?);
        Ok(Stat {
            size: data.len() as u64,
        })
    }

    async fn unlink(&self) -> Result<()> {
        lock(self.buffer()?).clear();
        let folder = self
            .folder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .and_then(|f| f.upgrade());
        if let Some(files) = folder {
            files.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.name);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Named in-memory storages whose contents outlive each handle.
#[derive(Clone)]
pub struct MemoryFolder {
    files: Arc<Files>,
    strict: bool,
    capabilities: CapabilitySet,
    max_size: u64,
}

impl MemoryFolder {
    /// Folder that creates an empty buffer for any unknown name.
    pub fn new() -> Self {
        Self {
            files: Arc::new(Mutex::new(HashMap::new())),
            strict: false,
            capabilities: CapabilitySet::ALL,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    /// Folder whose storages fail `open` with a not-found error unless the
    /// name was added with [`MemoryFolder::create`].
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::new()
        }
    }

    /// Capabilities declared by the storages this folder hands out.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Size limit of the storages this folder hands out.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    fn files(&self) -> MutexGuard<'_, HashMap<String, Buffer>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add (or replace) a file with the given contents.
    pub fn create(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.files()
            .insert(name.to_string(), Arc::new(Mutex::new(data.into())));
    }

    /// Storage for `name`, sharing the folder's buffer for that name.
    pub fn storage(&self, name: &str) -> MemoryStorage {
        let data = {
            let mut files = self.files();
            if self.strict {
                files.get(name).cloned()
            } else {
                Some(files.entry(name.to_string()).or_default().clone())
            }
        };
        MemoryStorage {
            name: name.to_string(),
            data,
            capabilities: self.capabilities,
            max_size: self.max_size,
            closed: AtomicBool::new(false),
            folder: Mutex::new(Some(Arc::downgrade(&self.files))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files().contains_key(name)
    }

    /// Copy of a file's contents.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files().get(name).map(|d| lock(d).clone())
    }
}

impl Default for MemoryFolder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    #[tokio::test]
    async fn test_write_extends_with_zero_fill() {
        let storage = MemoryStorage::new();
        storage.write(3, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(storage.contents(), b"\0\0\0abc");
        assert_eq!(storage.stat().await.unwrap().size, 6);
    }

    #[tokio::test]
    async fn test_read_past_end_is_short_read() {
        let storage = MemoryStorage::from_bytes(b"hello".to_vec());
        assert_eq!(&storage.read(1, 4).await.unwrap()[..], b"ello");
        assert!(storage.read(0, 6).await.unwrap_err().is_short_read());
        assert!(storage.read(u64::MAX, 2).await.unwrap_err().is_short_read());
    }

    #[tokio::test]
    async fn test_del_zero_fills_or_truncates() {
        let storage = MemoryStorage::from_bytes(b"abcdef".to_vec());
        storage.del(1, 2).await.unwrap();
        assert_eq!(storage.contents(), b"a\0\0def");

        storage.del(4, 100).await.unwrap();
        assert_eq!(storage.contents(), b"a\0\0d");
    }

    #[tokio::test]
    async fn test_truncate_shrinks_and_extends() {
        let storage = MemoryStorage::from_bytes(b"hello world".to_vec());
        storage.truncate(5).await.unwrap();
        assert_eq!(storage.contents(), b"hello");
        storage.truncate(7).await.unwrap();
        assert_eq!(storage.contents(), b"hello\0\0");
    }

    #[tokio::test]
    async fn test_growth_beyond_limit_rejected() {
        let storage = MemoryStorage::from_bytes(b"abc".to_vec()).with_max_size(8);

        let err = storage
            .write(u64::MAX - 1, Bytes::from_static(b"abcd"))
            .await
            .unwrap_err();
        assert!(matches!(err, RamuxError::TooLarge { size: u64::MAX, limit: 8 }));
        assert_eq!(err.code(), "EFBIG");

        assert!(storage.write(5, Bytes::from_static(b"1234")).await.is_err());
        assert!(storage.truncate(9).await.is_err());
        assert_eq!(storage.contents(), b"abc");

        storage.write(4, Bytes::from_static(b"1234")).await.unwrap();
        storage.truncate(8).await.unwrap();
        assert_eq!(storage.stat().await.unwrap().size, 8);
    }

    #[tokio::test]
    async fn test_closed_storage_rejects_operations() {
        let storage = MemoryStorage::new();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.write(0, Bytes::from_static(b"x")).await,
            Err(RamuxError::StorageClosed)
        ));
        assert!(storage.stat().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_folder_reuses_buffers() {
        let folder = MemoryFolder::new();
        let first = folder.storage("a");
        first.write(0, Bytes::from_static(b"kept")).await.unwrap();
        first.close().await.unwrap();

        let second = folder.storage("a");
        assert_eq!(&second.read(0, 4).await.unwrap()[..], b"kept");
        assert_eq!(folder.contents("a").unwrap(), b"kept");
    }

    #[tokio::test]
    async fn test_strict_folder_not_found() {
        let folder = MemoryFolder::strict();
        folder.create("present", b"x".to_vec());

        folder.storage("present").open().await.unwrap();
        let err = folder.storage("absent").open().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!folder.contains("absent"));
    }

    #[tokio::test]
    async fn test_unlink_detaches_from_folder() {
        let folder = MemoryFolder::new();
        let storage = folder.storage("gone");
        storage.write(0, Bytes::from_static(b"data")).await.unwrap();

        storage.unlink().await.unwrap();
        assert!(!folder.contains("gone"));
        assert_eq!(storage.stat().await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_declared_capabilities() {
        let caps = CapabilitySet::ALL.without(Capability::Writable);
        let storage = MemoryStorage::new().with_capabilities(caps);
        assert!(!storage.capabilities().writable());
        assert!(storage.capabilities().readable());
    }
}
