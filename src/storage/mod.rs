//! The random-access storage contract.
//!
//! [`RandomAccess`] is what a channel serves and what a client handle looks
//! like, so a remote file can be used anywhere a local one can. Optional
//! operations default to failing with the matching capability error.

mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capability::{Capability, CapabilitySet};
use crate::error::{RamuxError, Result};

pub use memory::{MemoryFolder, MemoryStorage};

/// Result of `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stat {
    /// Current length in bytes.
    pub size: u64,
}

/// Byte-addressable storage.
#[async_trait]
pub trait RandomAccess: Send + Sync {
    /// Declared capabilities. Read once when a channel is served.
    fn capabilities(&self) -> CapabilitySet;

    /// Prepare the resource. Fails with a not-found error if it does not exist.
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Read exactly `size` bytes at `offset`.
    async fn read(&self, _offset: u64, _size: u64) -> Result<Bytes> {
        Err(RamuxError::Capability(Capability::Readable))
    }

    async fn write(&self, _offset: u64, _data: Bytes) -> Result<()> {
        Err(RamuxError::Capability(Capability::Writable))
    }

    /// Delete `size` bytes at `offset`.
    async fn del(&self, _offset: u64, _size: u64) -> Result<()> {
        Err(RamuxError::Capability(Capability::Deletable))
    }

    /// Set the length to `size`.
    async fn truncate(&self, _size: u64) -> Result<()> {
        Err(RamuxError::Capability(Capability::Truncatable))
    }

    async fn stat(&self) -> Result<Stat> {
        Err(RamuxError::Capability(Capability::Statable))
    }

    /// Remove the underlying resource.
    async fn unlink(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
