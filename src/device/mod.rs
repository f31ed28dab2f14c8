//! Raw byte-range I/O on the backing store.
//!
//! Every higher component (cache, freelist, blob manager) goes through a
//! [`Device`] for bytes in or out; the blob manager is the one caller that
//! bypasses the page cache and calls a `Device` directly for large payloads
//! (see [`crate::blob`]).

mod file;
mod memory;

pub use file::FileDevice;
pub use memory::MemoryDevice;

use crate::error::Result;

/// Positional, offset-addressed I/O on a single backing store.
pub trait Device: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` starting at `offset`, growing the store if necessary.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Grow or shrink the store to exactly `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Current size of the store in bytes.
    fn size(&self) -> Result<u64>;

    /// Append-friendly helper: returns the current end-of-store offset.
    fn seek_end(&self) -> Result<u64> {
        self.size()
    }

    /// Flush any buffered writes to stable storage.
    fn flush(&self) -> Result<()>;

    /// True if this device keeps no persistent state (in-memory database).
    fn is_in_memory(&self) -> bool {
        false
    }
}
