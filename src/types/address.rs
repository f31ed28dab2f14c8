//! File-offset addressing for pages and blobs.
//!
//! Unlike an index-based page id, a [`PageAddress`] is the page's actual byte
//! offset in the backing device. Allocating a page means carving out
//! `page_size` bytes at some offset; there is no separate translation table.

use std::fmt;

/// A byte offset into the backing device. `NULL` means "no page"/"no blob".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageAddress(pub u64);

impl PageAddress {
    pub const NULL: PageAddress = PageAddress(0);

    /// The file header always lives at offset 0.
    pub const HEADER: PageAddress = PageAddress(0);

    pub fn new(offset: u64) -> Self {
        PageAddress(offset)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<u64> for PageAddress {
    fn from(v: u64) -> Self {
        PageAddress(v)
    }
}

/// Identifies a blob, independent of whether it lives on disk (its on-disk
/// offset) or purely in memory (a synthetic, monotonically increasing id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(pub u64);

impl BlobId {
    pub const NULL: BlobId = BlobId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:0x{:x}", self.0)
    }
}

impl From<u64> for BlobId {
    fn from(v: u64) -> Self {
        BlobId(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_address_is_zero() {
        assert!(PageAddress::NULL.is_null());
        assert!(!PageAddress::new(4096).is_null());
    }

    #[test]
    fn blob_id_roundtrip() {
        let id = BlobId::from(12345u64);
        assert_eq!(id.0, 12345);
        assert!(!id.is_null());
    }
}
