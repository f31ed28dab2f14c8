//! Common types, constants and flags shared across the engine.

mod address;

pub use address::{BlobId, PageAddress};

/// Default page size in bytes. Must be a power of two, >= `MIN_PAGE_SIZE`.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest page size the engine accepts.
pub const MIN_PAGE_SIZE: usize = 512;

/// Alignment unit used by the freelist bitmap.
pub const CHUNKSIZE: usize = 32;

/// Number of logarithmic size buckets tracked by freelist page statistics.
pub const SLOT_SPREAD: usize = 12;

/// Size of the persistent page header common to every page (flags, type, reserved).
pub const PAGE_HEADER_SIZE: usize = 12;

/// Size of a single database-directory slot in the file header page.
pub const DB_DIRECTORY_SLOT_SIZE: usize = 32;

/// Maximum number of databases addressable from one environment's directory.
pub const DEFAULT_MAX_DATABASES: u16 = 16;

/// File header magic, `"ham\0"`.
pub const FILE_MAGIC: [u8; 4] = *b"ham\0";

/// Fixed on-disk size of an `int_key_t` entry's non-key overhead:
/// ptr (8) + keysize (2) + flags (1) + reserved (1).
pub const KEY_OVERHEAD: usize = 12;

/// A record whose size fits in `ptr`'s 7 usable bytes is stored inline.
pub const RECORD_TINY_MAX: usize = 7;

/// Threshold under which a blob is stored inline in a b-index page rather
/// than as a standalone page run (relative to page size, see [`crate::blob`]).
pub const SMALL_BLOB_DIVISOR: usize = 3;

/// Minimum chunk worth returning to the freelist after an in-place overwrite.
pub const SMALLEST_CHUNK: usize = 17; // size_of::<u64>() + size_of(header tag) + 1

bitflags::bitflags! {
    /// Persistent per-entry flags stored in the low byte of `int_key_t::flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyFlags: u8 {
        const BLOB_SIZE_TINY   = 0b0000_0001;
        const BLOB_SIZE_SMALL  = 0b0000_0010;
        const BLOB_SIZE_EMPTY  = 0b0000_0100;
        const IS_EXTENDED      = 0b0000_1000;
        const HAS_DUPLICATES   = 0b0001_0000;
    }
}

bitflags::bitflags! {
    /// Flags accepted by `insert`-family operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        const OVERWRITE             = 0b0000_0001;
        const DUPLICATE             = 0b0000_0010;
        const DUPLICATE_INSERT_BEFORE = 0b0000_0100;
        const DUPLICATE_INSERT_AFTER  = 0b0000_1000;
        const DUPLICATE_INSERT_FIRST  = 0b0001_0000;
        const DUPLICATE_INSERT_LAST   = 0b0010_0000;
    }
}

bitflags::bitflags! {
    /// Flags accepted by `find`-family operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FindFlags: u32 {
        const EXACT_MATCH = 0b0000_0001;
        const FIND_LT_MATCH = 0b0000_0010;
        const FIND_GT_MATCH = 0b0000_0100;
        const FIND_LEQ_MATCH = Self::EXACT_MATCH.bits() | Self::FIND_LT_MATCH.bits();
        const FIND_GEQ_MATCH = Self::EXACT_MATCH.bits() | Self::FIND_GT_MATCH.bits();
    }
}

bitflags::bitflags! {
    /// Non-persistent flags describing how a found key relates to the lookup key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MatchFlags: u8 {
        const IS_LT = 0b01;
        const IS_GT = 0b10;
        const IS_APPROXIMATE = Self::IS_LT.bits() | Self::IS_GT.bits();
    }
}

bitflags::bitflags! {
    /// Database-level behavior flags set at create/open time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        const RECORD_NUMBER = 0b0001;
    }
}

/// Cursor movement directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    First,
    Last,
    Next,
    Previous,
}

bitflags::bitflags! {
    /// Flags accepted by cursor `move`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MoveFlags: u32 {
        const SKIP_DUPLICATES = 0b01;
        const ONLY_DUPLICATES = 0b10;
    }
}

/// Identifies the payload type of a page for both the persistent header and
/// cache bookkeeping.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Page 0: environment/file header.
    Header = 0,
    /// A B+tree node (root or non-root).
    BIndex = 1,
    /// A freelist bitmap page.
    Freelist = 2,
    /// Raw blob bytes; has no 12-byte persistent header (`NO_HEADER`).
    Blob = 3,
}

impl PageType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Header),
            1 => Some(Self::BIndex),
            2 => Some(Self::Freelist),
            3 => Some(Self::Blob),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_flags_round_trip() {
        let f = KeyFlags::IS_EXTENDED | KeyFlags::HAS_DUPLICATES;
        assert!(f.contains(KeyFlags::IS_EXTENDED));
        assert!(!f.contains(KeyFlags::BLOB_SIZE_TINY));
    }

    #[test]
    fn page_type_from_u16() {
        assert_eq!(PageType::from_u16(1), Some(PageType::BIndex));
        assert_eq!(PageType::from_u16(99), None);
    }
}
