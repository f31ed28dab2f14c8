//! Duplicate-record tables.
//!
//! A key with `HAS_DUPLICATES` set points (via its `ptr` field) at a blob
//! whose payload is the encoding implemented here: a count, a capacity, and
//! an array of `{flags, rid}` entries. Grounded on
//! `original_source/src/duplicates.h`'s `dupe_table_t` naming; no teacher
//! counterpart (the teacher has no duplicate-key support at all).

use crate::types::{InsertFlags, KeyFlags};

/// One slot of a duplicate table. `rid` is interpreted the same way as an
/// `int_key_t::ptr`: either raw inline bytes (tiny/small/empty) or a blob id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupeEntry {
    pub flags: KeyFlags,
    pub rid: u64,
}

const ENTRY_ENCODED: usize = 16; // flags byte + padding, then rid at offset 8

impl DupeEntry {
    fn write(&self, buf: &mut [u8]) {
        buf[0] = self.flags.bits();
        buf[8..16].copy_from_slice(&self.rid.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            flags: KeyFlags::from_bits_truncate(buf[0]),
            rid: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// The decoded payload of a duplicate-table blob.
#[derive(Debug, Clone, Default)]
pub struct DuplicateTable {
    entries: Vec<DupeEntry>,
}

impl DuplicateTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DupeEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[DupeEntry] {
        &self.entries
    }

    /// Inserts `entry` according to the `DUPLICATE_INSERT_*` flags. Absent
    /// any positional flag, the default is append (`INSERT_LAST`).
    pub fn insert(&mut self, entry: DupeEntry, flags: InsertFlags, position: usize) {
        if flags.contains(InsertFlags::DUPLICATE_INSERT_FIRST) {
            self.entries.insert(0, entry);
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_BEFORE) {
            self.entries.insert(position.min(self.entries.len()), entry);
        } else if flags.contains(InsertFlags::DUPLICATE_INSERT_AFTER) {
            self.entries.insert((position + 1).min(self.entries.len()), entry);
        } else {
            self.entries.push(entry);
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<DupeEntry> {
        if index < self.entries.len() {
            Some(self.entries.remove(index))
        } else {
            None
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8 + self.entries.len() * ENTRY_ENCODED];
        buf[0..4].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (i, e) in self.entries.iter().enumerate() {
            let off = 8 + i * ENTRY_ENCODED;
            e.write(&mut buf[off..off + ENTRY_ENCODED]);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        if buf.len() < 8 {
            return Self::new();
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * ENTRY_ENCODED;
            if off + ENTRY_ENCODED > buf.len() {
                break;
            }
            entries.push(DupeEntry::read(&buf[off..off + ENTRY_ENCODED]));
        }
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rid: u64) -> DupeEntry {
        DupeEntry {
            flags: KeyFlags::empty(),
            rid,
        }
    }

    #[test]
    fn insert_first_and_last() {
        let mut table = DuplicateTable::new();
        table.insert(entry(1), InsertFlags::empty(), 0);
        table.insert(entry(2), InsertFlags::empty(), 0);
        table.insert(entry(0), InsertFlags::DUPLICATE_INSERT_FIRST, 0);
        let rids: Vec<u64> = table.entries().iter().map(|e| e.rid).collect();
        assert_eq!(rids, vec![0, 1, 2]);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut table = DuplicateTable::new();
        table.insert(entry(10), InsertFlags::empty(), 0);
        table.insert(entry(20), InsertFlags::empty(), 0);
        let bytes = table.encode();
        let back = DuplicateTable::decode(&bytes);
        assert_eq!(back.len(), 2);
        assert_eq!(back.get(1).unwrap().rid, 20);
    }

    #[test]
    fn remove_shrinks_table() {
        let mut table = DuplicateTable::new();
        table.insert(entry(1), InsertFlags::empty(), 0);
        table.insert(entry(2), InsertFlags::empty(), 0);
        table.remove(0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).unwrap().rid, 2);
    }
}
