//! Byte-exact layouts for the two persistent headers: the per-page header
//! that prefixes every non-blob page, and the environment/file header that
//! lives in page 0.
//!
//! Layouts are hand-rolled little-endian get/set rather than `repr(C)`
//! structs: the wire format's byte offsets are a contract independent of
//! Rust's struct layout rules.

use crate::error::{Result, StorageError};
use crate::types::{
    PageAddress, PageType, DB_DIRECTORY_SLOT_SIZE, DEFAULT_MAX_DATABASES, FILE_MAGIC,
    PAGE_HEADER_SIZE,
};

/// The 12-byte header common to every page except raw blob pages
/// (`NO_HEADER`): `flags:u16, page_type:u16, reserved:u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentPageHeader {
    pub flags: u16,
    pub page_type: PageType,
    pub reserved: u64,
}

impl PersistentPageHeader {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(StorageError::invalid_parameter("page buffer too small for header"));
        }
        let flags = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let page_type_raw = u16::from_le_bytes(buf[2..4].try_into().unwrap());
        let reserved = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let page_type = PageType::from_u16(page_type_raw)
            .ok_or_else(|| StorageError::integrity_violated("unknown page type"))?;
        Ok(Self {
            flags,
            page_type,
            reserved,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.flags.to_le_bytes());
        buf[2..4].copy_from_slice(&(self.page_type as u16).to_le_bytes());
        buf[4..12].copy_from_slice(&self.reserved.to_le_bytes());
    }
}

/// One entry of the file header's database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DbDirectorySlot {
    pub dbname: u16,
    pub maxkeys: u16,
    pub keysize: u16,
    pub flags: u32,
    pub rootpage: PageAddress,
    pub recno: u64,
}

impl DbDirectorySlot {
    fn read(buf: &[u8]) -> Self {
        let dbname = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let maxkeys = u16::from_le_bytes(buf[2..4].try_into().unwrap());
        let keysize = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        // bytes 6..8 reserved
        let rootpage = PageAddress::new(u64::from_le_bytes(buf[8..16].try_into().unwrap()));
        let flags = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let recno = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        // bytes 28..32 reserved
        Self {
            dbname,
            maxkeys,
            keysize,
            flags,
            rootpage,
            recno,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.dbname.to_le_bytes());
        buf[2..4].copy_from_slice(&self.maxkeys.to_le_bytes());
        buf[4..6].copy_from_slice(&self.keysize.to_le_bytes());
        buf[6..8].copy_from_slice(&0u16.to_le_bytes());
        buf[8..16].copy_from_slice(&self.rootpage.value().to_le_bytes());
        buf[16..20].copy_from_slice(&self.flags.to_le_bytes());
        buf[20..28].copy_from_slice(&self.recno.to_le_bytes());
        buf[28..32].copy_from_slice(&0u32.to_le_bytes());
    }

    fn is_empty(&self) -> bool {
        self.dbname == 0
    }
}

/// The environment/file header living at offset 0 of page 0.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: [u8; 4],
    pub page_size: u32,
    pub max_databases: u16,
    pub page_manager_state: PageAddress,
    pub slots: Vec<DbDirectorySlot>,
}

const VERSION_OFFSET: usize = 4;
const CHECKSUM_OFFSET: usize = 8;
const PAGE_SIZE_OFFSET: usize = 12;
const MAX_DB_OFFSET: usize = 16;
const PAGE_MANAGER_STATE_OFFSET: usize = 20;
const DIRECTORY_OFFSET: usize = 28;

const CURRENT_VERSION: [u8; 4] = [1, 0, 0, 0];

impl FileHeader {
    pub fn new(page_size: u32) -> Self {
        let max_databases = DEFAULT_MAX_DATABASES;
        Self {
            version: CURRENT_VERSION,
            page_size,
            max_databases,
            page_manager_state: PageAddress::NULL,
            slots: vec![DbDirectorySlot::default(); max_databases as usize],
        }
    }

    pub fn encoded_len(&self) -> usize {
        DIRECTORY_OFFSET + self.slots.len() * DB_DIRECTORY_SLOT_SIZE
    }

    pub fn find_slot(&self, dbname: u16) -> Option<usize> {
        self.slots.iter().position(|s| s.dbname == dbname)
    }

    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_empty())
    }

    pub fn write(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&self.version);
        buf[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4].copy_from_slice(&self.page_size.to_le_bytes());
        buf[MAX_DB_OFFSET..MAX_DB_OFFSET + 2].copy_from_slice(&self.max_databases.to_le_bytes());
        buf[PAGE_MANAGER_STATE_OFFSET..PAGE_MANAGER_STATE_OFFSET + 8]
            .copy_from_slice(&self.page_manager_state.value().to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let off = DIRECTORY_OFFSET + i * DB_DIRECTORY_SLOT_SIZE;
            slot.write(&mut buf[off..off + DB_DIRECTORY_SLOT_SIZE]);
        }
        let checksum = checksum_of(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < DIRECTORY_OFFSET || &buf[0..4] != FILE_MAGIC {
            return Err(StorageError::InvalidFileHeader("bad magic".into()));
        }
        let version: [u8; 4] = buf[VERSION_OFFSET..VERSION_OFFSET + 4].try_into().unwrap();
        if version[0] != CURRENT_VERSION[0] {
            return Err(StorageError::InvalidFileVersion(format!(
                "major version {} unsupported",
                version[0]
            )));
        }
        let stored_checksum =
            u32::from_le_bytes(buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].try_into().unwrap());
        let mut verify_buf = buf.to_vec();
        verify_buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        if checksum_of(&verify_buf[..buf.len()]) != stored_checksum {
            return Err(StorageError::integrity_violated("file header checksum mismatch"));
        }
        let page_size =
            u32::from_le_bytes(buf[PAGE_SIZE_OFFSET..PAGE_SIZE_OFFSET + 4].try_into().unwrap());
        let max_databases =
            u16::from_le_bytes(buf[MAX_DB_OFFSET..MAX_DB_OFFSET + 2].try_into().unwrap());
        let page_manager_state = PageAddress::new(u64::from_le_bytes(
            buf[PAGE_MANAGER_STATE_OFFSET..PAGE_MANAGER_STATE_OFFSET + 8]
                .try_into()
                .unwrap(),
        ));
        let mut slots = Vec::with_capacity(max_databases as usize);
        for i in 0..max_databases as usize {
            let off = DIRECTORY_OFFSET + i * DB_DIRECTORY_SLOT_SIZE;
            if off + DB_DIRECTORY_SLOT_SIZE > buf.len() {
                break;
            }
            slots.push(DbDirectorySlot::read(&buf[off..off + DB_DIRECTORY_SLOT_SIZE]));
        }
        Ok(Self {
            version,
            page_size,
            max_databases,
            page_manager_state,
            slots,
        })
    }
}

fn checksum_of(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    // The checksum field itself is zeroed by the caller before hashing.
    hasher.update(&buf[0..CHECKSUM_OFFSET]);
    hasher.update(&buf[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_round_trip() {
        let hdr = PersistentPageHeader {
            flags: 0x1234,
            page_type: PageType::BIndex,
            reserved: 0,
        };
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        hdr.write(&mut buf);
        let back = PersistentPageHeader::read(&buf).unwrap();
        assert_eq!(hdr, back);
    }

    #[test]
    fn file_header_round_trip() {
        let mut header = FileHeader::new(16384);
        header.slots[0] = DbDirectorySlot {
            dbname: 1,
            maxkeys: 64,
            keysize: 16,
            flags: 0,
            rootpage: PageAddress::new(16384),
            recno: 0,
        };
        let bytes = header.write();
        let back = FileHeader::read(&bytes).unwrap();
        assert_eq!(back.page_size, 16384);
        assert_eq!(back.find_slot(1), Some(0));
        assert_eq!(back.slots[0].rootpage, PageAddress::new(16384));
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let header = FileHeader::new(4096);
        let mut bytes = header.write();
        bytes[100] ^= 0xFF;
        assert!(FileHeader::read(&bytes).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = FileHeader::new(4096).write();
        bytes[0] = b'X';
        assert!(matches!(
            FileHeader::read(&bytes),
            Err(StorageError::InvalidFileHeader(_))
        ));
    }
}
