//! Variable-length record storage: the blob manager, duplicate tables, and
//! the extended-key overflow cache.
//!
//! No teacher counterpart exists (the teacher stores every value inline in a
//! slotted cell). Grounded on `original_source/src/blob.c`/`blob.h` (small-
//! vs-large threshold, direct-I/O bypass for large payloads, header sanity
//! check via `blobid == self`) and `original_source/src/duplicates.h`
//! (duplicate table shape), per SPEC_FULL.md §4.4.

pub mod duplicates;
pub mod extkey;

pub use duplicates::DuplicateTable;
pub use extkey::ExtKeyCache;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::Cache;
use crate::device::Device;
use crate::error::{Result, StorageError};
use crate::freelist::Freelist;
use crate::types::{BlobId, SMALLEST_CHUNK, SMALL_BLOB_DIVISOR};

/// On-disk/in-memory blob header: `blobid, allocated_size, real_size,
/// user_size, flags`.
#[derive(Debug, Clone, Copy)]
pub struct BlobHeader {
    pub blobid: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub user_size: u64,
    pub flags: u32,
}

pub const BLOB_HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 4;

impl BlobHeader {
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.blobid.to_le_bytes());
        buf[8..16].copy_from_slice(&self.allocated_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.real_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.user_size.to_le_bytes());
        buf[32..36].copy_from_slice(&self.flags.to_le_bytes());
    }

    pub fn read(buf: &[u8]) -> Self {
        Self {
            blobid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            allocated_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            real_size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            user_size: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        }
    }
}

/// Allocates, reads, overwrites and frees variable-length payloads.
pub struct BlobManager {
    device: Arc<dyn Device>,
    cache: Arc<dyn Cache>,
    freelist: Arc<Freelist>,
    page_size: usize,
    in_memory: bool,
    mem_store: RwLock<std::collections::HashMap<u64, Vec<u8>>>,
    mem_next_id: AtomicU64,
}

impl BlobManager {
    pub fn new(device: Arc<dyn Device>, cache: Arc<dyn Cache>, freelist: Arc<Freelist>) -> Self {
        let page_size = cache.page_size();
        let in_memory = device.is_in_memory();
        Self {
            device,
            cache,
            freelist,
            page_size,
            in_memory,
            mem_store: RwLock::new(std::collections::HashMap::new()),
            mem_next_id: AtomicU64::new(1),
        }
    }

    fn is_small(&self, total_size: usize) -> bool {
        total_size < self.page_size / SMALL_BLOB_DIVISOR
    }

    pub fn allocate(&self, data: &[u8]) -> Result<BlobId> {
        let total = BLOB_HEADER_SIZE + data.len();

        if self.in_memory {
            let id = self.mem_next_id.fetch_add(1, Ordering::Relaxed);
            let mut buf = vec![0u8; total];
            let header = BlobHeader {
                blobid: id,
                allocated_size: total as u64,
                real_size: data.len() as u64,
                user_size: data.len() as u64,
                flags: 0,
            };
            header.write(&mut buf[0..BLOB_HEADER_SIZE]);
            buf[BLOB_HEADER_SIZE..].copy_from_slice(data);
            self.mem_store.write().insert(id, buf);
            return Ok(BlobId(id));
        }

        if self.is_small(total) {
            let offset = match self.freelist.alloc_area(total, false)? {
                Some(addr) => addr,
                None => self.extend_device(total)?,
            };
            self.write_blob_at(offset.value(), data, total as u64)?;
            Ok(BlobId(offset.value()))
        } else {
            let offset = self.device.seek_end()?;
            let padded = round_up(total, self.page_size);
            self.device.truncate(offset + padded as u64)?;
            self.write_blob_at(offset, data, padded as u64)?;
            let pad = padded - total;
            if pad > SMALLEST_CHUNK {
                self.freelist
                    .add_area((offset + total as u64).into(), pad)?;
            }
            Ok(BlobId(offset))
        }
    }

    fn extend_device(&self, size: usize) -> Result<crate::types::PageAddress> {
        let offset = self.device.seek_end()?;
        self.device.truncate(offset + size as u64)?;
        Ok(offset.into())
    }

    fn write_blob_at(&self, offset: u64, data: &[u8], allocated: u64) -> Result<()> {
        let header = BlobHeader {
            blobid: offset,
            allocated_size: allocated,
            real_size: data.len() as u64,
            user_size: data.len() as u64,
            flags: 0,
        };
        let mut buf = vec![0u8; BLOB_HEADER_SIZE + data.len()];
        header.write(&mut buf[0..BLOB_HEADER_SIZE]);
        buf[BLOB_HEADER_SIZE..].copy_from_slice(data);
        self.device.write(offset, &buf)
    }

    pub fn read(&self, id: BlobId) -> Result<Vec<u8>> {
        if self.in_memory {
            let store = self.mem_store.read();
            let buf = store
                .get(&id.0)
                .ok_or_else(|| StorageError::blob_not_found(id.0.into()))?;
            let header = BlobHeader::read(&buf[0..BLOB_HEADER_SIZE]);
            return Ok(buf[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + header.user_size as usize].to_vec());
        }

        let mut header_buf = [0u8; BLOB_HEADER_SIZE];
        self.device.read(id.0, &mut header_buf)?;
        let header = BlobHeader::read(&header_buf);
        if header.blobid != id.0 {
            return Err(StorageError::blob_not_found(id.0.into()));
        }
        let mut data = vec![0u8; header.user_size as usize];
        self.device.read(id.0 + BLOB_HEADER_SIZE as u64, &mut data)?;
        Ok(data)
    }

    pub fn overwrite(&self, id: BlobId, data: &[u8]) -> Result<BlobId> {
        if self.in_memory {
            let mut store = self.mem_store.write();
            let old = store
                .get(&id.0)
                .ok_or_else(|| StorageError::blob_not_found(id.0.into()))?;
            let old_header = BlobHeader::read(&old[0..BLOB_HEADER_SIZE]);
            let total = BLOB_HEADER_SIZE + data.len();
            if total as u64 <= old_header.allocated_size {
                let mut buf = vec![0u8; old.len()];
                let header = BlobHeader {
                    blobid: id.0,
                    allocated_size: old_header.allocated_size,
                    real_size: data.len() as u64,
                    user_size: data.len() as u64,
                    flags: 0,
                };
                header.write(&mut buf[0..BLOB_HEADER_SIZE]);
                buf[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + data.len()].copy_from_slice(data);
                store.insert(id.0, buf);
                return Ok(id);
            }
            drop(store);
            self.free(id)?;
            return self.allocate(data);
        }

        let mut header_buf = [0u8; BLOB_HEADER_SIZE];
        self.device.read(id.0, &mut header_buf)?;
        let old_header = BlobHeader::read(&header_buf);
        if old_header.blobid != id.0 {
            return Err(StorageError::blob_not_found(id.0.into()));
        }
        let total = BLOB_HEADER_SIZE as u64 + data.len() as u64;
        if total <= old_header.allocated_size {
            self.write_blob_at(id.0, data, old_header.allocated_size)?;
            let remainder = old_header.allocated_size - total;
            if remainder > SMALLEST_CHUNK as u64 {
                self.freelist.add_area((id.0 + total).into(), remainder as usize)?;
            }
            return Ok(id);
        }
        self.free(id)?;
        self.allocate(data)
    }

    pub fn free(&self, id: BlobId) -> Result<()> {
        if self.in_memory {
            self.mem_store.write().remove(&id.0);
            return Ok(());
        }
        let mut header_buf = [0u8; BLOB_HEADER_SIZE];
        self.device.read(id.0, &mut header_buf)?;
        let header = BlobHeader::read(&header_buf);
        if header.blobid != id.0 {
            return Err(StorageError::blob_not_found(id.0.into()));
        }
        self.freelist
            .add_area(id.0.into(), header.allocated_size as usize)
    }
}

fn round_up(v: usize, multiple: usize) -> usize {
    ((v + multiple - 1) / multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheImpl;
    use crate::device::MemoryDevice;

    fn new_manager(in_memory: bool) -> BlobManager {
        let device: Arc<dyn Device> = if in_memory {
            Arc::new(MemoryDevice::new())
        } else {
            Arc::new(MemoryDevice::new())
        };
        let cache: Arc<dyn Cache> = Arc::new(CacheImpl::new(device.clone(), 4096, 16));
        let freelist = Arc::new(Freelist::new(cache.clone(), None));
        let mut mgr = BlobManager::new(device, cache, freelist);
        mgr.in_memory = in_memory;
        mgr
    }

    #[test]
    fn small_blob_round_trips_on_disk() {
        let mgr = new_manager(false);
        let id = mgr.allocate(b"hello world").unwrap();
        assert_eq!(mgr.read(id).unwrap(), b"hello world");
    }

    #[test]
    fn large_blob_uses_direct_path() {
        let mgr = new_manager(false);
        let data = vec![7u8; 5000];
        let id = mgr.allocate(&data).unwrap();
        assert_eq!(mgr.read(id).unwrap(), data);
    }

    #[test]
    fn overwrite_in_place_when_it_fits() {
        let mgr = new_manager(false);
        let id = mgr.allocate(b"0123456789").unwrap();
        let id2 = mgr.overwrite(id, b"abc").unwrap();
        assert_eq!(id2.0, id.0);
        assert_eq!(mgr.read(id2).unwrap(), b"abc");
    }

    #[test]
    fn in_memory_round_trip() {
        let mgr = new_manager(true);
        let id = mgr.allocate(b"memory").unwrap();
        assert_eq!(mgr.read(id).unwrap(), b"memory");
        mgr.free(id).unwrap();
        assert!(mgr.read(id).is_err());
    }
}
