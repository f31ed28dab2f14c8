//! Bounded page cache with LRU-ish eviction and reference-counted pinning.
//!
//! Grounded on the teacher's `buffer::pool` (`BufferPool` trait, frame map,
//! pin counting) and `buffer::lru` (recency tracking), generalized with
//! `fetch`'s `only_from_cache` lookup and dirty-aware eviction order per
//! SPEC_FULL.md §4.2.

mod lru;

pub use lru::RecencyClock;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::device::Device;
use crate::error::{Result, StorageError};
use crate::page::Page;
use crate::types::{PageAddress, PageType};

/// A page resident in the cache, shared by every holder of its address.
pub type PageHandle = Arc<RwLock<Page>>;

/// The page cache contract. `CacheImpl` is the only implementation; this
/// exists so `btree`/`blob` can be written against an interface rather than a
/// concrete struct, mirroring the teacher's `BufferPool` trait.
pub trait Cache: Send + Sync {
    /// Looks up `addr`. If absent and `only_from_cache` is true, returns
    /// `Ok(None)` rather than reading through to the device.
    fn fetch(&self, addr: PageAddress, only_from_cache: bool) -> Result<Option<PageHandle>>;

    /// Allocates a fresh zeroed page of the cache's configured page size.
    fn alloc(&self, page_type: PageType) -> Result<PageHandle>;

    /// Writes a dirty page back to the device and clears its dirty bit.
    fn flush(&self, addr: PageAddress) -> Result<()>;

    /// Flushes every dirty resident page.
    fn flush_all(&self) -> Result<()>;

    /// Drops a page from the cache without writing it back (used when the
    /// page's address has just been freed and its bytes are meaningless).
    fn discard(&self, addr: PageAddress);

    fn page_size(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CacheImpl {
    device: Arc<dyn Device>,
    page_size: usize,
    capacity: usize,
    frames: RwLock<HashMap<PageAddress, PageHandle>>,
    clock: Mutex<RecencyClock>,
}

impl CacheImpl {
    pub fn new(device: Arc<dyn Device>, page_size: usize, capacity: usize) -> Self {
        Self {
            device,
            page_size,
            capacity,
            frames: RwLock::new(HashMap::new()),
            clock: Mutex::new(RecencyClock::new()),
        }
    }

    fn read_from_device(&self, addr: PageAddress) -> Result<Page> {
        let mut buf = vec![0u8; self.page_size];
        self.device.read(addr.value(), &mut buf)?;
        Page::from_bytes(addr, buf, false)
    }

    /// Evicts one unpinned page to make room, writing it back first if dirty.
    /// Returns an error if every resident page is pinned.
    fn evict_one(&self) -> Result<()> {
        let victim = {
            let frames = self.frames.read();
            let clock = self.clock.lock();
            let mut best: Option<(PageAddress, bool, u64)> = None;
            for (&addr, page) in frames.iter() {
                let page = page.read();
                if page.is_pinned() {
                    continue;
                }
                let age = clock.age_of(addr);
                let dirty = page.is_dirty();
                let better = match &best {
                    None => true,
                    // prefer evicting clean pages before dirty ones
                    Some((_, best_dirty, best_age)) => {
                        (dirty as u8, age) < (*best_dirty as u8, *best_age)
                    }
                };
                if better {
                    best = Some((addr, dirty, age));
                }
            }
            best
        };

        let (addr, dirty, _) = victim
            .ok_or_else(|| StorageError::invalid_parameter("cache exhausted: every page pinned"))?;
        if dirty {
            self.flush(addr)?;
        }
        self.frames.write().remove(&addr);
        self.clock.lock().remove(addr);
        Ok(())
    }
}

impl Cache for CacheImpl {
    fn fetch(&self, addr: PageAddress, only_from_cache: bool) -> Result<Option<PageHandle>> {
        if let Some(page) = self.frames.read().get(&addr) {
            let age = self.clock.lock().touch(addr);
            page.write().touch(age);
            return Ok(Some(page.clone()));
        }
        if only_from_cache {
            return Ok(None);
        }
        if self.frames.read().len() >= self.capacity {
            self.evict_one()?;
        }
        let page = self.read_from_device(addr)?;
        let handle = Arc::new(RwLock::new(page));
        self.frames.write().insert(addr, handle.clone());
        let age = self.clock.lock().touch(addr);
        handle.write().touch(age);
        Ok(Some(handle))
    }

    fn alloc(&self, page_type: PageType) -> Result<PageHandle> {
        if self.frames.read().len() >= self.capacity {
            self.evict_one()?;
        }
        let offset = self.device.seek_end()?;
        self.device.truncate(offset + self.page_size as u64)?;
        let page = Page::new(PageAddress::new(offset), self.page_size, page_type);
        let handle = Arc::new(RwLock::new(page));
        {
            let mut handle_mut = handle.write();
            handle_mut.mark_dirty();
        }
        self.frames.write().insert(PageAddress::new(offset), handle.clone());
        let age = self.clock.lock().touch(PageAddress::new(offset));
        handle.write().touch(age);
        log::debug!("allocated page at {}", PageAddress::new(offset));
        Ok(handle)
    }

    fn flush(&self, addr: PageAddress) -> Result<()> {
        let handle = match self.frames.read().get(&addr) {
            Some(h) => h.clone(),
            None => return Ok(()),
        };
        let mut page = handle.write();
        if page.is_dirty() {
            self.device.write(addr.value(), page.raw())?;
            page.clear_dirty();
        }
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        let addrs: Vec<PageAddress> = self.frames.read().keys().copied().collect();
        for addr in addrs {
            self.flush(addr)?;
        }
        self.device.flush()?;
        Ok(())
    }

    fn discard(&self, addr: PageAddress) {
        self.frames.write().remove(&addr);
        self.clock.lock().remove(addr);
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn len(&self) -> usize {
        self.frames.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn new_cache(capacity: usize) -> CacheImpl {
        let device = Arc::new(MemoryDevice::new());
        CacheImpl::new(device, 512, capacity)
    }

    #[test]
    fn alloc_then_fetch_round_trips() {
        let cache = new_cache(4);
        let handle = cache.alloc(PageType::BIndex).unwrap();
        let addr = handle.read().address();
        handle.write().payload_mut()[0] = 0xAB;
        cache.flush(addr).unwrap();
        cache.discard(addr);
        let fetched = cache.fetch(addr, false).unwrap().unwrap();
        assert_eq!(fetched.read().payload()[0], 0xAB);
    }

    #[test]
    fn only_from_cache_misses_without_reading_device() {
        let cache = new_cache(4);
        let addr = PageAddress::new(999_999);
        assert!(cache.fetch(addr, true).unwrap().is_none());
    }

    #[test]
    fn eviction_refuses_when_everything_pinned() {
        let cache = new_cache(1);
        let handle = cache.alloc(PageType::BIndex).unwrap();
        handle.write().pin();
        assert!(cache.alloc(PageType::BIndex).is_err());
    }

    #[test]
    fn eviction_prefers_unpinned_page() {
        let cache = new_cache(1);
        let first = cache.alloc(PageType::BIndex).unwrap();
        let first_addr = first.read().address();
        drop(first);
        let second = cache.alloc(PageType::BIndex).unwrap();
        assert_ne!(second.read().address(), first_addr);
        assert_eq!(cache.len(), 1);
    }
}
