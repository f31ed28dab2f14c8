//! Page layer: the fixed-size unit of I/O, plus its non-persistent runtime
//! state (pin count, dirty bit, cursor list, age).
//!
//! A page's persistent bytes are an opaque buffer here; only [`crate::btree`]
//! and [`crate::freelist`] know how to interpret a page's payload. This
//! module owns only the header and the cache-facing lifecycle.

pub mod header;

pub use header::{DbDirectorySlot, FileHeader, PersistentPageHeader};

use crate::types::{PageAddress, PageType, PAGE_HEADER_SIZE};

/// A page resident in the [`crate::cache`], with its header parsed out.
pub struct Page {
    address: PageAddress,
    buf: Vec<u8>,
    page_type: PageType,
    /// `NO_HEADER` pages (raw blob bytes) store payload starting at offset 0.
    no_header: bool,
    dirty: bool,
    refcount: u32,
    age: u64,
    cursors: Vec<u64>,
}

impl Page {
    /// Wraps a freshly allocated, zeroed page of `size` bytes.
    pub fn new(address: PageAddress, size: usize, page_type: PageType) -> Self {
        let mut buf = vec![0u8; size];
        if page_type != PageType::Blob {
            let header = PersistentPageHeader {
                flags: 0,
                page_type,
                reserved: 0,
            };
            header.write(&mut buf[0..PAGE_HEADER_SIZE]);
        }
        Self {
            address,
            buf,
            page_type,
            no_header: page_type == PageType::Blob,
            dirty: false,
            refcount: 0,
            age: 0,
            cursors: Vec::new(),
        }
    }

    /// Wraps bytes freshly read from a [`crate::device::Device`].
    pub fn from_bytes(address: PageAddress, buf: Vec<u8>, no_header: bool) -> crate::error::Result<Self> {
        let page_type = if no_header {
            PageType::Blob
        } else {
            PersistentPageHeader::read(&buf)?.page_type
        };
        Ok(Self {
            address,
            buf,
            page_type,
            no_header,
            dirty: false,
            refcount: 0,
            age: 0,
            cursors: Vec::new(),
        })
    }

    pub fn address(&self) -> PageAddress {
        self.address
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn is_no_header(&self) -> bool {
        self.no_header
    }

    /// Offset where caller-meaningful payload begins.
    pub fn payload_offset(&self) -> usize {
        if self.no_header {
            0
        } else {
            PAGE_HEADER_SIZE
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.buf
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.buf
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        let off = self.payload_offset();
        &mut self.buf[off..]
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn pin(&mut self) {
        self.refcount += 1;
    }

    pub fn unpin(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
    }

    pub fn is_pinned(&self) -> bool {
        self.refcount > 0
    }

    pub fn touch(&mut self, clock: u64) {
        self.age = clock;
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn attach_cursor(&mut self, cursor_id: u64) {
        if !self.cursors.contains(&cursor_id) {
            self.cursors.push(cursor_id);
        }
    }

    pub fn detach_cursor(&mut self, cursor_id: u64) {
        self.cursors.retain(|&c| c != cursor_id);
    }

    pub fn cursors(&self) -> &[u64] {
        &self.cursors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_has_clean_header() {
        let page = Page::new(PageAddress::new(4096), 4096, PageType::BIndex);
        assert_eq!(page.page_type(), PageType::BIndex);
        assert!(!page.is_dirty());
        assert_eq!(page.payload_offset(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn blob_page_has_no_header() {
        let page = Page::new(PageAddress::new(8192), 4096, PageType::Blob);
        assert!(page.is_no_header());
        assert_eq!(page.payload_offset(), 0);
    }

    #[test]
    fn pin_unpin_tracks_refcount() {
        let mut page = Page::new(PageAddress::new(0), 128, PageType::Freelist);
        assert!(!page.is_pinned());
        page.pin();
        page.pin();
        assert!(page.is_pinned());
        page.unpin();
        assert!(page.is_pinned());
        page.unpin();
        assert!(!page.is_pinned());
    }
}
