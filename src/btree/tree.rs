//! B+tree operations: traversal, find, insert with split, erase with
//! shift/merge rebalance, record-number mode, integrity check, enumeration.
//!
//! Grounded on the teacher's `btree::tree` (`BTree::get/put/delete/scan`
//! recursive-descent shape; its own comment "v1: does not rebalance after
//! deletion" marks exactly the gap this module fills) per SPEC_FULL.md §4.5.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::blob::duplicates::DupeEntry;
use crate::blob::{BlobManager, DuplicateTable, ExtKeyCache};
use crate::cache::{Cache, PageHandle};
use crate::error::{Result, StorageError};
use crate::types::{
    BlobId, FindFlags, InsertFlags, KeyFlags, MatchFlags, PageAddress, PageType,
    PAGE_HEADER_SIZE, RECORD_TINY_MAX,
};

use super::node::{BtreeNode, Entry};

const RECORD_SIZE_MASK: KeyFlags = KeyFlags::from_bits_truncate(
    KeyFlags::BLOB_SIZE_TINY.bits() | KeyFlags::BLOB_SIZE_SMALL.bits() | KeyFlags::BLOB_SIZE_EMPTY.bits(),
);

/// Where a `find` landed: a leaf page and a slot within it.
#[derive(Debug, Clone, Copy)]
pub struct FindResult {
    pub leaf: PageAddress,
    pub slot: usize,
    pub match_flags: MatchFlags,
}

struct PathEntry {
    addr: PageAddress,
}

/// What an [`Btree::enumerate`] callback asks the walk to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerateControl {
    /// Keep walking.
    Continue,
    /// Abort the walk immediately.
    Stop,
    /// Finish this page's siblings, but don't descend past this level.
    DoNotDescend,
}

/// One step of the level-by-level walk driven by [`Btree::enumerate`].
#[derive(Debug, Clone, Copy)]
pub enum EnumerateEvent<'a> {
    PageStart { level: usize, is_leaf: bool },
    Item { key: &'a [u8], record: &'a [u8] },
    PageStop { level: usize, is_leaf: bool },
}

/// A B+tree index over one database's key space.
pub struct Btree {
    cache: Arc<dyn Cache>,
    blobs: Arc<BlobManager>,
    extkeys: Arc<ExtKeyCache>,
    keysize_config: usize,
    recno_mode: bool,
    root: RwLock<PageAddress>,
    last_recno: AtomicU64,
    maxkeys: usize,
}

impl Btree {
    pub fn create(
        cache: Arc<dyn Cache>,
        blobs: Arc<BlobManager>,
        extkeys: Arc<ExtKeyCache>,
        keysize_config: usize,
        recno_mode: bool,
    ) -> Result<Self> {
        let root_handle = cache.alloc(PageType::BIndex)?;
        let root_addr = root_handle.read().address();
        let leaf = BtreeNode::new_leaf(keysize_config);
        {
            let mut page = root_handle.write();
            let len = leaf.encoded_len();
            leaf.encode(&mut page.payload_mut()[..len]);
        }
        let maxkeys = BtreeNode::max_entries(cache.page_size() - PAGE_HEADER_SIZE, keysize_config);
        Ok(Self {
            cache,
            blobs,
            extkeys,
            keysize_config,
            recno_mode,
            root: RwLock::new(root_addr),
            last_recno: AtomicU64::new(0),
            maxkeys,
        })
    }

    pub fn open(
        cache: Arc<dyn Cache>,
        blobs: Arc<BlobManager>,
        extkeys: Arc<ExtKeyCache>,
        keysize_config: usize,
        recno_mode: bool,
        root: PageAddress,
        last_recno: u64,
    ) -> Self {
        let maxkeys = BtreeNode::max_entries(cache.page_size() - PAGE_HEADER_SIZE, keysize_config);
        Self {
            cache,
            blobs,
            extkeys,
            keysize_config,
            recno_mode,
            root: RwLock::new(root),
            last_recno: AtomicU64::new(last_recno),
            maxkeys,
        }
    }

    pub fn root(&self) -> PageAddress {
        *self.root.read()
    }

    pub fn last_recno(&self) -> u64 {
        self.last_recno.load(AtomicOrdering::Relaxed)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if self.recno_mode {
            let av = u64::from_be_bytes(a.try_into().unwrap_or([0; 8]));
            let bv = u64::from_be_bytes(b.try_into().unwrap_or([0; 8]));
            av.cmp(&bv)
        } else {
            a.cmp(b)
        }
    }

    fn load(&self, addr: PageAddress) -> Result<(PageHandle, BtreeNode)> {
        let handle = self
            .cache
            .fetch(addr, false)?
            .ok_or_else(|| StorageError::integrity_violated("dangling page address"))?;
        let node = {
            let page = handle.read();
            BtreeNode::decode(page.payload(), self.keysize_config)?
        };
        Ok((handle, node))
    }

    fn store(&self, handle: &PageHandle, node: &BtreeNode) -> Result<()> {
        let mut page = handle.write();
        let len = node.encoded_len();
        node.encode(&mut page.payload_mut()[..len]);
        Ok(())
    }

    fn entry_key_bytes(&self, entry: &Entry) -> Result<Vec<u8>> {
        if let Some(blob_id) = entry.extended_blob_id() {
            if let Some(cached) = self.extkeys.get(BlobId(blob_id)) {
                return Ok(cached);
            }
            let body = self.blobs.read(BlobId(blob_id))?;
            self.extkeys.insert(BlobId(blob_id), body.clone());
            Ok(body)
        } else {
            Ok(entry.key_inline[..entry.logical_keysize as usize].to_vec())
        }
    }

    fn make_entry(&self, key: &[u8], ptr: u64, flags: KeyFlags) -> Result<Entry> {
        if key.len() <= self.keysize_config {
            let mut inline = vec![0u8; self.keysize_config];
            inline[..key.len()].copy_from_slice(key);
            Ok(Entry {
                ptr,
                flags,
                logical_keysize: key.len() as u16,
                key_inline: inline,
            })
        } else {
            let blob_id = self.blobs.allocate(key)?;
            let mut inline = vec![0u8; self.keysize_config];
            let prefix_len = self.keysize_config - 8;
            inline[..prefix_len].copy_from_slice(&key[..prefix_len]);
            inline[prefix_len..].copy_from_slice(&blob_id.0.to_le_bytes());
            Ok(Entry {
                ptr,
                flags: flags | KeyFlags::IS_EXTENDED,
                logical_keysize: key.len().min(u16::MAX as usize) as u16,
                key_inline: inline,
            })
        }
    }

    fn encode_record(&self, record: &[u8]) -> Result<(u64, KeyFlags)> {
        if record.is_empty() {
            Ok((0, KeyFlags::BLOB_SIZE_EMPTY))
        } else if record.len() <= RECORD_TINY_MAX {
            let mut b = [0u8; 8];
            b[..record.len()].copy_from_slice(record);
            b[7] = record.len() as u8;
            Ok((u64::from_le_bytes(b), KeyFlags::BLOB_SIZE_TINY))
        } else if record.len() == 8 {
            Ok((u64::from_le_bytes(record.try_into().unwrap()), KeyFlags::BLOB_SIZE_SMALL))
        } else {
            let id = self.blobs.allocate(record)?;
            Ok((id.0, KeyFlags::empty()))
        }
    }

    fn decode_record_ref(&self, flags: KeyFlags, ptr: u64) -> Result<Vec<u8>> {
        if flags.contains(KeyFlags::BLOB_SIZE_EMPTY) {
            Ok(Vec::new())
        } else if flags.contains(KeyFlags::BLOB_SIZE_TINY) {
            let b = ptr.to_le_bytes();
            let len = b[7] as usize;
            Ok(b[..len].to_vec())
        } else if flags.contains(KeyFlags::BLOB_SIZE_SMALL) {
            Ok(ptr.to_le_bytes().to_vec())
        } else {
            self.blobs.read(BlobId(ptr))
        }
    }

    fn decode_record(&self, entry: &Entry) -> Result<Vec<u8>> {
        if entry.flags.contains(KeyFlags::HAS_DUPLICATES) {
            let table = DuplicateTable::decode(&self.blobs.read(BlobId(entry.ptr))?);
            let first = table.get(0).ok_or(StorageError::KeyNotFound)?;
            self.decode_record_ref(first.flags, first.rid)
        } else {
            self.decode_record_ref(entry.flags, entry.ptr)
        }
    }

    fn free_entry_payload(&self, entry: &Entry) -> Result<()> {
        if entry.flags.contains(KeyFlags::IS_EXTENDED) {
            if let Some(id) = entry.extended_blob_id() {
                self.blobs.free(BlobId(id))?;
                self.extkeys.remove(BlobId(id));
            }
        }
        if entry.flags.contains(KeyFlags::HAS_DUPLICATES) {
            let table = DuplicateTable::decode(&self.blobs.read(BlobId(entry.ptr))?);
            for d in table.entries() {
                if !d.flags.intersects(RECORD_SIZE_MASK) {
                    self.blobs.free(BlobId(d.rid))?;
                }
            }
            self.blobs.free(BlobId(entry.ptr))?;
        } else if !entry.flags.intersects(RECORD_SIZE_MASK) {
            self.blobs.free(BlobId(entry.ptr))?;
        }
        Ok(())
    }

    fn locate(&self, node: &BtreeNode, key: &[u8]) -> Result<(usize, bool)> {
        let mut lo = 0usize;
        let mut hi = node.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let ek = self.entry_key_bytes(&node.entries[mid])?;
            match self.compare(&ek, key) {
                Ordering::Less => lo = mid + 1,
                _ => hi = mid,
            }
        }
        let exact = if lo < node.entries.len() {
            let ek = self.entry_key_bytes(&node.entries[lo])?;
            self.compare(&ek, key) == Ordering::Equal
        } else {
            false
        };
        Ok((lo, exact))
    }

    /// Upper-bound child selection: returns the child covering `key` and its
    /// index (`0` meaning `ptr_left`, `i` meaning `entries[i-1].ptr`).
    fn child_for(&self, node: &BtreeNode, key: &[u8]) -> Result<(PageAddress, usize)> {
        let mut lo = 0usize;
        let mut hi = node.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let ek = self.entry_key_bytes(&node.entries[mid])?;
            if self.compare(key, &ek) == Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo == 0 {
            Ok((node.header.ptr_left, 0))
        } else {
            Ok((node.entries[lo - 1].child(), lo))
        }
    }

    fn descend(&self, key: &[u8], track_path: bool) -> Result<(PageHandle, BtreeNode, Vec<PathEntry>)> {
        let mut path = Vec::new();
        let mut addr = *self.root.read();
        loop {
            let (handle, node) = self.load(addr)?;
            if node.is_leaf() {
                return Ok((handle, node, path));
            }
            let (child_addr, _) = self.child_for(&node, key)?;
            if track_path {
                path.push(PathEntry { addr });
            }
            addr = child_addr;
        }
    }

    fn find_child_index(&self, parent: &BtreeNode, addr: PageAddress) -> usize {
        if parent.header.ptr_left == addr {
            return 0;
        }
        for (i, e) in parent.entries.iter().enumerate() {
            if e.child() == addr {
                return i + 1;
            }
        }
        usize::MAX
    }

    fn child_addr_at(&self, parent: &BtreeNode, idx: usize) -> PageAddress {
        if idx == 0 {
            parent.header.ptr_left
        } else {
            parent.entries[idx - 1].child()
        }
    }

    // ---- find -------------------------------------------------------

    pub fn find(&self, key: &[u8], flags: FindFlags) -> Result<FindResult> {
        let (mut handle, mut leaf, _) = self.descend(key, false)?;
        let (mut idx, exact) = self.locate(&leaf, key)?;

        let want_lt = flags.contains(FindFlags::FIND_LT_MATCH);
        let want_gt = flags.contains(FindFlags::FIND_GT_MATCH);
        let want_exact_bit = flags.contains(FindFlags::EXACT_MATCH);

        if exact && (want_exact_bit || flags.is_empty() || (!want_lt && !want_gt)) {
            return Ok(FindResult {
                leaf: handle.read().address(),
                slot: idx,
                match_flags: MatchFlags::empty(),
            });
        }

        if want_lt && !want_gt {
            loop {
                if idx == 0 {
                    if leaf.header.left.is_null() {
                        return Err(StorageError::KeyNotFound);
                    }
                    let laddr = leaf.header.left;
                    let (h, n) = self.load(laddr)?;
                    handle = h;
                    leaf = n;
                    idx = leaf.entries.len();
                    continue;
                }
                idx -= 1;
                return Ok(FindResult {
                    leaf: handle.read().address(),
                    slot: idx,
                    match_flags: MatchFlags::IS_LT,
                });
            }
        }

        if want_gt && !want_lt {
            let mut start = if exact { idx + 1 } else { idx };
            loop {
                if start < leaf.entries.len() {
                    return Ok(FindResult {
                        leaf: handle.read().address(),
                        slot: start,
                        match_flags: MatchFlags::IS_GT,
                    });
                }
                if leaf.header.right.is_null() {
                    return Err(StorageError::KeyNotFound);
                }
                let raddr = leaf.header.right;
                let (h, n) = self.load(raddr)?;
                handle = h;
                leaf = n;
                start = 0;
            }
        }

        Err(StorageError::KeyNotFound)
    }

    pub fn get_key(&self, leaf_addr: PageAddress, slot: usize) -> Result<Vec<u8>> {
        let (_, node) = self.load(leaf_addr)?;
        let entry = node.entries.get(slot).ok_or(StorageError::KeyNotFound)?;
        self.entry_key_bytes(entry)
    }

    pub fn get_record(&self, leaf_addr: PageAddress, slot: usize) -> Result<Vec<u8>> {
        let (_, node) = self.load(leaf_addr)?;
        let entry = node.entries.get(slot).ok_or(StorageError::KeyNotFound)?;
        self.decode_record(entry)
    }

    pub fn has_duplicates(&self, leaf_addr: PageAddress, slot: usize) -> Result<bool> {
        let (_, node) = self.load(leaf_addr)?;
        let entry = node.entries.get(slot).ok_or(StorageError::KeyNotFound)?;
        Ok(entry.flags.contains(KeyFlags::HAS_DUPLICATES))
    }

    pub fn duplicate_count(&self, leaf_addr: PageAddress, slot: usize) -> Result<usize> {
        let (_, node) = self.load(leaf_addr)?;
        let entry = node.entries.get(slot).ok_or(StorageError::KeyNotFound)?;
        if entry.flags.contains(KeyFlags::HAS_DUPLICATES) {
            let table = DuplicateTable::decode(&self.blobs.read(BlobId(entry.ptr))?);
            Ok(table.len())
        } else {
            Ok(1)
        }
    }

    pub fn get_duplicate(&self, leaf_addr: PageAddress, slot: usize, dupe_id: usize) -> Result<Vec<u8>> {
        let (_, node) = self.load(leaf_addr)?;
        let entry = node.entries.get(slot).ok_or(StorageError::KeyNotFound)?;
        if !entry.flags.contains(KeyFlags::HAS_DUPLICATES) {
            return if dupe_id == 0 {
                self.decode_record(entry)
            } else {
                Err(StorageError::KeyNotFound)
            };
        }
        let table = DuplicateTable::decode(&self.blobs.read(BlobId(entry.ptr))?);
        let d = table.get(dupe_id).ok_or(StorageError::KeyNotFound)?;
        self.decode_record_ref(d.flags, d.rid)
    }

    // ---- insert -------------------------------------------------------

    pub fn insert(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        let (leaf_handle, mut leaf, path) = self.descend(key, true)?;
        let (idx, exact) = self.locate(&leaf, key)?;

        if exact {
            if flags.contains(InsertFlags::DUPLICATE)
                || flags.intersects(
                    InsertFlags::DUPLICATE_INSERT_BEFORE
                        | InsertFlags::DUPLICATE_INSERT_AFTER
                        | InsertFlags::DUPLICATE_INSERT_FIRST
                        | InsertFlags::DUPLICATE_INSERT_LAST,
                )
            {
                self.insert_duplicate(&leaf_handle, &mut leaf, idx, record, flags)?;
                return Ok(());
            }
            if flags.contains(InsertFlags::OVERWRITE) {
                let old = leaf.entries[idx].clone();
                self.free_entry_payload_record_only(&old)?;
                let (ptr, rflags) = self.encode_record(record)?;
                leaf.entries[idx].ptr = ptr;
                leaf.entries[idx].flags = (old.flags & KeyFlags::IS_EXTENDED) | rflags;
                self.store(&leaf_handle, &leaf)?;
                return Ok(());
            }
            return Err(StorageError::DuplicateKey);
        }

        let (ptr, rflags) = self.encode_record(record)?;
        let entry = self.make_entry(key, ptr, rflags)?;
        leaf.entries.insert(idx, entry);
        leaf.header.count = leaf.entries.len() as u16;

        if leaf.entries.len() <= self.maxkeys {
            self.store(&leaf_handle, &leaf)?;
            return Ok(());
        }

        self.split_and_propagate(leaf_handle, leaf, path)
    }

    pub fn insert_autoincrement(&self, record: &[u8], flags: InsertFlags) -> Result<u64> {
        let recno = self.last_recno.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        self.insert(&recno.to_be_bytes(), record, flags)?;
        Ok(recno)
    }

    /// Frees only the old record payload of an entry being overwritten,
    /// leaving its key (and any extended-key blob) untouched.
    fn free_entry_payload_record_only(&self, entry: &Entry) -> Result<()> {
        if entry.flags.contains(KeyFlags::HAS_DUPLICATES) {
            let table = DuplicateTable::decode(&self.blobs.read(BlobId(entry.ptr))?);
            for d in table.entries() {
                if !d.flags.intersects(RECORD_SIZE_MASK) {
                    self.blobs.free(BlobId(d.rid))?;
                }
            }
            self.blobs.free(BlobId(entry.ptr))?;
        } else if !entry.flags.intersects(RECORD_SIZE_MASK) {
            self.blobs.free(BlobId(entry.ptr))?;
        }
        Ok(())
    }

    fn insert_duplicate(
        &self,
        leaf_handle: &PageHandle,
        leaf: &mut BtreeNode,
        idx: usize,
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let entry = leaf.entries[idx].clone();
        let mut table = if entry.flags.contains(KeyFlags::HAS_DUPLICATES) {
            DuplicateTable::decode(&self.blobs.read(BlobId(entry.ptr))?)
        } else {
            let mut t = DuplicateTable::new();
            t.insert(
                DupeEntry {
                    flags: entry.flags & RECORD_SIZE_MASK,
                    rid: entry.ptr,
                },
                InsertFlags::empty(),
                0,
            );
            t
        };
        let (rptr, rflags) = self.encode_record(record)?;
        table.insert(DupeEntry { flags: rflags, rid: rptr }, flags, 0);
        let encoded = table.encode();

        if entry.flags.contains(KeyFlags::HAS_DUPLICATES) {
            let new_id = self.blobs.overwrite(BlobId(entry.ptr), &encoded)?;
            leaf.entries[idx].ptr = new_id.0;
        } else {
            let id = self.blobs.allocate(&encoded)?;
            leaf.entries[idx].ptr = id.0;
            leaf.entries[idx].flags = (entry.flags & KeyFlags::IS_EXTENDED) | KeyFlags::HAS_DUPLICATES;
        }
        self.store(leaf_handle, leaf)
    }

    fn split_node(&self, node: &mut BtreeNode) -> Result<(BtreeNode, Vec<u8>)> {
        let mid = node.entries.len() / 2;
        if node.is_leaf() {
            let sibling_entries = node.entries.split_off(mid);
            let mut sibling = BtreeNode::new_leaf(self.keysize_config);
            sibling.entries = sibling_entries;
            node.header.count = node.entries.len() as u16;
            sibling.header.count = sibling.entries.len() as u16;
            let sep_key = self.entry_key_bytes(&sibling.entries[0])?;
            Ok((sibling, sep_key))
        } else {
            let sep_entry = node.entries.remove(mid);
            let sibling_entries = node.entries.split_off(mid);
            let mut sibling = BtreeNode::new_internal(self.keysize_config, sep_entry.child());
            sibling.entries = sibling_entries;
            node.header.count = node.entries.len() as u16;
            sibling.header.count = sibling.entries.len() as u16;
            let sep_key = self.entry_key_bytes(&sep_entry)?;
            Ok((sibling, sep_key))
        }
    }

    fn split_and_propagate(
        &self,
        mut handle: PageHandle,
        mut node: BtreeNode,
        mut path: Vec<PathEntry>,
    ) -> Result<()> {
        loop {
            let was_leaf = node.is_leaf();
            let (mut sibling, sep_key) = self.split_node(&mut node)?;
            let sibling_handle = self.cache.alloc(PageType::BIndex)?;
            let sibling_addr = sibling_handle.read().address();
            let node_addr = handle.read().address();

            if was_leaf {
                sibling.header.left = node_addr;
                sibling.header.right = node.header.right;
                if !node.header.right.is_null() {
                    if let Some(rh) = self.cache.fetch(node.header.right, false)? {
                        let mut rn = {
                            let p = rh.read();
                            BtreeNode::decode(p.payload(), self.keysize_config)?
                        };
                        rn.header.left = sibling_addr;
                        self.store(&rh, &rn)?;
                    }
                }
                node.header.right = sibling_addr;
            }
            self.store(&handle, &node)?;
            self.store(&sibling_handle, &sibling)?;
            log::debug!("split page {} -> {}", node_addr, sibling_addr);

            match path.pop() {
                None => {
                    let mut new_root = BtreeNode::new_internal(self.keysize_config, node_addr);
                    let sep = self.make_entry(&sep_key, sibling_addr.value(), KeyFlags::empty())?;
                    new_root.entries.push(sep);
                    new_root.header.count = 1;
                    let root_handle = self.cache.alloc(PageType::BIndex)?;
                    let root_addr = root_handle.read().address();
                    self.store(&root_handle, &new_root)?;
                    *self.root.write() = root_addr;
                    return Ok(());
                }
                Some(parent_entry) => {
                    let (parent_handle, mut parent) = self.load(parent_entry.addr)?;
                    let (idx, _) = self.locate(&parent, &sep_key)?;
                    let sep = self.make_entry(&sep_key, sibling_addr.value(), KeyFlags::empty())?;
                    parent.entries.insert(idx, sep);
                    parent.header.count = parent.entries.len() as u16;
                    if parent.entries.len() <= self.maxkeys {
                        self.store(&parent_handle, &parent)?;
                        return Ok(());
                    }
                    handle = parent_handle;
                    node = parent;
                }
            }
        }
    }

    // ---- erase -------------------------------------------------------

    pub fn erase(&self, key: &[u8]) -> Result<()> {
        let (leaf_handle, mut leaf, path) = self.descend(key, true)?;
        let (idx, exact) = self.locate(&leaf, key)?;
        if !exact {
            return Err(StorageError::KeyNotFound);
        }
        let entry = leaf.entries.remove(idx);
        self.free_entry_payload(&entry)?;
        leaf.header.count = leaf.entries.len() as u16;

        let is_root = path.is_empty();
        self.store(&leaf_handle, &leaf)?;
        if is_root || leaf.entries.len() >= BtreeNode::minkeys(self.maxkeys) {
            return Ok(());
        }
        self.rebalance(leaf_handle, leaf, path)
    }

    pub fn erase_duplicate(&self, key: &[u8], dupe_id: usize) -> Result<()> {
        let (leaf_handle, mut leaf, path) = self.descend(key, true)?;
        let (idx, exact) = self.locate(&leaf, key)?;
        if !exact {
            return Err(StorageError::KeyNotFound);
        }
        if !leaf.entries[idx].flags.contains(KeyFlags::HAS_DUPLICATES) {
            return self.erase(key);
        }
        let table_id = leaf.entries[idx].ptr;
        let mut table = DuplicateTable::decode(&self.blobs.read(BlobId(table_id))?);
        let removed = table.remove(dupe_id).ok_or(StorageError::KeyNotFound)?;
        if !removed.flags.intersects(RECORD_SIZE_MASK) {
            self.blobs.free(BlobId(removed.rid))?;
        }
        if table.is_empty() {
            self.blobs.free(BlobId(table_id))?;
            let entry = leaf.entries.remove(idx);
            leaf.header.count = leaf.entries.len() as u16;
            let is_root = path.is_empty();
            self.store(&leaf_handle, &leaf)?;
            if entry.flags.contains(KeyFlags::IS_EXTENDED) {
                if let Some(id) = entry.extended_blob_id() {
                    self.blobs.free(BlobId(id))?;
                }
            }
            if is_root || leaf.entries.len() >= BtreeNode::minkeys(self.maxkeys) {
                return Ok(());
            }
            return self.rebalance(leaf_handle, leaf, path);
        }
        if table.len() == 1 {
            let only = *table.get(0).unwrap();
            self.blobs.free(BlobId(table_id))?;
            leaf.entries[idx].ptr = only.rid;
            leaf.entries[idx].flags = (leaf.entries[idx].flags & KeyFlags::IS_EXTENDED) | only.flags;
        } else {
            let encoded = table.encode();
            let new_id = self.blobs.overwrite(BlobId(table_id), &encoded)?;
            leaf.entries[idx].ptr = new_id.0;
        }
        self.store(&leaf_handle, &leaf)
    }

    /// Shifts entries from `right` into `node` until their counts are equal
    /// (or differ by one, if their total is odd), per
    /// `original_source/src/btree_erase.c`'s `my_shift_pages`.
    fn shift_left(&self, node: &mut BtreeNode, right: &mut BtreeNode, parent: &mut BtreeNode, sep_idx: usize) -> Result<()> {
        while right.entries.len() > node.entries.len() + 1 {
            self.shift_left_one(node, right, parent, sep_idx)?;
        }
        Ok(())
    }

    fn shift_left_one(&self, node: &mut BtreeNode, right: &mut BtreeNode, parent: &mut BtreeNode, sep_idx: usize) -> Result<()> {
        if node.is_leaf() {
            let moved = right.entries.remove(0);
            let new_sep_key = self.entry_key_bytes(&right.entries[0])?;
            let sep_ptr = parent.entries[sep_idx].ptr;
            node.entries.push(moved);
            parent.entries[sep_idx] = self.make_entry(&new_sep_key, sep_ptr, KeyFlags::empty())?;
        } else {
            let old_sep_key = self.entry_key_bytes(&parent.entries[sep_idx])?;
            let moved_first = right.entries.remove(0);
            let demoted = self.make_entry(&old_sep_key, right.header.ptr_left.value(), KeyFlags::empty())?;
            node.entries.push(demoted);
            right.header.ptr_left = moved_first.child();
            let new_sep_key = self.entry_key_bytes(&moved_first)?;
            let sep_ptr = parent.entries[sep_idx].ptr;
            parent.entries[sep_idx] = self.make_entry(&new_sep_key, sep_ptr, KeyFlags::empty())?;
        }
        node.header.count = node.entries.len() as u16;
        right.header.count = right.entries.len() as u16;
        Ok(())
    }

    /// Shifts entries from `left` into `node` until their counts are equal
    /// (or differ by one, if their total is odd); mirrors `shift_left`.
    fn shift_right(&self, left: &mut BtreeNode, node: &mut BtreeNode, parent: &mut BtreeNode, sep_idx: usize) -> Result<()> {
        while left.entries.len() > node.entries.len() + 1 {
            self.shift_right_one(left, node, parent, sep_idx)?;
        }
        Ok(())
    }

    fn shift_right_one(&self, left: &mut BtreeNode, node: &mut BtreeNode, parent: &mut BtreeNode, sep_idx: usize) -> Result<()> {
        if node.is_leaf() {
            let moved = left.entries.pop().unwrap();
            node.entries.insert(0, moved);
            let new_sep_key = self.entry_key_bytes(&node.entries[0])?;
            let sep_ptr = parent.entries[sep_idx].ptr;
            parent.entries[sep_idx] = self.make_entry(&new_sep_key, sep_ptr, KeyFlags::empty())?;
        } else {
            let old_sep_key = self.entry_key_bytes(&parent.entries[sep_idx])?;
            let moved_last = left.entries.pop().unwrap();
            let demoted = self.make_entry(&old_sep_key, node.header.ptr_left.value(), KeyFlags::empty())?;
            node.entries.insert(0, demoted);
            node.header.ptr_left = moved_last.child();
            let new_sep_key = self.entry_key_bytes(&moved_last)?;
            let sep_ptr = parent.entries[sep_idx].ptr;
            parent.entries[sep_idx] = self.make_entry(&new_sep_key, sep_ptr, KeyFlags::empty())?;
        }
        left.header.count = left.entries.len() as u16;
        node.header.count = node.entries.len() as u16;
        Ok(())
    }

    fn merge_into(&self, left: &mut BtreeNode, mut right: BtreeNode, parent: &mut BtreeNode, sep_idx: usize) -> Result<()> {
        if left.is_leaf() {
            left.header.right = right.header.right;
            left.entries.append(&mut right.entries);
        } else {
            let sep_key = self.entry_key_bytes(&parent.entries[sep_idx])?;
            let demoted = self.make_entry(&sep_key, right.header.ptr_left.value(), KeyFlags::empty())?;
            left.entries.push(demoted);
            left.entries.append(&mut right.entries);
        }
        parent.entries.remove(sep_idx);
        left.header.count = left.entries.len() as u16;
        Ok(())
    }

    fn rebalance(&self, mut handle: PageHandle, mut node: BtreeNode, mut path: Vec<PathEntry>) -> Result<()> {
        loop {
            if path.is_empty() {
                if !node.is_leaf() && node.entries.is_empty() {
                    let new_root = node.header.ptr_left;
                    let old_root = handle.read().address();
                    *self.root.write() = new_root;
                    self.cache.discard(old_root);
                    log::debug!("collapsed root {} -> {}", old_root, new_root);
                }
                return Ok(());
            }

            let parent_entry = path.pop().unwrap();
            let (parent_handle, mut parent) = self.load(parent_entry.addr)?;
            let node_addr = handle.read().address();
            let child_idx = self.find_child_index(&parent, node_addr);

            let right_addr = if child_idx < parent.entries.len() {
                Some(self.child_addr_at(&parent, child_idx + 1))
            } else {
                None
            };
            let left_addr = if child_idx > 0 {
                Some(self.child_addr_at(&parent, child_idx - 1))
            } else {
                None
            };

            let minkeys = BtreeNode::minkeys(self.maxkeys);

            if let Some(raddr) = right_addr {
                let (right_handle, mut right) = self.load(raddr)?;
                if right.entries.len() > minkeys {
                    self.shift_left(&mut node, &mut right, &mut parent, child_idx)?;
                    self.store(&handle, &node)?;
                    self.store(&right_handle, &right)?;
                    self.store(&parent_handle, &parent)?;
                    return Ok(());
                }
            }
            if let Some(laddr) = left_addr {
                let (left_handle, mut left) = self.load(laddr)?;
                if left.entries.len() > minkeys {
                    self.shift_right(&mut left, &mut node, &mut parent, child_idx - 1)?;
                    self.store(&left_handle, &left)?;
                    self.store(&handle, &node)?;
                    self.store(&parent_handle, &parent)?;
                    return Ok(());
                }
            }

            if let Some(raddr) = right_addr {
                let (_, right) = self.load(raddr)?;
                self.merge_into(&mut node, right, &mut parent, child_idx)?;
                self.store(&handle, &node)?;
                self.cache.discard(raddr);
            } else if let Some(laddr) = left_addr {
                let (left_handle, mut left) = self.load(laddr)?;
                self.merge_into(&mut left, node.clone(), &mut parent, child_idx - 1)?;
                self.store(&left_handle, &left)?;
                self.cache.discard(node_addr);
                handle = left_handle;
                node = left;
            } else {
                self.store(&parent_handle, &parent)?;
                return Ok(());
            }

            parent.header.count = parent.entries.len() as u16;
            if path.is_empty() && parent.entries.is_empty() && !parent.is_leaf() {
                *self.root.write() = parent.header.ptr_left;
                self.cache.discard(parent_entry.addr);
                return Ok(());
            }
            if parent.entries.len() >= minkeys || path.is_empty() {
                self.store(&parent_handle, &parent)?;
                return Ok(());
            }
            self.store(&parent_handle, &parent)?;
            handle = parent_handle;
            node = parent;
        }
    }

    // ---- whole-tree operations ----------------------------------------

    pub fn height(&self) -> Result<usize> {
        let mut addr = *self.root.read();
        let mut h = 1;
        loop {
            let (_, node) = self.load(addr)?;
            if node.is_leaf() {
                break;
            }
            addr = node.header.ptr_left;
            h += 1;
        }
        Ok(h)
    }

    pub fn check_integrity(&self) -> Result<()> {
        let root_addr = *self.root.read();
        self.check_node(root_addr, true, None)?;
        Ok(())
    }

    /// `upper_bound` is the exclusive upper bound the parent's separator
    /// places on every key in this subtree (`None` for the root or for the
    /// rightmost child of a node).
    fn check_node(&self, addr: PageAddress, is_root: bool, upper_bound: Option<&[u8]>) -> Result<()> {
        let (_, node) = self.load(addr)?;
        if !is_root && node.entries.len() < BtreeNode::minkeys(self.maxkeys) {
            return Err(StorageError::integrity_violated("node below minkeys"));
        }
        if node.entries.len() > self.maxkeys {
            return Err(StorageError::integrity_violated("node above maxkeys"));
        }
        let mut prev: Option<Vec<u8>> = None;
        for e in &node.entries {
            let k = self.entry_key_bytes(e)?;
            if let Some(p) = &prev {
                if self.compare(p, &k) != Ordering::Less {
                    return Err(StorageError::integrity_violated("keys not strictly increasing"));
                }
            }
            if e.flags.contains(KeyFlags::IS_EXTENDED) && e.extended_blob_id() == Some(0) {
                return Err(StorageError::integrity_violated("extended key with null blob id"));
            }
            if e.flags.contains(KeyFlags::HAS_DUPLICATES) {
                let table = DuplicateTable::decode(&self.blobs.read(BlobId(e.ptr))?);
                if table.len() == 0 {
                    return Err(StorageError::integrity_violated("duplicate table has no entries"));
                }
            }
            prev = Some(k);
        }
        if let (Some(bound), Some(last)) = (upper_bound, &prev) {
            if self.compare(last, bound) != Ordering::Less {
                return Err(StorageError::integrity_violated("key exceeds parent separator bound"));
            }
        }
        if !node.header.left.is_null() {
            let (_, left_sibling) = self.load(node.header.left)?;
            if let (Some(left_last), Some(first)) = (left_sibling.entries.last(), node.entries.first()) {
                let left_key = self.entry_key_bytes(left_last)?;
                let this_key = self.entry_key_bytes(first)?;
                if self.compare(&left_key, &this_key) != Ordering::Less {
                    return Err(StorageError::integrity_violated("sibling keys overlap"));
                }
            }
        }
        if !node.is_leaf() {
            let left_bound = node.entries.first().map(|e| self.entry_key_bytes(e)).transpose()?;
            self.check_node(node.header.ptr_left, false, left_bound.as_deref())?;
            for (i, e) in node.entries.iter().enumerate() {
                let bound = node.entries.get(i + 1).map(|ne| self.entry_key_bytes(ne)).transpose()?;
                self.check_node(e.child(), false, bound.as_deref())?;
            }
        }
        Ok(())
    }

    /// Walks the tree level by level, root to leaves. For each level, walks
    /// the sibling chain left to right; for each page, emits `PageStart`,
    /// then an `Item` per slot, then `PageStop`.
    ///
    /// Mirrors `original_source/src/btree_enum.c`'s event sequence,
    /// including its quirk that a page's `PageStop` return value is what
    /// decides whether the walk descends past that level, overriding any
    /// earlier `DoNotDescend` from that same page's `PageStart`/`Item`
    /// events unless one of them already returned `Stop`.
    pub fn enumerate<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(EnumerateEvent) -> Result<EnumerateControl>,
    {
        let mut level = 0usize;
        let mut addr = *self.root.read();
        loop {
            let (_, node) = self.load(addr)?;
            let ptr_left = node.header.ptr_left;
            let control = self.enumerate_level(addr, level, &mut callback)?;
            if control == EnumerateControl::Stop {
                return Ok(());
            }
            if control == EnumerateControl::DoNotDescend || ptr_left.is_null() {
                return Ok(());
            }
            addr = ptr_left;
            level += 1;
        }
    }

    fn enumerate_level<F>(&self, mut addr: PageAddress, level: usize, callback: &mut F) -> Result<EnumerateControl>
    where
        F: FnMut(EnumerateEvent) -> Result<EnumerateControl>,
    {
        let mut descend = true;
        loop {
            let control = self.enumerate_page(addr, level, callback)?;
            if control == EnumerateControl::Stop {
                return Ok(EnumerateControl::Stop);
            }
            if control == EnumerateControl::DoNotDescend {
                descend = false;
            }
            let (_, node) = self.load(addr)?;
            if node.header.right.is_null() {
                break;
            }
            addr = node.header.right;
        }
        Ok(if descend { EnumerateControl::Continue } else { EnumerateControl::DoNotDescend })
    }

    fn enumerate_page<F>(&self, addr: PageAddress, level: usize, callback: &mut F) -> Result<EnumerateControl>
    where
        F: FnMut(EnumerateEvent) -> Result<EnumerateControl>,
    {
        let (_, node) = self.load(addr)?;
        let is_leaf = node.is_leaf();
        let mut control = callback(EnumerateEvent::PageStart { level, is_leaf })?;
        if control != EnumerateControl::Stop {
            'entries: for e in &node.entries {
                if control == EnumerateControl::DoNotDescend {
                    break;
                }
                let key = self.entry_key_bytes(e)?;
                if e.flags.contains(KeyFlags::HAS_DUPLICATES) {
                    let table = DuplicateTable::decode(&self.blobs.read(BlobId(e.ptr))?);
                    for d in table.entries() {
                        let rec = self.decode_record_ref(d.flags, d.rid)?;
                        control = callback(EnumerateEvent::Item { key: &key, record: &rec })?;
                        if control == EnumerateControl::Stop {
                            break 'entries;
                        }
                    }
                } else {
                    let rec = self.decode_record(e)?;
                    control = callback(EnumerateEvent::Item { key: &key, record: &rec })?;
                }
                if control == EnumerateControl::Stop {
                    break;
                }
            }
        }
        let stop_control = callback(EnumerateEvent::PageStop { level, is_leaf })?;
        Ok(if control == EnumerateControl::Stop { EnumerateControl::Stop } else { stop_control })
    }

    // ---- cursor support -------------------------------------------------

    pub fn first_position(&self) -> Result<(PageAddress, usize)> {
        let mut addr = *self.root.read();
        loop {
            let (_, node) = self.load(addr)?;
            if node.is_leaf() {
                if node.entries.is_empty() {
                    return Err(StorageError::KeyNotFound);
                }
                return Ok((addr, 0));
            }
            addr = node.header.ptr_left;
        }
    }

    pub fn last_position(&self) -> Result<(PageAddress, usize)> {
        let mut addr = *self.root.read();
        loop {
            let (_, node) = self.load(addr)?;
            if node.is_leaf() {
                if node.entries.is_empty() {
                    return Err(StorageError::KeyNotFound);
                }
                return Ok((addr, node.entries.len() - 1));
            }
            addr = node
                .entries
                .last()
                .map(|e| e.child())
                .unwrap_or(node.header.ptr_left);
        }
    }

    pub fn next_position(&self, leaf: PageAddress, slot: usize) -> Result<Option<(PageAddress, usize)>> {
        let (_, node) = self.load(leaf)?;
        if slot + 1 < node.entries.len() {
            return Ok(Some((leaf, slot + 1)));
        }
        if node.header.right.is_null() {
            return Ok(None);
        }
        let (_, right) = self.load(node.header.right)?;
        if right.entries.is_empty() {
            return Ok(None);
        }
        Ok(Some((node.header.right, 0)))
    }

    pub fn prev_position(&self, leaf: PageAddress, slot: usize) -> Result<Option<(PageAddress, usize)>> {
        if slot > 0 {
            return Ok(Some((leaf, slot - 1)));
        }
        let (_, node) = self.load(leaf)?;
        if node.header.left.is_null() {
            return Ok(None);
        }
        let (_, left) = self.load(node.header.left)?;
        if left.entries.is_empty() {
            return Ok(None);
        }
        Ok(Some((node.header.left, left.entries.len() - 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheImpl;
    use crate::device::MemoryDevice;
    use crate::freelist::Freelist;

    fn new_tree(page_size: usize, keysize: usize, recno: bool) -> Btree {
        let device = Arc::new(MemoryDevice::new());
        let cache: Arc<dyn Cache> = Arc::new(CacheImpl::new(device.clone(), page_size, 64));
        let freelist = Arc::new(Freelist::new(cache.clone(), None));
        let blobs = Arc::new(BlobManager::new(device, cache.clone(), freelist));
        let extkeys = Arc::new(ExtKeyCache::new(16));
        Btree::create(cache, blobs, extkeys, keysize, recno).unwrap()
    }

    #[test]
    fn insert_then_find_exact() {
        let tree = new_tree(4096, 16, false);
        tree.insert(b"hello", b"world", InsertFlags::empty()).unwrap();
        let r = tree.find(b"hello", FindFlags::empty()).unwrap();
        assert_eq!(tree.get_record(r.leaf, r.slot).unwrap(), b"world");
    }

    #[test]
    fn missing_key_not_found() {
        let tree = new_tree(4096, 16, false);
        assert!(matches!(tree.find(b"nope", FindFlags::empty()), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn duplicate_without_flag_is_rejected() {
        let tree = new_tree(4096, 16, false);
        tree.insert(b"k", b"v1", InsertFlags::empty()).unwrap();
        let err = tree.insert(b"k", b"v2", InsertFlags::empty());
        assert!(matches!(err, Err(StorageError::DuplicateKey)));
    }

    #[test]
    fn duplicate_ordering_with_insert_first() {
        let tree = new_tree(4096, 16, false);
        tree.insert(b"k", b"v1", InsertFlags::empty()).unwrap();
        tree.insert(b"k", b"v2", InsertFlags::DUPLICATE).unwrap();
        tree.insert(b"k", b"v0", InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_FIRST)
            .unwrap();
        let r = tree.find(b"k", FindFlags::empty()).unwrap();
        assert_eq!(tree.duplicate_count(r.leaf, r.slot).unwrap(), 3);
        assert_eq!(tree.get_duplicate(r.leaf, r.slot, 0).unwrap(), b"v0");
        assert_eq!(tree.get_duplicate(r.leaf, r.slot, 1).unwrap(), b"v1");
        assert_eq!(tree.get_duplicate(r.leaf, r.slot, 2).unwrap(), b"v2");
    }

    #[test]
    fn insert_erase_roundtrip() {
        let tree = new_tree(4096, 16, false);
        tree.insert(b"a", b"1", InsertFlags::empty()).unwrap();
        tree.erase(b"a").unwrap();
        assert!(matches!(tree.find(b"a", FindFlags::empty()), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn many_inserts_trigger_split_and_survive_lookup() {
        let tree = new_tree(256, 8, false);
        for i in 0u32..100 {
            tree.insert(&i.to_be_bytes(), b"value", InsertFlags::empty()).unwrap();
        }
        tree.check_integrity().unwrap();
        assert!(tree.height().unwrap() > 1);
        for i in 0u32..100 {
            let r = tree.find(&i.to_be_bytes(), FindFlags::empty()).unwrap();
            assert_eq!(tree.get_record(r.leaf, r.slot).unwrap(), b"value");
        }
    }

    #[test]
    fn erase_after_many_inserts_keeps_integrity() {
        let tree = new_tree(256, 8, false);
        for i in 0u32..60 {
            tree.insert(&i.to_be_bytes(), b"v", InsertFlags::empty()).unwrap();
        }
        for i in 0u32..50 {
            tree.erase(&i.to_be_bytes()).unwrap();
        }
        tree.check_integrity().unwrap();
        for i in 50u32..60 {
            assert!(tree.find(&i.to_be_bytes(), FindFlags::empty()).is_ok());
        }
    }

    #[test]
    fn check_integrity_passes_with_duplicates_and_splits() {
        let tree = new_tree(256, 8, false);
        for i in 0u32..30 {
            tree.insert(&i.to_be_bytes(), b"v", InsertFlags::empty()).unwrap();
        }
        for _ in 0..5 {
            tree.insert(&0u32.to_be_bytes(), b"dup", InsertFlags::DUPLICATE).unwrap();
        }
        tree.check_integrity().unwrap();
    }

    #[test]
    fn approximate_match_lt_gt() {
        let tree = new_tree(4096, 16, false);
        for k in [10u64, 20, 30] {
            tree.insert(&k.to_be_bytes(), b"v", InsertFlags::empty()).unwrap();
        }
        let r = tree.find(&25u64.to_be_bytes(), FindFlags::FIND_LT_MATCH).unwrap();
        assert_eq!(tree.get_key(r.leaf, r.slot).unwrap(), 20u64.to_be_bytes());
        let r = tree.find(&25u64.to_be_bytes(), FindFlags::FIND_GT_MATCH).unwrap();
        assert_eq!(tree.get_key(r.leaf, r.slot).unwrap(), 30u64.to_be_bytes());
        let r = tree.find(&20u64.to_be_bytes(), FindFlags::FIND_LT_MATCH).unwrap();
        assert_eq!(tree.get_key(r.leaf, r.slot).unwrap(), 10u64.to_be_bytes());
    }

    #[test]
    fn record_number_mode_autoincrements() {
        let tree = new_tree(4096, 8, true);
        let a = tree.insert_autoincrement(b"first", InsertFlags::empty()).unwrap();
        let b = tree.insert_autoincrement(b"second", InsertFlags::empty()).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn extended_key_round_trips() {
        let tree = new_tree(4096, 16, false);
        let long_key = vec![b'x'; 200];
        tree.insert(&long_key, b"v", InsertFlags::empty()).unwrap();
        let r = tree.find(&long_key, FindFlags::empty()).unwrap();
        assert_eq!(tree.get_record(r.leaf, r.slot).unwrap(), b"v");
    }

    #[test]
    fn enumerate_visits_all_in_order() {
        let tree = new_tree(256, 8, false);
        for i in (0u32..40).rev() {
            tree.insert(&i.to_be_bytes(), b"v", InsertFlags::empty()).unwrap();
        }
        let mut seen = Vec::new();
        let mut leaf_pages = 0usize;
        tree.enumerate(|ev| {
            match ev {
                EnumerateEvent::Item { key, .. } => {
                    seen.push(u32::from_be_bytes(key.try_into().unwrap()));
                }
                EnumerateEvent::PageStart { is_leaf, .. } if is_leaf => leaf_pages += 1,
                _ => {}
            }
            Ok(EnumerateControl::Continue)
        })
        .unwrap();
        let sorted = {
            let mut s = seen.clone();
            s.sort();
            s
        };
        assert_eq!(seen, sorted);
        assert_eq!(seen.len(), 40);
        assert!(leaf_pages >= 1);
    }

    #[test]
    fn enumerate_stop_halts_walk() {
        let tree = new_tree(256, 8, false);
        for i in 0u32..40 {
            tree.insert(&i.to_be_bytes(), b"v", InsertFlags::empty()).unwrap();
        }
        let mut seen = 0usize;
        tree.enumerate(|ev| {
            if let EnumerateEvent::Item { .. } = ev {
                seen += 1;
                if seen == 5 {
                    return Ok(EnumerateControl::Stop);
                }
            }
            Ok(EnumerateControl::Continue)
        })
        .unwrap();
        assert_eq!(seen, 5);
    }
}
