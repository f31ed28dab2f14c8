//! B+tree cursor: a tagged, possibly-detached position over one tree.
//!
//! Grounded on the teacher's `btree::cursor` (position-over-a-tree shape)
//! generalized to the coupled/uncoupled duality described by
//! `original_source/src/cursor.h` (`CURSOR_COUPLED`/`CURSOR_UNCOUPLED`): a
//! cursor that survives a structural change (split/merge/shift) by falling
//! back to its key rather than holding a now-invalid page/slot pair.

use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::types::{FindFlags, InsertFlags, MoveDirection, MoveFlags, PageAddress};

use super::tree::Btree;

#[derive(Debug, Clone)]
enum CursorState {
    Nil,
    Coupled { page: PageAddress, slot: usize, dupe_id: usize },
    Uncoupled { key: Vec<u8>, dupe_id: usize },
}

/// A position over a [`Btree`]. Any structural change to the tree (a split,
/// merge, or shift triggered by someone else's insert/erase) uncouples every
/// cursor pointing at the touched page; the next access re-resolves the
/// cursor's key through a fresh `find`.
///
/// Owns a handle on its tree rather than borrowing it, so a cursor can
/// outlive the call that looked the database up (see [`crate::env`]).
pub struct Cursor {
    tree: Arc<Btree>,
    state: CursorState,
}

impl Cursor {
    pub fn new(tree: Arc<Btree>) -> Self {
        Self {
            tree,
            state: CursorState::Nil,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.state, CursorState::Nil)
    }

    pub fn close(&mut self) {
        self.state = CursorState::Nil;
    }

    pub fn clone_cursor(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            state: self.state.clone(),
        }
    }

    fn current_triplet(&mut self) -> Result<(PageAddress, usize, usize)> {
        match self.state.clone() {
            CursorState::Nil => Err(StorageError::CursorIsNil),
            CursorState::Coupled { page, slot, dupe_id } => Ok((page, slot, dupe_id)),
            CursorState::Uncoupled { key, dupe_id } => {
                let r = self.tree.find(&key, FindFlags::empty())?;
                self.state = CursorState::Coupled {
                    page: r.leaf,
                    slot: r.slot,
                    dupe_id,
                };
                Ok((r.leaf, r.slot, dupe_id))
            }
        }
    }

    pub fn find(&mut self, key: &[u8], flags: FindFlags) -> Result<()> {
        let r = self.tree.find(key, flags)?;
        self.state = CursorState::Coupled {
            page: r.leaf,
            slot: r.slot,
            dupe_id: 0,
        };
        Ok(())
    }

    pub fn move_to(&mut self, direction: MoveDirection, flags: MoveFlags) -> Result<()> {
        match direction {
            MoveDirection::First => {
                let (page, slot) = self.tree.first_position()?;
                self.state = CursorState::Coupled { page, slot, dupe_id: 0 };
            }
            MoveDirection::Last => {
                let (page, slot) = self.tree.last_position()?;
                let dupe_id = if flags.contains(MoveFlags::SKIP_DUPLICATES) {
                    0
                } else {
                    self.tree.duplicate_count(page, slot)?.saturating_sub(1)
                };
                self.state = CursorState::Coupled { page, slot, dupe_id };
            }
            MoveDirection::Next => self.step_next(flags)?,
            MoveDirection::Previous => self.step_previous(flags)?,
        }
        Ok(())
    }

    fn step_next(&mut self, flags: MoveFlags) -> Result<()> {
        let (page, slot, dupe_id) = self.current_triplet()?;
        if !flags.contains(MoveFlags::SKIP_DUPLICATES) {
            let dcount = self.tree.duplicate_count(page, slot)?;
            if dupe_id + 1 < dcount {
                self.state = CursorState::Coupled {
                    page,
                    slot,
                    dupe_id: dupe_id + 1,
                };
                return Ok(());
            }
        }
        if flags.contains(MoveFlags::ONLY_DUPLICATES) {
            self.state = CursorState::Nil;
            return Err(StorageError::KeyNotFound);
        }
        match self.tree.next_position(page, slot)? {
            Some((p, s)) => {
                self.state = CursorState::Coupled { page: p, slot: s, dupe_id: 0 };
                Ok(())
            }
            None => {
                self.state = CursorState::Nil;
                Err(StorageError::KeyNotFound)
            }
        }
    }

    fn step_previous(&mut self, flags: MoveFlags) -> Result<()> {
        let (page, slot, dupe_id) = self.current_triplet()?;
        if !flags.contains(MoveFlags::SKIP_DUPLICATES) && dupe_id > 0 {
            self.state = CursorState::Coupled {
                page,
                slot,
                dupe_id: dupe_id - 1,
            };
            return Ok(());
        }
        if flags.contains(MoveFlags::ONLY_DUPLICATES) {
            self.state = CursorState::Nil;
            return Err(StorageError::KeyNotFound);
        }
        match self.tree.prev_position(page, slot)? {
            Some((p, s)) => {
                let dcount = self.tree.duplicate_count(p, s)?;
                self.state = CursorState::Coupled {
                    page: p,
                    slot: s,
                    dupe_id: dcount.saturating_sub(1),
                };
                Ok(())
            }
            None => {
                self.state = CursorState::Nil;
                Err(StorageError::KeyNotFound)
            }
        }
    }

    pub fn key(&mut self) -> Result<Vec<u8>> {
        let (page, slot, _) = self.current_triplet()?;
        self.tree.get_key(page, slot)
    }

    pub fn record(&mut self) -> Result<Vec<u8>> {
        let (page, slot, dupe_id) = self.current_triplet()?;
        self.tree.get_duplicate(page, slot, dupe_id)
    }

    /// Inserts a new key/record pair and repositions onto it, uncoupled
    /// (the insert may have split pages this cursor had no knowledge of).
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        self.tree.insert(key, record, flags)?;
        self.state = CursorState::Uncoupled {
            key: key.to_vec(),
            dupe_id: 0,
        };
        Ok(())
    }

    /// Overwrites the record at the cursor's current position.
    pub fn overwrite(&mut self, record: &[u8]) -> Result<()> {
        let (page, slot, dupe_id) = self.current_triplet()?;
        let key = self.tree.get_key(page, slot)?;
        if dupe_id == 0 && !self.tree.has_duplicates(page, slot)? {
            self.tree.insert(&key, record, InsertFlags::OVERWRITE)?;
        } else {
            self.tree.erase_duplicate(&key, dupe_id)?;
            self.tree
                .insert(&key, record, InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_BEFORE)?;
        }
        self.state = CursorState::Uncoupled { key, dupe_id };
        Ok(())
    }

    /// Erases the current position (a single duplicate, or the whole key if
    /// it has none) and uncouples the cursor.
    pub fn erase(&mut self) -> Result<()> {
        let (page, slot, dupe_id) = self.current_triplet()?;
        let key = self.tree.get_key(page, slot)?;
        if self.tree.has_duplicates(page, slot)? {
            self.tree.erase_duplicate(&key, dupe_id)?;
        } else {
            self.tree.erase(&key)?;
        }
        self.state = CursorState::Nil;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobManager, ExtKeyCache};
    use crate::cache::{Cache, CacheImpl};
    use crate::device::MemoryDevice;
    use crate::freelist::Freelist;

    fn new_tree() -> Arc<Btree> {
        let device = Arc::new(MemoryDevice::new());
        let cache: Arc<dyn Cache> = Arc::new(CacheImpl::new(device.clone(), 4096, 64));
        let freelist = Arc::new(Freelist::new(cache.clone(), None));
        let blobs = Arc::new(BlobManager::new(device, cache.clone(), freelist));
        let extkeys = Arc::new(ExtKeyCache::new(16));
        Arc::new(Btree::create(cache, blobs, extkeys, 16, false).unwrap())
    }

    #[test]
    fn fresh_cursor_is_nil() {
        let tree = new_tree();
        let cursor = Cursor::new(tree);
        assert!(cursor.is_nil());
    }

    #[test]
    fn move_first_last_and_walk_forward() {
        let tree = new_tree();
        for k in [b"a", b"b", b"c"] {
            tree.insert(k, b"v", InsertFlags::empty()).unwrap();
        }
        let mut cursor = Cursor::new(tree);
        cursor.move_to(MoveDirection::First, MoveFlags::empty()).unwrap();
        assert_eq!(cursor.key().unwrap(), b"a");
        cursor.move_to(MoveDirection::Next, MoveFlags::empty()).unwrap();
        assert_eq!(cursor.key().unwrap(), b"b");
        cursor.move_to(MoveDirection::Next, MoveFlags::empty()).unwrap();
        assert_eq!(cursor.key().unwrap(), b"c");
        assert!(cursor.move_to(MoveDirection::Next, MoveFlags::empty()).is_err());
    }

    #[test]
    fn walk_backward_from_last() {
        let tree = new_tree();
        for k in [b"a", b"b", b"c"] {
            tree.insert(k, b"v", InsertFlags::empty()).unwrap();
        }
        let mut cursor = Cursor::new(tree);
        cursor.move_to(MoveDirection::Last, MoveFlags::empty()).unwrap();
        assert_eq!(cursor.key().unwrap(), b"c");
        cursor.move_to(MoveDirection::Previous, MoveFlags::empty()).unwrap();
        assert_eq!(cursor.key().unwrap(), b"b");
    }

    #[test]
    fn insert_via_cursor_then_erase() {
        let tree = new_tree();
        let mut cursor = Cursor::new(tree.clone());
        cursor.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        assert_eq!(cursor.record().unwrap(), b"v");
        cursor.erase().unwrap();
        assert!(cursor.is_nil());
        assert!(tree.find(b"k", FindFlags::empty()).is_err());
    }

    #[test]
    fn duplicates_step_before_advancing_leaf() {
        let tree = new_tree();
        tree.insert(b"k", b"v1", InsertFlags::empty()).unwrap();
        tree.insert(b"k", b"v2", InsertFlags::DUPLICATE).unwrap();
        tree.insert(b"z", b"last", InsertFlags::empty()).unwrap();
        let mut cursor = Cursor::new(tree);
        cursor.find(b"k", FindFlags::empty()).unwrap();
        assert_eq!(cursor.record().unwrap(), b"v1");
        cursor.move_to(MoveDirection::Next, MoveFlags::empty()).unwrap();
        assert_eq!(cursor.record().unwrap(), b"v2");
        cursor.move_to(MoveDirection::Next, MoveFlags::empty()).unwrap();
        assert_eq!(cursor.key().unwrap(), b"z");
    }
}
