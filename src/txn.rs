//! Transaction bracketing: a logical unit that journals its operations as it
//! goes and, on commit, leaves the underlying database mutated; on abort, it
//! undoes whatever it already applied.
//!
//! No teacher counterpart (the teacher commits every call immediately).
//! Grounded on `original_source/src/journal.h`'s begin/commit/abort
//! bracketing and the `old/txn.c` transaction-handle shape, per
//! SPEC_FULL.md §4.8.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::btree::Btree;
use crate::error::{Result, StorageError};
use crate::journal::{Journal, JournalTxnHandle};
use crate::types::{FindFlags, InsertFlags};

/// Inverse of an already-applied operation, replayed in reverse order by
/// [`Transaction::abort`].
enum UndoOp {
    /// The key did not exist before; undo by erasing it.
    RemoveInserted { key: Vec<u8> },
    /// The key existed with this record before an `OVERWRITE`; undo by
    /// writing it back.
    RestoreRecord { key: Vec<u8>, record: Vec<u8> },
    /// A duplicate was appended; undo by dropping the duplicate at this
    /// index once the table has been re-read (duplicates may have shifted,
    /// so the undo re-locates by exact match and pops the tail entry we
    /// observed at insert time).
    RemoveDuplicateAt { key: Vec<u8>, dupe_id: usize },
    /// The key was erased; undo by reinserting it verbatim.
    ReinsertErased { key: Vec<u8>, record: Vec<u8> },
}

/// A logical transaction over one database. Operations take effect against
/// the in-memory tree immediately (the engine is single-threaded and
/// cooperative, see SPEC_FULL.md §5) but are only durable once
/// [`Transaction::commit`] has synced the journal; [`Transaction::abort`]
/// rolls back everything applied so far.
pub struct Transaction<'e> {
    btree: Arc<Btree>,
    journal: Option<&'e Journal>,
    dbname: u16,
    handle: Option<JournalTxnHandle>,
    undo: Vec<UndoOp>,
    finished: bool,
    /// Held for the whole transaction when it was opened explicitly via
    /// [`crate::Db::begin_txn`], so the environment's single-threaded
    /// cooperative model (SPEC_FULL.md §5) still holds across a transaction
    /// that spans more than one call.
    _guard: Option<MutexGuard<'e, ()>>,
}

impl<'e> Transaction<'e> {
    pub(crate) fn begin(btree: Arc<Btree>, journal: Option<&'e Journal>, dbname: u16) -> Result<Self> {
        Self::begin_with_guard(btree, journal, dbname, None)
    }

    pub(crate) fn begin_with_guard(
        btree: Arc<Btree>,
        journal: Option<&'e Journal>,
        dbname: u16,
        guard: Option<MutexGuard<'e, ()>>,
    ) -> Result<Self> {
        let handle = match journal {
            Some(j) => Some(j.begin_txn()?),
            None => None,
        };
        Ok(Self {
            btree,
            journal,
            dbname,
            handle,
            undo: Vec::new(),
            finished: false,
            _guard: guard,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(StorageError::invalid_parameter("transaction already finished"));
        }
        Ok(())
    }

    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        self.ensure_open()?;
        let is_duplicate_insert = flags.intersects(
            InsertFlags::DUPLICATE
                | InsertFlags::DUPLICATE_INSERT_BEFORE
                | InsertFlags::DUPLICATE_INSERT_AFTER
                | InsertFlags::DUPLICATE_INSERT_FIRST
                | InsertFlags::DUPLICATE_INSERT_LAST,
        );
        let existing = self.btree.find(key, FindFlags::EXACT_MATCH).ok();
        let prev_record = if existing.is_some() && flags.contains(InsertFlags::OVERWRITE) {
            let r = existing.unwrap();
            Some(self.btree.get_record(r.leaf, r.slot)?)
        } else {
            None
        };

        self.btree.insert(key, record, flags)?;
        if let (Some(journal), Some(handle)) = (self.journal, &self.handle) {
            journal.append_insert(handle, self.dbname, key, record, flags)?;
        }

        if is_duplicate_insert {
            let r = self.btree.find(key, FindFlags::EXACT_MATCH)?;
            let count = self.btree.duplicate_count(r.leaf, r.slot)?;
            self.undo.push(UndoOp::RemoveDuplicateAt {
                key: key.to_vec(),
                dupe_id: count.saturating_sub(1),
            });
        } else if let Some(prev) = prev_record {
            self.undo.push(UndoOp::RestoreRecord {
                key: key.to_vec(),
                record: prev,
            });
        } else {
            self.undo.push(UndoOp::RemoveInserted { key: key.to_vec() });
        }
        Ok(())
    }

    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let r = self.btree.find(key, FindFlags::EXACT_MATCH)?;
        let record = self.btree.get_record(r.leaf, r.slot)?;
        self.btree.erase(key)?;
        if let (Some(journal), Some(handle)) = (self.journal, &self.handle) {
            journal.append_erase(handle, self.dbname, key, 0)?;
        }
        self.undo.push(UndoOp::ReinsertErased {
            key: key.to_vec(),
            record,
        });
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.ensure_open()?;
        if let (Some(journal), Some(handle)) = (self.journal, &self.handle) {
            journal.commit_txn(handle)?;
        }
        self.finished = true;
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        self.ensure_open()?;
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::RemoveInserted { key } => {
                    self.btree.erase(&key)?;
                }
                UndoOp::RestoreRecord { key, record } => {
                    self.btree.insert(&key, &record, InsertFlags::OVERWRITE)?;
                }
                UndoOp::RemoveDuplicateAt { key, dupe_id } => {
                    self.btree.erase_duplicate(&key, dupe_id)?;
                }
                UndoOp::ReinsertErased { key, record } => {
                    self.btree.insert(&key, &record, InsertFlags::empty())?;
                }
            }
        }
        if let (Some(journal), Some(handle)) = (self.journal, &self.handle) {
            journal.abort_txn(handle)?;
        }
        self.finished = true;
        Ok(())
    }
}

impl<'e> Drop for Transaction<'e> {
    /// A transaction dropped without an explicit commit/abort is treated as
    /// an abort: better to roll back than to silently leave a half-applied
    /// operation looking committed.
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        while let Some(op) = self.undo.pop() {
            let _ = match op {
                UndoOp::RemoveInserted { key } => self.btree.erase(&key),
                UndoOp::RestoreRecord { key, record } => {
                    self.btree.insert(&key, &record, InsertFlags::OVERWRITE)
                }
                UndoOp::RemoveDuplicateAt { key, dupe_id } => self.btree.erase_duplicate(&key, dupe_id),
                UndoOp::ReinsertErased { key, record } => {
                    self.btree.insert(&key, &record, InsertFlags::empty())
                }
            };
        }
        if let (Some(journal), Some(handle)) = (self.journal, &self.handle) {
            let _ = journal.abort_txn(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobManager, ExtKeyCache};
    use crate::cache::{Cache, CacheImpl};
    use crate::device::{Device, MemoryDevice};
    use crate::freelist::Freelist;
    use std::sync::Arc;

    fn new_btree() -> Arc<Btree> {
        let device = Arc::new(MemoryDevice::new());
        let cache: Arc<dyn Cache> = Arc::new(CacheImpl::new(device.clone(), 4096, 64));
        let freelist = Arc::new(Freelist::new(cache.clone(), None));
        let blobs = Arc::new(BlobManager::new(device, cache.clone(), freelist));
        let extkeys = Arc::new(ExtKeyCache::new(16));
        Arc::new(Btree::create(cache, blobs, extkeys, 16, false).unwrap())
    }

    fn new_journal() -> Journal {
        let d0: Arc<dyn Device> = Arc::new(MemoryDevice::new());
        let d1: Arc<dyn Device> = Arc::new(MemoryDevice::new());
        Journal::create(d0, d1).unwrap()
    }

    #[test]
    fn commit_makes_insert_visible() {
        let tree = new_btree();
        let journal = new_journal();
        let mut txn = Transaction::begin(tree.clone(), Some(&journal), 1).unwrap();
        txn.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        txn.commit().unwrap();
        let r = tree.find(b"k", FindFlags::empty()).unwrap();
        assert_eq!(tree.get_record(r.leaf, r.slot).unwrap(), b"v");
    }

    #[test]
    fn abort_undoes_insert() {
        let tree = new_btree();
        let journal = new_journal();
        let mut txn = Transaction::begin(tree.clone(), Some(&journal), 1).unwrap();
        txn.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        txn.abort().unwrap();
        assert!(tree.find(b"k", FindFlags::empty()).is_err());
    }

    #[test]
    fn abort_restores_overwritten_record() {
        let tree = new_btree();
        let journal = new_journal();
        tree.insert(b"k", b"old", InsertFlags::empty()).unwrap();
        let mut txn = Transaction::begin(tree.clone(), Some(&journal), 1).unwrap();
        txn.insert(b"k", b"new", InsertFlags::OVERWRITE).unwrap();
        txn.abort().unwrap();
        let r = tree.find(b"k", FindFlags::empty()).unwrap();
        assert_eq!(tree.get_record(r.leaf, r.slot).unwrap(), b"old");
    }

    #[test]
    fn abort_restores_erased_key() {
        let tree = new_btree();
        let journal = new_journal();
        tree.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        let mut txn = Transaction::begin(tree.clone(), Some(&journal), 1).unwrap();
        txn.erase(b"k").unwrap();
        txn.abort().unwrap();
        let r = tree.find(b"k", FindFlags::empty()).unwrap();
        assert_eq!(tree.get_record(r.leaf, r.slot).unwrap(), b"v");
    }

    #[test]
    fn drop_without_commit_aborts() {
        let tree = new_btree();
        let journal = new_journal();
        {
            let mut txn = Transaction::begin(tree.clone(), Some(&journal), 1).unwrap();
            txn.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        }
        assert!(tree.find(b"k", FindFlags::empty()).is_err());
    }

    #[test]
    fn left_open_transaction_is_undone_as_if_crashed() {
        // Txn A commits, txn B is left open (never committed or aborted) and
        // its abort is simulated by dropping it, matching the "begin B, do
        // not commit, simulate crash, recover" scenario.
        let tree = new_btree();
        let journal = new_journal();
        let mut a = Transaction::begin_with_guard(tree.clone(), Some(&journal), 1, None).unwrap();
        a.insert(b"a", b"1", InsertFlags::empty()).unwrap();
        a.commit().unwrap();

        let mut b = Transaction::begin_with_guard(tree.clone(), Some(&journal), 1, None).unwrap();
        b.insert(b"b", b"2", InsertFlags::empty()).unwrap();
        drop(b);

        let r = tree.find(b"a", FindFlags::empty()).unwrap();
        assert_eq!(tree.get_record(r.leaf, r.slot).unwrap(), b"1");
        assert!(tree.find(b"b", FindFlags::empty()).is_err());
    }
}
