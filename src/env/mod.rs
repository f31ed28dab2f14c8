//! Environment and database façade: the top-level API tying the device,
//! cache, freelist, blob manager, B+tree and journal together behind a
//! single file.
//!
//! Grounded on the teacher's `lib.rs::Db`/`Config` (a single struct owning
//! every subsystem, builder-style configuration, `open`/`create`
//! constructors), generalized to hamsterdb's multi-database-per-file layout
//! and the dedicated background flusher of SPEC_FULL.md §5.

mod flusher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::blob::{BlobManager, ExtKeyCache};
use crate::btree::{Btree, Cursor, EnumerateControl, EnumerateEvent};
use crate::cache::{Cache, CacheImpl};
use crate::device::{Device, FileDevice, MemoryDevice};
use crate::error::{Result, StorageError};
use crate::freelist::Freelist;
use crate::journal::{Journal, ReplayOp};
use crate::page::{DbDirectorySlot, FileHeader};
use crate::txn::Transaction;
use crate::types::{DbFlags, FindFlags, InsertFlags, PageAddress, DB_DIRECTORY_SLOT_SIZE, MIN_PAGE_SIZE};

use flusher::FlusherHandle;

/// Tuning knobs for [`Environment::create`] / [`Environment::open`].
#[derive(Debug, Clone)]
pub struct Config {
    page_size: usize,
    cache_capacity: usize,
    journal_threshold: usize,
    auto_recovery: bool,
    in_memory: bool,
    flush_interval: Duration,
}

impl Config {
    pub fn new() -> Self {
        Self {
            page_size: crate::types::DEFAULT_PAGE_SIZE,
            cache_capacity: 256,
            journal_threshold: 16,
            auto_recovery: true,
            in_memory: false,
            flush_interval: Duration::from_millis(500),
        }
    }

    /// Page size in bytes. Must be a power of two, at least [`MIN_PAGE_SIZE`].
    /// Only consulted by `create`; `open` always uses the page size recorded
    /// in the file header.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Number of pages the cache may hold resident before it starts evicting.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Transactions per journal file before rotating to the other one.
    pub fn journal_threshold(mut self, threshold: usize) -> Self {
        self.journal_threshold = threshold;
        self
    }

    /// Whether `open` should replay uncheckpointed committed transactions
    /// automatically, rather than returning [`StorageError::NeedRecovery`].
    pub fn auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery = enabled;
        self
    }

    /// Backs the environment with a growable in-memory buffer instead of a
    /// file. No journal is kept: nothing survives process exit to recover.
    pub fn in_memory(mut self, enabled: bool) -> Self {
        self.in_memory = enabled;
        self
    }

    /// How often the background flusher wakes up even without being
    /// notified of a commit.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_page_size(page_size: usize) -> Result<()> {
    if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
        return Err(StorageError::InvalidPageSize(format!(
            "page size must be a power of two >= {MIN_PAGE_SIZE}, got {page_size}"
        )));
    }
    Ok(())
}

fn journal_path(base: &Path, index: u8) -> PathBuf {
    PathBuf::from(format!("{}.jrn{}", base.display(), index))
}

fn freelist_head(header: &FileHeader) -> Option<PageAddress> {
    if header.page_manager_state.is_null() {
        None
    } else {
        Some(header.page_manager_state)
    }
}

fn apply_replay_op(databases: &HashMap<u16, Arc<Btree>>, op: ReplayOp) -> Result<()> {
    match op {
        ReplayOp::Insert {
            dbname,
            key,
            record,
            flags,
        } => {
            let tree = databases
                .get(&dbname)
                .ok_or(StorageError::DatabaseNotFound(dbname))?;
            tree.insert(&key, &record, flags)?;
        }
        ReplayOp::Erase {
            dbname,
            key,
            duplicate_index,
        } => {
            let tree = databases
                .get(&dbname)
                .ok_or(StorageError::DatabaseNotFound(dbname))?;
            if duplicate_index == 0 {
                tree.erase(&key)?;
            } else {
                tree.erase_duplicate(&key, duplicate_index as usize)?;
            }
        }
    }
    Ok(())
}

/// An open database file (or in-memory store) and every database within it.
///
/// All public operations serialize through [`Environment::op_lock`]: the
/// core is single-threaded and cooperative (SPEC_FULL.md §5), so the only
/// concurrency here is between a caller and the background flusher.
pub struct Environment {
    device: Arc<dyn Device>,
    cache: Arc<dyn Cache>,
    freelist: Arc<Freelist>,
    blobs: Arc<BlobManager>,
    extkeys: Arc<ExtKeyCache>,
    journal: Option<Arc<Journal>>,
    databases: RwLock<HashMap<u16, Arc<Btree>>>,
    header: Mutex<FileHeader>,
    op_lock: Mutex<()>,
    flusher: Mutex<Option<FlusherHandle>>,
}

impl Environment {
    /// Creates a fresh environment, overwriting whatever was at `path`.
    pub fn create(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        validate_page_size(config.page_size)?;
        let path = path.as_ref();

        if config.in_memory {
            let device: Arc<dyn Device> = Arc::new(MemoryDevice::new());
            return Self::init(device, None, config);
        }

        let device: Arc<dyn Device> = Arc::new(FileDevice::open(path)?);
        let jrn0: Arc<dyn Device> = Arc::new(FileDevice::open(journal_path(path, 0))?);
        let jrn1: Arc<dyn Device> = Arc::new(FileDevice::open(journal_path(path, 1))?);
        Self::init(device, Some((jrn0, jrn1)), config)
    }

    fn init(
        device: Arc<dyn Device>,
        journal_devices: Option<(Arc<dyn Device>, Arc<dyn Device>)>,
        config: Config,
    ) -> Result<Self> {
        // Reserve page 0 for the file header before the cache allocates
        // anything: `CacheImpl::alloc` hands out `device.seek_end()`, so the
        // device must already be at least one page long.
        device.truncate(config.page_size as u64)?;

        let cache: Arc<dyn Cache> = Arc::new(CacheImpl::new(device.clone(), config.page_size, config.cache_capacity));
        let freelist = Arc::new(Freelist::new(cache.clone(), None));
        let blobs = Arc::new(BlobManager::new(device.clone(), cache.clone(), freelist.clone()));
        let extkeys = Arc::new(ExtKeyCache::new(config.cache_capacity));

        let header = FileHeader::new(config.page_size as u32);
        device.write(0, &header.write())?;

        let journal = match journal_devices {
            Some((d0, d1)) => Some(Arc::new(
                Journal::create(d0, d1)?.with_threshold(config.journal_threshold),
            )),
            None => None,
        };

        let env = Self {
            device,
            cache,
            freelist,
            blobs,
            extkeys,
            journal,
            databases: RwLock::new(HashMap::new()),
            header: Mutex::new(header),
            op_lock: Mutex::new(()),
            flusher: Mutex::new(None),
        };
        env.start_flusher(config.flush_interval)?;
        Ok(env)
    }

    /// Opens an existing file-backed environment, replaying any committed
    /// transactions the journal holds that were not yet checkpointed.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        if config.in_memory {
            return Err(StorageError::invalid_parameter(
                "an in-memory environment cannot be reopened from a path",
            ));
        }
        let path = path.as_ref();
        let device: Arc<dyn Device> = Arc::new(FileDevice::open(path)?);

        let mut prefix = vec![0u8; 28];
        device.read(0, &mut prefix)?;
        let max_databases = u16::from_le_bytes(prefix[16..18].try_into().unwrap());
        let header_len = 28 + max_databases as usize * DB_DIRECTORY_SLOT_SIZE;
        let mut header_buf = vec![0u8; header_len];
        device.read(0, &mut header_buf)?;
        let header = FileHeader::read(&header_buf)?;
        let page_size = header.page_size as usize;

        let cache: Arc<dyn Cache> = Arc::new(CacheImpl::new(device.clone(), page_size, config.cache_capacity));
        let freelist = Arc::new(Freelist::new(cache.clone(), freelist_head(&header)));
        let blobs = Arc::new(BlobManager::new(device.clone(), cache.clone(), freelist.clone()));
        let extkeys = Arc::new(ExtKeyCache::new(config.cache_capacity));

        let mut databases = HashMap::new();
        for slot in header.slots.iter().filter(|s| s.dbname != 0) {
            let recno_mode = DbFlags::from_bits_truncate(slot.flags).contains(DbFlags::RECORD_NUMBER);
            let tree = Btree::open(
                cache.clone(),
                blobs.clone(),
                extkeys.clone(),
                slot.keysize as usize,
                recno_mode,
                slot.rootpage,
                slot.recno,
            );
            databases.insert(slot.dbname, Arc::new(tree));
        }

        let jrn0: Arc<dyn Device> = Arc::new(FileDevice::open(journal_path(path, 0))?);
        let jrn1: Arc<dyn Device> = Arc::new(FileDevice::open(journal_path(path, 1))?);
        let (journal, report) = Journal::open(jrn0, jrn1, config.auto_recovery)?;
        let journal = journal.with_threshold(config.journal_threshold);

        for op in report.ops {
            apply_replay_op(&databases, op)?;
        }

        let env = Self {
            device,
            cache,
            freelist,
            blobs,
            extkeys,
            journal: Some(Arc::new(journal)),
            databases: RwLock::new(databases),
            header: Mutex::new(header),
            op_lock: Mutex::new(()),
            flusher: Mutex::new(None),
        };
        env.start_flusher(config.flush_interval)?;
        Ok(env)
    }

    fn start_flusher(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Ok(());
        }
        let handle = FlusherHandle::spawn(self.cache.clone(), interval)?;
        *self.flusher.lock() = Some(handle);
        Ok(())
    }

    fn notify_flusher(&self) {
        if let Some(handle) = self.flusher.lock().as_ref() {
            handle.notify();
        }
    }

    /// Creates a new database within this environment.
    pub fn create_db(&self, dbname: u16, keysize: usize, flags: DbFlags) -> Result<Db<'_>> {
        if dbname == 0 {
            return Err(StorageError::invalid_parameter("database name 0 is reserved"));
        }
        let _guard = self.op_lock.lock();
        let mut header = self.header.lock();
        if header.find_slot(dbname).is_some() {
            return Err(StorageError::invalid_parameter(format!(
                "database {dbname} already exists"
            )));
        }
        let slot_index = header
            .find_free_slot()
            .ok_or_else(|| StorageError::invalid_parameter("no free database directory slot"))?;

        let recno_mode = flags.contains(DbFlags::RECORD_NUMBER);
        let tree = Arc::new(Btree::create(
            self.cache.clone(),
            self.blobs.clone(),
            self.extkeys.clone(),
            keysize,
            recno_mode,
        )?);

        header.slots[slot_index] = DbDirectorySlot {
            dbname,
            maxkeys: 0,
            keysize: keysize as u16,
            flags: flags.bits(),
            rootpage: tree.root(),
            recno: tree.last_recno(),
        };
        self.device.write(0, &header.write())?;
        drop(header);

        self.databases.write().insert(dbname, tree.clone());
        Ok(Db {
            env: self,
            dbname,
            tree,
        })
    }

    /// Opens a database that was previously created in this environment.
    pub fn open_db(&self, dbname: u16) -> Result<Db<'_>> {
        let tree = self.database(dbname)?;
        Ok(Db {
            env: self,
            dbname,
            tree,
        })
    }

    fn database(&self, dbname: u16) -> Result<Arc<Btree>> {
        self.databases
            .read()
            .get(&dbname)
            .cloned()
            .ok_or(StorageError::DatabaseNotFound(dbname))
    }

    /// Rewrites the file header with each database's current root page and
    /// record-number counter, and the freelist's current head.
    fn sync_header(&self) -> Result<()> {
        let mut header = self.header.lock();
        header.page_manager_state = self.freelist.head().unwrap_or(PageAddress::NULL);
        let databases = self.databases.read();
        for slot in header.slots.iter_mut() {
            if slot.dbname == 0 {
                continue;
            }
            if let Some(tree) = databases.get(&slot.dbname) {
                slot.rootpage = tree.root();
                slot.recno = tree.last_recno();
            }
        }
        self.device.write(0, &header.write())
    }

    /// Flushes every dirty page and the file header to disk.
    pub fn sync(&self) -> Result<()> {
        self.sync_header()?;
        self.cache.flush_all()
    }

    /// Stops the background flusher and flushes everything to disk.
    pub fn close(&self) -> Result<()> {
        *self.flusher.lock() = None;
        self.sync()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("error closing environment: {err}");
        }
    }
}

/// A handle to one database within an [`Environment`].
pub struct Db<'e> {
    env: &'e Environment,
    dbname: u16,
    tree: Arc<Btree>,
}

impl<'e> Db<'e> {
    pub fn dbname(&self) -> u16 {
        self.dbname
    }

    /// Looks up `key`'s first (or only) record.
    pub fn find(&self, key: &[u8]) -> Result<Vec<u8>> {
        let r = self.tree.find(key, FindFlags::empty())?;
        self.tree.get_record(r.leaf, r.slot)
    }

    /// Inserts or overwrites `key` inside its own transaction: applied to
    /// the tree immediately and journaled before this call returns.
    pub fn insert(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        let _guard = self.env.op_lock.lock();
        let mut txn = Transaction::begin(self.tree.clone(), self.env.journal.as_deref(), self.dbname)?;
        txn.insert(key, record, flags)?;
        txn.commit()?;
        self.env.notify_flusher();
        Ok(())
    }

    /// Erases `key` (and, if it has duplicates, every duplicate) inside its
    /// own transaction.
    pub fn erase(&self, key: &[u8]) -> Result<()> {
        let _guard = self.env.op_lock.lock();
        let mut txn = Transaction::begin(self.tree.clone(), self.env.journal.as_deref(), self.dbname)?;
        txn.erase(key)?;
        txn.commit()?;
        self.env.notify_flusher();
        Ok(())
    }

    /// Inserts `record` under a freshly assigned record number. Only valid
    /// for databases created with `DbFlags::RECORD_NUMBER`.
    pub fn insert_autoincrement(&self, record: &[u8], flags: InsertFlags) -> Result<u64> {
        let _guard = self.env.op_lock.lock();
        let recno = self.tree.insert_autoincrement(record, flags)?;
        self.env.notify_flusher();
        Ok(recno)
    }

    /// A standalone cursor over this database, positioned nowhere until
    /// moved or a find succeeds.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.tree.clone())
    }

    /// Opens an explicit transaction the caller drives to `commit`/`abort`
    /// (or simply drops, which aborts). Holds the environment's op lock for
    /// the transaction's whole lifetime, so only one explicit transaction
    /// can be open at a time per environment.
    pub fn begin_txn(&self) -> Result<Transaction<'e>> {
        let guard = self.env.op_lock.lock();
        Transaction::begin_with_guard(self.tree.clone(), self.env.journal.as_deref(), self.dbname, Some(guard))
    }

    pub fn check_integrity(&self) -> Result<()> {
        self.tree.check_integrity()
    }

    pub fn height(&self) -> Result<usize> {
        self.tree.height()
    }

    pub fn enumerate<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(EnumerateEvent) -> Result<EnumerateControl>,
    {
        self.tree.enumerate(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find_in_memory() {
        let env = Environment::create("unused", Config::new().in_memory(true)).unwrap();
        let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
        db.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        assert_eq!(db.find(b"k").unwrap(), b"v");
    }

    #[test]
    fn erase_removes_key() {
        let env = Environment::create("unused", Config::new().in_memory(true)).unwrap();
        let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
        db.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        db.erase(b"k").unwrap();
        assert!(matches!(db.find(b"k"), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn cursor_walks_every_key_in_order() {
        let env = Environment::create("unused", Config::new().in_memory(true)).unwrap();
        let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
        for k in [b"a", b"b", b"c"] {
            db.insert(k, b"v", InsertFlags::empty()).unwrap();
        }
        let mut cursor = db.cursor();
        cursor
            .move_to(crate::types::MoveDirection::First, crate::types::MoveFlags::empty())
            .unwrap();
        let mut seen = vec![cursor.key().unwrap()];
        while cursor
            .move_to(crate::types::MoveDirection::Next, crate::types::MoveFlags::empty())
            .is_ok()
        {
            seen.push(cursor.key().unwrap());
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn begin_txn_commit_makes_insert_visible() {
        let env = Environment::create("unused", Config::new().in_memory(true)).unwrap();
        let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
        let mut txn = db.begin_txn().unwrap();
        txn.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        txn.commit().unwrap();
        assert_eq!(db.find(b"k").unwrap(), b"v");
    }

    #[test]
    fn begin_txn_left_open_is_rolled_back_on_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.db");
        let config = || Config::new().page_size(4096).flush_interval(Duration::from_secs(3600));

        {
            let env = Environment::create(&path, config()).unwrap();
            let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
            env.sync().unwrap();
            db.insert(b"a", b"1", InsertFlags::empty()).unwrap();

            let mut txn = db.begin_txn().unwrap();
            txn.insert(b"b", b"2", InsertFlags::empty()).unwrap();
            // Never committed or aborted: simulate a crash before any
            // destructor (and thus any drop-triggered rollback) runs.
            std::mem::forget(txn);
            drop(db);
            std::mem::forget(env);
        }

        let env = Environment::open(&path, config()).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.find(b"a").unwrap(), b"1");
        assert!(matches!(db.find(b"b"), Err(StorageError::KeyNotFound)));
    }

    #[test]
    fn second_database_with_same_name_is_rejected() {
        let env = Environment::create("unused", Config::new().in_memory(true)).unwrap();
        env.create_db(1, 16, DbFlags::empty()).unwrap();
        assert!(env.create_db(1, 16, DbFlags::empty()).is_err());
    }

    #[test]
    fn uncheckpointed_commit_is_replayed_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.db");
        let config = || Config::new().page_size(4096).flush_interval(Duration::from_secs(3600));

        {
            let env = Environment::create(&path, config()).unwrap();
            let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
            env.sync().unwrap();
            db.insert(b"k", b"v", InsertFlags::empty()).unwrap();
            drop(db);
            std::mem::forget(env);
        }

        let env = Environment::open(&path, config()).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.find(b"k").unwrap(), b"v");
    }

    #[test]
    fn needs_recovery_surfaces_without_auto_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.db");
        let config = || Config::new().page_size(4096).flush_interval(Duration::from_secs(3600));

        {
            let env = Environment::create(&path, config()).unwrap();
            let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
            env.sync().unwrap();
            db.insert(b"k", b"v", InsertFlags::empty()).unwrap();
            drop(db);
            std::mem::forget(env);
        }

        let result = Environment::open(&path, config().auto_recovery(false));
        assert!(matches!(result, Err(StorageError::NeedRecovery)));
    }

    #[test]
    fn enumerate_visits_items_in_order_and_honors_stop() {
        let env = Environment::create("unused", Config::new().in_memory(true)).unwrap();
        let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
        for k in [b"a", b"b", b"c", b"d"] {
            db.insert(k, b"v", InsertFlags::empty()).unwrap();
        }

        let mut seen = Vec::new();
        db.enumerate(|ev| {
            if let EnumerateEvent::Item { key, .. } = ev {
                seen.push(key.to_vec());
            }
            Ok(EnumerateControl::Continue)
        })
        .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let mut count = 0;
        db.enumerate(|ev| {
            if matches!(ev, EnumerateEvent::Item { .. }) {
                count += 1;
                if count == 2 {
                    return Ok(EnumerateControl::Stop);
                }
            }
            Ok(EnumerateControl::Continue)
        })
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn sync_then_reopen_preserves_data_without_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.db");
        let config = || Config::new().page_size(4096).flush_interval(Duration::from_secs(3600));

        let env = Environment::create(&path, config()).unwrap();
        let db = env.create_db(1, 16, DbFlags::empty()).unwrap();
        db.insert(b"k", b"v", InsertFlags::empty()).unwrap();
        drop(db);
        env.close().unwrap();
        drop(env);

        let env = Environment::open(&path, config()).unwrap();
        let db = env.open_db(1).unwrap();
        assert_eq!(db.find(b"k").unwrap(), b"v");
    }
}
