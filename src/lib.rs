//! # hamstore
//!
//! An embedded, file-backed key-value storage engine: a B+tree index over
//! variable-length keys and records, a blob manager for payloads too large
//! to live inline, and a crash-safe two-file journal.
//!
//! ## Architecture
//!
//! - **Device** (`device`): positional I/O over a file or an in-memory buffer
//! - **Cache** (`cache`): bounded page cache with pin-aware eviction
//! - **Freelist** (`freelist`): bitmap tracking of reclaimed file space
//! - **Blob manager** (`blob`): variable-length records and duplicate tables
//! - **B+tree** (`btree`): the index itself, plus its cursor
//! - **Journal** (`journal`): write-ahead log and crash recovery
//! - **Transaction** (`txn`): commit/abort bracketing over a single database
//! - **Environment** (`env`): the façade tying all of the above to one file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hamstore::{Config, DbFlags, Environment, InsertFlags};
//!
//! let env = Environment::create("my_database.db", Config::new())?;
//! let db = env.create_db(1, 32, DbFlags::empty())?;
//!
//! db.insert(b"hello", b"world", InsertFlags::empty())?;
//! assert_eq!(db.find(b"hello")?, b"world");
//! db.erase(b"hello")?;
//! # Ok::<(), hamstore::StorageError>(())
//! ```

pub mod blob;
pub mod btree;
pub mod cache;
pub mod device;
pub mod env;
pub mod error;
pub mod freelist;
pub mod journal;
pub mod page;
pub mod txn;
pub mod types;

pub use btree::{Cursor, EnumerateControl, EnumerateEvent};
pub use env::{Config, Db, Environment};
pub use error::{Result, StorageError};
pub use txn::Transaction;
pub use types::{DbFlags, FindFlags, InsertFlags, MoveDirection, MoveFlags};
