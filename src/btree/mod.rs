//! B+tree implementation: on-page node layout, tree operations, and cursors.
//!
//! - [`node`]: the packed on-page entry layout (`int_key_t`-style)
//! - [`tree`]: traversal, find, insert/split, erase/rebalance, record-number
//!   mode, integrity checking, enumeration
//! - [`cursor`]: a coupled/uncoupled position over a tree

mod cursor;
mod node;
mod tree;

pub use cursor::Cursor;
pub use node::{BtreeNode, Entry, NodeHeader};
pub use tree::{Btree, EnumerateControl, EnumerateEvent, FindResult};
