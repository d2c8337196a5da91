//! # Engine
//!
//! The public handle over one store file. An [`Engine`] owns the pager behind
//! a reader-writer lock and exposes the full operation set:
//!
//! | Operation | Guard |
//! |---|---|
//! | `find`, `find_range`, `count`, `root_count`, `page_count` | shared |
//! | `insert`, `delete`, `flush`, `create_root`, `delete_root` | exclusive |
//!
//! Any number of readers run concurrently against a consistent snapshot;
//! writers are serialized and block readers for the duration of one logical
//! operation. There are no transactions: each call is its own atom, and
//! [`Engine::flush`] is the only durability boundary.
//!
//! ## Example
//!
//! ```no_run
//! use bptr::{Engine, Key};
//!
//! # fn main() -> eyre::Result<()> {
//! let engine = Engine::open("data.db")?;
//! let root = engine.create_root()?;
//!
//! engine.insert(root, 10u64, 100)?;
//! engine.insert(root, Key::new(10, 7), 170)?;
//!
//! assert_eq!(engine.find(root, 10u64)?, Some(100));
//! engine.find_range(root, 0u64, 50u64, |key, value| {
//!     println!("{key:?} = {value}");
//!     true
//! })?;
//!
//! engine.flush()?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use eyre::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::btree::{check_consistency, BTree, BTreeMut, ConsistencyReport, Key};
use crate::storage::{Pager, RootId, INITIAL_FILE_SIZE, PAGE_SIZE};

/// Options for opening a store file.
///
/// ```no_run
/// # fn main() -> eyre::Result<()> {
/// let engine = bptr::OpenOptions::new()
///     .initial_size(16 * 1024 * 1024)
///     .open("data.db")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    initial_size: u64,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            initial_size: INITIAL_FILE_SIZE,
        }
    }

    /// Size a fresh file is extended to before mapping, rounded up to a page
    /// multiple. Larger values avoid early grow-and-remap cycles for stores
    /// with a known working set.
    pub fn initial_size(mut self, bytes: u64) -> Self {
        let pages = bytes.div_ceil(PAGE_SIZE as u64).max(1);
        self.initial_size = pages * PAGE_SIZE as u64;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Engine> {
        let pager = Pager::open_with_initial_size(path, self.initial_size)?;
        Ok(Engine {
            pager: RwLock::new(pager),
        })
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// An embedded, single-file, multi-root ordered key-value store.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Engine {
    pager: RwLock<Pager>,
}

impl Engine {
    /// Opens or creates the store at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        OpenOptions::new().open(path)
    }

    /// Serializes metadata into page 0 and `msync`s the file. Nothing is
    /// guaranteed durable before this returns.
    pub fn flush(&self) -> Result<()> {
        self.pager.write().flush()
    }

    /// Unmaps and closes the store. Does not flush: call [`Engine::flush`]
    /// first if the latest updates must reach disk before close.
    pub fn close(self) -> Result<()> {
        let _pager = self.pager.into_inner();
        debug!("closed store");
        Ok(())
    }

    /// Claims a new tree and returns its root ID. Fails when all
    /// [`crate::storage::MAX_ROOTS`] slots are taken.
    pub fn create_root(&self) -> Result<RootId> {
        self.pager.write().create_root()
    }

    /// Removes a tree from the root directory.
    ///
    /// The tree's pages are *not* freed: they stay allocated and unreachable
    /// (see the report of [`Engine::check_consistency`]). Delete all keys
    /// first if the space matters.
    pub fn delete_root(&self, root_id: RootId) -> Result<()> {
        self.pager.write().delete_root(root_id)
    }

    /// Number of live trees.
    pub fn root_count(&self) -> u64 {
        self.pager.read().root_count()
    }

    /// Total allocated pages, including the meta page and free pages.
    pub fn page_count(&self) -> u64 {
        self.pager.read().page_count()
    }

    /// Inserts or updates one entry in the given tree.
    pub fn insert(&self, root_id: RootId, key: impl Into<Key>, value: u64) -> Result<()> {
        let mut pager = self.pager.write();
        BTreeMut::new(&mut pager, root_id).insert(key.into(), value)
    }

    /// Point lookup. A missing key is `None`, not an error.
    pub fn find(&self, root_id: RootId, key: impl Into<Key>) -> Result<Option<u64>> {
        let pager = self.pager.read();
        let root_page = pager.root_page(root_id)?;
        BTree::new(&pager, root_page).find(key.into())
    }

    /// Calls `visit` for every entry with `start <= key <= end` in ascending
    /// key order; return `false` from the callback to stop early.
    pub fn find_range(
        &self,
        root_id: RootId,
        start: impl Into<Key>,
        end: impl Into<Key>,
        mut visit: impl FnMut(Key, u64) -> bool,
    ) -> Result<()> {
        let pager = self.pager.read();
        let root_page = pager.root_page(root_id)?;
        BTree::new(&pager, root_page).scan(start.into(), end.into(), &mut visit)
    }

    /// Removes a key. Returns whether it was present; a missing key is not
    /// an error.
    pub fn delete(&self, root_id: RootId, key: impl Into<Key>) -> Result<bool> {
        let mut pager = self.pager.write();
        BTreeMut::new(&mut pager, root_id).delete(key.into())
    }

    /// Number of entries in the tree. O(n): a full range scan.
    pub fn count(&self, root_id: RootId) -> Result<u64> {
        let pager = self.pager.read();
        let root_page = pager.root_page(root_id)?;
        BTree::new(&pager, root_page).count()
    }

    /// Walks every tree and the free list, verifying structural invariants,
    /// and reports how the allocated pages are accounted for.
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        let pager = self.pager.read();
        check_consistency(&pager)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pager = self.pager.read();
        f.debug_struct("Engine")
            .field("page_count", &pager.page_count())
            .field("root_count", &pager.root_count())
            .finish()
    }
}
