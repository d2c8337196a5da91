//! # bptr — Embedded Memory-Mapped B+Tree Store
//!
//! `bptr` is an embedded, single-file, ordered key-value store. Keys are
//! composite 64-bit pairs `(k1, k2)` in lexicographic order (plain `u64`
//! keys are the degenerate `k2 = 0` case), values are `u64`, and one file
//! can hold up to 500 independent trees ("roots").
//!
//! ## Architecture
//!
//! Three layers compose bottom-up:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Engine)          │  RwLock: readers ∥, one writer
//! ├─────────────────────────────────────┤
//! │     B+Tree (node codecs + ops)      │  search / split / rebalance / scan
//! ├─────────────────────────────────────┤
//! │   Pager (meta, roots, free list)    │  page alloc/free, root directory
//! ├─────────────────────────────────────┤
//! │   Memory-mapped region (mmap)       │  grow-and-remap, msync
//! └─────────────────────────────────────┘
//! ```
//!
//! Every page is 4096 bytes; page 0 holds the metadata (magic, version, root
//! directory, free list). Nodes never store parent pointers: descent state
//! lives on the operation's call stack.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bptr::Engine;
//!
//! # fn main() -> eyre::Result<()> {
//! let engine = Engine::open("data.db")?;
//! let root = engine.create_root()?;
//!
//! engine.insert(root, 10u64, 100)?;
//! assert_eq!(engine.find(root, 10u64)?, Some(100));
//!
//! engine.flush()?; // the only durability boundary
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! The engine supports many concurrent readers or one exclusive writer,
//! enforced by a reader-writer lock. Windows into the mapping never outlive
//! an operation: any call that can grow the file takes the pager exclusively,
//! so remapping cannot invalidate a live reader.
//!
//! ## Durability
//!
//! There is no write-ahead log. Mutations land in the mapping immediately and
//! reach disk when the OS writes them back, but only [`Engine::flush`] gives
//! a guarantee. A crash between flushes can leave a torn file; callers that
//! need crash atomicity must layer their own journal.
//!
//! ## Module Overview
//!
//! - [`storage`]: mapped region, meta page, pager
//! - [`btree`]: node codecs and tree operations
//! - [`Engine`]: the public handle

pub mod btree;
mod engine;
pub mod storage;

pub use btree::{ConsistencyReport, Key};
pub use engine::{Engine, OpenOptions};
pub use storage::{PageId, RootId, MAX_ROOTS, PAGE_SIZE};
