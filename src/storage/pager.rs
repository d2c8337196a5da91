//! # Pager
//!
//! The pager partitions the mapped region into fixed 4096-byte pages and owns
//! every piece of file metadata: the magic/version stamp, the page count, the
//! free list and the root directory.
//!
//! ## Allocation
//!
//! `allocate_page` pops the free list when it is non-empty; the next pointer
//! of a free page lives in its first 8 bytes. Otherwise the page count is
//! extended, doubling the mapped size as often as needed to cover the new
//! page. Freed pages are pushed onto the free list head; the file never
//! shrinks.
//!
//! ## Window invalidation
//!
//! `allocate_page` can grow and therefore remap the region, which moves the
//! base address. Any window obtained from `page`/`page_mut` before the call is
//! dangling afterwards. This is not a runtime-checked property: it is enforced
//! at compile time because every window borrows the pager and `allocate_page`
//! takes `&mut self`. Tree code re-fetches windows by page ID after every
//! allocation.
//!
//! ## Durability
//!
//! Metadata mutations are serialized into page 0 immediately (a memcpy into
//! the mapping) but only reach disk at [`Pager::flush`], which rewrites the
//! meta header and `msync`s the whole region. A crash between flushes can lose
//! or tear recent updates; that is the documented contract.

use std::path::Path;

use eyre::{ensure, Result};
use tracing::debug;

use super::meta::{MetaHeader, MAX_ROOTS, RESERVED_ROOT};
use super::mmap::MmapRegion;
use super::{PageId, RootId, INITIAL_FILE_SIZE, PAGE_SIZE};

/// Multiplier applied to the mapped size while it is too small for a newly
/// extended page.
const GROWTH_FACTOR: u64 = 2;

#[derive(Debug)]
pub struct Pager {
    region: MmapRegion,
    meta: Box<MetaHeader>,
}

impl Pager {
    /// Opens `path`, mapping at least [`INITIAL_FILE_SIZE`] bytes, and loads
    /// or initializes the meta page.
    ///
    /// A blank file (zero magic) is stamped with a fresh header. A non-blank
    /// file with the wrong magic or version is rejected.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_initial_size(path, INITIAL_FILE_SIZE)
    }

    pub fn open_with_initial_size<P: AsRef<Path>>(path: P, initial_size: u64) -> Result<Self> {
        ensure!(
            initial_size >= PAGE_SIZE as u64 && initial_size % PAGE_SIZE as u64 == 0,
            "initial size {} must be a non-zero multiple of page size {}",
            initial_size,
            PAGE_SIZE
        );

        let mut region = MmapRegion::open(path, initial_size)?;

        let mut meta = Box::new(MetaHeader::read_from(region.slice(0, PAGE_SIZE)?)?);
        if meta.is_blank() {
            *meta = MetaHeader::new();
            meta.write_to(region.slice_mut(0, PAGE_SIZE)?)?;
            debug!("initialized fresh store");
        } else {
            meta.validate()?;
        }

        debug!(
            page_count = meta.page_count(),
            root_count = meta.root_count(),
            "opened store"
        );

        Ok(Self { region, meta })
    }

    fn write_meta(&mut self) -> Result<()> {
        self.meta.write_to(self.region.slice_mut(0, PAGE_SIZE)?)
    }

    /// Serializes the meta header into page 0 and `msync`s the region. This
    /// is the sole durability boundary.
    pub fn flush(&mut self) -> Result<()> {
        self.write_meta()?;
        self.region.sync()?;
        debug!(page_count = self.meta.page_count(), "flushed store");
        Ok(())
    }

    /// Total number of allocated pages, including the meta page.
    pub fn page_count(&self) -> u64 {
        self.meta.page_count()
    }

    /// Head of the free list, `0` when empty.
    pub fn free_list_head(&self) -> PageId {
        self.meta.free_list()
    }

    /// Returns the 4096-byte window for `id`.
    ///
    /// The window is valid only until the next call that can remap the
    /// region (`allocate_page`); re-fetch by page ID after any allocation.
    pub fn page(&self, id: PageId) -> Result<&[u8]> {
        ensure!(
            id < self.meta.page_count(),
            "page {} out of bounds (page_count={})",
            id,
            self.meta.page_count()
        );
        self.region.slice(id as usize * PAGE_SIZE, PAGE_SIZE)
    }

    pub fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        ensure!(
            id < self.meta.page_count(),
            "page {} out of bounds (page_count={})",
            id,
            self.meta.page_count()
        );
        self.region.slice_mut(id as usize * PAGE_SIZE, PAGE_SIZE)
    }

    /// Returns mutable windows for two distinct pages at once, for node
    /// operations that rewrite a page pair in place.
    pub fn page_pair_mut(&mut self, a: PageId, b: PageId) -> Result<(&mut [u8], &mut [u8])> {
        ensure!(a != b, "page pair requires distinct pages, got {} twice", a);
        let count = self.meta.page_count();
        ensure!(
            a < count && b < count,
            "page pair ({}, {}) out of bounds (page_count={})",
            a,
            b,
            count
        );
        self.region
            .slice_pair_mut(a as usize * PAGE_SIZE, b as usize * PAGE_SIZE, PAGE_SIZE)
    }

    /// Allocates a page and returns its ID. The returned page is zeroed.
    ///
    /// May grow and remap the region: all windows handed out before this call
    /// are invalid afterwards.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        if self.meta.free_list() != 0 {
            let id = self.meta.free_list();
            let page = self.page_mut(id)?;
            let next = u64::from_le_bytes(page[..8].try_into().unwrap());
            page.fill(0);
            self.meta.set_free_list(next);
            self.write_meta()?;
            return Ok(id);
        }

        let id = self.meta.page_count();
        let required = (id + 1) * PAGE_SIZE as u64;
        if required > self.region.len() as u64 {
            let mut new_len = self.region.len() as u64 * GROWTH_FACTOR;
            while new_len < required {
                new_len *= GROWTH_FACTOR;
            }
            self.region.grow(new_len)?;
        }

        self.meta.set_page_count(id + 1);
        self.write_meta()?;
        Ok(id)
    }

    /// Pushes `id` onto the free list. The page is zeroed except for its
    /// first 8 bytes, which hold the previous free-list head.
    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        ensure!(id != 0, "cannot free the meta page");
        let head = self.meta.free_list();
        let page = self.page_mut(id)?;
        page.fill(0);
        page[..8].copy_from_slice(&head.to_le_bytes());
        self.meta.set_free_list(id);
        self.write_meta()
    }

    /// Claims the first unused root slot and returns its ID.
    pub fn create_root(&mut self) -> Result<RootId> {
        let Some(root_id) = self.meta.claim_root_slot() else {
            eyre::bail!("maximum number of roots reached: {}", MAX_ROOTS);
        };
        self.write_meta()?;
        debug!(root_id, "created root");
        Ok(root_id)
    }

    /// Clears a root slot.
    ///
    /// Pages of the tree are *not* freed; they become unreachable and stay
    /// allocated until the file is rebuilt. Callers that care should empty
    /// the tree first.
    pub fn delete_root(&mut self, root_id: RootId) -> Result<()> {
        self.meta.release_root_slot(root_id)?;
        self.write_meta()?;
        debug!(root_id, "deleted root");
        Ok(())
    }

    /// Root page ID for `root_id`, with the reserved marker (empty tree)
    /// mapped to `0`. An unused slot also reads as `0`.
    pub fn root_page(&self, root_id: RootId) -> Result<PageId> {
        let slot = self.meta.root_slot(root_id).ok_or_else(|| {
            eyre::eyre!("invalid root id: {} (max {})", root_id, MAX_ROOTS - 1)
        })?;
        if slot == RESERVED_ROOT {
            return Ok(0);
        }
        Ok(slot)
    }

    /// Records `page_id` as the root page of `root_id`; `0` marks the tree
    /// empty while keeping the slot claimed. Not flushed.
    pub fn set_root_page(&mut self, root_id: RootId, page_id: PageId) -> Result<()> {
        self.meta.set_root_slot(root_id, page_id)?;
        self.write_meta()
    }

    /// Number of claimed root slots.
    pub fn root_count(&self) -> u64 {
        self.meta.root_count()
    }

    /// Hints the kernel to fault in `count` pages starting at `start`.
    pub fn prefetch(&self, start: PageId, count: u64) {
        self.region
            .prefetch(start as usize * PAGE_SIZE, count as usize * PAGE_SIZE);
    }
}
