//! # Meta Page Layout
//!
//! Page 0 of every store file holds the metadata that bootstraps the pager:
//! magic bytes, format version, the root directory, the total page count and
//! the free-list head.
//!
//! ## Layout
//!
//! All multi-byte integers are little-endian. The header occupies the first
//! 4040 bytes of page 0; the rest of the page is unused.
//!
//! ```text
//! Offset  Size   Field
//! ------  -----  ---------------------------------------------
//! 0       8      reserved (zero)
//! 8       4      magic (0x42505452, "BPTR")
//! 12      4      version (2)
//! 16      8      root_count
//! 24      4000   root_table: 500 slots of 8 bytes each
//! 4024    8      page_count
//! 4032    8      free_list head page (0 = empty)
//! ```
//!
//! ## Root directory
//!
//! A slot holds `0` (unused), [`RESERVED_ROOT`] (root exists, tree empty) or
//! the page ID of the tree's current root node. The reserved marker lets an
//! empty tree keep its slot: deleting the last key of a tree must not make the
//! slot available to `create_root` again.
//!
//! ## Zerocopy
//!
//! The header is a `zerocopy` struct read and written as raw bytes, so loading
//! a meta page is a bounds check plus a cast, and serializing it is a single
//! `copy_from_slice`.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{PageId, RootId, PAGE_SIZE};

/// File format magic, "BPTR" as a little-endian u32.
pub const MAGIC: u32 = 0x4250_5452;

/// On-disk format version. Version 2 is the composite-key, multi-root format.
pub const FORMAT_VERSION: u32 = 2;

/// Number of slots in the root directory.
pub const MAX_ROOTS: usize = 500;

/// Root-directory marker for "root exists but its tree is empty".
pub const RESERVED_ROOT: PageId = u64::MAX;

pub const META_HEADER_SIZE: usize = 8 + 4 + 4 + 8 + MAX_ROOTS * 8 + 8 + 8;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaHeader {
    reserved: [u8; 8],
    magic: U32,
    version: U32,
    root_count: U64,
    root_table: [U64; MAX_ROOTS],
    page_count: U64,
    free_list: U64,
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() == META_HEADER_SIZE);
const _: () = assert!(META_HEADER_SIZE <= PAGE_SIZE);

impl MetaHeader {
    /// A freshly initialized header: one page allocated (the meta page
    /// itself), no roots, empty free list.
    pub fn new() -> Self {
        Self {
            reserved: [0u8; 8],
            magic: U32::new(MAGIC),
            version: U32::new(FORMAT_VERSION),
            root_count: U64::new(0),
            root_table: [U64::ZERO; MAX_ROOTS],
            page_count: U64::new(1),
            free_list: U64::new(0),
        }
    }

    /// Deserializes a header from the start of a meta page without
    /// validation. Use [`MetaHeader::validate`] afterwards; a zero magic
    /// means the file is fresh and must be initialized instead.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= META_HEADER_SIZE,
            "buffer too small for MetaHeader: {} < {}",
            bytes.len(),
            META_HEADER_SIZE
        );
        Self::read_from_bytes(&bytes[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MetaHeader: {:?}", e))
    }

    /// Serializes the header into the start of a meta page.
    pub fn write_to(&self, bytes: &mut [u8]) -> Result<()> {
        ensure!(
            bytes.len() >= META_HEADER_SIZE,
            "buffer too small for MetaHeader: {} < {}",
            bytes.len(),
            META_HEADER_SIZE
        );
        bytes[..META_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    /// True if the magic field is zero, i.e. the file was never initialized.
    pub fn is_blank(&self) -> bool {
        self.magic.get() == 0
    }

    /// Checks magic and version, rejecting foreign or newer files.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic.get() == MAGIC,
            "invalid file format: bad magic number {:#010x}",
            self.magic.get()
        );
        ensure!(
            self.version.get() == FORMAT_VERSION,
            "unsupported format version: {} (expected {})",
            self.version.get(),
            FORMAT_VERSION
        );
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn root_count(&self) -> u64 {
        self.root_count.get()
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.get()
    }

    pub fn set_page_count(&mut self, count: u64) {
        self.page_count = U64::new(count);
    }

    pub fn free_list(&self) -> PageId {
        self.free_list.get()
    }

    pub fn set_free_list(&mut self, head: PageId) {
        self.free_list = U64::new(head);
    }

    /// Raw slot value: `0`, [`RESERVED_ROOT`], or a root page ID.
    pub fn root_slot(&self, root_id: RootId) -> Option<PageId> {
        self.root_table
            .get(root_id as usize)
            .map(|slot| slot.get())
    }

    /// Stores `page_id` for `root_id`. A `page_id` of `0` records an empty
    /// tree as [`RESERVED_ROOT`], keeping the slot claimed.
    pub fn set_root_slot(&mut self, root_id: RootId, page_id: PageId) -> Result<()> {
        ensure!(
            (root_id as usize) < MAX_ROOTS,
            "invalid root id: {} (max {})",
            root_id,
            MAX_ROOTS - 1
        );
        let stored = if page_id == 0 { RESERVED_ROOT } else { page_id };
        self.root_table[root_id as usize] = U64::new(stored);
        Ok(())
    }

    /// Claims the first unused slot, returning its index.
    pub fn claim_root_slot(&mut self) -> Option<RootId> {
        let idx = self.root_table.iter().position(|slot| slot.get() == 0)?;
        self.root_table[idx] = U64::new(RESERVED_ROOT);
        self.root_count = U64::new(self.root_count.get() + 1);
        Some(idx as RootId)
    }

    /// Releases a slot. Idempotent: clearing an unused slot changes nothing.
    pub fn release_root_slot(&mut self, root_id: RootId) -> Result<()> {
        ensure!(
            (root_id as usize) < MAX_ROOTS,
            "invalid root id: {} (max {})",
            root_id,
            MAX_ROOTS - 1
        );
        if self.root_table[root_id as usize].get() != 0 {
            self.root_table[root_id as usize] = U64::ZERO;
            if self.root_count.get() > 0 {
                self.root_count = U64::new(self.root_count.get() - 1);
            }
        }
        Ok(())
    }
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self::new()
    }
}
