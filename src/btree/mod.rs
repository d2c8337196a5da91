//! # B+Tree Engine
//!
//! This module implements the on-disk B+Tree: the node codecs and the tree
//! algorithms that run over pages served by the [`crate::storage`] layer.
//!
//! ## Node Types
//!
//! - **Leaf nodes** hold the actual entries: fixed 24-byte records of
//!   composite key `(k1, k2)` and value, kept in ascending key order. Leaves
//!   are chained by a next-leaf page pointer for range scans.
//! - **Interior nodes** hold `n` separator keys and `n + 1` child page IDs.
//!   A separator is the `k1` of the smallest key in the subtree to its right.
//!
//! ## Shared Header
//!
//! Both node kinds start with the same 16-byte header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------
//! 0       1     node type (0 interior, 1 leaf)
//! 1       2     entry count
//! 3       8     next-leaf page ID (leaves only)
//! 11      5     reserved
//! ```
//!
//! All integers are little-endian, matching the meta page.
//!
//! ## Capacities
//!
//! With 4080 usable bytes per page:
//!
//! - leaves hold up to 170 entries of 24 bytes;
//! - interior nodes hold up to 254 separators plus 255 children, all 8-byte
//!   slots (`255*8 + 254*8 = 4072` bytes).
//!
//! Minimums are what a split leaves behind: 85 for leaves (half of 170) and
//! 126 for interior nodes (a full 254-key node splits into 127 + promoted +
//! 126). Roots are exempt.

pub mod interior;
pub mod leaf;
pub mod tree;

pub use interior::{InteriorNode, InteriorNodeMut, MAX_INTERIOR_KEYS, MIN_INTERIOR_KEYS};
pub use leaf::{LeafEntry, LeafNode, LeafNodeMut, MAX_LEAF_ENTRIES, MIN_LEAF_ENTRIES};
pub use tree::{check_consistency, BTree, BTreeMut, ConsistencyReport};

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::{PageId, PAGE_SIZE};

/// Size of the header shared by leaf and interior nodes.
pub const NODE_HEADER_SIZE: usize = 16;

/// Bytes of a page available for node entries.
pub const NODE_USABLE_SIZE: usize = PAGE_SIZE - NODE_HEADER_SIZE;

/// Composite key: ordered lexicographically by `(k1, k2)`.
///
/// `k1` is the navigational key — interior separators store only `k1` — while
/// `k2` disambiguates entries within one `k1`. Single-key use passes `k2 = 0`
/// (`Key` converts from plain `u64`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub k1: u64,
    pub k2: u64,
}

impl Key {
    pub const MIN: Key = Key { k1: 0, k2: 0 };
    pub const MAX: Key = Key {
        k1: u64::MAX,
        k2: u64::MAX,
    };

    pub const fn new(k1: u64, k2: u64) -> Self {
        Self { k1, k2 }
    }
}

impl From<u64> for Key {
    fn from(k1: u64) -> Self {
        Key::new(k1, 0)
    }
}

impl From<(u64, u64)> for Key {
    fn from((k1, k2): (u64, u64)) -> Self {
        Key::new(k1, k2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Interior = 0,
    Leaf = 1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    node_type: u8,
    entry_count: U16,
    next_leaf: U64,
    reserved: [u8; 5],
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse NodeHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse NodeHeader: {:?}", e))
    }

    pub fn init(data: &mut [u8], node_type: NodeType) -> Result<()> {
        let header = Self::from_bytes_mut(data)?;
        header.node_type = node_type as u8;
        header.entry_count = U16::ZERO;
        header.next_leaf = U64::ZERO;
        header.reserved = [0u8; 5];
        Ok(())
    }

    pub fn node_type(&self) -> Result<NodeType> {
        match self.node_type {
            0 => Ok(NodeType::Interior),
            1 => Ok(NodeType::Leaf),
            other => eyre::bail!("unknown node type byte: {}", other),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count.get() as usize
    }

    pub fn set_entry_count(&mut self, count: usize) {
        debug_assert!(count <= u16::MAX as usize);
        self.entry_count = U16::new(count as u16);
    }

    pub fn next_leaf(&self) -> PageId {
        self.next_leaf.get()
    }

    pub fn set_next_leaf(&mut self, page_id: PageId) {
        self.next_leaf = U64::new(page_id);
    }
}

/// Reads the node type of a page, for descent dispatch.
pub fn node_type(data: &[u8]) -> Result<NodeType> {
    NodeHeader::from_bytes(data)?.node_type()
}
