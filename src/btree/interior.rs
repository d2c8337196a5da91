//! # Interior Node Codec
//!
//! Interior nodes route descent: `n` separator keys and `n + 1` child page
//! IDs, laid out as two fixed arrays after the shared header:
//!
//! ```text
//! +----------------------+
//! | NodeHeader (16B)     |  type = interior, key count
//! +----------------------+
//! | children (255 x 8B)  |  bytes 16..2056
//! +----------------------+
//! | separators (254 x 8B)|  bytes 2056..4088
//! +----------------------+
//! ```
//!
//! A separator is the `k1` of the smallest key in the subtree to its right:
//! child `i` covers keys strictly below separator `i`, child `n` covers keys
//! at or above separator `n - 1`. Descent picks the first separator strictly
//! greater than the probe, so a probe equal to a separator goes right, where
//! leaf-anchored separators place it.
//!
//! Like the leaf codec, everything here rewrites windows in place and never
//! touches the pager; splits and rebalances get their second window from
//! `Pager::page_pair_mut`.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::FromBytes;

use super::{NodeHeader, NodeType, NODE_HEADER_SIZE};
use crate::storage::{PageId, PAGE_SIZE};

/// Maximum separators per interior node: 255 children + 254 separators of
/// 8 bytes each fit the 4080 usable bytes.
pub const MAX_INTERIOR_KEYS: usize = 254;

/// Minimum separators per non-root interior node. Splitting a full node
/// leaves `(254 - 1) / 2 = 126` keys in the smaller half, so that is the
/// floor rebalancing maintains.
pub const MIN_INTERIOR_KEYS: usize = (MAX_INTERIOR_KEYS - 1) / 2;

const CHILDREN_START: usize = NODE_HEADER_SIZE;
const KEYS_START: usize = NODE_HEADER_SIZE + (MAX_INTERIOR_KEYS + 1) * 8;

const _: () = assert!(KEYS_START + MAX_INTERIOR_KEYS * 8 <= PAGE_SIZE);
const _: () = assert!(MIN_INTERIOR_KEYS == 126);

/// Read-only view of an interior page.
#[derive(Debug)]
pub struct InteriorNode<'a> {
    data: &'a [u8],
}

/// Mutable view of an interior page.
pub struct InteriorNodeMut<'a> {
    data: &'a mut [u8],
}

fn validate(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );
    let header = NodeHeader::from_bytes(data)?;
    ensure!(
        header.node_type()? == NodeType::Interior,
        "expected interior page, got {:?}",
        header.node_type()?
    );
    ensure!(
        header.entry_count() <= MAX_INTERIOR_KEYS,
        "corrupt interior node: key count {} exceeds capacity {}",
        header.entry_count(),
        MAX_INTERIOR_KEYS
    );
    Ok(())
}

impl<'a> InteriorNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    pub fn key_count(&self) -> usize {
        NodeHeader::from_bytes(self.data).unwrap().entry_count()
    }

    /// The separators as a typed slice into the page.
    pub fn separators(&self) -> &'a [U64] {
        let count = self.key_count();
        <[U64]>::ref_from_bytes(&self.data[KEYS_START..KEYS_START + count * 8]).unwrap()
    }

    /// The `key_count() + 1` child page IDs.
    pub fn children(&self) -> &'a [U64] {
        let count = self.key_count() + 1;
        <[U64]>::ref_from_bytes(&self.data[CHILDREN_START..CHILDREN_START + count * 8]).unwrap()
    }

    pub fn separator(&self, idx: usize) -> u64 {
        self.separators()[idx].get()
    }

    pub fn child(&self, idx: usize) -> PageId {
        self.children()[idx].get()
    }

    /// Child index for a probe: the first separator strictly greater than
    /// `k1`, or `key_count()` when none is.
    pub fn search(&self, k1: u64) -> usize {
        self.separators().partition_point(|s| s.get() <= k1)
    }

    pub fn child_for_key(&self, k1: u64) -> PageId {
        self.child(self.search(k1))
    }

    pub fn is_underflow(&self) -> bool {
        self.key_count() < MIN_INTERIOR_KEYS
    }

    pub fn can_lend(&self) -> bool {
        self.key_count() > MIN_INTERIOR_KEYS
    }
}

impl<'a> InteriorNodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    /// Initializes the page as an empty interior node.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        NodeHeader::init(data, NodeType::Interior)?;
        Ok(Self { data })
    }

    /// Initializes the page as a new root: one separator, two children.
    pub fn init_root(
        data: &'a mut [u8],
        left: PageId,
        right: PageId,
        separator: u64,
    ) -> Result<Self> {
        let mut node = Self::init(data)?;
        node.set_child(0, left);
        node.set_child(1, right);
        node.write_key(0, separator);
        node.set_key_count(1);
        Ok(node)
    }

    fn as_node(&self) -> InteriorNode<'_> {
        InteriorNode { data: self.data }
    }

    pub fn key_count(&self) -> usize {
        self.as_node().key_count()
    }

    pub fn separator(&self, idx: usize) -> u64 {
        self.as_node().separator(idx)
    }

    pub fn child(&self, idx: usize) -> PageId {
        self.as_node().child(idx)
    }

    pub fn search(&self, k1: u64) -> usize {
        self.as_node().search(k1)
    }

    pub fn child_for_key(&self, k1: u64) -> PageId {
        self.as_node().child_for_key(k1)
    }

    pub fn is_full(&self) -> bool {
        self.key_count() >= MAX_INTERIOR_KEYS
    }

    pub fn is_underflow(&self) -> bool {
        self.as_node().is_underflow()
    }

    pub fn can_lend(&self) -> bool {
        self.as_node().can_lend()
    }

    fn set_key_count(&mut self, count: usize) {
        NodeHeader::from_bytes_mut(self.data)
            .unwrap()
            .set_entry_count(count);
    }

    fn child_offset(idx: usize) -> usize {
        CHILDREN_START + idx * 8
    }

    fn key_offset(idx: usize) -> usize {
        KEYS_START + idx * 8
    }

    fn write_key(&mut self, idx: usize, k1: u64) {
        let off = Self::key_offset(idx);
        self.data[off..off + 8].copy_from_slice(&k1.to_le_bytes());
    }

    pub fn set_separator(&mut self, idx: usize, k1: u64) {
        assert!(idx < self.key_count(), "separator index out of bounds");
        self.write_key(idx, k1);
    }

    pub fn set_child(&mut self, idx: usize, page_id: PageId) {
        let off = Self::child_offset(idx);
        self.data[off..off + 8].copy_from_slice(&page_id.to_le_bytes());
    }

    /// Inserts a separator with its right child; the left child of the new
    /// separator is already in place. Panics when full; the tree layer
    /// splits first.
    pub fn insert(&mut self, separator: u64, right_child: PageId) {
        let count = self.key_count();
        assert!(count < MAX_INTERIOR_KEYS, "interior node is full");

        let idx = self.search(separator);
        self.data.copy_within(
            Self::key_offset(idx)..Self::key_offset(count),
            Self::key_offset(idx + 1),
        );
        self.data.copy_within(
            Self::child_offset(idx + 1)..Self::child_offset(count + 1),
            Self::child_offset(idx + 2),
        );
        self.write_key(idx, separator);
        self.set_child(idx + 1, right_child);
        self.set_key_count(count + 1);
    }

    /// Splits into `new` (a freshly initialized interior node): keys
    /// `[0, mid)` and children `[0, mid]` stay, key `mid` is promoted to the
    /// parent and stored in neither node, the rest moves to `new`.
    ///
    /// Returns the promoted key.
    pub fn split_into(&mut self, new: &mut InteriorNodeMut<'_>) -> u64 {
        let count = self.key_count();
        let mid = count / 2;
        let promoted = self.separator(mid);
        let moved = count - mid - 1;

        new.data[Self::key_offset(0)..Self::key_offset(moved)]
            .copy_from_slice(&self.data[Self::key_offset(mid + 1)..Self::key_offset(count)]);
        new.data[Self::child_offset(0)..Self::child_offset(moved + 1)].copy_from_slice(
            &self.data[Self::child_offset(mid + 1)..Self::child_offset(count + 1)],
        );
        new.set_key_count(moved);
        self.set_key_count(mid);

        promoted
    }

    /// Removes separator `idx` together with its right child pointer.
    pub fn delete_key_at(&mut self, idx: usize) {
        let count = self.key_count();
        assert!(idx < count, "separator index out of bounds");

        self.data.copy_within(
            Self::key_offset(idx + 1)..Self::key_offset(count),
            Self::key_offset(idx),
        );
        self.data.copy_within(
            Self::child_offset(idx + 2)..Self::child_offset(count + 1),
            Self::child_offset(idx + 1),
        );
        self.set_key_count(count - 1);
    }

    /// Rotates one key through the parent from the left sibling: the parent
    /// separator comes down as this node's new first key, the left sibling's
    /// last child moves over, and the left sibling's last key goes up.
    ///
    /// Returns the new parent separator.
    pub fn borrow_from_left(&mut self, left: &mut InteriorNodeMut<'_>, parent_key: u64) -> u64 {
        let count = self.key_count();
        let left_count = left.key_count();

        self.data.copy_within(
            Self::key_offset(0)..Self::key_offset(count),
            Self::key_offset(1),
        );
        self.data.copy_within(
            Self::child_offset(0)..Self::child_offset(count + 1),
            Self::child_offset(1),
        );
        self.write_key(0, parent_key);
        self.set_child(0, left.child(left_count));
        self.set_key_count(count + 1);

        let new_parent = left.separator(left_count - 1);
        left.set_key_count(left_count - 1);
        new_parent
    }

    /// Mirror of [`InteriorNodeMut::borrow_from_left`] for the right sibling.
    pub fn borrow_from_right(&mut self, right: &mut InteriorNodeMut<'_>, parent_key: u64) -> u64 {
        let count = self.key_count();
        let right_count = right.key_count();

        self.write_key(count, parent_key);
        self.set_child(count + 1, right.child(0));
        self.set_key_count(count + 1);

        let new_parent = right.separator(0);
        right.data.copy_within(
            Self::key_offset(1)..Self::key_offset(right_count),
            Self::key_offset(0),
        );
        right.data.copy_within(
            Self::child_offset(1)..Self::child_offset(right_count + 1),
            Self::child_offset(0),
        );
        right.set_key_count(right_count - 1);
        new_parent
    }

    /// Concatenates `right` onto this node with the parent separator pulled
    /// down between the halves. The caller frees `right`'s page and removes
    /// the separator from the parent.
    pub fn merge_from_right(&mut self, right: &InteriorNode<'_>, parent_key: u64) {
        let count = self.key_count();
        let right_count = right.key_count();
        assert!(
            count + 1 + right_count <= MAX_INTERIOR_KEYS,
            "interior merge overflows capacity: {} + 1 + {}",
            count,
            right_count
        );

        self.write_key(count, parent_key);
        self.data[Self::key_offset(count + 1)..Self::key_offset(count + 1 + right_count)]
            .copy_from_slice(&right.data[Self::key_offset(0)..Self::key_offset(right_count)]);
        self.data
            [Self::child_offset(count + 1)..Self::child_offset(count + 2 + right_count)]
            .copy_from_slice(
                &right.data[Self::child_offset(0)..Self::child_offset(right_count + 1)],
            );
        self.set_key_count(count + 1 + right_count);
    }
}
