//! # Leaf Node Codec
//!
//! Leaf nodes store the actual entries of a tree as fixed 24-byte records
//! directly after the shared 16-byte header:
//!
//! ```text
//! +--------------------+
//! | NodeHeader (16B)   |  type = leaf, entry count, next-leaf page
//! +--------------------+
//! | entry 0 (24B)      |  k1 (8B) | k2 (8B) | value (8B)
//! | entry 1 (24B)      |
//! | ...                |
//! +--------------------+
//! ```
//!
//! Entries are kept in strictly ascending `(k1, k2)` order with no gaps, so
//! lookup is a binary search and in-page range iteration is a slice walk.
//! With 4080 usable bytes a leaf holds up to 170 entries; non-root leaves
//! keep at least 85.
//!
//! All operations here are pure page rewrites: the codec never allocates or
//! frees pages. Splitting, borrowing and merging work on two windows the
//! caller obtained from `Pager::page_pair_mut`, and the caller owns the
//! next-leaf rewiring that involves page IDs it allocated.
//!
//! Capacity is a caller-checked contract: `put` on a full leaf with a new key
//! is a bug in the tree layer and panics rather than corrupting the page.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Key, NodeHeader, NodeType, NODE_HEADER_SIZE, NODE_USABLE_SIZE};
use crate::storage::{PageId, PAGE_SIZE};

pub const LEAF_ENTRY_SIZE: usize = 24;

/// Maximum entries per leaf: 4080 / 24.
pub const MAX_LEAF_ENTRIES: usize = NODE_USABLE_SIZE / LEAF_ENTRY_SIZE;

/// Minimum entries per non-root leaf (half of a split).
pub const MIN_LEAF_ENTRIES: usize = MAX_LEAF_ENTRIES / 2;

const _: () = assert!(MAX_LEAF_ENTRIES == 170);
const _: () = assert!(MIN_LEAF_ENTRIES == 85);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafEntry {
    k1: U64,
    k2: U64,
    value: U64,
}

const _: () = assert!(std::mem::size_of::<LeafEntry>() == LEAF_ENTRY_SIZE);

impl LeafEntry {
    pub fn new(key: Key, value: u64) -> Self {
        Self {
            k1: U64::new(key.k1),
            k2: U64::new(key.k2),
            value: U64::new(value),
        }
    }

    pub fn key(&self) -> Key {
        Key::new(self.k1.get(), self.k2.get())
    }

    pub fn value(&self) -> u64 {
        self.value.get()
    }
}

/// Read-only view of a leaf page.
#[derive(Debug)]
pub struct LeafNode<'a> {
    data: &'a [u8],
}

/// Mutable view of a leaf page.
pub struct LeafNodeMut<'a> {
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
        header.node_type()? == NodeType::Leaf,
        "expected leaf page, got {:?}",
        header.node_type()?
    );
    ensure!(
        header.entry_count() <= MAX_LEAF_ENTRIES,
        "corrupt leaf: entry count {} exceeds capacity {}",
        header.entry_count(),
        MAX_LEAF_ENTRIES
    );
    Ok(())
}

impl<'a> LeafNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    pub fn entry_count(&self) -> usize {
        NodeHeader::from_bytes(self.data).unwrap().entry_count()
    }

    pub fn next_leaf(&self) -> PageId {
        NodeHeader::from_bytes(self.data).unwrap().next_leaf()
    }

    /// The entries as a typed slice into the page.
    pub fn entries(&self) -> &'a [LeafEntry] {
        let count = self.entry_count();
        let bytes = &self.data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + count * LEAF_ENTRY_SIZE];
        <[LeafEntry]>::ref_from_bytes(bytes).unwrap()
    }

    /// Binary search. Returns `(index, found)`; when not found, `index` is
    /// the insertion point.
    pub fn search(&self, key: Key) -> (usize, bool) {
        match self.entries().binary_search_by(|e| e.key().cmp(&key)) {
            Ok(idx) => (idx, true),
            Err(idx) => (idx, false),
        }
    }

    pub fn get(&self, key: Key) -> Option<u64> {
        let (idx, found) = self.search(key);
        found.then(|| self.entries()[idx].value())
    }

    pub fn first_key(&self) -> Option<Key> {
        self.entries().first().map(LeafEntry::key)
    }

    pub fn last_key(&self) -> Option<Key> {
        self.entries().last().map(LeafEntry::key)
    }

    /// In-page entries with `start <= key <= end`, ascending.
    pub fn range(&self, start: Key, end: Key) -> impl Iterator<Item = (Key, u64)> + 'a {
        let (from, _) = self.search(start);
        self.entries()[from..]
            .iter()
            .take_while(move |e| e.key() <= end)
            .map(|e| (e.key(), e.value()))
    }

    pub fn is_underflow(&self) -> bool {
        self.entry_count() < MIN_LEAF_ENTRIES
    }

    pub fn can_lend(&self) -> bool {
        self.entry_count() > MIN_LEAF_ENTRIES
    }
}

impl<'a> LeafNodeMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    /// Initializes the page as an empty leaf.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        NodeHeader::init(data, NodeType::Leaf)?;
        Ok(Self { data })
    }

    fn as_node(&self) -> LeafNode<'_> {
        LeafNode { data: self.data }
    }

    pub fn entry_count(&self) -> usize {
        self.as_node().entry_count()
    }

    pub fn next_leaf(&self) -> PageId {
        self.as_node().next_leaf()
    }

    pub fn set_next_leaf(&mut self, page_id: PageId) {
        NodeHeader::from_bytes_mut(self.data)
            .unwrap()
            .set_next_leaf(page_id);
    }

    pub fn search(&self, key: Key) -> (usize, bool) {
        self.as_node().search(key)
    }

    pub fn get(&self, key: Key) -> Option<u64> {
        self.as_node().get(key)
    }

    pub fn first_key(&self) -> Option<Key> {
        self.as_node().first_key()
    }

    pub fn is_full(&self) -> bool {
        self.entry_count() >= MAX_LEAF_ENTRIES
    }

    pub fn is_underflow(&self) -> bool {
        self.as_node().is_underflow()
    }

    pub fn can_lend(&self) -> bool {
        self.as_node().can_lend()
    }

    fn set_entry_count(&mut self, count: usize) {
        NodeHeader::from_bytes_mut(self.data)
            .unwrap()
            .set_entry_count(count);
    }

    fn entry_offset(idx: usize) -> usize {
        NODE_HEADER_SIZE + idx * LEAF_ENTRY_SIZE
    }

    fn entry_at(&self, idx: usize) -> LeafEntry {
        self.as_node().entries()[idx]
    }

    fn write_entry(&mut self, idx: usize, entry: LeafEntry) {
        let off = Self::entry_offset(idx);
        self.data[off..off + LEAF_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
    }

    fn insert_at(&mut self, idx: usize, entry: LeafEntry) {
        let count = self.entry_count();
        assert!(count < MAX_LEAF_ENTRIES, "leaf node is full");
        self.data.copy_within(
            Self::entry_offset(idx)..Self::entry_offset(count),
            Self::entry_offset(idx + 1),
        );
        self.write_entry(idx, entry);
        self.set_entry_count(count + 1);
    }

    fn remove_at(&mut self, idx: usize) -> LeafEntry {
        let count = self.entry_count();
        let entry = self.entry_at(idx);
        self.data.copy_within(
            Self::entry_offset(idx + 1)..Self::entry_offset(count),
            Self::entry_offset(idx),
        );
        self.set_entry_count(count - 1);
        entry
    }

    /// Inserts or updates an entry. Returns `true` if a new key was
    /// inserted, `false` on update.
    ///
    /// Inserting a new key into a full leaf is a caller bug and panics; the
    /// tree layer splits first.
    pub fn put(&mut self, key: Key, value: u64) -> bool {
        let (idx, found) = self.search(key);
        if found {
            self.write_entry(idx, LeafEntry::new(key, value));
            return false;
        }
        self.insert_at(idx, LeafEntry::new(key, value));
        true
    }

    /// Removes a key, compacting the entry array. Returns whether it existed.
    pub fn delete(&mut self, key: Key) -> bool {
        let (idx, found) = self.search(key);
        if !found {
            return false;
        }
        self.remove_at(idx);
        true
    }

    /// Moves the upper half of the entries into `new`, which must be a
    /// freshly initialized leaf. `new` inherits this leaf's next-leaf
    /// pointer; the caller points this leaf at `new`'s page afterwards.
    ///
    /// Returns the separator for the parent: the `k1` of the smallest key
    /// now in `new`.
    pub fn split_into(&mut self, new: &mut LeafNodeMut<'_>) -> u64 {
        let count = self.entry_count();
        let mid = count / 2;

        let src = Self::entry_offset(mid)..Self::entry_offset(count);
        new.data[Self::entry_offset(0)..Self::entry_offset(count - mid)]
            .copy_from_slice(&self.data[src]);
        new.set_entry_count(count - mid);
        self.set_entry_count(mid);

        new.set_next_leaf(self.next_leaf());
        new.first_key().expect("split produced an empty right leaf").k1
    }

    /// Takes the last entry of `left` as this leaf's new first entry.
    /// Returns the new parent separator: this leaf's new first `k1`.
    pub fn borrow_from_left(&mut self, left: &mut LeafNodeMut<'_>) -> u64 {
        let entry = left.remove_at(left.entry_count() - 1);
        self.insert_at(0, entry);
        entry.key().k1
    }

    /// Takes the first entry of `right` as this leaf's new last entry.
    /// Returns the new parent separator: `right`'s new first `k1`.
    pub fn borrow_from_right(&mut self, right: &mut LeafNodeMut<'_>) -> u64 {
        let entry = right.remove_at(0);
        let count = self.entry_count();
        self.insert_at(count, entry);
        right.first_key().expect("borrowed the last entry of a sibling").k1
    }

    /// Appends every entry of `right` and takes over its next-leaf pointer.
    /// The caller frees `right`'s page and drops the parent separator.
    pub fn merge_from_right(&mut self, right: &LeafNode<'_>) {
        let count = self.entry_count();
        let right_count = right.entry_count();
        assert!(
            count + right_count <= MAX_LEAF_ENTRIES,
            "leaf merge overflows capacity: {} + {}",
            count,
            right_count
        );

        let dst = Self::entry_offset(count)..Self::entry_offset(count + right_count);
        self.data[dst]
            .copy_from_slice(&right.data[Self::entry_offset(0)..Self::entry_offset(right_count)]);
        self.set_entry_count(count + right_count);
        self.set_next_leaf(right.next_leaf());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page() -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        LeafNodeMut::init(&mut page).unwrap();
        page
    }

    fn fill(leaf: &mut LeafNodeMut<'_>, keys: impl IntoIterator<Item = u64>) {
        for k in keys {
            assert!(leaf.put(Key::from(k), k * 10));
        }
    }

    #[test]
    fn init_produces_empty_leaf() {
        let page = leaf_page();
        let leaf = LeafNode::from_page(&page).unwrap();

        assert_eq!(leaf.entry_count(), 0);
        assert_eq!(leaf.next_leaf(), 0);
        assert_eq!(leaf.first_key(), None);
    }

    #[test]
    fn from_page_rejects_interior_page() {
        let mut page = vec![0u8; PAGE_SIZE];
        NodeHeader::init(&mut page, NodeType::Interior).unwrap();

        assert!(LeafNode::from_page(&page).is_err());
    }

    #[test]
    fn from_page_rejects_corrupt_count() {
        let mut page = leaf_page();
        NodeHeader::from_bytes_mut(&mut page)
            .unwrap()
            .set_entry_count(MAX_LEAF_ENTRIES + 1);

        assert!(LeafNode::from_page(&page).is_err());
    }

    #[test]
    fn put_keeps_entries_sorted() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        fill(&mut leaf, [30, 10, 20, 5, 25]);

        let leaf = LeafNode::from_page(&page).unwrap();
        let keys: Vec<u64> = leaf.entries().iter().map(|e| e.key().k1).collect();
        assert_eq!(keys, vec![5, 10, 20, 25, 30]);
    }

    #[test]
    fn get_returns_inserted_values() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        fill(&mut leaf, [1, 2, 3]);

        assert_eq!(leaf.get(Key::from(2)), Some(20));
        assert_eq!(leaf.get(Key::from(4)), None);
    }

    #[test]
    fn put_overwrites_existing_key() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();

        assert!(leaf.put(Key::from(7), 70));
        assert!(!leaf.put(Key::from(7), 700));

        assert_eq!(leaf.entry_count(), 1);
        assert_eq!(leaf.get(Key::from(7)), Some(700));
    }

    #[test]
    fn composite_keys_order_by_k2_within_k1() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        leaf.put(Key::new(1, 5), 15);
        leaf.put(Key::new(1, 2), 12);
        leaf.put(Key::new(0, 9), 9);

        let leaf = LeafNode::from_page(&page).unwrap();
        let keys: Vec<Key> = leaf.entries().iter().map(LeafEntry::key).collect();
        assert_eq!(keys, vec![Key::new(0, 9), Key::new(1, 2), Key::new(1, 5)]);
        assert_eq!(leaf.get(Key::new(1, 2)), Some(12));
        assert_eq!(leaf.get(Key::new(1, 3)), None);
    }

    #[test]
    fn zero_value_is_a_legal_value() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        leaf.put(Key::from(1), 0);

        assert_eq!(leaf.get(Key::from(1)), Some(0));
    }

    #[test]
    fn delete_compacts_entries() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        fill(&mut leaf, [1, 2, 3]);

        assert!(leaf.delete(Key::from(2)));
        assert!(!leaf.delete(Key::from(2)));

        let leaf = LeafNode::from_page(&page).unwrap();
        let keys: Vec<u64> = leaf.entries().iter().map(|e| e.key().k1).collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    #[should_panic(expected = "leaf node is full")]
    fn inserting_into_full_leaf_panics() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        fill(&mut leaf, 0..MAX_LEAF_ENTRIES as u64);

        leaf.put(Key::from(u64::MAX), 1);
    }

    #[test]
    fn update_on_full_leaf_succeeds() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        fill(&mut leaf, 0..MAX_LEAF_ENTRIES as u64);
        assert!(leaf.is_full());

        assert!(!leaf.put(Key::from(3), 999));
        assert_eq!(leaf.get(Key::from(3)), Some(999));
    }

    #[test]
    fn split_moves_upper_half_and_links_chain() {
        let mut left_page = leaf_page();
        let mut right_page = leaf_page();
        let mut left = LeafNodeMut::from_page(&mut left_page).unwrap();
        fill(&mut left, 0..MAX_LEAF_ENTRIES as u64);
        left.set_next_leaf(99);

        let mut right = LeafNodeMut::from_page(&mut right_page).unwrap();
        let separator = left.split_into(&mut right);

        assert_eq!(left.entry_count(), MAX_LEAF_ENTRIES / 2);
        assert_eq!(right.entry_count(), MAX_LEAF_ENTRIES - MAX_LEAF_ENTRIES / 2);
        assert_eq!(separator, MAX_LEAF_ENTRIES as u64 / 2);
        assert_eq!(right.first_key().unwrap().k1, separator);
        assert_eq!(right.next_leaf(), 99);
    }

    #[test]
    fn range_filters_and_orders() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        fill(&mut leaf, [10, 20, 30, 40, 50]);

        let leaf = LeafNode::from_page(&page).unwrap();
        let hits: Vec<u64> = leaf
            .range(Key::from(15), Key::from(40))
            .map(|(k, _)| k.k1)
            .collect();
        assert_eq!(hits, vec![20, 30, 40]);

        assert_eq!(leaf.range(Key::from(60), Key::from(70)).count(), 0);
    }

    #[test]
    fn borrow_from_left_moves_last_entry() {
        let mut left_page = leaf_page();
        let mut child_page = leaf_page();
        let mut left = LeafNodeMut::from_page(&mut left_page).unwrap();
        let mut child = LeafNodeMut::from_page(&mut child_page).unwrap();
        fill(&mut left, [1, 2, 3]);
        fill(&mut child, [10, 11]);

        let separator = child.borrow_from_left(&mut left);

        assert_eq!(separator, 3);
        assert_eq!(left.entry_count(), 2);
        assert_eq!(child.first_key().unwrap().k1, 3);
        assert_eq!(child.entry_count(), 3);
        assert_eq!(child.get(Key::from(3)), Some(30));
    }

    #[test]
    fn borrow_from_right_moves_first_entry() {
        let mut child_page = leaf_page();
        let mut right_page = leaf_page();
        let mut child = LeafNodeMut::from_page(&mut child_page).unwrap();
        let mut right = LeafNodeMut::from_page(&mut right_page).unwrap();
        fill(&mut child, [1, 2]);
        fill(&mut right, [10, 11, 12]);

        let separator = child.borrow_from_right(&mut right);

        assert_eq!(separator, 11);
        assert_eq!(child.entry_count(), 3);
        assert_eq!(child.get(Key::from(10)), Some(100));
        assert_eq!(right.first_key().unwrap().k1, 11);
    }

    #[test]
    fn merge_concatenates_and_rewires_chain() {
        let mut left_page = leaf_page();
        let mut right_page = leaf_page();
        let mut left = LeafNodeMut::from_page(&mut left_page).unwrap();
        fill(&mut left, [1, 2]);
        left.set_next_leaf(7);
        {
            let mut right = LeafNodeMut::from_page(&mut right_page).unwrap();
            fill(&mut right, [10, 11]);
            right.set_next_leaf(42);
        }

        left.merge_from_right(&LeafNode::from_page(&right_page).unwrap());

        assert_eq!(left.entry_count(), 4);
        assert_eq!(left.next_leaf(), 42);
        assert_eq!(left.get(Key::from(11)), Some(110));
    }

    #[test]
    fn underflow_thresholds() {
        let mut page = leaf_page();
        let mut leaf = LeafNodeMut::from_page(&mut page).unwrap();
        fill(&mut leaf, 0..MIN_LEAF_ENTRIES as u64);

        assert!(!leaf.is_underflow());
        assert!(!leaf.can_lend());

        leaf.put(Key::from(u64::MAX), 1);
        assert!(leaf.can_lend());

        leaf.delete(Key::from(u64::MAX));
        leaf.delete(Key::from(0));
        assert!(leaf.is_underflow());
    }
}
