//! # Tree Engine
//!
//! The algorithms that tie node codecs to the pager: descent, insert with
//! split propagation, delete with borrow-or-merge rebalancing, and chained
//! range scans.
//!
//! ## Read / write split
//!
//! [`BTree`] borrows the pager immutably and serves `find`, `scan` and
//! `count`; any number of readers can hold one concurrently. [`BTreeMut`]
//! borrows it mutably for `insert` and `delete`. The engine layer maps this
//! onto its reader-writer lock.
//!
//! ## Insert
//!
//! Recursive descend-and-restructure-on-return. The recursion returns `None`
//! when the child absorbed the entry, or the separator and new right page
//! when it split. A split that bubbles out of the old root gets a new root
//! page built over `[old | separator | new]`.
//!
//! ## Refetch discipline
//!
//! `Pager::allocate_page` can grow and remap the file, so every window is
//! invalid after it. The pattern throughout this module is: read what you
//! need from a window, drop it, allocate, then re-fetch windows by page ID.
//! The borrow checker rejects any ordering that holds a window across the
//! allocation.
//!
//! ## Delete
//!
//! Recursive with rebalance-on-return. A leaf reports underflow to its
//! parent, which first tries to borrow an entry from the left sibling, then
//! the right, and otherwise merges (preferring the left). Interior
//! underflow propagates the same way. When the recursion unwinds to a root
//! with zero keys, the root collapses: an interior root is replaced by its
//! sole child, an empty leaf root empties the tree.

use eyre::{ensure, Result};

use super::interior::{InteriorNode, InteriorNodeMut};
use super::leaf::{LeafNode, LeafNodeMut};
use super::{node_type, Key, NodeType};
use crate::storage::{PageId, Pager, RootId, MAX_ROOTS};

struct SplitResult {
    separator: u64,
    right_page: PageId,
}

/// Read-only operations over one tree.
pub struct BTree<'a> {
    pager: &'a Pager,
    root_page: PageId,
}

impl<'a> BTree<'a> {
    /// `root_page` of `0` denotes an empty tree; every operation then
    /// returns its empty result.
    pub fn new(pager: &'a Pager, root_page: PageId) -> Self {
        Self { pager, root_page }
    }

    /// Point lookup.
    pub fn find(&self, key: Key) -> Result<Option<u64>> {
        if self.root_page == 0 {
            return Ok(None);
        }

        let mut page_id = self.root_page;
        loop {
            let data = self.pager.page(page_id)?;
            match node_type(data)? {
                NodeType::Leaf => return Ok(LeafNode::from_page(data)?.get(key)),
                NodeType::Interior => {
                    page_id = InteriorNode::from_page(data)?.child_for_key(key.k1);
                }
            }
        }
    }

    /// Calls `visit` for every entry with `start <= key <= end` in ascending
    /// key order. A `false` return from the callback stops the scan.
    pub fn scan(
        &self,
        start: Key,
        end: Key,
        visit: &mut dyn FnMut(Key, u64) -> bool,
    ) -> Result<()> {
        if self.root_page == 0 {
            return Ok(());
        }

        let mut leaf_id = self.leaf_for(start.k1)?;
        while leaf_id != 0 {
            let data = self.pager.page(leaf_id)?;
            let leaf = LeafNode::from_page(data)?;

            for (key, value) in leaf.range(start, end) {
                if !visit(key, value) {
                    return Ok(());
                }
            }

            // Entries past this leaf can only be larger than its last key.
            if let Some(last) = leaf.last_key() {
                if last >= end {
                    break;
                }
            }

            leaf_id = leaf.next_leaf();
            if leaf_id != 0 {
                self.pager.prefetch(leaf_id, 1);
            }
        }
        Ok(())
    }

    /// Number of entries, implemented as a full scan.
    pub fn count(&self) -> Result<u64> {
        let mut count = 0u64;
        self.scan(Key::MIN, Key::MAX, &mut |_, _| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    /// Descends to the leaf that would hold `k1`.
    fn leaf_for(&self, k1: u64) -> Result<PageId> {
        let mut page_id = self.root_page;
        loop {
            let data = self.pager.page(page_id)?;
            match node_type(data)? {
                NodeType::Leaf => return Ok(page_id),
                NodeType::Interior => {
                    page_id = InteriorNode::from_page(data)?.child_for_key(k1);
                }
            }
        }
    }
}

/// Mutating operations over one tree, identified by its root-directory slot
/// so the root page can be replaced as the tree grows and shrinks.
pub struct BTreeMut<'a> {
    pager: &'a mut Pager,
    root_id: RootId,
}

impl<'a> BTreeMut<'a> {
    pub fn new(pager: &'a mut Pager, root_id: RootId) -> Self {
        Self { pager, root_id }
    }

    /// Inserts or updates one entry.
    pub fn insert(&mut self, key: Key, value: u64) -> Result<()> {
        let root_page = self.pager.root_page(self.root_id)?;

        if root_page == 0 {
            let page_id = self.pager.allocate_page()?;
            let mut leaf = LeafNodeMut::init(self.pager.page_mut(page_id)?)?;
            leaf.put(key, value);
            return self.pager.set_root_page(self.root_id, page_id);
        }

        if let Some(split) = self.insert_rec(root_page, key, value)? {
            let new_root = self.pager.allocate_page()?;
            InteriorNodeMut::init_root(
                self.pager.page_mut(new_root)?,
                root_page,
                split.right_page,
                split.separator,
            )?;
            self.pager.set_root_page(self.root_id, new_root)?;
        }
        Ok(())
    }

    fn insert_rec(&mut self, page_id: PageId, key: Key, value: u64) -> Result<Option<SplitResult>> {
        match node_type(self.pager.page(page_id)?)? {
            NodeType::Leaf => self.insert_leaf(page_id, key, value),
            NodeType::Interior => self.insert_interior(page_id, key, value),
        }
    }

    fn insert_leaf(&mut self, page_id: PageId, key: Key, value: u64) -> Result<Option<SplitResult>> {
        {
            let mut leaf = LeafNodeMut::from_page(self.pager.page_mut(page_id)?)?;
            let (_, exists) = leaf.search(key);
            if exists || !leaf.is_full() {
                leaf.put(key, value);
                return Ok(None);
            }
        }

        // Full leaf: allocate first, because growing remaps the file and the
        // window above is already dropped.
        let new_page = self.pager.allocate_page()?;

        let (old_data, new_data) = self.pager.page_pair_mut(page_id, new_page)?;
        let mut leaf = LeafNodeMut::from_page(old_data)?;
        let mut new_leaf = LeafNodeMut::init(new_data)?;

        let separator = leaf.split_into(&mut new_leaf);
        if key.k1 < separator {
            leaf.put(key, value);
        } else {
            new_leaf.put(key, value);
        }
        leaf.set_next_leaf(new_page);

        Ok(Some(SplitResult {
            separator,
            right_page: new_page,
        }))
    }

    fn insert_interior(
        &mut self,
        page_id: PageId,
        key: Key,
        value: u64,
    ) -> Result<Option<SplitResult>> {
        let child = InteriorNode::from_page(self.pager.page(page_id)?)?.child_for_key(key.k1);

        let Some(split) = self.insert_rec(child, key, value)? else {
            return Ok(None);
        };

        // The descent may have allocated; the window is re-fetched here.
        {
            let mut node = InteriorNodeMut::from_page(self.pager.page_mut(page_id)?)?;
            if !node.is_full() {
                node.insert(split.separator, split.right_page);
                return Ok(None);
            }
        }

        let new_page = self.pager.allocate_page()?;

        let (old_data, new_data) = self.pager.page_pair_mut(page_id, new_page)?;
        let mut node = InteriorNodeMut::from_page(old_data)?;
        let mut new_node = InteriorNodeMut::init(new_data)?;

        let promoted = node.split_into(&mut new_node);
        if split.separator < promoted {
            node.insert(split.separator, split.right_page);
        } else {
            new_node.insert(split.separator, split.right_page);
        }

        Ok(Some(SplitResult {
            separator: promoted,
            right_page: new_page,
        }))
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete(&mut self, key: Key) -> Result<bool> {
        let root_page = self.pager.root_page(self.root_id)?;
        if root_page == 0 {
            return Ok(false);
        }

        let (deleted, _) = self.delete_rec(root_page, key)?;
        if deleted {
            self.collapse_root(root_page)?;
        }
        Ok(deleted)
    }

    /// Returns `(deleted, underflow)`; `underflow` tells the parent this
    /// node dropped below its minimum and needs rebalancing.
    fn delete_rec(&mut self, page_id: PageId, key: Key) -> Result<(bool, bool)> {
        match node_type(self.pager.page(page_id)?)? {
            NodeType::Leaf => {
                let mut leaf = LeafNodeMut::from_page(self.pager.page_mut(page_id)?)?;
                let deleted = leaf.delete(key);
                Ok((deleted, deleted && leaf.is_underflow()))
            }
            NodeType::Interior => {
                let (child_idx, child_id) = {
                    let node = InteriorNode::from_page(self.pager.page(page_id)?)?;
                    let idx = node.search(key.k1);
                    (idx, node.child(idx))
                };

                let (deleted, child_underflow) = self.delete_rec(child_id, key)?;
                if !deleted || !child_underflow {
                    return Ok((deleted, false));
                }

                self.rebalance_child(page_id, child_idx)?;
                let underflow =
                    InteriorNode::from_page(self.pager.page(page_id)?)?.is_underflow();
                Ok((true, underflow))
            }
        }
    }

    /// Restores the minimum of child `child_idx`: borrow from the left
    /// sibling, else from the right, else merge (preferring the left pair).
    fn rebalance_child(&mut self, parent_id: PageId, child_idx: usize) -> Result<()> {
        let (child_id, parent_keys) = {
            let parent = InteriorNode::from_page(self.pager.page(parent_id)?)?;
            (parent.child(child_idx), parent.key_count())
        };
        let child_kind = node_type(self.pager.page(child_id)?)?;

        if child_idx > 0 {
            let left_id =
                InteriorNode::from_page(self.pager.page(parent_id)?)?.child(child_idx - 1);
            if self.sibling_can_lend(left_id, child_kind)? {
                let new_separator = match child_kind {
                    NodeType::Leaf => {
                        let (child_data, left_data) =
                            self.pager.page_pair_mut(child_id, left_id)?;
                        let mut child = LeafNodeMut::from_page(child_data)?;
                        let mut left = LeafNodeMut::from_page(left_data)?;
                        child.borrow_from_left(&mut left)
                    }
                    NodeType::Interior => {
                        let parent_key = InteriorNode::from_page(self.pager.page(parent_id)?)?
                            .separator(child_idx - 1);
                        let (child_data, left_data) =
                            self.pager.page_pair_mut(child_id, left_id)?;
                        let mut child = InteriorNodeMut::from_page(child_data)?;
                        let mut left = InteriorNodeMut::from_page(left_data)?;
                        child.borrow_from_left(&mut left, parent_key)
                    }
                };
                InteriorNodeMut::from_page(self.pager.page_mut(parent_id)?)?
                    .set_separator(child_idx - 1, new_separator);
                return Ok(());
            }
        }

        if child_idx < parent_keys {
            let right_id =
                InteriorNode::from_page(self.pager.page(parent_id)?)?.child(child_idx + 1);
            if self.sibling_can_lend(right_id, child_kind)? {
                let new_separator = match child_kind {
                    NodeType::Leaf => {
                        let (child_data, right_data) =
                            self.pager.page_pair_mut(child_id, right_id)?;
                        let mut child = LeafNodeMut::from_page(child_data)?;
                        let mut right = LeafNodeMut::from_page(right_data)?;
                        child.borrow_from_right(&mut right)
                    }
                    NodeType::Interior => {
                        let parent_key = InteriorNode::from_page(self.pager.page(parent_id)?)?
                            .separator(child_idx);
                        let (child_data, right_data) =
                            self.pager.page_pair_mut(child_id, right_id)?;
                        let mut child = InteriorNodeMut::from_page(child_data)?;
                        let mut right = InteriorNodeMut::from_page(right_data)?;
                        child.borrow_from_right(&mut right, parent_key)
                    }
                };
                InteriorNodeMut::from_page(self.pager.page_mut(parent_id)?)?
                    .set_separator(child_idx, new_separator);
                return Ok(());
            }
        }

        // Neither sibling can lend: merge two siblings into one page and
        // drop the separator that sat between them.
        if child_idx > 0 {
            let left_id =
                InteriorNode::from_page(self.pager.page(parent_id)?)?.child(child_idx - 1);
            self.merge_pair(parent_id, child_idx - 1, left_id, child_id, child_kind)
        } else {
            let right_id =
                InteriorNode::from_page(self.pager.page(parent_id)?)?.child(child_idx + 1);
            self.merge_pair(parent_id, child_idx, child_id, right_id, child_kind)
        }
    }

    fn sibling_can_lend(&self, sibling_id: PageId, kind: NodeType) -> Result<bool> {
        let data = self.pager.page(sibling_id)?;
        Ok(match kind {
            NodeType::Leaf => LeafNode::from_page(data)?.can_lend(),
            NodeType::Interior => InteriorNode::from_page(data)?.can_lend(),
        })
    }

    /// Merges `right_id` into `left_id`, removes parent separator
    /// `separator_idx` (the one between the pair) and frees the right page.
    fn merge_pair(
        &mut self,
        parent_id: PageId,
        separator_idx: usize,
        left_id: PageId,
        right_id: PageId,
        kind: NodeType,
    ) -> Result<()> {
        match kind {
            NodeType::Leaf => {
                let (left_data, right_data) = self.pager.page_pair_mut(left_id, right_id)?;
                let mut left = LeafNodeMut::from_page(left_data)?;
                let right = LeafNode::from_page(&*right_data)?;
                left.merge_from_right(&right);
            }
            NodeType::Interior => {
                let parent_key =
                    InteriorNode::from_page(self.pager.page(parent_id)?)?.separator(separator_idx);
                let (left_data, right_data) = self.pager.page_pair_mut(left_id, right_id)?;
                let mut left = InteriorNodeMut::from_page(left_data)?;
                let right = InteriorNode::from_page(&*right_data)?;
                left.merge_from_right(&right, parent_key);
            }
        }

        InteriorNodeMut::from_page(self.pager.page_mut(parent_id)?)?.delete_key_at(separator_idx);
        self.pager.free_page(right_id)
    }

    /// Shrinks the root after a delete: an interior root with no keys is
    /// replaced by its sole child, an empty leaf root leaves the tree empty.
    fn collapse_root(&mut self, root_page: PageId) -> Result<()> {
        let data = self.pager.page(root_page)?;
        match node_type(data)? {
            NodeType::Interior => {
                let node = InteriorNode::from_page(data)?;
                if node.key_count() == 0 {
                    let only_child = node.child(0);
                    self.pager.set_root_page(self.root_id, only_child)?;
                    self.pager.free_page(root_page)?;
                }
            }
            NodeType::Leaf => {
                if LeafNode::from_page(data)?.entry_count() == 0 {
                    self.pager.set_root_page(self.root_id, 0)?;
                    self.pager.free_page(root_page)?;
                }
            }
        }
        Ok(())
    }
}

/// Structural summary returned by [`check_consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Total pages in the file, including the meta page.
    pub page_count: u64,
    /// Pages reachable from some root.
    pub reachable_pages: u64,
    /// Pages on the free list.
    pub free_pages: u64,
    /// Allocated pages that are neither reachable nor free (the pages a
    /// `delete_root` left behind).
    pub leaked_pages: u64,
}

/// Walks every tree and the free list, verifying the structural invariants:
/// node minimums, separator ordering, uniform leaf depth, the next-leaf
/// chain, and that no page is referenced twice or both used and free.
pub fn check_consistency(pager: &Pager) -> Result<ConsistencyReport> {
    use std::collections::HashSet;

    let page_count = pager.page_count();
    let mut seen: HashSet<PageId> = HashSet::new();
    let mut reachable = 0u64;

    for root_id in 0..MAX_ROOTS as RootId {
        // root_page maps both unused and reserved (empty tree) slots to 0.
        let root_page = pager.root_page(root_id)?;
        if root_page == 0 {
            continue;
        }

        let mut leaves: Vec<PageId> = Vec::new();
        let mut leaf_depth: Option<usize> = None;
        walk_tree(
            pager,
            root_page,
            0,
            true,
            None,
            None,
            &mut seen,
            &mut leaves,
            &mut leaf_depth,
        )?;
        reachable += leaves.len() as u64;
        reachable += count_interior(pager, root_page)? as u64;

        verify_leaf_chain(pager, &leaves)?;
    }

    let mut free = 0u64;
    let mut free_id = pager.free_list_head();
    while free_id != 0 {
        ensure!(
            free_id < page_count,
            "free list references unallocated page {}",
            free_id
        );
        ensure!(
            seen.insert(free_id),
            "page {} is both in use and on the free list",
            free_id
        );
        free += 1;
        ensure!(
            free <= page_count,
            "free list does not terminate (cycle suspected)"
        );
        let data = pager.page(free_id)?;
        free_id = u64::from_le_bytes(data[..8].try_into().unwrap());
    }

    Ok(ConsistencyReport {
        page_count,
        reachable_pages: reachable,
        free_pages: free,
        leaked_pages: page_count - 1 - reachable - free,
    })
}

#[allow(clippy::too_many_arguments)]
fn walk_tree(
    pager: &Pager,
    page_id: PageId,
    depth: usize,
    is_root: bool,
    lower: Option<u64>,
    upper: Option<u64>,
    seen: &mut std::collections::HashSet<PageId>,
    leaves: &mut Vec<PageId>,
    leaf_depth: &mut Option<usize>,
) -> Result<()> {
    ensure!(
        page_id != 0 && page_id < pager.page_count(),
        "tree references invalid page {}",
        page_id
    );
    ensure!(
        seen.insert(page_id),
        "page {} has more than one parent",
        page_id
    );

    let data = pager.page(page_id)?;
    match node_type(data)? {
        NodeType::Leaf => {
            let leaf = LeafNode::from_page(data)?;
            ensure!(
                is_root || !leaf.is_underflow(),
                "non-root leaf {} has {} entries (minimum {})",
                page_id,
                leaf.entry_count(),
                super::MIN_LEAF_ENTRIES
            );
            let entries = leaf.entries();
            for pair in entries.windows(2) {
                ensure!(
                    pair[0].key() < pair[1].key(),
                    "leaf {} entries out of order",
                    page_id
                );
            }
            for entry in entries {
                let k1 = entry.key().k1;
                if let Some(lo) = lower {
                    ensure!(k1 >= lo, "leaf {} key below separator bound", page_id);
                }
                if let Some(hi) = upper {
                    ensure!(k1 < hi, "leaf {} key at or above separator bound", page_id);
                }
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) => ensure!(
                    depth == expected,
                    "leaf {} at depth {}, expected {}",
                    page_id,
                    depth,
                    expected
                ),
            }
            leaves.push(page_id);
        }
        NodeType::Interior => {
            let node = InteriorNode::from_page(data)?;
            let count = node.key_count();
            ensure!(
                count > 0,
                "interior node {} has no keys",
                page_id
            );
            ensure!(
                is_root || !node.is_underflow(),
                "non-root interior node {} has {} keys (minimum {})",
                page_id,
                count,
                super::MIN_INTERIOR_KEYS
            );
            for i in 1..count {
                ensure!(
                    node.separator(i - 1) < node.separator(i),
                    "interior node {} separators out of order",
                    page_id
                );
            }
            let separators: Vec<u64> = node.separators().iter().map(|s| s.get()).collect();
            let children: Vec<PageId> = node.children().iter().map(|c| c.get()).collect();
            for (i, &child) in children.iter().enumerate() {
                let child_lower = if i == 0 { lower } else { Some(separators[i - 1]) };
                let child_upper = if i == count { upper } else { Some(separators[i]) };
                walk_tree(
                    pager,
                    child,
                    depth + 1,
                    false,
                    child_lower,
                    child_upper,
                    seen,
                    leaves,
                    leaf_depth,
                )?;
            }
        }
    }
    Ok(())
}

fn count_interior(pager: &Pager, page_id: PageId) -> Result<usize> {
    let data = pager.page(page_id)?;
    match node_type(data)? {
        NodeType::Leaf => Ok(0),
        NodeType::Interior => {
            let node = InteriorNode::from_page(data)?;
            let children: Vec<PageId> = node.children().iter().map(|c| c.get()).collect();
            let mut total = 1;
            for child in children {
                total += count_interior(pager, child)?;
            }
            Ok(total)
        }
    }
}

/// The in-order leaves of one tree must be exactly its next-leaf chain, and
/// keys must ascend across leaf boundaries.
fn verify_leaf_chain(pager: &Pager, leaves: &[PageId]) -> Result<()> {
    for (i, &leaf_id) in leaves.iter().enumerate() {
        let leaf = LeafNode::from_page(pager.page(leaf_id)?)?;
        let expected_next = leaves.get(i + 1).copied().unwrap_or(0);
        ensure!(
            leaf.next_leaf() == expected_next,
            "leaf {} links to {}, expected {}",
            leaf_id,
            leaf.next_leaf(),
            expected_next
        );
        if let Some(&next_id) = leaves.get(i + 1) {
            let next = LeafNode::from_page(pager.page(next_id)?)?;
            if let (Some(last), Some(first)) = (leaf.last_key(), next.first_key()) {
                ensure!(
                    last < first,
                    "keys do not ascend from leaf {} to leaf {}",
                    leaf_id,
                    next_id
                );
            }
        }
    }
    Ok(())
}
