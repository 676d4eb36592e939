// SPDX-License-Identifier: MPL-2.0

//! The augmented red-black tree backing a [`super::RangeLockTree`].
//!
//! Keyed by `start`, each node additionally caches `subtree_last`, the
//! maximum `last` over its own subtree, maintained as a rotation invariant.
//! This is what gives the root an O(1) "does anything in the tree overlap
//! `[a0, a1]`" fast path: the candidate interval intersects something iff
//! `a0 <= root.subtree_last` AND `tree.leftmost.start <= a1`.
//!
//! Nodes are never owned by the tree: a [`super::RangeLock`] is caller-owned
//! and only linked into the tree for the duration it is waiting or held, per
//! the "non-owning pointer" lifetime contract in the data model.

use core::cell::Cell;
use core::cmp;
use core::ptr::NonNull;

use crate::sync::ParkHandle;

use super::RangeLock;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Color {
    Red,
    Black,
}

type Link<H> = Option<NonNull<RangeLock<H>>>;

/// Tree-linkage fields embedded in every [`RangeLock`]. `Copy` regardless of
/// `H` because it only stores pointers typed by `H`, never an `H` value —
/// this lets it live in a plain [`Cell`] instead of needing `RefCell`.
///
/// `Clone`/`Copy` are implemented by hand rather than derived: `#[derive]`
/// would add a spurious `H: Copy` bound, but nothing here actually stores an
/// `H` (only pointers to types parameterized by it, which are `Copy`
/// regardless).
pub(super) struct NodeLink<H: ParkHandle> {
    pub(super) parent: Link<H>,
    pub(super) left: Link<H>,
    pub(super) right: Link<H>,
    pub(super) color: Color,
    /// `max(last)` over this node and its subtree.
    pub(super) subtree_last: u64,
    pub(super) in_tree: bool,
}

impl<H: ParkHandle> Clone for NodeLink<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: ParkHandle> Copy for NodeLink<H> {}

impl<H: ParkHandle> NodeLink<H> {
    pub(super) const fn new() -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            color: Color::Red,
            subtree_last: 0,
            in_tree: false,
        }
    }
}

/// The tree root plus the bookkeeping that belongs to the tree rather than
/// to any one node: the `leftmost` cache and the `seqnum` source.
pub(super) struct Tree<H: ParkHandle> {
    pub(super) root: Cell<Link<H>>,
    pub(super) leftmost: Cell<Link<H>>,
    pub(super) seqnum: Cell<u64>,
    pub(super) holds: Cell<u64>,
}

// Safety: every node reachable through `root`/`leftmost` is only read or
// mutated while the `RangeLockTree`'s spin lock (which owns this `Tree`) is
// held, so the raw `NonNull` links never see concurrent access.
unsafe impl<H: ParkHandle> Send for Tree<H> {}
unsafe impl<H: ParkHandle> Sync for Tree<H> {}

impl<H: ParkHandle> Tree<H> {
    pub(super) const fn new() -> Self {
        Self {
            root: Cell::new(None),
            leftmost: Cell::new(None),
            seqnum: Cell::new(0),
            holds: Cell::new(0),
        }
    }

    /// The O(1) global fast path: `true` iff nothing in the tree can
    /// possibly overlap `[a0, a1]`.
    pub(super) fn definitely_no_overlap(&self, a0: u64, a1: u64) -> bool {
        let root = match self.root.get() {
            Some(r) => r,
            None => return true,
        };
        let root_subtree_last = link(root).subtree_last;
        let leftmost_start = self.leftmost.get().map(|n| start_of(n)).unwrap_or(u64::MAX);
        !(a0 <= root_subtree_last && leftmost_start <= a1)
    }
}

fn link<H: ParkHandle>(n: NonNull<RangeLock<H>>) -> NodeLink<H> {
    unsafe { n.as_ref().link.get() }
}

fn set_link<H: ParkHandle>(n: NonNull<RangeLock<H>>, l: NodeLink<H>) {
    unsafe { n.as_ref().link.set(l) }
}

fn start_of<H: ParkHandle>(n: NonNull<RangeLock<H>>) -> u64 {
    unsafe { n.as_ref().start }
}

fn last_of<H: ParkHandle>(n: NonNull<RangeLock<H>>) -> u64 {
    unsafe { n.as_ref().last }
}

fn subtree_last_opt<H: ParkHandle>(n: Link<H>) -> Option<u64> {
    n.map(|n| link(n).subtree_last)
}

/// Recomputes `n`'s `subtree_last` from its own `last` and its children's
/// cached values. Does not recurse; callers propagate upward themselves.
fn update_augment<H: ParkHandle>(n: NonNull<RangeLock<H>>) {
    let l = link(n);
    let mut max = last_of(n);
    if let Some(v) = subtree_last_opt(l.left) {
        max = cmp::max(max, v);
    }
    if let Some(v) = subtree_last_opt(l.right) {
        max = cmp::max(max, v);
    }
    let mut l = l;
    l.subtree_last = max;
    set_link(n, l);
}

/// Recomputes `subtree_last` from `n` up to the root, stopping early once a
/// step doesn't change anything (rotations only ever invalidate a bounded
/// prefix of ancestors, but recomputing all the way up is cheap and simple
/// and keeps the fixup code below easy to follow).
fn propagate_augment<H: ParkHandle>(tree: &Tree<H>, mut n: Link<H>) {
    while let Some(node) = n {
        update_augment(node);
        n = link(node).parent;
    }
    let _ = tree;
}

fn is_red<H: ParkHandle>(n: Link<H>) -> bool {
    n.map(|n| link(n).color == Color::Red).unwrap_or(false)
}

fn set_color<H: ParkHandle>(n: NonNull<RangeLock<H>>, color: Color) {
    let mut l = link(n);
    l.color = color;
    set_link(n, l);
}

fn parent_of<H: ParkHandle>(n: NonNull<RangeLock<H>>) -> Link<H> {
    link(n).parent
}

fn set_parent<H: ParkHandle>(n: NonNull<RangeLock<H>>, p: Link<H>) {
    let mut l = link(n);
    l.parent = p;
    set_link(n, l);
}

fn left_of<H: ParkHandle>(n: NonNull<RangeLock<H>>) -> Link<H> {
    link(n).left
}

fn right_of<H: ParkHandle>(n: NonNull<RangeLock<H>>) -> Link<H> {
    link(n).right
}

fn set_left<H: ParkHandle>(n: NonNull<RangeLock<H>>, c: Link<H>) {
    let mut l = link(n);
    l.left = c;
    set_link(n, l);
    if let Some(c) = c {
        set_parent(c, Some(n));
    }
}

fn set_right<H: ParkHandle>(n: NonNull<RangeLock<H>>, c: Link<H>) {
    let mut l = link(n);
    l.right = c;
    set_link(n, l);
    if let Some(c) = c {
        set_parent(c, Some(n));
    }
}

fn replace_child<H: ParkHandle>(tree: &Tree<H>, parent: Link<H>, old: NonNull<RangeLock<H>>, new: Link<H>) {
    match parent {
        None => tree.root.set(new),
        Some(p) => {
            if left_of(p) == Some(old) {
                set_link(p, {
                    let mut l = link(p);
                    l.left = new;
                    l
                });
            } else {
                set_link(p, {
                    let mut l = link(p);
                    l.right = new;
                    l
                });
            }
        }
    }
    if let Some(new) = new {
        set_parent(new, parent);
    }
}

fn rotate_left<H: ParkHandle>(tree: &Tree<H>, x: NonNull<RangeLock<H>>) {
    let y = right_of(x).expect("rotate_left requires a right child");
    let y_left = left_of(y);
    set_right(x, y_left);
    let x_parent = parent_of(x);
    replace_child(tree, x_parent, x, Some(y));
    set_left(y, Some(x));
    update_augment(x);
    update_augment(y);
}

fn rotate_right<H: ParkHandle>(tree: &Tree<H>, x: NonNull<RangeLock<H>>) {
    let y = left_of(x).expect("rotate_right requires a left child");
    let y_right = right_of(y);
    set_left(x, y_right);
    let x_parent = parent_of(x);
    replace_child(tree, x_parent, x, Some(y));
    set_right(y, Some(x));
    update_augment(x);
    update_augment(y);
}

/// Inserts `z` (keyed by `start`, ties broken toward the right so multiple
/// waiters on the same start coexist) and fixes up color and augmentation.
/// Updates `tree.leftmost` if `z` becomes the new minimum.
pub(super) fn insert<H: ParkHandle>(tree: &Tree<H>, z: NonNull<RangeLock<H>>) {
    set_link(z, NodeLink {
        parent: None,
        left: None,
        right: None,
        color: Color::Red,
        subtree_last: last_of(z),
        in_tree: true,
    });

    let mut parent: Link<H> = None;
    let mut cur = tree.root.get();
    let z_start = start_of(z);
    while let Some(c) = cur {
        parent = Some(c);
        if z_start < start_of(c) {
            cur = left_of(c);
        } else {
            cur = right_of(c);
        }
    }

    match parent {
        None => tree.root.set(Some(z)),
        Some(p) => {
            if z_start < start_of(p) {
                set_left(p, Some(z));
            } else {
                set_right(p, Some(z));
            }
        }
    }
    if z_start < tree.leftmost.get().map(start_of).unwrap_or(u64::MAX) {
        tree.leftmost.set(Some(z));
    }

    propagate_augment(tree, Some(z));
    insert_fixup(tree, z);
}

fn insert_fixup<H: ParkHandle>(tree: &Tree<H>, mut z: NonNull<RangeLock<H>>) {
    while let Some(parent) = parent_of(z).filter(|p| is_red(Some(*p))) {
        let grandparent = parent_of(parent).expect("red node always has a black grandparent here");
        if Some(parent) == left_of(grandparent) {
            let uncle = right_of(grandparent);
            if is_red(uncle) {
                set_color(parent, Color::Black);
                set_color(uncle.unwrap(), Color::Black);
                set_color(grandparent, Color::Red);
                z = grandparent;
            } else {
                if Some(z) == right_of(parent) {
                    z = parent;
                    rotate_left(tree, z);
                }
                let parent = parent_of(z).unwrap();
                let grandparent = parent_of(parent).unwrap();
                set_color(parent, Color::Black);
                set_color(grandparent, Color::Red);
                rotate_right(tree, grandparent);
            }
        } else {
            let uncle = left_of(grandparent);
            if is_red(uncle) {
                set_color(parent, Color::Black);
                set_color(uncle.unwrap(), Color::Black);
                set_color(grandparent, Color::Red);
                z = grandparent;
            } else {
                if Some(z) == left_of(parent) {
                    z = parent;
                    rotate_right(tree, z);
                }
                let parent = parent_of(z).unwrap();
                let grandparent = parent_of(parent).unwrap();
                set_color(parent, Color::Black);
                set_color(grandparent, Color::Red);
                rotate_left(tree, grandparent);
            }
        }
    }
    set_color(tree.root.get().unwrap(), Color::Black);
}

/// The minimum-`start` node in the subtree rooted at `n`.
fn subtree_min<H: ParkHandle>(mut n: NonNull<RangeLock<H>>) -> NonNull<RangeLock<H>> {
    while let Some(l) = left_of(n) {
        n = l;
    }
    n
}

/// The in-order successor of `n`, or `None` if `n` is the maximum.
pub(super) fn successor<H: ParkHandle>(n: NonNull<RangeLock<H>>) -> Link<H> {
    if let Some(r) = right_of(n) {
        return Some(subtree_min(r));
    }
    let mut cur = n;
    let mut p = parent_of(n);
    while let Some(pp) = p {
        if right_of(pp) != Some(cur) {
            break;
        }
        cur = pp;
        p = parent_of(pp);
    }
    p
}

/// Removes `z` from the tree, fixing up color, augmentation, and the
/// `leftmost` cache. `z` must currently be linked in.
pub(super) fn remove<H: ParkHandle>(tree: &Tree<H>, z: NonNull<RangeLock<H>>) {
    if tree.leftmost.get() == Some(z) {
        tree.leftmost.set(successor(z));
    }

    let z_original_color = link(z).color;
    let fixup_start: (Link<H>, Link<H>);

    if left_of(z).is_none() {
        let x = right_of(z);
        let z_parent = parent_of(z);
        replace_child(tree, z_parent, z, x);
        fixup_start = (x, z_parent);
        propagate_augment(tree, z_parent);
    } else if right_of(z).is_none() {
        let x = left_of(z);
        let z_parent = parent_of(z);
        replace_child(tree, z_parent, z, x);
        fixup_start = (x, z_parent);
        propagate_augment(tree, z_parent);
    } else {
        let y = subtree_min(right_of(z).unwrap());
        let y_original_color = link(y).color;
        let x = right_of(y);
        let x_parent;

        if parent_of(y) == Some(z) {
            x_parent = Some(y);
        } else {
            x_parent = parent_of(y);
            let y_parent = parent_of(y).unwrap();
            replace_child(tree, Some(y_parent), y, x);
            set_right(y, right_of(z));
        }
        let z_parent = parent_of(z);
        replace_child(tree, z_parent, z, Some(y));
        set_left(y, left_of(z));
        set_color(y, link(z).color);

        propagate_augment(tree, x_parent);
        fixup_start = (x, x_parent);

        if y_original_color == Color::Black {
            delete_fixup(tree, fixup_start.0, fixup_start.1);
        }
        unlink(z);
        return;
    }

    if z_original_color == Color::Black {
        delete_fixup(tree, fixup_start.0, fixup_start.1);
    }
    unlink(z);
}

fn unlink<H: ParkHandle>(n: NonNull<RangeLock<H>>) {
    set_link(n, NodeLink::new());
}

fn delete_fixup<H: ParkHandle>(tree: &Tree<H>, mut x: Link<H>, mut x_parent: Link<H>) {
    while x != tree.root.get() && !is_red(x) {
        let parent = match x_parent {
            Some(p) => p,
            None => break,
        };
        if x == left_of(parent) {
            let mut sibling = right_of(parent).expect("sibling must exist: black-height invariant");
            if is_red(Some(sibling)) {
                set_color(sibling, Color::Black);
                set_color(parent, Color::Red);
                rotate_left(tree, parent);
                sibling = right_of(parent).unwrap();
            }
            if !is_red(left_of(sibling)) && !is_red(right_of(sibling)) {
                set_color(sibling, Color::Red);
                x = Some(parent);
                x_parent = parent_of(parent);
            } else {
                if !is_red(right_of(sibling)) {
                    if let Some(sl) = left_of(sibling) {
                        set_color(sl, Color::Black);
                    }
                    set_color(sibling, Color::Red);
                    rotate_right(tree, sibling);
                    sibling = right_of(parent).unwrap();
                }
                set_color(sibling, link(parent).color);
                set_color(parent, Color::Black);
                if let Some(sr) = right_of(sibling) {
                    set_color(sr, Color::Black);
                }
                rotate_left(tree, parent);
                x = tree.root.get();
                x_parent = None;
            }
        } else {
            let mut sibling = left_of(parent).expect("sibling must exist: black-height invariant");
            if is_red(Some(sibling)) {
                set_color(sibling, Color::Black);
                set_color(parent, Color::Red);
                rotate_right(tree, parent);
                sibling = left_of(parent).unwrap();
            }
            if !is_red(right_of(sibling)) && !is_red(left_of(sibling)) {
                set_color(sibling, Color::Red);
                x = Some(parent);
                x_parent = parent_of(parent);
            } else {
                if !is_red(left_of(sibling)) {
                    if let Some(sr) = right_of(sibling) {
                        set_color(sr, Color::Black);
                    }
                    set_color(sibling, Color::Red);
                    rotate_left(tree, sibling);
                    sibling = left_of(parent).unwrap();
                }
                set_color(sibling, link(parent).color);
                set_color(parent, Color::Black);
                if let Some(sl) = left_of(sibling) {
                    set_color(sl, Color::Black);
                }
                rotate_right(tree, parent);
                x = tree.root.get();
                x_parent = None;
            }
        }
    }
    if let Some(x) = x {
        set_color(x, Color::Black);
    }
}

/// Calls `f` for every node whose interval overlaps `[a0, a1]`, using the
/// augmented `subtree_last` to prune subtrees that cannot contain a match.
pub(super) fn for_each_overlap<H: ParkHandle>(
    tree: &Tree<H>,
    a0: u64,
    a1: u64,
    mut f: impl FnMut(NonNull<RangeLock<H>>),
) {
    fn visit<H: ParkHandle>(n: Link<H>, a0: u64, a1: u64, f: &mut impl FnMut(NonNull<RangeLock<H>>)) {
        let n = match n {
            Some(n) => n,
            None => return,
        };
        // Nothing in this subtree reaches past a0.
        if link(n).subtree_last < a0 {
            return;
        }
        visit(left_of(n), a0, a1, f);
        if crate::interval::overlaps(start_of(n), last_of(n), a0, a1) {
            f(n);
        }
        // The left subtree's starts are all <= start_of(n); if start_of(n)
        // already exceeds a1, the right subtree (all greater starts) can't
        // overlap either.
        if start_of(n) <= a1 {
            visit(right_of(n), a0, a1, f);
        }
    }
    visit(tree.root.get(), a0, a1, &mut f);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::StdParkHandle;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn overlap_starts(tree: &Tree<StdParkHandle>, a0: u64, a1: u64) -> Vec<u64> {
        let mut v = Vec::new();
        for_each_overlap(tree, a0, a1, |n| v.push(start_of(n)));
        v.sort_unstable();
        v
    }

    #[test]
    fn insert_and_find_overlaps() {
        let tree: Tree<StdParkHandle> = Tree::new();
        let nodes: Vec<_> = (0..20u64)
            .map(|i| Box::new(RangeLock::<StdParkHandle>::new(i * 10, i * 10 + 5)))
            .collect();
        for n in &nodes {
            insert(&tree, NonNull::from(n.as_ref()));
        }
        assert_eq!(overlap_starts(&tree, 0, 4), alloc::vec![0]);
        assert_eq!(overlap_starts(&tree, 4, 11), alloc::vec![0, 10]);
        assert!(!tree.definitely_no_overlap(0, 300));
        assert!(tree.definitely_no_overlap(1000, 2000));

        let leftmost = tree.leftmost.get().unwrap();
        assert_eq!(start_of(leftmost), 0);
    }

    #[test]
    fn remove_keeps_leftmost_consistent() {
        let tree: Tree<StdParkHandle> = Tree::new();
        let nodes: Vec<_> = (0..10u64)
            .map(|i| Box::new(RangeLock::<StdParkHandle>::new(i, i)))
            .collect();
        for n in &nodes {
            insert(&tree, NonNull::from(n.as_ref()));
        }
        let first = NonNull::from(nodes[0].as_ref());
        remove(&tree, first);
        let leftmost = tree.leftmost.get().unwrap();
        assert_eq!(start_of(leftmost), 1);
    }
}
