// SPDX-License-Identifier: MPL-2.0

//! A free-space block allocator over a single managed `[block_start,
//! block_end]` region.
//!
//! Free space is tracked as a set of disjoint, non-adjacent extents keyed
//! by their low end. Allocation walks from the lowest or highest extent
//! (the requested [`Direction`]) consuming whole extents or splitting a
//! partial one off; freeing an extent coalesces it with any immediately
//! adjacent neighbor so the non-adjacency invariant is restored.
//!
//! The extent set is kept in a [`BTreeMap`] rather than a second
//! hand-rolled tree: unlike [`crate::range_lock`]'s waiter records, free
//! extents are owned by the allocator itself rather than by a caller, so
//! there is no intrusive-linkage requirement pushing toward a custom
//! structure, and `BTreeMap`'s ordered keys give the `first_node`/
//! `last_node` extremes and `range_low`-keyed lookup the design calls for
//! at `O(log n)` with no unsafe code.

use alloc::collections::BTreeMap;
use core::cell::Cell;
use core::ops::Bound;

use log::trace;

use crate::error::Error;
use crate::interval;
use crate::prelude::Result;
use crate::sync::SpinLock;

/// Allocation direction: serve from the lowest-addressed extent or the
/// highest-addressed one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    FromHead,
    FromTail,
}

/// Caller-supplied classification for an allocation request.
///
/// Threaded through `new_blocks` and recorded for diagnostics, but does not
/// affect allocation behavior — reserved for a future policy hook.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AllocType(pub u32);

/// An external collaborator capable of zeroing a granted block range.
///
/// Zeroing returned memory is outside this allocator's concern the same
/// way the backing storage's geometry is: the allocator only tracks which
/// extents are free and hands back a `[start, start+count-1]` run,
/// optionally asking the host to clear it before the caller sees it.
pub trait BlockZeroer {
    fn zero_range(&self, start: u64, count: u64);
}

struct FreeListInner {
    /// `range_low -> range_high`, disjoint and non-adjacent by construction.
    ranges: BTreeMap<u64, u64>,
    num_free_blocks: u64,
    block_start: u64,
    block_end: u64,
    last_alloc_type: Cell<AllocType>,
    alloc_count: u64,
    free_count: u64,
}

impl FreeListInner {
    fn first(&self) -> Option<(u64, u64)> {
        self.ranges.iter().next().map(|(&l, &h)| (l, h))
    }

    fn last(&self) -> Option<(u64, u64)> {
        self.ranges.iter().next_back().map(|(&l, &h)| (l, h))
    }
}

/// Owns the free-extent set for one managed region and the spinlock
/// protecting it.
pub struct FreeList {
    inner: SpinLock<FreeListInner>,
}

impl FreeList {
    /// Allocates the free-list structure for the region `[block_start,
    /// block_end]`, with the tree left empty — call [`Self::init_blockmap`]
    /// to populate it.
    ///
    /// The source's `init_free_lists` can fail with an out-of-memory error
    /// on allocation failure; a safe Rust `BTreeMap` allocates lazily on
    /// first insert rather than up front, so there is nothing to fail here,
    /// but the fallible signature is kept for interface fidelity with a
    /// host that supplies a bounded allocator.
    pub fn init_free_lists(block_start: u64, block_end: u64) -> Result<Self> {
        if block_start > block_end {
            return Err(Error::InvalidArgs);
        }
        Ok(Self {
            inner: SpinLock::new(FreeListInner {
                ranges: BTreeMap::new(),
                num_free_blocks: 0,
                block_start,
                block_end,
                last_alloc_type: Cell::new(AllocType::default()),
                alloc_count: 0,
                free_count: 0,
            }),
        })
    }

    /// On first boot (`recovery == false`), resets the tree to a single
    /// extent spanning the whole managed region. On recovery, empties the
    /// tree for the caller to repopulate from its own recovery log.
    pub fn init_blockmap(&self, recovery: bool) {
        let mut inner = self.inner.lock();
        inner.ranges.clear();
        inner.num_free_blocks = 0;
        if !recovery {
            let (start, end) = (inner.block_start, inner.block_end);
            inner.ranges.insert(start, end);
            inner.num_free_blocks = end - start + 1;
        }
        trace!(
            "init_blockmap recovery={recovery} region=[{}, {}]",
            inner.block_start, inner.block_end
        );
    }

    /// Tears the free-list down. Equivalent to dropping the `FreeList`;
    /// provided to keep the lifecycle explicit at call sites that mirror
    /// the source's paired init/delete calls.
    pub fn delete_free_lists(self) {
        drop(self);
    }

    /// Allocates a contiguous run of `count` blocks from the requested
    /// [`Direction`]. `block_type > 0` demands a single extent of exactly
    /// matching size or larger (no partial split of a superpage request).
    ///
    /// Returns `(start_block, granted_count)`; `granted_count` always
    /// equals `count` (a partial grant is not modeled — either an extent
    /// can serve the whole request or allocation fails with
    /// [`Error::NoSpace`]).
    ///
    /// If `zero` is supplied, the granted range is handed to it for
    /// clearing before returning.
    pub fn new_blocks(
        &self,
        count: u64,
        block_type: u32,
        alloc_type: AllocType,
        direction: Direction,
        zero: Option<&dyn BlockZeroer>,
    ) -> Result<(u64, u64)> {
        if count == 0 {
            return Err(Error::InvalidArgs);
        }
        let granted = {
            let mut inner = self.inner.lock();
            inner.last_alloc_type.set(alloc_type);
            let granted = allocate_locked(&mut inner, count, block_type, direction)?;
            inner.alloc_count += 1;
            granted
        };
        if let Some(zeroer) = zero {
            zeroer.zero_range(granted.0, granted.1);
        }
        trace!(
            "new_blocks count={count} direction={direction:?} -> start={} count={}",
            granted.0, granted.1
        );
        Ok(granted)
    }

    /// Returns `[start, start + count - 1]` to the free set, coalescing
    /// with an immediately adjacent neighbor on either side.
    pub fn free_blocks(&self, start: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidArgs);
        }
        let mut inner = self.inner.lock();
        free_locked(&mut inner, start, count)?;
        inner.free_count += 1;
        trace!("free_blocks start={start} count={count}");
        Ok(())
    }

    /// Total free blocks across all extents.
    pub fn num_free_blocks(&self) -> u64 {
        self.inner.lock().num_free_blocks
    }

    /// Number of disjoint free extents currently tracked.
    pub fn num_blocknode(&self) -> usize {
        self.inner.lock().ranges.len()
    }

    /// A snapshot of all free extents, ordered by `range_low`. Intended for
    /// diagnostics and tests, not the allocation hot path.
    pub fn extents(&self) -> alloc::vec::Vec<(u64, u64)> {
        self.inner.lock().ranges.iter().map(|(&l, &h)| (l, h)).collect()
    }

    /// The `alloc_type` passed to the most recent `new_blocks` call.
    /// Reserved: recorded for diagnostics only, per the open question on
    /// `alloc_type`'s unused status in the source.
    pub fn last_alloc_type(&self) -> AllocType {
        self.inner.lock().last_alloc_type.get()
    }
}

fn successor_extent(inner: &FreeListInner, low: u64) -> Option<(u64, u64)> {
    inner
        .ranges
        .range((Bound::Excluded(low), Bound::Unbounded))
        .next()
        .map(|(&l, &h)| (l, h))
}

fn predecessor_extent(inner: &FreeListInner, low: u64) -> Option<(u64, u64)> {
    inner.ranges.range(..low).next_back().map(|(&l, &h)| (l, h))
}

fn allocate_locked(
    inner: &mut FreeListInner,
    count: u64,
    block_type: u32,
    direction: Direction,
) -> Result<(u64, u64)> {
    let mut cursor = match direction {
        Direction::FromHead => inner.first(),
        Direction::FromTail => inner.last(),
    };

    loop {
        let (low, high) = cursor.ok_or(Error::NoSpace)?;
        let size = high - low + 1;

        if count >= size {
            if block_type > 0 && count > size {
                cursor = match direction {
                    Direction::FromHead => successor_extent(inner, low),
                    Direction::FromTail => predecessor_extent(inner, low),
                };
                continue;
            }
            inner.ranges.remove(&low);
            inner.num_free_blocks -= size;
            return Ok((low, size));
        }

        return match direction {
            Direction::FromHead => {
                inner.ranges.remove(&low);
                let new_low = low + count;
                inner.ranges.insert(new_low, high);
                inner.num_free_blocks -= count;
                Ok((low, count))
            }
            Direction::FromTail => {
                let new_high = high - count;
                inner.ranges.insert(low, new_high);
                let granted_start = high + 1 - count;
                inner.num_free_blocks -= count;
                Ok((granted_start, count))
            }
        };
    }
}

fn free_locked(inner: &mut FreeListInner, low: u64, count: u64) -> Result<()> {
    let high = low.checked_add(count - 1).ok_or(Error::InvalidArgs)?;
    if low < inner.block_start || high > inner.block_end {
        return Err(Error::IoError);
    }

    if let Some((plow, phigh)) = predecessor_extent(inner, low + 1) {
        if interval::contains(plow, phigh, low) || interval::contains(plow, phigh, high) {
            return Err(Error::InvalidArgs);
        }
    }
    if let Some((nlow, nhigh)) = inner.ranges.range(low..).next().map(|(&l, &h)| (l, h)) {
        if interval::contains(nlow, nhigh, low) || interval::contains(nlow, nhigh, high) {
            return Err(Error::InvalidArgs);
        }
    }

    let prev = predecessor_extent(inner, low);
    let next = inner.ranges.range(low..).next().map(|(&l, &h)| (l, h));
    let abuts_left = prev.is_some_and(|(_, ph)| ph + 1 == low);
    let abuts_right = next.is_some_and(|(nl, _)| high + 1 == nl);

    match (abuts_left, abuts_right) {
        (true, true) => {
            let (plow, _) = prev.unwrap();
            let (nlow, nhigh) = next.unwrap();
            inner.ranges.remove(&nlow);
            inner.ranges.insert(plow, nhigh);
        }
        (true, false) => {
            let (plow, _) = prev.unwrap();
            inner.ranges.insert(plow, high);
        }
        (false, true) => {
            let (nlow, nhigh) = next.unwrap();
            inner.ranges.remove(&nlow);
            inner.ranges.insert(low, nhigh);
        }
        (false, false) => {
            inner.ranges.insert(low, high);
        }
    }
    inner.num_free_blocks += count;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn allocator_end_to_end() {
        init_logging();
        let fl = FreeList::init_free_lists(10, 19).unwrap();
        fl.init_blockmap(false);

        let (start, count) = fl
            .new_blocks(3, 0, AllocType::default(), Direction::FromHead, None)
            .unwrap();
        assert_eq!((start, count), (10, 3));
        assert_eq!(fl.extents(), alloc::vec![(13, 19)]);
        assert_eq!(fl.num_free_blocks(), 7);

        let (start, count) = fl
            .new_blocks(2, 0, AllocType::default(), Direction::FromTail, None)
            .unwrap();
        assert_eq!((start, count), (18, 2));
        assert_eq!(fl.extents(), alloc::vec![(13, 17)]);
        assert_eq!(fl.num_free_blocks(), 5);

        fl.free_blocks(10, 3).unwrap();
        assert_eq!(fl.extents(), alloc::vec![(10, 17)]);
        assert_eq!(fl.num_free_blocks(), 8);
    }

    #[test]
    fn middle_free_fits_a_hole() {
        let fl = FreeList::init_free_lists(0, 9).unwrap();
        fl.init_blockmap(false);

        fl.new_blocks(3, 0, AllocType::default(), Direction::FromHead, None)
            .unwrap();
        assert_eq!(fl.extents(), alloc::vec![(3, 9)]);

        fl.new_blocks(3, 0, AllocType::default(), Direction::FromHead, None)
            .unwrap();
        assert_eq!(fl.extents(), alloc::vec![(6, 9)]);

        fl.free_blocks(0, 3).unwrap();
        assert_eq!(fl.extents(), alloc::vec![(0, 2), (6, 9)]);

        fl.free_blocks(3, 3).unwrap();
        assert_eq!(fl.extents(), alloc::vec![(0, 9)]);
        assert_eq!(fl.num_free_blocks(), 10);
    }

    #[test]
    fn superpage_request_skips_undersized_extent() {
        let fl = FreeList::init_free_lists(0, 99).unwrap();
        fl.init_blockmap(false);
        // Consume the whole region, then free two disjoint extents: a
        // small one at the head (too small for the superpage request
        // below) and a larger one further on.
        fl.new_blocks(100, 0, AllocType::default(), Direction::FromHead, None)
            .unwrap();
        fl.free_blocks(10, 3).unwrap();
        fl.free_blocks(50, 10).unwrap();
        assert_eq!(fl.extents(), alloc::vec![(10, 12), (50, 59)]);

        // A superpage demand too big for the head extent must skip it
        // rather than fail, and must not split across the two extents.
        let (start, count) = fl
            .new_blocks(5, 1, AllocType::default(), Direction::FromHead, None)
            .unwrap();
        assert_eq!((start, count), (50, 5));
        assert_eq!(fl.extents(), alloc::vec![(10, 12), (55, 59)]);

        // Nothing left can satisfy a superpage demand bigger than either
        // remaining extent.
        let err = fl
            .new_blocks(10, 1, AllocType::default(), Direction::FromHead, None)
            .unwrap_err();
        assert_eq!(err, Error::NoSpace);
    }

    #[test]
    fn free_outside_region_is_io_error() {
        let fl = FreeList::init_free_lists(10, 19).unwrap();
        fl.init_blockmap(false);
        fl.new_blocks(10, 0, AllocType::default(), Direction::FromHead, None)
            .unwrap();
        assert_eq!(fl.free_blocks(5, 3), Err(Error::IoError));
    }

    #[test]
    fn double_free_is_invalid() {
        let fl = FreeList::init_free_lists(0, 9).unwrap();
        fl.init_blockmap(false);
        fl.new_blocks(5, 0, AllocType::default(), Direction::FromHead, None)
            .unwrap();
        assert_eq!(fl.free_blocks(6, 2), Err(Error::InvalidArgs));
    }

    #[test]
    fn recovery_leaves_tree_empty() {
        let fl = FreeList::init_free_lists(0, 9).unwrap();
        fl.init_blockmap(true);
        assert_eq!(fl.num_blocknode(), 0);
        assert_eq!(fl.num_free_blocks(), 0);
    }
}
