// SPDX-License-Identifier: MPL-2.0

//! A range-based reader/writer lock.
//!
//! Callers stake out an arbitrary `[start, last]` interval with a
//! [`RangeLock`] and acquire it against a shared [`RangeLockTree`]. Multiple
//! readers over overlapping intervals proceed concurrently; a writer
//! excludes every overlapping reader and writer. Acquisition order is fair:
//! a [`RangeLock`] is stamped with the tree's `seqnum` at insert time and
//! nothing can jump ahead of an earlier, still-overlapping waiter.
//!
//! A [`RangeLock`] is caller-owned — typically a stack local — and is only
//! linked into the tree for the span it is waiting or held; the tree never
//! allocates a node of its own. This mirrors the intrusive, container-of
//! style of the system this was distilled from, re-expressed without
//! pointer tagging: the reader/writer tag lives in its own field rather
//! than stolen from the low bit of the waiter handle.

mod tree;

use core::cell::{Cell, RefCell};
use core::ptr::NonNull;

use alloc::vec::Vec;
use log::trace;

use crate::error::Error;
use crate::prelude::Result;
use crate::sync::{ParkHandle, SpinLock, WaitState};

use self::tree::{NodeLink, Tree};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mode {
    Reader,
    Writer,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Init,
    Waiting,
    Held,
}

/// A waiter record for one `[start, last]` acquisition attempt.
///
/// Constructed with [`RangeLock::new`] (or [`RangeLock::new_full`] for the
/// whole address space), then passed by reference to a [`RangeLockTree`]'s
/// lock/unlock methods. Must not be dropped, moved, or reused for a new
/// interval while linked into a tree — the states are `Init -> Waiting ->
/// Held -> Init` (trylock paths skip straight to `Held`; a cancelled wait
/// returns to `Init` with an interrupted result).
pub struct RangeLock<H: ParkHandle> {
    start: u64,
    last: u64,
    mode: Cell<Mode>,
    /// Number of currently-in-tree ranges this waiter must still wait for.
    blocking_ranges: Cell<u64>,
    seqnum: Cell<u64>,
    waiter: RefCell<Option<H>>,
    state: Cell<State>,
    /// Advisory acquisition-order stamp; see open question on `tree->holds`.
    holds: Cell<u64>,
    link: Cell<NodeLink<H>>,
}

// Safety: all mutable access to a `RangeLock`'s shared fields happens while
// the owning `RangeLockTree`'s spin lock is held (or, for the fields the
// caller alone touches before/after tree membership, under the caller's own
// exclusive access). `ParkHandle: Send + Sync` makes the waiter handle
// itself safe to hand across threads.
unsafe impl<H: ParkHandle> Send for RangeLock<H> {}
unsafe impl<H: ParkHandle> Sync for RangeLock<H> {}

impl<H: ParkHandle> RangeLock<H> {
    /// Initializes a waiter record for `[start, last]`. `start` must be
    /// less than or equal to `last`.
    pub fn new(start: u64, last: u64) -> Self {
        assert!(start <= last, "range lock interval must be non-empty");
        Self {
            start,
            last,
            mode: Cell::new(Mode::Reader),
            blocking_ranges: Cell::new(0),
            seqnum: Cell::new(0),
            waiter: RefCell::new(None),
            state: Cell::new(State::Init),
            holds: Cell::new(0),
            link: Cell::new(NodeLink::new()),
        }
    }

    /// Initializes a waiter record spanning the whole representable range.
    pub fn new_full() -> Self {
        Self::new(0, u64::MAX)
    }

    /// Re-initializes an unlinked lock record for a new interval, allowing
    /// reuse of the same stack slot across acquisitions.
    pub fn reinit(&mut self, start: u64, last: u64) {
        assert_eq!(self.state.get(), State::Init, "cannot reinit a linked range lock");
        assert!(start <= last, "range lock interval must be non-empty");
        self.start = start;
        self.last = last;
        self.blocking_ranges.set(0);
        self.seqnum.set(0);
        *self.waiter.borrow_mut() = None;
    }

    /// The `[start, last]` interval this record was initialized with.
    pub fn range(&self) -> (u64, u64) {
        (self.start, self.last)
    }

    /// The acquisition-order stamp recorded for a held writer lock.
    /// Advisory: see the open question on `tree->holds` — do not rely on
    /// its exact value for correctness, only for diagnostics.
    pub fn holds(&self) -> u64 {
        self.holds.get()
    }
}

/// A tree of currently waiting and held [`RangeLock`]s, fair by insertion
/// order, with O(1) overlap rejection against the whole tree via a cached
/// `subtree_last` at the root and a `leftmost` cache.
pub struct RangeLockTree<H: ParkHandle> {
    inner: SpinLock<Tree<H>>,
}

impl<H: ParkHandle> Default for RangeLockTree<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ParkHandle> RangeLockTree<H> {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(Tree::new()),
        }
    }

    /// Total number of writer acquisitions this tree has stamped so far.
    /// Advisory diagnostic only, per the open question on `tree->holds`.
    pub fn holds(&self) -> u64 {
        self.inner.lock().holds.get()
    }

    /// Suspends the caller, uninterruptibly, until `lock`'s range is
    /// granted for shared (reader) access.
    pub fn read_lock(&self, lock: &RangeLock<H>) {
        let _ = self.lock_common(lock, Mode::Reader, WaitState::Uninterruptible);
    }

    /// As [`Self::read_lock`], but returns [`Error::Interrupted`] if any
    /// signal is delivered while waiting.
    pub fn read_lock_interruptible(&self, lock: &RangeLock<H>) -> Result<()> {
        self.lock_common(lock, Mode::Reader, WaitState::Interruptible)
    }

    /// As [`Self::read_lock`], but returns [`Error::Interrupted`] if a
    /// fatal signal is delivered while waiting.
    pub fn read_lock_killable(&self, lock: &RangeLock<H>) -> Result<()> {
        self.lock_common(lock, Mode::Reader, WaitState::Killable)
    }

    /// Suspends the caller, uninterruptibly, until `lock`'s range is
    /// granted for exclusive (writer) access.
    pub fn write_lock(&self, lock: &RangeLock<H>) {
        let _ = self.lock_common(lock, Mode::Writer, WaitState::Uninterruptible);
    }

    /// As [`Self::write_lock`], but returns [`Error::Interrupted`] if any
    /// signal is delivered while waiting.
    pub fn write_lock_interruptible(&self, lock: &RangeLock<H>) -> Result<()> {
        self.lock_common(lock, Mode::Writer, WaitState::Interruptible)
    }

    /// As [`Self::write_lock`], but returns [`Error::Interrupted`] if a
    /// fatal signal is delivered while waiting.
    pub fn write_lock_killable(&self, lock: &RangeLock<H>) -> Result<()> {
        self.lock_common(lock, Mode::Writer, WaitState::Killable)
    }

    /// Attempts to acquire `lock` for shared access without blocking.
    ///
    /// Unlike [`Self::read_lock`], this fails outright (leaving the tree
    /// untouched) if *any* overlapping range is held or waited on by a
    /// writer — it never joins the queue behind one.
    pub fn read_trylock(&self, lock: &RangeLock<H>) -> bool {
        debug_assert_eq!(lock.state.get(), State::Init);
        let (a0, a1) = lock.range();
        let guard = self.inner.lock();
        let mut all_readers = true;
        if !guard.definitely_no_overlap(a0, a1) {
            tree::for_each_overlap(&guard, a0, a1, |b| {
                if unsafe { b.as_ref() }.mode.get() != Mode::Reader {
                    all_readers = false;
                }
            });
        }
        if !all_readers {
            return false;
        }
        lock.mode.set(Mode::Reader);
        lock.blocking_ranges.set(0);
        *lock.waiter.borrow_mut() = Some(H::current());
        insert_locked(&guard, NonNull::from(lock));
        lock.state.set(State::Held);
        trace!("read_trylock acquired [{a0}, {a1}]");
        true
    }

    /// Attempts to acquire `lock` for exclusive access without blocking.
    /// Fails outright if any range overlaps at all.
    pub fn write_trylock(&self, lock: &RangeLock<H>) -> bool {
        debug_assert_eq!(lock.state.get(), State::Init);
        let (a0, a1) = lock.range();
        let guard = self.inner.lock();
        let mut any_overlap = false;
        if !guard.definitely_no_overlap(a0, a1) {
            tree::for_each_overlap(&guard, a0, a1, |_| any_overlap = true);
        }
        if any_overlap {
            return false;
        }
        lock.mode.set(Mode::Writer);
        lock.blocking_ranges.set(0);
        *lock.waiter.borrow_mut() = Some(H::current());
        insert_locked(&guard, NonNull::from(lock));
        let holds = guard.holds.get() + 1;
        guard.holds.set(holds);
        lock.holds.set(holds);
        lock.state.set(State::Held);
        trace!("write_trylock acquired [{a0}, {a1}]");
        true
    }

    /// Releases a previously acquired reader lock.
    pub fn read_unlock(&self, lock: &RangeLock<H>) {
        self.unlock_common(lock, Mode::Reader);
    }

    /// Releases a previously acquired writer lock.
    pub fn write_unlock(&self, lock: &RangeLock<H>) {
        self.unlock_common(lock, Mode::Writer);
    }

    /// Converts a held writer lock into a reader lock, waking any readers
    /// that were only blocked on this writer. Does not change the tree
    /// structure or `lock`'s position/seqnum.
    pub fn downgrade_write(&self, lock: &RangeLock<H>) {
        debug_assert_eq!(lock.state.get(), State::Held);
        debug_assert_eq!(lock.mode.get(), Mode::Writer);
        let (a0, a1) = lock.range();
        let guard = self.inner.lock();
        let mut wake_list = Vec::new();
        if !guard.definitely_no_overlap(a0, a1) {
            tree::for_each_overlap(&guard, a0, a1, |b| {
                let b_ref = unsafe { b.as_ref() };
                if b_ref.mode.get() == Mode::Reader {
                    release_one(b_ref, &mut wake_list);
                }
            });
        }
        lock.mode.set(Mode::Reader);
        drop(guard);
        wake_all(wake_list);
        trace!("downgraded write lock [{a0}, {a1}] to reader");
    }

    fn lock_common(&self, lock: &RangeLock<H>, mode: Mode, wait_state: WaitState) -> Result<()> {
        debug_assert_eq!(lock.state.get(), State::Init);
        let (a0, a1) = lock.range();
        let handle = H::current();

        {
            let guard = self.inner.lock();
            lock.mode.set(mode);
            let mut blocking = 0u64;
            if !guard.definitely_no_overlap(a0, a1) {
                tree::for_each_overlap(&guard, a0, a1, |b| {
                    let b_ref = unsafe { b.as_ref() };
                    if !(mode == Mode::Reader && b_ref.mode.get() == Mode::Reader) {
                        blocking += 1;
                    }
                });
            }
            lock.blocking_ranges.set(blocking);
            *lock.waiter.borrow_mut() = Some(handle.clone());
            insert_locked(&guard, NonNull::from(lock));
            lock.state.set(if blocking > 0 { State::Waiting } else { State::Held });
        }

        if lock.blocking_ranges.get() > 0 {
            trace!(
                "parking for [{a0}, {a1}], blocking_ranges={}",
                lock.blocking_ranges.get()
            );
            loop {
                handle.park(wait_state);
                if lock.blocking_ranges.get() == 0 {
                    break;
                }
                if wait_state != WaitState::Uninterruptible && H::signal_pending(wait_state) {
                    self.cancel_wait(lock);
                    return Err(Error::Interrupted);
                }
            }
        }

        if mode == Mode::Writer {
            let guard = self.inner.lock();
            let holds = guard.holds.get() + 1;
            guard.holds.set(holds);
            lock.holds.set(holds);
        }
        lock.state.set(State::Held);
        trace!("acquired [{a0}, {a1}]");
        Ok(())
    }

    fn unlock_common(&self, lock: &RangeLock<H>, mode: Mode) {
        debug_assert_eq!(lock.state.get(), State::Held);
        debug_assert_eq!(lock.mode.get(), mode);
        let (a0, a1) = lock.range();
        let guard = self.inner.lock();
        tree::remove(&guard, NonNull::from(lock));
        lock.state.set(State::Init);
        *lock.waiter.borrow_mut() = None;

        let mut wake_list = Vec::new();
        if !guard.definitely_no_overlap(a0, a1) {
            tree::for_each_overlap(&guard, a0, a1, |b| {
                let b_ref = unsafe { b.as_ref() };
                let must_release = match mode {
                    Mode::Writer => true,
                    Mode::Reader => b_ref.mode.get() == Mode::Writer,
                };
                if must_release {
                    release_one(b_ref, &mut wake_list);
                }
            });
        }
        drop(guard);
        wake_all(wake_list);
        trace!("released [{a0}, {a1}]");
    }

    /// Un-accounts a cancelled waiter from every later (higher-`seqnum`)
    /// overlapping waiter that counted it while it was in the tree — see
    /// the cancellation rule in the interval lock's acquisition design.
    fn cancel_wait(&self, lock: &RangeLock<H>) {
        let (a0, a1) = lock.range();
        let self_seqnum = lock.seqnum.get();
        let self_mode = lock.mode.get();

        let guard = self.inner.lock();
        tree::remove(&guard, NonNull::from(lock));
        lock.state.set(State::Init);
        *lock.waiter.borrow_mut() = None;

        let mut wake_list = Vec::new();
        if !guard.definitely_no_overlap(a0, a1) {
            tree::for_each_overlap(&guard, a0, a1, |b| {
                let b_ref = unsafe { b.as_ref() };
                if b_ref.seqnum.get() > self_seqnum
                    && !(self_mode == Mode::Reader && b_ref.mode.get() == Mode::Reader)
                {
                    release_one(b_ref, &mut wake_list);
                }
            });
        }
        drop(guard);
        wake_all(wake_list);
        trace!("cancelled wait on [{a0}, {a1}]");
    }
}

/// Decrements `b`'s `blocking_ranges`, queuing its waiter to be woken if it
/// reaches zero. Must be called with the tree's spin lock held; the queue
/// is flushed by the caller only after the lock is released.
fn release_one<H: ParkHandle>(b: &RangeLock<H>, wake_list: &mut Vec<H>) {
    let remaining = b
        .blocking_ranges
        .get()
        .checked_sub(1)
        .expect("blocking_ranges underflow: release without matching increment");
    b.blocking_ranges.set(remaining);
    if remaining == 0 {
        if let Some(h) = b.waiter.borrow().clone() {
            wake_list.push(h);
        }
    }
}

fn wake_all<H: ParkHandle>(wake_list: Vec<H>) {
    for h in wake_list {
        h.unpark();
    }
}

fn insert_locked<H: ParkHandle>(tree: &Tree<H>, node: NonNull<RangeLock<H>>) {
    let seq = tree.seqnum.get();
    tree.seqnum.set(seq + 1);
    unsafe { node.as_ref().seqnum.set(seq) };
    tree::insert(tree, node);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::StdParkHandle;
    use alloc::sync::Arc;
    use std::thread;
    use std::time::Duration;

    type Tree = RangeLockTree<StdParkHandle>;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn two_readers_share_immediately() {
        init_logging();
        let tree = Tree::new();
        let r1 = RangeLock::new(0, 10);
        let r2 = RangeLock::new(5, 15);
        tree.read_lock(&r1);
        tree.read_lock(&r2);
        assert_eq!(r1.blocking_ranges.get(), 0);
        assert_eq!(r2.blocking_ranges.get(), 0);
        tree.read_unlock(&r2);
        tree.read_unlock(&r1);
    }

    #[test]
    fn writer_excludes_overlapping_reader() {
        let tree = Arc::new(Tree::new());
        let r = RangeLock::new(0, 10);
        tree.read_lock(&r);

        let tree2 = tree.clone();
        let writer_acquired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = writer_acquired.clone();
        let handle = thread::spawn(move || {
            let w = RangeLock::new(5, 6);
            tree2.write_lock(&w);
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            tree2.write_unlock(&w);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!writer_acquired.load(std::sync::atomic::Ordering::SeqCst));
        tree.read_unlock(&r);
        handle.join().unwrap();
        assert!(writer_acquired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn write_trylock_fails_on_overlap_but_not_disjoint() {
        let tree = Tree::new();
        let held = RangeLock::new(0, 10);
        tree.write_lock(&held);

        let overlapping = RangeLock::new(5, 20);
        assert!(!tree.write_trylock(&overlapping));

        let disjoint = RangeLock::new(11, 20);
        assert!(tree.write_trylock(&disjoint));

        tree.write_unlock(&disjoint);
        tree.write_unlock(&held);
    }

    #[test]
    fn read_trylock_fails_if_any_overlap_is_a_writer() {
        let tree = Tree::new();
        let w = RangeLock::new(0, 10);
        tree.write_lock(&w);
        let r = RangeLock::new(5, 6);
        assert!(!tree.read_trylock(&r));
        tree.write_unlock(&w);
        assert!(tree.read_trylock(&r));
        tree.read_unlock(&r);
    }

    #[test]
    fn downgrade_wakes_blocked_reader() {
        let tree = Arc::new(Tree::new());
        let w = RangeLock::new(0, 100);
        tree.write_lock(&w);

        let tree2 = tree.clone();
        let reader_acquired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = reader_acquired.clone();
        let handle = thread::spawn(move || {
            let r = RangeLock::new(10, 20);
            tree2.read_lock(&r);
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            tree2.read_unlock(&r);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!reader_acquired.load(std::sync::atomic::Ordering::SeqCst));
        tree.downgrade_write(&w);
        handle.join().unwrap();
        assert!(reader_acquired.load(std::sync::atomic::Ordering::SeqCst));
        tree.read_unlock(&w);
    }

    // `StdParkHandle::signal_pending` always reports false — a plain
    // `std::thread` host has no signal concept of its own. Exercising
    // cancellation needs a `ParkHandle` that can be told a signal is
    // pending from outside the parked thread.
    mod signallable {
        use super::super::*;
        use crate::sync::WakeReason;
        use std::cell::RefCell;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        thread_local! {
            static SIGNAL: RefCell<Arc<AtomicBool>> = RefCell::new(Arc::new(AtomicBool::new(false)));
        }

        /// Sets the signal flag the *calling* thread's [`SignallableHandle`]
        /// will consult. Must be called before the thread parks.
        pub(super) fn install_signal_flag(flag: Arc<AtomicBool>) {
            SIGNAL.with(|s| *s.borrow_mut() = flag);
        }

        #[derive(Clone)]
        pub(super) struct SignallableHandle {
            thread: thread::Thread,
            has_woken: Arc<AtomicBool>,
        }

        impl ParkHandle for SignallableHandle {
            fn current() -> Self {
                Self {
                    thread: thread::current(),
                    has_woken: Arc::new(AtomicBool::new(false)),
                }
            }

            fn park(&self, state: WaitState) -> WakeReason {
                loop {
                    if self.has_woken.swap(false, Ordering::Acquire) {
                        return WakeReason::Woken;
                    }
                    if Self::signal_pending(state) {
                        return WakeReason::Signal;
                    }
                    thread::park_timeout(Duration::from_millis(2));
                }
            }

            fn unpark(&self) {
                self.has_woken.store(true, Ordering::Release);
                self.thread.unpark();
            }

            fn signal_pending(state: WaitState) -> bool {
                state != WaitState::Uninterruptible && SIGNAL.with(|s| s.borrow().load(Ordering::SeqCst))
            }
        }
    }

    #[test]
    fn interruptible_wait_returns_err_when_signalled() {
        use self::signallable::{install_signal_flag, SignallableHandle};
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Mutex;

        let tree = Arc::new(RangeLockTree::<SignallableHandle>::new());
        let held = RangeLock::new(0, 100);
        tree.write_lock(&held);

        let signal = Arc::new(AtomicBool::new(false));
        let signal_for_waiter = signal.clone();
        let tree2 = tree.clone();
        let outcome: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();

        let waiter = thread::spawn(move || {
            install_signal_flag(signal_for_waiter);
            let waiting = RangeLock::new(0, 100);
            let result = tree2.write_lock_interruptible(&waiting);
            *outcome2.lock().unwrap() = Some(result);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(outcome.lock().unwrap().is_none());
        signal.store(true, Ordering::SeqCst);
        waiter.join().unwrap();

        assert_eq!(outcome.lock().unwrap().take(), Some(Err(Error::Interrupted)));
        tree.write_unlock(&held);
    }
}
