// SPDX-License-Identifier: MPL-2.0

//! The park/wake contract a host environment must provide.
//!
//! The range lock never talks to a scheduler directly. Instead it parks and
//! wakes through [`ParkHandle`], an interface modeled on the source's
//! `park_current(state) -> WakeReason` / `wake(handle)` / `current_handle()` /
//! `signal_pending(state) -> bool` collaborator contract (see the crate's
//! design notes on the park/schedule primitive). A bare `no_std` build
//! supplies its own impl; the `std` feature ships one riding on
//! `std::thread::park`/`unpark`.

/// The wait state a parked waiter is suspended in.
///
/// Mirrors the three wait flavors `read_lock`/`write_lock` expose:
/// uninterruptible waits never observe a pending signal; interruptible waits
/// wake early on any signal; killable waits wake early only for a signal
/// that is about to terminate the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Uninterruptible,
    Interruptible,
    Killable,
}

/// Why a parked waiter resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken explicitly via [`ParkHandle::unpark`].
    Woken,
    /// Resumed early because a signal matching the wait state is pending.
    Signal,
}

/// A host-provided handle to "the current task" capable of being parked and
/// later woken from another thread.
///
/// Implementors must tolerate spurious wakeups: `park` may return `Woken`
/// even when nobody called `unpark` on this exact handle yet (e.g. if the
/// underlying primitive coalesces an `unpark` that raced ahead of `park`).
/// Callers re-check their own wake condition (`blocking_ranges == 0`) in a
/// loop, exactly as the source's `wait_for_ranges` does.
pub trait ParkHandle: Clone + Send + Sync + 'static {
    /// Returns a handle to the calling task.
    fn current() -> Self;

    /// Suspends the calling task until [`ParkHandle::unpark`] is called on a
    /// clone of `self`, or (for interruptible/killable waits) until a
    /// matching signal is pending.
    ///
    /// Must not busy-wait; a host schedules something else in the meantime.
    fn park(&self, state: WaitState) -> WakeReason;

    /// Wakes the task denoted by this handle. Never blocks. Waking a task
    /// that is not currently parked must not be lost — the next `park` call
    /// returns immediately (edge-triggered, not level-triggered, is also an
    /// acceptable implementation as long as at least one `park` call after
    /// an `unpark` returns promptly).
    fn unpark(&self);

    /// Reports whether the calling task has a signal pending that should
    /// abort a wait in the given state. Uninterruptible waits always report
    /// `false`.
    fn signal_pending(state: WaitState) -> bool;
}

#[cfg(feature = "std")]
mod std_impl {
    use super::{ParkHandle, WaitState, WakeReason};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, Thread};

    /// A [`ParkHandle`] backed by `std::thread::park`/`unpark`.
    ///
    /// Carries its own `has_woken` flag so that `unpark` calls arriving
    /// before the matching `park` are not lost to `std::thread`'s single
    /// "unpark token" semantics racing a spurious consumption elsewhere.
    #[derive(Clone)]
    pub struct StdParkHandle {
        thread: Thread,
        has_woken: Arc<AtomicBool>,
    }

    impl ParkHandle for StdParkHandle {
        fn current() -> Self {
            Self {
                thread: thread::current(),
                has_woken: Arc::new(AtomicBool::new(false)),
            }
        }

        fn park(&self, _state: WaitState) -> WakeReason {
            while !self.has_woken.swap(false, Ordering::Acquire) {
                thread::park();
            }
            WakeReason::Woken
        }

        fn unpark(&self) {
            self.has_woken.store(true, Ordering::Release);
            self.thread.unpark();
        }

        fn signal_pending(_state: WaitState) -> bool {
            // A plain std::thread host has no signal-delivery concept of its
            // own; hosts that do should supply their own `ParkHandle`.
            false
        }
    }
}

#[cfg(feature = "std")]
pub use std_impl::StdParkHandle;

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unpark_wakes_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let handle_for_waiter = StdParkHandle::current();
        let handle_for_waker = handle_for_waiter.clone();
        let waiter = thread::spawn(move || {
            tx.send(()).unwrap();
            handle_for_waiter.park(WaitState::Uninterruptible)
        });
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        handle_for_waker.unpark();
        assert_eq!(waiter.join().unwrap(), WakeReason::Woken);
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        let handle = StdParkHandle::current();
        handle.unpark();
        assert_eq!(handle.park(WaitState::Uninterruptible), WakeReason::Woken);
    }
}
