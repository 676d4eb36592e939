// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives shared by the range lock and the block
//! allocator: a spin lock for structural mutations, and the park/wake
//! contract a host environment implements.

mod park;
mod spin;

#[cfg(feature = "std")]
pub use self::park::StdParkHandle;
pub use self::{
    park::{ParkHandle, WaitState, WakeReason},
    spin::{SpinLock, SpinLockGuard},
};
