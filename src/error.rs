// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error type returned by the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The range-node pool could not satisfy an allocation request.
    NoMemory,
    /// No free extent (or no single extent, for a superpage request) could
    /// satisfy a `new_blocks` call.
    NoSpace,
    /// A non-positive count, or a free of a range that is not disjoint from
    /// the existing free set.
    InvalidArgs,
    /// A `free_blocks` range fell outside `[block_start, block_end]`.
    IoError,
    /// A range-lock wait was aborted by a pending signal.
    Interrupted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Error::NoMemory => "out of memory",
            Error::NoSpace => "no space left",
            Error::InvalidArgs => "invalid argument",
            Error::IoError => "range outside managed region",
            Error::Interrupted => "interrupted by signal",
        };
        f.write_str(msg)
    }
}
