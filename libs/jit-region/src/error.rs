// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::region::RegionState;

/// The `AllocError` error indicates that a region could not be reserved, either
/// due to resource exhaustion or because the operating system rejected the request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The host ran out of memory or address space, or the rounded size overflowed.
    OutOfMemory,
    /// The mapping call failed for another reason (resource limits, invalid flags, zero length).
    SystemRejected {
        /// Raw OS error code, if the failure came from the OS.
        os_error: Option<i32>,
    },
}

/// Errors produced by [`ExecutableRegion::write`].
///
/// [`ExecutableRegion::write`]: crate::ExecutableRegion::write
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// `offset + len` lies past the end of the region.
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    /// The region is no longer writable.
    WrongState(RegionState),
    /// The region has already been released.
    UseAfterRelease,
}

/// Errors produced while finalizing or running a region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The OS refused to make the region executable. The region has been released.
    ProtectionDenied {
        /// Raw OS error code, if the failure came from the OS.
        os_error: Option<i32>,
    },
    /// The region has already been released.
    UseAfterRelease,
    /// The region was already made executable.
    AlreadyFinalized,
    /// The region has not been finalized yet.
    NotExecutable,
    /// The entry point lies outside the region.
    EntryOutOfBounds { offset: usize, capacity: usize },
    /// The OS refused to unmap the region. The region is still mapped.
    ReleaseFailed {
        /// Raw OS error code, if the failure came from the OS.
        os_error: Option<i32>,
    },
}

// ===== impl AllocError =====

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => f.write_str("out of memory while reserving code region"),
            AllocError::SystemRejected { os_error: Some(code) } => {
                write!(f, "system rejected code region reservation (os error {code})")
            }
            AllocError::SystemRejected { os_error: None } => {
                f.write_str("system rejected code region reservation")
            }
        }
    }
}

impl core::error::Error for AllocError {}

// ===== impl WriteError =====

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::OutOfBounds {
                offset,
                len,
                capacity,
            } => write!(
                f,
                "write of {len} bytes at offset {offset:#x} exceeds region capacity {capacity:#x}"
            ),
            WriteError::WrongState(state) => write!(f, "region is not writable (state {state:?})"),
            WriteError::UseAfterRelease => f.write_str("write to released region"),
        }
    }
}

impl core::error::Error for WriteError {}

// ===== impl ExecError =====

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::ProtectionDenied { os_error: Some(code) } => {
                write!(f, "failed to mark region as executable (os error {code})")
            }
            ExecError::ProtectionDenied { os_error: None } => {
                f.write_str("failed to mark region as executable")
            }
            ExecError::UseAfterRelease => f.write_str("region was already released"),
            ExecError::AlreadyFinalized => f.write_str("region was already finalized"),
            ExecError::NotExecutable => f.write_str("region has not been finalized"),
            ExecError::EntryOutOfBounds { offset, capacity } => write!(
                f,
                "entry point {offset:#x} lies outside region of {capacity:#x} bytes"
            ),
            ExecError::ReleaseFailed { os_error: Some(code) } => {
                write!(f, "failed to release region (os error {code})")
            }
            ExecError::ReleaseFailed { os_error: None } => f.write_str("failed to release region"),
        }
    }
}

impl core::error::Error for ExecError {}

macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}

pub(crate) use ensure;
