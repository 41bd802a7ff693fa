// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Access to the host's memory mapping primitive.
//!
//! All calls into `mmap`/`mprotect` (or `VirtualAlloc`/`VirtualProtect`) go through
//! the [`MemoryProvider`] trait so regions can be backed by something other than the
//! real OS, most notably the [`FakeProvider`] used in tests.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::SystemProvider;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::SystemProvider;
    } else {
        compile_error!("Unsupported host operating system");
    }
}

#[cfg(any(test, feature = "test_utils"))]
mod fake;
#[cfg(any(test, feature = "test_utils"))]
pub use fake::FakeProvider;

use core::ptr::NonNull;
use std::io;

use crate::access_rules::AccessRules;
use crate::error::AllocError;

/// A source of page-granular, independently protectable memory mappings.
///
/// # Safety
///
/// Implementations must uphold the following:
///
/// - [`page_size`](Self::page_size) returns a power of two that stays constant for the
///   lifetime of the provider.
/// - A successful [`map`](Self::map) returns a pointer aligned to `page_size` to `len`
///   bytes of zero-filled memory, readable and writable but not executable, that is not
///   aliased by any other live mapping and stays valid until passed to
///   [`unmap`](Self::unmap).
/// - [`protect`](Self::protect) only changes protection. It never moves or modifies
///   the mapping's contents.
pub unsafe trait MemoryProvider {
    /// The granularity of mappings, in bytes.
    fn page_size(&self) -> usize;

    /// Reserves `len` bytes of zero-filled read/write memory.
    ///
    /// `len` is always a non-zero multiple of [`page_size`](Self::page_size).
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the host cannot satisfy the request.
    fn map(&self, len: usize) -> Result<NonNull<u8>, AllocError>;

    /// Changes the protection of `len` bytes starting at `ptr` to `rules`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the protection change is refused.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a mapping previously returned by [`map`](Self::map)
    /// on this provider and not yet unmapped.
    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, rules: AccessRules) -> io::Result<()>;

    /// Releases a mapping.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping could not be released.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must describe a mapping previously returned by [`map`](Self::map)
    /// on this provider and not yet unmapped. The memory must not be accessed afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// A shared reference to a provider can be used as a provider. This lets callers keep
/// inspecting a provider while a region borrowing it is alive.
// Safety: forwards to the underlying provider, which upholds the contract
unsafe impl<P: MemoryProvider + ?Sized> MemoryProvider for &P {
    #[inline]
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    #[inline]
    fn map(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).map(len)
    }

    #[inline]
    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, rules: AccessRules) -> io::Result<()> {
        // Safety: ensured by caller
        unsafe { (**self).protect(ptr, len, rules) }
    }

    #[inline]
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // Safety: ensured by caller
        unsafe { (**self).unmap(ptr, len) }
    }
}
