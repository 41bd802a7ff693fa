// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use std::alloc;
use std::io;

use crate::access_rules::AccessRules;
use crate::error::AllocError;
use crate::provider::MemoryProvider;

/// A heap-backed [`MemoryProvider`] that never touches real page protection.
///
/// Every protection request is recorded so tests can check the sequence of
/// transitions a region went through. Memory handed out by this provider is
/// never actually executable, so regions backed by it must not be run.
#[derive(Debug)]
pub struct FakeProvider {
    page_size: usize,
    fail_map: Cell<Option<AllocError>>,
    deny_protect: Cell<bool>,
    fail_unmap: Cell<bool>,
    history: RefCell<Vec<AccessRules>>,
    live: RefCell<Vec<(NonNull<u8>, usize)>>,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl FakeProvider {
    /// Raw OS error reported by `unmap` while [`fail_unmap`](Self::fail_unmap) is set.
    pub const UNMAP_ERROR: i32 = 22;

    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());

        Self {
            page_size,
            fail_map: Cell::new(None),
            deny_protect: Cell::new(false),
            fail_unmap: Cell::new(false),
            history: RefCell::new(Vec::new()),
            live: RefCell::new(Vec::new()),
        }
    }

    /// Makes every following `map` call fail with `err`.
    pub fn fail_map(&self, err: AllocError) {
        self.fail_map.set(Some(err));
    }

    /// Makes every following `protect` call fail with a permission error.
    pub fn deny_protect(&self) {
        self.deny_protect.set(true);
    }

    /// Makes following `unmap` calls fail, leaving the mapping in place, until reset.
    pub fn fail_unmap(&self, fail: bool) {
        self.fail_unmap.set(fail);
    }

    /// Frees every mapping that is still live, e.g. ones a region gave up on after
    /// a failed unmap.
    ///
    /// # Safety
    ///
    /// No region backed by this provider may still be using its mapping.
    pub unsafe fn reclaim_leaked(&self) {
        for (ptr, len) in self.live.borrow_mut().drain(..) {
            // Safety: the mapping was allocated by `map` with the same layout, and the
            // caller ensures it is no longer in use
            unsafe { alloc::dealloc(ptr.as_ptr(), self.layout(len)) };
        }
    }

    /// All protections applied so far, including the initial read/write protection of
    /// every mapping, in order.
    pub fn history(&self) -> Vec<AccessRules> {
        self.history.borrow().clone()
    }

    /// Number of mappings that have not been unmapped yet.
    pub fn live_mappings(&self) -> usize {
        self.live.borrow().len()
    }

    fn layout(&self, len: usize) -> Layout {
        Layout::from_size_align(len, self.page_size).expect("invalid fake mapping layout")
    }
}

// Safety: mappings are fresh zeroed heap allocations aligned to `page_size`, and
// protection changes are only recorded.
unsafe impl MemoryProvider for FakeProvider {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        if let Some(err) = self.fail_map.get() {
            return Err(err);
        }

        // Safety: `len` is non-zero as required by the trait contract
        let ptr = unsafe { alloc::alloc_zeroed(self.layout(len)) };
        let ptr = NonNull::new(ptr).ok_or(AllocError::OutOfMemory)?;

        self.live.borrow_mut().push((ptr, len));
        self.history.borrow_mut().push(AccessRules::read_write());

        Ok(ptr)
    }

    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, rules: AccessRules) -> io::Result<()> {
        assert!(
            self.live.borrow().contains(&(ptr, len)),
            "protect called on unknown mapping"
        );

        if self.deny_protect.get() {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }

        self.history.borrow_mut().push(rules);
        Ok(())
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        if self.fail_unmap.get() {
            return Err(io::Error::from_raw_os_error(Self::UNMAP_ERROR));
        }

        let mut live = self.live.borrow_mut();
        let idx = live
            .iter()
            .position(|m| *m == (ptr, len))
            .expect("unmap called on unknown mapping");
        live.swap_remove(idx);

        // Safety: the mapping was allocated by `map` with the same layout
        unsafe { alloc::dealloc(ptr.as_ptr(), self.layout(len)) };

        Ok(())
    }
}

impl Drop for FakeProvider {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.live.get_mut().is_empty(),
                "FakeProvider dropped with live mappings"
            );
        }
    }
}
