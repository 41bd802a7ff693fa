// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::num::NonZeroUsize;
use core::ops::Range;
use core::ptr::{self, NonNull};
use std::io;

use crate::access_rules::AccessRules;
use crate::arch;
use crate::config::RegionConfig;
use crate::error::{AllocError, ExecError, WriteError, ensure};
use crate::provider::{MemoryProvider, SystemProvider};

/// Lifecycle state of an [`ExecutableRegion`].
///
/// ```text
/// Uninitialized --allocate--> Writable --finalize--> Executable --release--> Released
/// ```
///
/// Any state may move straight to `Released`, which is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionState {
    /// No mapping exists yet. [`ExecutableRegion::allocate`] never hands out a region in
    /// this state, the variant only names the starting point of the lifecycle.
    Uninitialized,
    /// Mapped read/write, code may be written.
    Writable,
    /// Mapped read/execute, code may be run.
    Executable,
    /// Unmapped.
    Released,
}

/// An offset into an [`ExecutableRegion`] at which execution begins.
///
/// The region checks that the offset lies inside its mapping. Whether it points at
/// the first byte of a valid instruction is up to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryPoint(usize);

impl EntryPoint {
    /// The first byte of the region.
    pub const START: Self = Self(0);

    #[must_use]
    pub const fn new(offset: usize) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

impl From<usize> for EntryPoint {
    fn from(offset: usize) -> Self {
        Self(offset)
    }
}

/// A page-aligned block of memory that run-time generated code is written into and
/// then executed from.
///
/// The region starts out read/write. [`finalize`](Self::finalize) flips it to
/// read/execute exactly once, after which it can never become writable again. At no
/// point is the region both writable and executable. The mapping is released when the
/// region is dropped or [`release`](Self::release)d.
///
/// Regions can be moved across threads but not shared between them.
/// ```compile_fail
/// fn sync<T: Sync>() {}
/// sync::<jit_region::ExecutableRegion>();
/// ```
pub struct ExecutableRegion<P: MemoryProvider = SystemProvider> {
    provider: P,
    /// Start of the mapping. Never handed out for arithmetic outside the region.
    base: NonNull<u8>,
    len: usize,
    state: RegionState,
}

// ===== impl ExecutableRegion =====

// Safety: the region exclusively owns its mapping, nothing else references it
unsafe impl<P: MemoryProvider + Send> Send for ExecutableRegion<P> {}

impl ExecutableRegion {
    /// Allocates a region of at least `size_hint` bytes from the operating system.
    ///
    /// A hint of `0` selects the default size of [`DEFAULT_REGION_PAGES`] pages.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the system cannot provide the mapping.
    ///
    /// [`DEFAULT_REGION_PAGES`]: crate::DEFAULT_REGION_PAGES
    pub fn allocate(size_hint: usize) -> Result<Self, AllocError> {
        Self::allocate_with(SystemProvider, &RegionConfig::default(), size_hint)
    }
}

impl<P: MemoryProvider> ExecutableRegion<P> {
    /// Allocates a region from `provider`, sized according to `config`.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the size overflows or the provider cannot map it.
    pub fn allocate_with(
        provider: P,
        config: &RegionConfig,
        size_hint: usize,
    ) -> Result<Self, AllocError> {
        let len = config.region_len(size_hint, provider.page_size())?;
        let base = provider.map(len)?;

        debug_assert_eq!(base.as_ptr().addr() % provider.page_size(), 0);
        log::debug!("allocated code region {base:p}..{len:#x} (hint {size_hint:#x})");

        Ok(Self {
            provider,
            base,
            len,
            state: RegionState::Writable,
        })
    }

    /// Length of the mapping in bytes, a multiple of the provider's page size.
    #[expect(clippy::len_without_is_empty, reason = "regions are never empty")]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The region's contents, or `None` once it has been released.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self.state {
            RegionState::Writable | RegionState::Executable => {
                // Safety: the mapping is readable in both states and we hold a shared borrow
                Some(unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.len) })
            }
            RegionState::Uninitialized | RegionState::Released => None,
        }
    }

    /// Copies `code` into the region at `offset`.
    ///
    /// The bytes are copied verbatim. Writes to disjoint offsets compose, later writes
    /// overwrite earlier ones where they overlap.
    ///
    /// # Errors
    ///
    /// - [`WriteError::OutOfBounds`] if `offset + code.len()` exceeds the region. The
    ///   region is not modified.
    /// - [`WriteError::WrongState`] if the region has been finalized.
    /// - [`WriteError::UseAfterRelease`] if the region has been released.
    pub fn write(&mut self, offset: usize, code: &[u8]) -> Result<(), WriteError> {
        match self.state {
            RegionState::Writable => {}
            RegionState::Released => return Err(WriteError::UseAfterRelease),
            state => return Err(WriteError::WrongState(state)),
        }

        let out_of_bounds = WriteError::OutOfBounds {
            offset,
            len: code.len(),
            capacity: self.len,
        };
        let end = offset.checked_add(code.len()).ok_or(out_of_bounds)?;
        ensure!(end <= self.len, out_of_bounds);

        log::trace!("writing {:#x} bytes at offset {offset:#x}", code.len());

        // Safety: `offset..end` lies inside the writable mapping, and `code` cannot
        // overlap it since we hold the only (mutable) reference to the region
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), self.base.as_ptr().add(offset), code.len());
        }

        Ok(())
    }

    /// Makes the region executable.
    ///
    /// Flushes the instruction cache for the region and changes its protection from
    /// read/write to read/execute. This happens at most once.
    ///
    /// # Errors
    ///
    /// - [`ExecError::ProtectionDenied`] if the system refuses the change. The region is
    ///   released before returning.
    /// - [`ExecError::AlreadyFinalized`] if the region is already executable. Protection
    ///   is not touched again.
    /// - [`ExecError::UseAfterRelease`] if the region has been released.
    pub fn finalize(&mut self) -> Result<(), ExecError> {
        match self.state {
            RegionState::Writable => {}
            RegionState::Executable => return Err(ExecError::AlreadyFinalized),
            RegionState::Uninitialized | RegionState::Released => {
                return Err(ExecError::UseAfterRelease);
            }
        }

        // Safety: the region owns `base..base + len` and it is currently mapped
        let res = unsafe {
            arch::flush_icache(self.base, self.len);
            self.provider
                .protect(self.base, self.len, AccessRules::read_execute())
        };

        if let Err(err) = res {
            log::debug!("failed to make code region {:p} executable: {err}", self.base);
            if let Err(unmap_err) = self.unmap() {
                // the mapping is leaked, it must not be handed out again
                log::warn!("failed to unmap code region {:p}: {unmap_err}", self.base);
                self.state = RegionState::Released;
            }
            return Err(ExecError::ProtectionDenied {
                os_error: err.raw_os_error(),
            });
        }

        self.state = RegionState::Executable;
        Ok(())
    }

    /// Absolute address `entry` resolves to, for diagnostics.
    ///
    /// Returns `None` if `entry` lies outside the region or the region has been
    /// released.
    pub fn entry_address(&self, entry: EntryPoint) -> Option<NonZeroUsize> {
        match self.state {
            RegionState::Writable | RegionState::Executable if entry.offset() < self.len => {
                // Safety: `entry` lies inside the mapping
                Some(unsafe { self.base.add(entry.offset()) }.addr())
            }
            _ => None,
        }
    }

    pub(crate) fn as_ptr_range(&self) -> Range<*const u8> {
        let start = self.base.as_ptr().cast_const();
        start..start.wrapping_add(self.len)
    }

    /// Transfers control to `entry` and returns once the code at `entry` returns.
    ///
    /// The generated code is called like an ordinary function taking no arguments and
    /// returning nothing. The calling thread is blocked until it returns.
    ///
    /// # Errors
    ///
    /// - [`ExecError::NotExecutable`] if the region has not been finalized.
    /// - [`ExecError::UseAfterRelease`] if the region has been released.
    /// - [`ExecError::EntryOutOfBounds`] if `entry` lies outside the region.
    ///
    /// # Safety
    ///
    /// The bytes at `entry` must encode a complete instruction sequence for the host
    /// architecture that follows the host calling convention (preserves callee-saved
    /// registers and the stack pointer) and eventually returns. Anything else is
    /// undefined behaviour.
    pub unsafe fn run(&self, entry: EntryPoint) -> Result<(), ExecError> {
        match self.state {
            RegionState::Executable => {}
            RegionState::Writable => return Err(ExecError::NotExecutable),
            RegionState::Uninitialized | RegionState::Released => {
                return Err(ExecError::UseAfterRelease);
            }
        }
        ensure!(
            entry.offset() < self.len,
            ExecError::EntryOutOfBounds {
                offset: entry.offset(),
                capacity: self.len,
            }
        );

        // Safety: `entry` lies inside the mapping
        let addr = unsafe { self.base.add(entry.offset()) };
        log::debug!("transferring control to {addr:p}");

        // Safety: the region is mapped executable and `addr` lies inside it. The code
        // behind it is the caller's responsibility.
        unsafe {
            arch::transfer_control(addr.addr());
        }

        log::trace!("returned from {addr:p}");
        Ok(())
    }

    /// Finalizes the region, runs it from `entry` and releases it.
    ///
    /// Taking the region by value means no further writes are possible once it has been
    /// made executable.
    ///
    /// # Errors
    ///
    /// Any error from [`finalize`](Self::finalize) or [`run`](Self::run).
    ///
    /// # Safety
    ///
    /// Same as [`run`](Self::run).
    pub unsafe fn finalize_and_run(mut self, entry: EntryPoint) -> Result<(), ExecError> {
        self.finalize()?;
        // Safety: ensured by caller
        unsafe { self.run(entry) }
    }

    /// Unmaps the region.
    ///
    /// # Errors
    ///
    /// - [`ExecError::UseAfterRelease`] if the region was already released.
    /// - [`ExecError::ReleaseFailed`] if the system refused to unmap it. The region
    ///   keeps its state, so the release can be retried.
    pub fn release(&mut self) -> Result<(), ExecError> {
        ensure!(
            self.state != RegionState::Released,
            ExecError::UseAfterRelease
        );
        self.unmap().map_err(|err| ExecError::ReleaseFailed {
            os_error: err.raw_os_error(),
        })
    }

    fn unmap(&mut self) -> io::Result<()> {
        debug_assert_ne!(self.state, RegionState::Released);

        // Safety: the mapping is live and nothing borrows it (we hold `&mut self`)
        unsafe { self.provider.unmap(self.base, self.len) }?;

        self.state = RegionState::Released;
        Ok(())
    }
}

impl<P: MemoryProvider> Drop for ExecutableRegion<P> {
    fn drop(&mut self) {
        if self.state == RegionState::Released {
            return;
        }
        if let Err(err) = self.unmap() {
            log::warn!("failed to unmap code region {:p} on drop: {err}", self.base);
        }
    }
}

impl<P: MemoryProvider> fmt::Debug for ExecutableRegion<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("state", &self.state)
            .field("<mmap range>", &self.as_ptr_range())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Sizing;
    use crate::provider::FakeProvider;

    const PAGE: usize = 4096;

    fn region(provider: &FakeProvider, size: usize) -> ExecutableRegion<&FakeProvider> {
        ExecutableRegion::allocate_with(provider, &RegionConfig::default(), size).unwrap()
    }

    #[test_log::test]
    fn default_region_is_ten_pages() {
        let provider = FakeProvider::new(PAGE);
        let region = region(&provider, 0);

        assert_eq!(region.len(), 10 * PAGE);
        assert_eq!(region.state(), RegionState::Writable);
        assert!(region.bytes().unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn coarse_config_is_honored() {
        let provider = FakeProvider::new(PAGE);
        let config = RegionConfig {
            default_pages: 3,
            sizing: Sizing::Coarse,
        };
        let region = ExecutableRegion::allocate_with(&provider, &config, 10).unwrap();
        assert_eq!(region.len(), 3 * PAGE);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let provider = FakeProvider::new(PAGE);
        provider.fail_map(AllocError::OutOfMemory);

        let err = ExecutableRegion::allocate_with(&provider, &RegionConfig::default(), 1)
            .unwrap_err();
        assert_eq!(err, AllocError::OutOfMemory);
        assert_eq!(provider.live_mappings(), 0);
    }

    #[test]
    fn writes_compose() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);

        region.write(0, &[1, 2, 3, 4]).unwrap();
        region.write(8, &[5, 6]).unwrap();
        region.write(2, &[9]).unwrap();

        assert_eq!(&region.bytes().unwrap()[..10], &[1, 2, 9, 4, 0, 0, 0, 0, 5, 6]);
    }

    #[test]
    fn write_may_fill_the_region_exactly() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);

        region.write(0, &[0xcc; PAGE]).unwrap();
        region.write(PAGE, &[]).unwrap();
        assert!(region.bytes().unwrap().iter().all(|b| *b == 0xcc));
    }

    #[test]
    fn write_past_end_leaves_region_untouched() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, 0);
        region.write(0, &[0xaa; 16]).unwrap();
        let before = region.bytes().unwrap().to_vec();

        let offset = region.len() - 1;
        assert_eq!(
            region.write(offset, &[1, 2, 3, 4]),
            Err(WriteError::OutOfBounds {
                offset,
                len: 4,
                capacity: region.len(),
            })
        );
        assert_eq!(region.bytes().unwrap(), &before[..]);
        assert_eq!(region.state(), RegionState::Writable);
    }

    #[test]
    fn write_offset_overflow_is_out_of_bounds() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);

        assert!(matches!(
            region.write(usize::MAX, &[1, 2]),
            Err(WriteError::OutOfBounds { .. })
        ));
    }

    #[test_log::test]
    fn finalize_flips_once_and_never_both() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);
        region.write(0, &[0x90]).unwrap();

        region.finalize().unwrap();
        assert_eq!(region.state(), RegionState::Executable);

        assert_eq!(region.finalize(), Err(ExecError::AlreadyFinalized));
        assert_eq!(region.state(), RegionState::Executable);

        let history = provider.history();
        assert_eq!(
            history,
            [AccessRules::read_write(), AccessRules::read_execute()]
        );
        assert!(
            history
                .iter()
                .all(|rules| !(rules.allows_write() && rules.allows_execution()))
        );
    }

    #[test]
    fn finalized_region_is_read_only() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);
        region.write(4, &[7, 7]).unwrap();
        region.finalize().unwrap();

        assert_eq!(
            region.write(0, &[1]),
            Err(WriteError::WrongState(RegionState::Executable))
        );
        assert_eq!(&region.bytes().unwrap()[..6], &[0, 0, 0, 0, 7, 7]);
    }

    #[test]
    fn protection_denied_releases_region() {
        let provider = FakeProvider::new(PAGE);
        provider.deny_protect();
        let mut region = region(&provider, PAGE);

        assert_eq!(
            region.finalize(),
            Err(ExecError::ProtectionDenied { os_error: None })
        );
        assert_eq!(region.state(), RegionState::Released);
        assert_eq!(provider.live_mappings(), 0);
        assert_eq!(provider.history(), [AccessRules::read_write()]);
    }

    #[test]
    fn finalize_and_run_reports_protection_denied() {
        let provider = FakeProvider::new(PAGE);
        provider.deny_protect();
        let region = region(&provider, PAGE);

        // Safety: protection is denied so control is never transferred
        let res = unsafe { region.finalize_and_run(EntryPoint::START) };
        assert_eq!(res, Err(ExecError::ProtectionDenied { os_error: None }));
        assert_eq!(provider.live_mappings(), 0);
    }

    #[test]
    fn run_requires_finalize() {
        let provider = FakeProvider::new(PAGE);
        let region = region(&provider, PAGE);

        // Safety: the region is not executable so control is never transferred
        let res = unsafe { region.run(EntryPoint::START) };
        assert_eq!(res, Err(ExecError::NotExecutable));
    }

    #[test]
    fn entry_must_lie_inside_region() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);
        region.finalize().unwrap();

        // Safety: the entry is out of bounds so control is never transferred
        let res = unsafe { region.run(EntryPoint::new(PAGE)) };
        assert_eq!(
            res,
            Err(ExecError::EntryOutOfBounds {
                offset: PAGE,
                capacity: PAGE,
            })
        );
    }

    #[test]
    fn operations_after_release_fail() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);

        region.release().unwrap();
        assert_eq!(region.state(), RegionState::Released);
        assert_eq!(provider.live_mappings(), 0);

        assert_eq!(region.write(0, &[1]), Err(WriteError::UseAfterRelease));
        assert_eq!(region.finalize(), Err(ExecError::UseAfterRelease));
        assert_eq!(region.release(), Err(ExecError::UseAfterRelease));
        // Safety: the region is released so control is never transferred
        assert_eq!(
            unsafe { region.run(EntryPoint::START) },
            Err(ExecError::UseAfterRelease)
        );
        assert!(region.bytes().is_none());
    }

    #[test]
    fn release_after_finalize() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);
        region.finalize().unwrap();
        region.release().unwrap();

        assert_eq!(region.finalize(), Err(ExecError::UseAfterRelease));
        assert_eq!(provider.live_mappings(), 0);
    }

    #[test_log::test]
    fn failed_release_is_reported_and_retryable() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);
        region.finalize().unwrap();

        provider.fail_unmap(true);
        assert_eq!(
            region.release(),
            Err(ExecError::ReleaseFailed {
                os_error: Some(FakeProvider::UNMAP_ERROR)
            })
        );
        assert_eq!(region.state(), RegionState::Executable);
        assert_eq!(provider.live_mappings(), 1);

        provider.fail_unmap(false);
        region.release().unwrap();
        assert_eq!(region.state(), RegionState::Released);
        assert_eq!(provider.live_mappings(), 0);
    }

    #[test]
    fn protection_denied_with_failing_unmap_still_releases() {
        let provider = FakeProvider::new(PAGE);
        provider.deny_protect();
        provider.fail_unmap(true);
        let mut region = region(&provider, PAGE);

        assert_eq!(
            region.finalize(),
            Err(ExecError::ProtectionDenied { os_error: None })
        );
        assert_eq!(region.state(), RegionState::Released);
        assert_eq!(region.write(0, &[1]), Err(WriteError::UseAfterRelease));

        drop(region);
        assert_eq!(provider.live_mappings(), 1);
        // Safety: the only region using the provider has been dropped
        unsafe { provider.reclaim_leaked() };
    }

    #[test]
    fn entry_address_is_bounds_checked() {
        let provider = FakeProvider::new(PAGE);
        let mut region = region(&provider, PAGE);
        let start = region.entry_address(EntryPoint::START).unwrap();

        assert_eq!(
            region.entry_address(EntryPoint::new(PAGE - 1)),
            start.checked_add(PAGE - 1)
        );
        assert_eq!(region.entry_address(EntryPoint::new(PAGE)), None);
        assert_eq!(region.entry_address(EntryPoint::new(usize::MAX)), None);

        region.release().unwrap();
        assert_eq!(region.entry_address(EntryPoint::START), None);
    }

    #[test]
    fn drop_unmaps() {
        let provider = FakeProvider::new(PAGE);
        {
            let _a = region(&provider, PAGE);
            let _b = region(&provider, 3 * PAGE);
            assert_eq!(provider.live_mappings(), 2);
        }
        assert_eq!(provider.live_mappings(), 0);
    }

    proptest::proptest! {
        #[test]
        fn allocation_is_page_rounded(size in 1usize..(64 * PAGE)) {
            let provider = FakeProvider::new(PAGE);
            let region = region(&provider, size);

            proptest::prop_assert_eq!(region.len(), size.next_multiple_of(PAGE));
            proptest::prop_assert_eq!(region.state(), RegionState::Writable);
        }

        #[test]
        fn read_back_matches_write(
            offset in 0usize..(2 * PAGE),
            code in proptest::collection::vec(proptest::num::u8::ANY, 0..PAGE),
        ) {
            let provider = FakeProvider::new(PAGE);
            let mut region = region(&provider, 2 * PAGE);

            let res = region.write(offset, &code);
            if offset + code.len() <= region.len() {
                proptest::prop_assert!(res.is_ok());
                let written = &region.bytes().unwrap()[offset..offset + code.len()];
                proptest::prop_assert_eq!(written, &code[..]);
            } else {
                let is_out_of_bounds = matches!(res, Err(WriteError::OutOfBounds { .. }));
                proptest::prop_assert!(is_out_of_bounds);
                proptest::prop_assert!(region.bytes().unwrap().iter().all(|b| *b == 0));
            }
        }
    }
}
