// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::{self, NonNull};
use std::io::{self, Error};
use std::sync::OnceLock;

use windows_sys::Win32::Foundation::{ERROR_COMMITMENT_LIMIT, ERROR_NOT_ENOUGH_MEMORY};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, VirtualAlloc, VirtualFree,
    VirtualProtect,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::access_rules::{AccessRules, WriteOrExecute};
use crate::error::AllocError;
use crate::provider::MemoryProvider;

/// Backs regions with committed `VirtualAlloc` allocations.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

// Safety: committed VirtualAlloc memory is page aligned, zero-filled and unaliased, and
// `VirtualProtect` never touches the contents of an allocation.
unsafe impl MemoryProvider for SystemProvider {
    fn page_size(&self) -> usize {
        page_size()
    }

    fn map(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(len > 0 && len % page_size() == 0);

        // Safety: reserving fresh address space does not alias any existing memory
        let base =
            unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        let Some(base) = NonNull::new(base.cast::<u8>()) else {
            return Err(alloc_error(&Error::last_os_error()));
        };

        log::debug!("allocated {len:#x} bytes at {base:p}");

        Ok(base)
    }

    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, rules: AccessRules) -> io::Result<()> {
        log::debug!("VirtualProtect {ptr:p}..{len:#x} to {rules:?}");

        let mut old = 0;
        // Safety: ensured by caller
        let ok = unsafe {
            VirtualProtect(
                ptr.as_ptr().cast_const().cast(),
                len,
                protection(rules),
                &mut old,
            )
        };
        if ok == 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        log::debug!("releasing {len:#x} bytes at {ptr:p}");

        // MEM_RELEASE frees the whole allocation and requires a size of 0.
        // Safety: ensured by caller
        if unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }
}

fn protection(rules: AccessRules) -> PAGE_PROTECTION_FLAGS {
    match (rules.allows_read(), rules.write_or_execute()) {
        // Windows has no write-only protection
        (_, WriteOrExecute::Write) => PAGE_READWRITE,
        (true, WriteOrExecute::Execute) => PAGE_EXECUTE_READ,
        (false, WriteOrExecute::Execute) => PAGE_EXECUTE,
        (true, WriteOrExecute::Neither) => PAGE_READONLY,
        (false, WriteOrExecute::Neither) => PAGE_NOACCESS,
    }
}

fn alloc_error(err: &Error) -> AllocError {
    let is_oom = err
        .raw_os_error()
        .and_then(|code| u32::try_from(code).ok())
        .is_some_and(|code| code == ERROR_NOT_ENOUGH_MEMORY || code == ERROR_COMMITMENT_LIMIT);

    if is_oom {
        AllocError::OutOfMemory
    } else {
        AllocError::SystemRejected {
            os_error: err.raw_os_error(),
        }
    }
}

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // Safety: GetSystemInfo fills in the provided struct and cannot fail
        let info = unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        let pagesize = usize::try_from(info.dwPageSize).expect("page size does not fit usize");
        assert!(pagesize.is_power_of_two());
        pagesize
    })
}
