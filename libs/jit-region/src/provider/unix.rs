// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::{self, NonNull};
use std::io::{self, Error};
use std::sync::OnceLock;

use crate::access_rules::{AccessRules, WriteOrExecute};
use crate::error::AllocError;
use crate::provider::MemoryProvider;

/// Backs regions with anonymous private `mmap` mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

// Safety: anonymous private mappings are page aligned, zero-filled and unaliased, and
// `mprotect` never touches the contents of a mapping.
unsafe impl MemoryProvider for SystemProvider {
    fn page_size(&self) -> usize {
        page_size()
    }

    fn map(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(len > 0 && len % page_size() == 0);

        // Safety: a fresh anonymous mapping does not alias any existing memory
        let mmap = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if mmap == libc::MAP_FAILED {
            return Err(alloc_error(&Error::last_os_error()));
        }

        log::debug!("mapped {len:#x} bytes at {mmap:p}");

        NonNull::new(mmap.cast::<u8>()).ok_or(AllocError::SystemRejected { os_error: None })
    }

    unsafe fn protect(&self, ptr: NonNull<u8>, len: usize, rules: AccessRules) -> io::Result<()> {
        log::debug!("mprotect {ptr:p}..{len:#x} to {rules:?}");

        // Safety: ensured by caller
        if unsafe { libc::mprotect(ptr.as_ptr().cast(), len, prot_flags(rules)) } != 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        log::debug!("unmapping {len:#x} bytes at {ptr:p}");

        // Safety: ensured by caller
        if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }
}

fn prot_flags(rules: AccessRules) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if rules.allows_read() {
        prot |= libc::PROT_READ;
    }
    match rules.write_or_execute() {
        WriteOrExecute::Write => prot |= libc::PROT_WRITE,
        WriteOrExecute::Execute => prot |= libc::PROT_EXEC,
        WriteOrExecute::Neither => {}
    }
    prot
}

fn alloc_error(err: &Error) -> AllocError {
    match err.raw_os_error() {
        Some(libc::ENOMEM) => AllocError::OutOfMemory,
        os_error => AllocError::SystemRejected { os_error },
    }
}

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // Safety: sysconf has no preconditions
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let pagesize = usize::try_from(raw).expect("sysconf(_SC_PAGESIZE) failed");
        assert!(pagesize.is_power_of_two());
        pagesize
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_flags_follow_rules() {
        assert_eq!(
            prot_flags(AccessRules::read_write()),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            prot_flags(AccessRules::read_execute()),
            libc::PROT_READ | libc::PROT_EXEC
        );
        assert_eq!(prot_flags(AccessRules::new()), libc::PROT_NONE);
    }

    #[test]
    fn enomem_is_out_of_memory() {
        assert_eq!(
            alloc_error(&Error::from_raw_os_error(libc::ENOMEM)),
            AllocError::OutOfMemory
        );
        assert_eq!(
            alloc_error(&Error::from_raw_os_error(libc::EINVAL)),
            AllocError::SystemRejected {
                os_error: Some(libc::EINVAL)
            }
        );
    }

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let provider = SystemProvider;
        let len = provider.page_size() * 2;
        let ptr = provider.map(len).unwrap();

        assert_eq!(ptr.as_ptr().addr() % provider.page_size(), 0);

        // Safety: the mapping is `len` bytes of read/write memory
        unsafe {
            let bytes = core::slice::from_raw_parts_mut(ptr.as_ptr(), len);
            assert!(bytes.iter().all(|b| *b == 0));
            bytes[len - 1] = 0xaa;
            assert_eq!(bytes[len - 1], 0xaa);

            provider
                .protect(ptr, len, AccessRules::read_execute())
                .unwrap();
            provider.unmap(ptr, len).unwrap();
        }
    }
}
