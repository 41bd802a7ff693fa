// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AAPCS64.
//!
//! Callee-saved: X19-X28, X29 (FP), SP and the low halves of V8-V15. X18 is left
//! alone as it is the platform register on some hosts.

use core::arch::asm;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

/// `ret` (`0xd65f03c0`)
pub const RETURN_INSTRUCTION: &[u8] = &0xd65f_03c0_u32.to_le_bytes();

cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        unsafe extern "C" {
            fn sys_icache_invalidate(start: *mut core::ffi::c_void, len: usize);
        }

        /// Invalidates the instruction cache for `start..start + len`.
        #[inline]
        pub unsafe fn flush_icache(start: NonNull<u8>, len: usize) {
            // Safety: ensured by caller
            unsafe { sys_icache_invalidate(start.as_ptr().cast(), len) }
        }
    } else if #[cfg(windows)] {
        use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows_sys::Win32::System::Threading::GetCurrentProcess;

        /// Invalidates the instruction cache for `start..start + len`.
        #[inline]
        pub unsafe fn flush_icache(start: NonNull<u8>, len: usize) {
            // Safety: ensured by caller
            unsafe {
                let start = start.as_ptr().cast_const();
                FlushInstructionCache(GetCurrentProcess(), start.cast(), len);
            }
        }
    } else {
        unsafe extern "C" {
            // provided by compiler-rt / libgcc
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }

        /// Cleans the data cache and invalidates the instruction cache for
        /// `start..start + len`.
        #[inline]
        pub unsafe fn flush_icache(start: NonNull<u8>, len: usize) {
            // Safety: ensured by caller
            unsafe {
                let start = start.as_ptr();
                __clear_cache(start.cast(), start.add(len).cast());
            }
        }
    }
}

/// Calls `entry` as an `extern "C" fn()`.
///
/// # Safety
///
/// `entry` must point to executable memory holding a complete instruction sequence
/// that follows AAPCS64 and eventually returns.
#[inline]
pub unsafe fn transfer_control(entry: NonZeroUsize) {
    // Safety: inline assembly
    unsafe {
        asm! {
            // SP is 16-byte aligned on entry to the asm block. BLR writes the return
            // address to LR, which clobber_abi already marks as clobbered.
            "blr {entry}",
            entry = in(reg) entry.get(),
            clobber_abi("C"),
        }
    }
}
