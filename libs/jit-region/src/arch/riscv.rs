// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! RISC-V LP64 calling convention.
//!
//! Callee-saved: s0-s11, sp, fs0-fs11. gp and tp are never touched by ordinary
//! functions.

use core::arch::asm;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

/// `ret` (`jalr x0, 0(ra)`, `0x00008067`)
pub const RETURN_INSTRUCTION: &[u8] = &0x0000_8067_u32.to_le_bytes();

unsafe extern "C" {
    // provided by compiler-rt / libgcc, issues the riscv_flush_icache syscall on Linux
    fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
}

/// Makes `start..start + len` visible to instruction fetch on all harts.
#[inline]
pub unsafe fn flush_icache(start: NonNull<u8>, len: usize) {
    // Safety: ensured by caller
    unsafe {
        let start = start.as_ptr();
        __clear_cache(start.cast(), start.add(len).cast());
    }
}

/// Calls `entry` as an `extern "C" fn()`.
///
/// # Safety
///
/// `entry` must point to executable memory holding a complete instruction sequence
/// that follows the RISC-V calling convention and eventually returns.
#[inline]
pub unsafe fn transfer_control(entry: NonZeroUsize) {
    // Safety: inline assembly
    unsafe {
        asm! {
            // `jalr rs` is `jalr ra, 0(rs)`, ra is part of the "C" clobber set.
            "jalr {entry}",
            entry = in(reg) entry.get(),
            clobber_abi("C"),
        }
    }
}
