// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Microsoft x64 calling convention.
//!
//! Callee-saved: RBX, RBP, RDI, RSI, RSP, R12-R15 and XMM6-XMM15. The caller must
//! reserve 32 bytes of shadow space directly above the return address.

use core::arch::asm;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::Threading::GetCurrentProcess;

/// `ret`
pub const RETURN_INSTRUCTION: &[u8] = &[0xc3];

/// Windows asks for an explicit flush after writing code even on x86.
#[inline]
pub unsafe fn flush_icache(start: NonNull<u8>, len: usize) {
    // Safety: ensured by caller
    unsafe {
        let start = start.as_ptr().cast_const();
        FlushInstructionCache(GetCurrentProcess(), start.cast(), len);
    }
}

/// Calls `entry` as an `extern "C" fn()`.
///
/// # Safety
///
/// `entry` must point to executable memory holding a complete instruction sequence
/// that follows the Microsoft x64 calling convention and eventually returns.
#[inline]
pub unsafe fn transfer_control(entry: NonZeroUsize) {
    // Safety: inline assembly
    unsafe {
        asm! {
            // Reserve the shadow space. 32 is a multiple of 16 so the stack stays
            // aligned for the call.
            "sub rsp, 32",
            "call {entry}",
            "add rsp, 32",
            entry = in(reg) entry.get(),
            clobber_abi("C"),
        }
    }
}
