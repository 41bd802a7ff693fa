// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! System V AMD64 calling convention.
//!
//! Callee-saved: RBX, RBP, RSP, R12-R15. Everything else, including all vector
//! registers and the flags, may be clobbered by the generated code.

use core::arch::asm;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

/// `ret`
pub const RETURN_INSTRUCTION: &[u8] = &[0xc3];

/// x86 keeps instruction fetch coherent with stores, nothing to do.
#[inline]
pub unsafe fn flush_icache(_start: NonNull<u8>, _len: usize) {}

/// Calls `entry` as an `extern "C" fn()`.
///
/// # Safety
///
/// `entry` must point to executable memory holding a complete instruction sequence
/// that follows the System V calling convention and eventually returns.
#[inline]
pub unsafe fn transfer_control(entry: NonZeroUsize) {
    // Safety: inline assembly
    unsafe {
        asm! {
            // The asm block is entered with RSP aligned for a call (16 bytes), and
            // since `nostack` is not given the compiler keeps nothing in the red zone.
            // CALL pushes the return address so the callee observes the usual
            // "RSP + 8 is 16-byte aligned" function entry state.
            "call {entry}",
            entry = in(reg) entry.get(),
            // Anything the convention allows a callee to trash is marked clobbered.
            // The callee-saved registers are the callee's responsibility.
            clobber_abi("C"),
        }
    }
}
