// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable memory regions for code generated at run time.
//!
//! This crate covers the lifecycle of a single [`ExecutableRegion`]:
//!
//! 1. [`ExecutableRegion::allocate`] reserves page-aligned, zero-filled read/write
//!    memory from the operating system.
//! 2. [`ExecutableRegion::write`] copies pre-encoded instruction bytes into it.
//! 3. [`ExecutableRegion::finalize_and_run`] flips the region to read/execute and
//!    calls into it, returning once the generated code returns.
//!
//! A region is never writable and executable at the same time, and once executable
//! it can never be written to again.
//!
//! Encoding instructions is out of scope: the bytes handed to the region are opaque
//! and have to be valid for the host architecture and calling convention.
//!
//! ```no_run
//! use jit_region::{EntryPoint, ExecutableRegion, RETURN_INSTRUCTION};
//!
//! let mut region = ExecutableRegion::allocate(0)?;
//! region.write(0, RETURN_INSTRUCTION)?;
//!
//! // Safety: the region holds a single return instruction
//! unsafe { region.finalize_and_run(EntryPoint::START)? };
//! # Ok::<(), Box<dyn core::error::Error>>(())
//! ```

mod access_rules;
mod arch;
mod config;
mod error;
pub mod provider;
mod region;

pub use access_rules::{AccessRules, InvalidAccessRules, WriteOrExecute};
pub use arch::RETURN_INSTRUCTION;
pub use config::{DEFAULT_REGION_PAGES, RegionConfig, Sizing};
pub use error::{AllocError, ExecError, WriteError};
pub use provider::{MemoryProvider, SystemProvider};
pub use region::{EntryPoint, ExecutableRegion, RegionState};
