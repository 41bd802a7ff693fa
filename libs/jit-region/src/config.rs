// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, ensure};

/// Number of pages reserved when the caller does not ask for a specific size.
pub const DEFAULT_REGION_PAGES: usize = 10;

fn default_region_pages() -> usize {
    DEFAULT_REGION_PAGES
}

/// How region sizes are derived from size hints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sizing {
    /// Round each request up to the next page boundary.
    #[default]
    Exact,
    /// Never reserve less than `default-pages` pages, even for small requests.
    Coarse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegionConfig {
    /// Region size in pages used for a zero size hint (and as the floor under [`Sizing::Coarse`])
    #[serde(default = "default_region_pages")]
    pub default_pages: usize,
    #[serde(default)]
    pub sizing: Sizing,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            default_pages: DEFAULT_REGION_PAGES,
            sizing: Sizing::default(),
        }
    }
}

impl RegionConfig {
    /// Returns the length in bytes of the mapping to reserve for `size_hint`.
    ///
    /// The result is always a non-zero multiple of `page_size`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfMemory`] if the rounded size overflows and
    /// [`AllocError::SystemRejected`] if the configuration resolves to an empty region.
    pub fn region_len(&self, size_hint: usize, page_size: usize) -> Result<usize, AllocError> {
        debug_assert!(page_size.is_power_of_two());

        let default_len = self
            .default_pages
            .checked_mul(page_size)
            .ok_or(AllocError::OutOfMemory)?;

        let requested = match self.sizing {
            _ if size_hint == 0 => default_len,
            Sizing::Exact => size_hint,
            Sizing::Coarse => size_hint.max(default_len),
        };

        let len = requested
            .checked_next_multiple_of(page_size)
            .ok_or(AllocError::OutOfMemory)?;
        ensure!(len > 0, AllocError::SystemRejected { os_error: None });

        Ok(len)
    }
}
