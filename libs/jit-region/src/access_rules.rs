// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

mycelium_bitfield::bitfield! {
    /// Raw packing of [`AccessRules`]. Private so that every value is built through
    /// `with`, which never packs `0b11` into `WRITE_OR_EXECUTE`.
    #[derive(PartialEq, Eq)]
    struct Bits<u8> {
        /// If set, reading from the region is allowed.
        const READ: bool;
        /// Whether writing to, or executing from, the region is allowed (or neither).
        const WRITE_OR_EXECUTE: WriteOrExecute;
    }
}

/// Protection requested from a [`MemoryProvider`] for a mapped region.
///
/// # W^X
///
/// A region may be *writable* OR *executable* but never both at once. The
/// [`WriteOrExecute`] field encodes this as a single three-state value, and
/// [`from_bits`](Self::from_bits) rejects the one bit pattern that would ask for
/// both, so every `AccessRules` value is a valid protection request.
///
/// [`MemoryProvider`]: crate::MemoryProvider
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AccessRules(Bits);

/// Whether writing to, or executing from, a region is allowed (or neither).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum WriteOrExecute {
    /// Neither writing nor execution is allowed.
    Neither = 0b00,
    /// Writing is allowed.
    Write = 0b01,
    /// Executing code is allowed.
    Execute = 0b10,
}

/// A raw bit pattern that does not describe valid [`AccessRules`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidAccessRules {
    bits: u8,
}

// ===== impl AccessRules =====

impl AccessRules {
    /// No access at all.
    #[must_use]
    pub fn new() -> Self {
        Self(Bits::new())
    }

    /// `READ | WRITE`, the protection of a freshly allocated region.
    #[must_use]
    pub fn read_write() -> Self {
        Self(
            Bits::new()
                .with(Bits::READ, true)
                .with(Bits::WRITE_OR_EXECUTE, WriteOrExecute::Write),
        )
    }

    /// `READ | EXECUTE`, the protection of a finalized region.
    #[must_use]
    pub fn read_execute() -> Self {
        Self(
            Bits::new()
                .with(Bits::READ, true)
                .with(Bits::WRITE_OR_EXECUTE, WriteOrExecute::Execute),
        )
    }

    /// Decodes rules from their raw representation.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidAccessRules`] if `bits` asks for write and execute access at
    /// once, or sets bits outside of the two fields.
    pub fn from_bits(bits: u8) -> Result<Self, InvalidAccessRules> {
        let raw = Bits::from_bits(bits);
        let used = Bits::new()
            .with(Bits::READ, raw.get(Bits::READ))
            .with(
                Bits::WRITE_OR_EXECUTE,
                raw.try_get(Bits::WRITE_OR_EXECUTE)
                    .map_err(|_| InvalidAccessRules { bits })?,
            );

        if used != raw {
            return Err(InvalidAccessRules { bits });
        }

        Ok(Self(raw))
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0.bits()
    }

    #[must_use]
    pub fn write_or_execute(self) -> WriteOrExecute {
        self.0.get(Bits::WRITE_OR_EXECUTE)
    }

    pub fn allows_read(self) -> bool {
        self.0.get(Bits::READ)
    }

    pub fn allows_write(self) -> bool {
        matches!(self.write_or_execute(), WriteOrExecute::Write)
    }

    pub fn allows_execution(self) -> bool {
        matches!(self.write_or_execute(), WriteOrExecute::Execute)
    }
}

impl Default for AccessRules {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AccessRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessRules")
            .field("READ", &self.allows_read())
            .field("WRITE_OR_EXECUTE", &self.write_or_execute())
            .finish()
    }
}

// ===== impl WriteOrExecute =====

impl mycelium_bitfield::FromBits<u8> for WriteOrExecute {
    type Error = InvalidAccessRules;

    /// The number of bits required to represent a value of this type.
    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Neither as u8 => Ok(Self::Neither),
            b if b == Self::Write as u8 => Ok(Self::Write),
            b if b == Self::Execute as u8 => Ok(Self::Execute),
            _ => Err(InvalidAccessRules { bits }),
        }
    }

    #[inline]
    fn into_bits(self) -> u8 {
        self as u8
    }
}

// ===== impl InvalidAccessRules =====

impl fmt::Display for InvalidAccessRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid region access rules {:#05b}", self.bits)
    }
}

impl core::error::Error for InvalidAccessRules {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_is_not_executable() {
        let rules = AccessRules::read_write();
        assert!(rules.allows_read());
        assert!(rules.allows_write());
        assert!(!rules.allows_execution());
    }

    #[test]
    fn read_execute_is_not_writable() {
        let rules = AccessRules::read_execute();
        assert!(rules.allows_read());
        assert!(!rules.allows_write());
        assert!(rules.allows_execution());
    }

    #[test]
    fn switching_to_execute_drops_write() {
        let rules = AccessRules::read_write();
        let rules = AccessRules::from_bits(rules.bits() ^ 0b110).unwrap();
        assert_eq!(rules, AccessRules::read_execute());
    }

    #[test]
    fn empty_rules_allow_nothing() {
        let rules = AccessRules::new();
        assert!(!rules.allows_read());
        assert!(!rules.allows_write());
        assert!(!rules.allows_execution());
    }

    #[test]
    fn packing_is_valid() {
        Bits::assert_valid();
    }

    #[test]
    fn raw_bits_never_yield_write_and_execute() {
        for bits in 0..=u8::MAX {
            match AccessRules::from_bits(bits) {
                Ok(rules) => {
                    assert_eq!(rules.bits(), bits);
                    assert!(!(rules.allows_write() && rules.allows_execution()));
                    // formatting reads every field
                    let _ = format!("{rules:?}");
                }
                Err(err) => {
                    assert!(bits & 0b110 == 0b110 || bits > 0b111, "{err}");
                }
            }
        }
    }

    #[test]
    fn write_and_execute_bits_are_rejected() {
        assert_eq!(
            AccessRules::from_bits(0b110),
            Err(InvalidAccessRules { bits: 0b110 })
        );
        assert!(AccessRules::from_bits(0b111).is_err());
        assert!(AccessRules::from_bits(0b1000).is_err());
    }
}
