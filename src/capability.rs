//! Capability set exchanged during the channel handshake.
//!
//! The set is a fixed 5-bit mask:
//!
//! ```text
//! bit 0  readable
//! bit 1  writable
//! bit 2  deletable
//! bit 3  truncatable
//! bit 4  statable
//! ```
//!
//! Bits 5-7 are ignored on decode.

use std::fmt;

/// Flag constants for the capability byte.
pub mod bits {
    /// No capabilities.
    pub const NONE: u8 = 0;
    /// Resource can be read.
    pub const READABLE: u8 = 0b0000_0001;
    /// Resource can be written.
    pub const WRITABLE: u8 = 0b0000_0010;
    /// Byte ranges can be deleted.
    pub const DELETABLE: u8 = 0b0000_0100;
    /// Resource can be truncated.
    pub const TRUNCATABLE: u8 = 0b0000_1000;
    /// Resource can be stat'ed.
    pub const STATABLE: u8 = 0b0001_0000;
    /// All defined bits.
    pub const ALL: u8 = READABLE | WRITABLE | DELETABLE | TRUNCATABLE | STATABLE;
}

/// A single named permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `read` is allowed.
    Readable,
    /// `write` is allowed.
    Writable,
    /// `del` is allowed.
    Deletable,
    /// `truncate` is allowed.
    Truncatable,
    /// `stat` is allowed.
    Statable,
}

impl Capability {
    /// Every capability, in bit order.
    pub const ALL: [Capability; 5] = [
        Capability::Readable,
        Capability::Writable,
        Capability::Deletable,
        Capability::Truncatable,
        Capability::Statable,
    ];

    /// The bit this capability occupies.
    #[inline]
    pub const fn bit(self) -> u8 {
        match self {
            Capability::Readable => bits::READABLE,
            Capability::Writable => bits::WRITABLE,
            Capability::Deletable => bits::DELETABLE,
            Capability::Truncatable => bits::TRUNCATABLE,
            Capability::Statable => bits::STATABLE,
        }
    }

    /// Lowercase adjective, e.g. `"readable"`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Capability::Readable => "readable",
            Capability::Writable => "writable",
            Capability::Deletable => "deletable",
            Capability::Truncatable => "truncatable",
            Capability::Statable => "statable",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable set of capabilities.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// The empty set (encodes to `0`).
    pub const EMPTY: CapabilitySet = CapabilitySet(bits::NONE);

    /// Every capability.
    pub const ALL: CapabilitySet = CapabilitySet(bits::ALL);

    /// Build a set from the five flags, in bit order.
    pub const fn new(
        readable: bool,
        writable: bool,
        deletable: bool,
        truncatable: bool,
        statable: bool,
    ) -> Self {
        let mut mask = 0;
        if readable {
            mask |= bits::READABLE;
        }
        if writable {
            mask |= bits::WRITABLE;
        }
        if deletable {
            mask |= bits::DELETABLE;
        }
        if truncatable {
            mask |= bits::TRUNCATABLE;
        }
        if statable {
            mask |= bits::STATABLE;
        }
        CapabilitySet(mask)
    }

    /// Decode from the handshake byte. Undefined bits are dropped.
    #[inline]
    pub const fn from_bits(byte: u8) -> Self {
        CapabilitySet(byte & bits::ALL)
    }

    /// Encode to the handshake byte.
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Return a copy with `cap` added.
    #[must_use]
    pub const fn with(self, cap: Capability) -> Self {
        CapabilitySet(self.0 | cap.bit())
    }

    /// Return a copy with `cap` removed.
    #[must_use]
    pub const fn without(self, cap: Capability) -> Self {
        CapabilitySet(self.0 & !cap.bit())
    }

    /// Check membership.
    #[inline]
    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    /// Check if no capability is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn readable(self) -> bool {
        self.contains(Capability::Readable)
    }

    #[inline]
    pub const fn writable(self) -> bool {
        self.contains(Capability::Writable)
    }

    #[inline]
    pub const fn deletable(self) -> bool {
        self.contains(Capability::Deletable)
    }

    #[inline]
    pub const fn truncatable(self) -> bool {
        self.contains(Capability::Truncatable)
    }

    #[inline]
    pub const fn statable(self) -> bool {
        self.contains(Capability::Statable)
    }

    /// Iterate over the members in bit order.
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CapabilitySet::EMPTY, |set, cap| set.with(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subset_roundtrips() {
        for mask in 0u8..=bits::ALL {
            let set = CapabilitySet::from_bits(mask);
            assert_eq!(CapabilitySet::from_bits(set.bits()), set);
            assert_eq!(set.bits(), mask);

            let rebuilt: CapabilitySet = set.iter().collect();
            assert_eq!(rebuilt, set);
        }
    }

    #[test]
    fn test_empty_encodes_to_zero() {
        assert_eq!(CapabilitySet::EMPTY.bits(), 0);
        assert!(CapabilitySet::from_bits(0).is_empty());
    }

    #[test]
    fn test_bit_positions() {
        let set = CapabilitySet::new(true, false, true, false, true);
        assert_eq!(set.bits(), 0b0001_0101);
        assert!(set.readable());
        assert!(!set.writable());
        assert!(set.deletable());
        assert!(!set.truncatable());
        assert!(set.statable());
    }

    #[test]
    fn test_undefined_bits_ignored() {
        let set = CapabilitySet::from_bits(0b1110_0001);
        assert_eq!(set, CapabilitySet::EMPTY.with(Capability::Readable));
    }

    #[test]
    fn test_with_without() {
        let set = CapabilitySet::ALL.without(Capability::Writable);
        assert!(!set.writable());
        assert!(set.with(Capability::Writable) == CapabilitySet::ALL);
    }
}
