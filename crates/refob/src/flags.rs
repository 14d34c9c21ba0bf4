//! Object and type flags, and pool selection.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::error::{ObjectError, ObjectResult};

/// Allocation arena an object body is carved from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PoolPolicy {
    /// The process-wide global allocator.
    #[default]
    Primary = 0,
    /// The page-backed arena built on OS mappings.
    Secondary = 1,
}

impl fmt::Display for PoolPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// Bit set of object creation flags and type behavior flags.
///
/// Creation flags (`USE_PRIMARY_POOL`, `USE_SECONDARY_POOL`,
/// `RAISE_ON_ALLOCATION_FAILURE`) are accepted by `Registry::create`.
/// Type flags (`REQUIRES_LOW_CONTEXT_TEARDOWN`) are accepted when a type is
/// registered. Any other bit is rejected with `InvalidArgument`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Force the body into the primary pool.
    pub const USE_PRIMARY_POOL: Self = Self(1 << 0);
    /// Force the body into the secondary pool.
    pub const USE_SECONDARY_POOL: Self = Self(1 << 1);
    /// Turn an out-of-memory result into a panic.
    pub const RAISE_ON_ALLOCATION_FAILURE: Self = Self(1 << 2);
    /// Teardown of this type never runs in the releasing caller's context.
    pub const REQUIRES_LOW_CONTEXT_TEARDOWN: Self = Self(1 << 8);

    const CREATE_MASK: u32 = Self::USE_PRIMARY_POOL.0
        | Self::USE_SECONDARY_POOL.0
        | Self::RAISE_ON_ALLOCATION_FAILURE.0;
    const TYPE_MASK: u32 = Self::REQUIRES_LOW_CONTEXT_TEARDOWN.0;

    const NAMES: [(Self, &'static str); 4] = [
        (Self::USE_PRIMARY_POOL, "USE_PRIMARY_POOL"),
        (Self::USE_SECONDARY_POOL, "USE_SECONDARY_POOL"),
        (Self::RAISE_ON_ALLOCATION_FAILURE, "RAISE_ON_ALLOCATION_FAILURE"),
        (Self::REQUIRES_LOW_CONTEXT_TEARDOWN, "REQUIRES_LOW_CONTEXT_TEARDOWN"),
    ];

    /// Builds a flag set from raw bits, keeping unknown bits.
    #[must_use]
    pub const fn from_bits_retain(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if no bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Validates creation flags and resolves the explicit pool override.
    pub(crate) fn validate_create(self) -> ObjectResult<Option<PoolPolicy>> {
        if self.0 & !Self::CREATE_MASK != 0 {
            return Err(ObjectError::InvalidArgument("unrecognized object flags"));
        }
        match (
            self.contains(Self::USE_PRIMARY_POOL),
            self.contains(Self::USE_SECONDARY_POOL),
        ) {
            (true, true) => Err(ObjectError::InvalidArgument(
                "conflicting pool selection flags",
            )),
            (true, false) => Ok(Some(PoolPolicy::Primary)),
            (false, true) => Ok(Some(PoolPolicy::Secondary)),
            (false, false) => Ok(None),
        }
    }

    /// Validates flags passed at type registration.
    pub(crate) const fn validate_type(self) -> ObjectResult<()> {
        if self.0 & !Self::TYPE_MASK != 0 {
            return Err(ObjectError::InvalidArgument("unrecognized type flags"));
        }
        Ok(())
    }
}

impl BitOr for ObjectFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ObjectFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ObjectFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for ObjectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("ObjectFlags(NONE)");
        }
        let mut rest = self.0;
        let mut list = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
                rest &= !flag.0;
            }
        }
        if rest != 0 {
            list.entry(&format_args!("{rest:#x}"));
        }
        list.finish()
    }
}
