//! Generic Access Profile types.

#![allow(clippy::use_self)]

use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::num::{NonZeroU128, NonZeroU16};
use std::str::FromStr;

const SHIFT: u32 = u128::BITS - u32::BITS;
const BASE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const MASK_16: u128 = !((u16::MAX as u128) << SHIFT);
const MASK_32: u128 = !((u32::MAX as u128) << SHIFT);

/// 16-, 32-, or 128-bit UUID ([Vol 3] Part B, Section 2.5.1).
///
/// `Display` is always the canonical uppercase 8-4-4-4-12 form used by the
/// wire schema; `Debug` uses the shortest representation.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid(NonZeroU128);

impl Uuid {
    /// Creates a UUID from a `u128`.
    #[inline]
    #[must_use]
    pub const fn new(v: u128) -> Option<Self> {
        match NonZeroU128::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns a [`Uuid16`] representation or [`None`] if the UUID is not an
    /// assigned 16-bit UUID.
    #[inline]
    #[must_use]
    pub fn as_uuid16(self) -> Option<Uuid16> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u16;
        (self.0.get() & MASK_16 == BASE && v > 0).then(|| Uuid16::new(v)).flatten()
    }

    /// Converts an assigned 32-bit Bluetooth SIG UUID to `u32`. This is
    /// mutually exclusive with 16- and 128-bit representations.
    #[inline]
    #[must_use]
    pub fn as_u32(self) -> Option<u32> {
        #[allow(clippy::cast_possible_truncation)]
        let v = (self.0.get() >> SHIFT) as u32;
        (self.0.get() & MASK_32 == BASE && v > u32::from(u16::MAX)).then_some(v)
    }
}

impl From<Uuid16> for Uuid {
    #[inline]
    fn from(u: Uuid16) -> Self {
        u.as_uuid()
    }
}

impl From<Uuid> for u128 {
    #[inline]
    fn from(u: Uuid) -> Self {
        u.0.get()
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(v) = self.as_uuid16() {
            Debug::fmt(&v, f)
        } else if let Some(v) = self.as_u32() {
            write!(f, "{v:#010X}")
        } else {
            Display::fmt(self, f)
        }
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let v = self.0.get();
        #[allow(clippy::cast_possible_truncation)]
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            (v & ((1 << 48) - 1)) as u64
        )
    }
}

/// Error returned when parsing a malformed UUID string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid UUID")]
pub struct UuidParseError;

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Parses the canonical 8-4-4-4-12 form, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.as_bytes();
        if b.len() != 36 || b[8] != b'-' || b[13] != b'-' || b[18] != b'-' || b[23] != b'-' {
            return Err(UuidParseError);
        }
        let mut v: u128 = 0;
        for (i, &c) in b.iter().enumerate() {
            if matches!(i, 8 | 13 | 18 | 23) {
                continue;
            }
            let d = char::from(c).to_digit(16).ok_or(UuidParseError)?;
            v = v << 4 | u128::from(d);
        }
        Self::new(v).ok_or(UuidParseError)
    }
}

/// 16-bit Bluetooth SIG UUID.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid16(NonZeroU16);

impl Uuid16 {
    /// Creates a 16-bit SIG UUID from a `u16`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        match NonZeroU16::new(v) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Returns the 128-bit UUID representation.
    #[inline]
    #[must_use]
    pub const fn as_uuid(self) -> Uuid {
        // SAFETY: Always non-zero
        unsafe { Uuid(NonZeroU128::new_unchecked((self.0.get() as u128) << SHIFT | BASE)) }
    }

    /// Returns the raw 16-bit UUID value.
    #[inline(always)]
    #[must_use]
    pub(crate) const fn raw(self) -> u16 {
        self.0.get()
    }
}

impl Debug for Uuid16 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.0.get())
    }
}

impl Display for Uuid16 {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[allow(clippy::derive_hash_xor_eq)]
impl Hash for Uuid16 {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_uuid().hash(state);
    }
}

impl From<Uuid16> for u16 {
    #[inline]
    fn from(u: Uuid16) -> Self {
        u.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form() {
        let u = Uuid16::new(0x180D).unwrap().as_uuid();
        assert_eq!(u.to_string(), "0000180D-0000-1000-8000-00805F9B34FB");
        assert_eq!(format!("{u:?}"), "0x180D");
        assert_eq!("0000180d-0000-1000-8000-00805f9b34fb".parse::<Uuid>(), Ok(u));
    }

    #[test]
    fn vendor_uuid() {
        let s = "F0DEBC9A-7856-3412-F0DE-BC9A78563412";
        let u: Uuid = s.parse().unwrap();
        assert_eq!(u.as_uuid16(), None);
        assert_eq!(u.as_u32(), None);
        assert_eq!(u.to_string(), s);
        assert_eq!(format!("{u:?}"), s);
    }

    #[test]
    fn parse_errors() {
        assert!("".parse::<Uuid>().is_err());
        assert!("180D".parse::<Uuid>().is_err());
        assert!("0000180D-0000-1000-8000-00805F9B34F".parse::<Uuid>().is_err());
        assert!("0000180D 0000 1000 8000 00805F9B34FB".parse::<Uuid>().is_err());
        assert!("00000000-0000-0000-0000-000000000000".parse::<Uuid>().is_err());
    }

    #[test]
    fn same_uuid_distinct_forms() {
        let a = Uuid16::new(0x2A37).unwrap();
        assert_eq!(Uuid::from(a).as_uuid16(), Some(a));
        assert_eq!(u16::from(a), 0x2A37);
    }
}
