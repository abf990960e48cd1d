//! LE-specific types.

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// 48-bit untyped device address stored in little-endian byte order
/// ([Vol 6] Part B, Section 1.3). Test drivers identify peers by address
/// string, so this also serves as the opaque connection handle of the RPC
/// surface.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct RawAddr([u8; 6]);

impl From<[u8; 6]> for RawAddr {
    #[inline]
    fn from(v: [u8; 6]) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for RawAddr {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for RawAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // [Vol 3] Part C, Section 3.2.1.3
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl Display for RawAddr {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Error returned when parsing a malformed device address string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid device address")]
pub struct AddrParseError;

impl FromStr for RawAddr {
    type Err = AddrParseError;

    /// Parses the colon-separated display form (`11:22:33:44:55:66`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut v = [0; 6];
        let mut parts = s.split(':');
        for b in v.iter_mut().rev() {
            let p = parts.next().ok_or(AddrParseError)?;
            if p.len() != 2 {
                return Err(AddrParseError);
            }
            *b = u8::from_str_radix(p, 16).map_err(|_| AddrParseError)?;
        }
        match parts.next() {
            Some(_) => Err(AddrParseError),
            None => Ok(Self(v)),
        }
    }
}

impl serde::Serialize for RawAddr {
    #[inline]
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for RawAddr {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: String = serde::Deserialize::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
