//! PostgreSQL log sequence numbers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A position in the PostgreSQL write-ahead log.
///
/// PostgreSQL prints LSNs as two hexadecimal halves, `"segment/offset"`
/// (e.g. `"0/1949850"`). Internally the position is a single `u64` so that
/// LSNs order numerically and can be used directly as a merge version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for Lsn {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::SyncError::data(format!("Invalid LSN format: {s}"));
        let (segment, offset) = s.trim().split_once('/').ok_or_else(invalid)?;
        let segment = u64::from_str_radix(segment, 16).map_err(|_| invalid())?;
        let offset = u64::from_str_radix(offset, 16).map_err(|_| invalid())?;
        if segment > u32::MAX as u64 || offset > u32::MAX as u64 {
            return Err(invalid());
        }
        Ok(Lsn((segment << 32) | offset))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
