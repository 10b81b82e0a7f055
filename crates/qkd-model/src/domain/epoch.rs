use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ModelError;

/// Length of one epoch in nanoseconds (2^29 ns).
pub const EPOCH_NANOS: u64 = 1 << 29;

/// Wall-clock duration of one epoch (≈0.536 s).
pub const EPOCH_DURATION: Duration = Duration::from_nanos(EPOCH_NANOS);

/// Time-slot identifier shared by both nodes.
///
/// On the wire and on disk an epoch is the 8-digit lowercase hex rendering of a 32-bit counter.
/// Every file produced by the pipeline is named after the epoch it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u32);

impl Epoch {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// The epoch immediately following this one.
    #[inline]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Signed distance `self - other` in epochs.
    #[inline]
    pub fn diff(self, other: Epoch) -> i64 {
        i64::from(self.0) - i64::from(other.0)
    }

    /// Returns `true` if `self` directly follows `prev`.
    #[inline]
    pub fn follows(self, prev: Epoch) -> bool {
        prev.next() == self
    }
}

impl From<u32> for Epoch {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for Epoch {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Files are sometimes referenced by path; the epoch is the file name.
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
        if name.is_empty() || name.len() > 8 {
            return Err(ModelError::InvalidEpoch(s.to_string()));
        }
        u32::from_str_radix(name, 16)
            .map(Epoch)
            .map_err(|_| ModelError::InvalidEpoch(s.to_string()))
    }
}

impl Serialize for Epoch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Epoch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_zero_padded_hex() {
        assert_eq!(Epoch::new(0xab).to_string(), "000000ab");
        assert_eq!(Epoch::new(0xbc1234ff).to_string(), "bc1234ff");
    }

    #[test]
    fn parses_bare_name_and_path() {
        assert_eq!("bc1234ff".parse::<Epoch>().unwrap(), Epoch::new(0xbc1234ff));
        assert_eq!(
            "/tmp/qkd/rawkey/0000001a\n".parse::<Epoch>().unwrap(),
            Epoch::new(0x1a)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Epoch>().is_err());
        assert!("xyz".parse::<Epoch>().is_err());
        assert!("123456789".parse::<Epoch>().is_err());
    }

    #[test]
    fn ordering_and_diff_follow_integer_value() {
        let a = Epoch::new(10);
        let b = Epoch::new(13);
        assert!(a < b);
        assert_eq!(b.diff(a), 3);
        assert_eq!(a.diff(b), -3);
        assert!(Epoch::new(11).follows(a));
        assert!(!b.follows(a));
    }

    #[test]
    fn epoch_duration_is_about_half_a_second() {
        let ms = EPOCH_DURATION.as_millis();
        assert_eq!(ms, 536);
    }
}
