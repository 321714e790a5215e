//! Opaque version tokens derived from a row's last-modified timestamp.
//!
//! The storage layer assigns `updated_at` on every write; the token handed to
//! callers is just that timestamp (unix microseconds) rendered in base 32.
//! Callers echo a token back on conditional writes and the store compares it
//! verbatim against the stored value.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

const RADIX: u32 = 32;
const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(i64);

impl Version {
  /// Wrap a stored `updated_at` value.
  pub fn from_micros(micros: i64) -> Self { Self(micros) }

  pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
    Self(ts.timestamp_micros())
  }

  /// The stored comparison key.
  pub fn as_micros(&self) -> i64 { self.0 }

  pub fn to_timestamp(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(self.0)
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Bit-cast so pre-epoch timestamps still render as plain digits.
    let mut n = self.0 as u64;
    if n == 0 {
      return f.write_str("0");
    }
    let mut buf = [0u8; 13];
    let mut at = buf.len();
    while n > 0 {
      at -= 1;
      buf[at] = DIGITS[(n % u64::from(RADIX)) as usize];
      n /= u64::from(RADIX);
    }
    // Only ASCII digits were written.
    f.write_str(std::str::from_utf8(&buf[at..]).map_err(|_| fmt::Error)?)
  }
}

impl FromStr for Version {
  type Err = Error;

  /// Accepts only the canonical rendering: lowercase digits, no sign, no
  /// leading zero.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || Error::InvalidVersion(s.to_owned());
    if s.is_empty() || s.len() > 13 || (s.len() > 1 && s.starts_with('0')) {
      return Err(invalid());
    }
    let mut n: u64 = 0;
    for b in s.bytes() {
      let digit = DIGITS.iter().position(|&d| d == b).ok_or_else(invalid)?;
      n = n
        .checked_mul(u64::from(RADIX))
        .and_then(|n| n.checked_add(digit as u64))
        .ok_or_else(invalid)?;
    }
    Ok(Self(n as i64))
  }
}

impl Serialize for Version {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Version {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let token = String::deserialize(deserializer)?;
    token.parse().map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn token_round_trips() {
    let ts = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
    let version = Version::from_timestamp(ts);
    let token = version.to_string();

    assert_eq!(token.parse::<Version>().unwrap(), version);
    assert_eq!(version.to_timestamp(), Some(ts));
  }

  #[test]
  fn distinct_timestamps_give_distinct_tokens() {
    let a = Version::from_micros(1_700_000_000_000_000);
    let b = Version::from_micros(1_700_000_000_000_001);
    assert_ne!(a.to_string(), b.to_string());
  }

  #[test]
  fn zero_and_negative_values_render() {
    assert_eq!(Version::from_micros(0).to_string(), "0");
    let negative = Version::from_micros(-5);
    assert_eq!(negative.to_string().parse::<Version>().unwrap(), negative);
  }

  #[test]
  fn malformed_tokens_are_rejected() {
    for bad in ["", "zz", "ABC", "0123456789abcdef", "12-4", "+1", "01", "00", "w"] {
      assert!(
        matches!(bad.parse::<Version>(), Err(Error::InvalidVersion(_))),
        "{bad:?} should not parse"
      );
    }
  }

  #[test]
  fn only_canonical_tokens_parse() {
    let version = Version::from_micros(1_700_000_000_000_000);
    let token = version.to_string();
    assert!(format!("0{token}").parse::<Version>().is_err());
    assert!(format!("+{token}").parse::<Version>().is_err());
    assert_eq!("0".parse::<Version>().unwrap(), Version::from_micros(0));

    let max = Version::from_micros(-1).to_string();
    assert_eq!(max.len(), 13);
    assert_eq!(max.parse::<Version>().unwrap(), Version::from_micros(-1));
    assert!("vvvvvvvvvvvvv".parse::<Version>().is_err(), "exceeds 64 bits");
  }

  #[test]
  fn serializes_as_token_string() {
    let version = Version::from_micros(1_000_000);
    let json = serde_json::to_string(&version).unwrap();
    assert_eq!(json, format!("\"{version}\""));
    let back: Version = serde_json::from_str(&json).unwrap();
    assert_eq!(back, version);
  }
}
