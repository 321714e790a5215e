//! A principal's interest in activity within a set of cells.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{cells::CellUnion, version::Version};

/// Identifies the subscribing principal. Opaque to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(pub String);

impl Owner {
  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Owner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Owner {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

/// A registered callback for activity in `cells`.
///
/// `version` is `None` on values built by callers and always `Some` on values
/// returned by a repository; it is never read on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
  pub id:                 Uuid,
  pub owner:              Owner,
  pub url:                String,
  /// Bumped once per relevant spatial update; never decremented.
  pub notification_index: u32,
  pub cells:              CellUnion,
  pub start_time:         Option<DateTime<Utc>>,
  pub end_time:           Option<DateTime<Utc>>,
  /// Node that owns the row for cleanup purposes. Empty means unattributed.
  pub writer:             String,
  pub version:            Option<Version>,
}

impl Subscription {
  /// A subscription with no validity window, writer or version.
  pub fn new(
    id: Uuid,
    owner: impl Into<Owner>,
    url: impl Into<String>,
    cells: CellUnion,
  ) -> Self {
    Self {
      id,
      owner: owner.into(),
      url: url.into(),
      notification_index: 0,
      cells,
      start_time: None,
      end_time: None,
      writer: String::new(),
      version: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cells::CellId;

  fn sample() -> Subscription {
    let cells = [CellId::from_face_pos_level(0, 1 << 35, 13)]
      .into_iter()
      .collect();
    Subscription::new(Uuid::new_v4(), "uss1", "https://example.com/cb", cells)
  }

  #[test]
  fn serde_round_trip_keeps_version_token() {
    let mut sub = sample();
    sub.version = Some(Version::from_micros(1_234_567));
    let json = serde_json::to_value(&sub).unwrap();
    assert_eq!(json["owner"], "uss1");
    assert_eq!(json["version"], Version::from_micros(1_234_567).to_string());

    let back: Subscription = serde_json::from_value(json).unwrap();
    assert_eq!(back, sub);
  }
}
