//! Encoding and decoding helpers between domain types and SQLite columns.
//!
//! Timestamps are stored as INTEGER unix microseconds, so `updated_at`
//! doubles as the version comparison key. UUIDs are hyphenated lowercase
//! strings. Cell lists are compact JSON arrays of signed 64-bit ids.

use cellreg_core::{
  cells::CellCodec,
  subscription::{Owner, Subscription},
  version::Version,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{Error, Record, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> {
  Uuid::parse_str(s).map_err(|e| Error::Decode(format!("id {s:?}: {e}")))
}

// ─── DateTime<Utc> ────────────────────────────────────────────────────────────

pub fn encode_ts(ts: DateTime<Utc>) -> i64 { ts.timestamp_micros() }

pub fn decode_ts(micros: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_micros(micros)
    .ok_or_else(|| Error::Decode(format!("timestamp {micros} out of range")))
}

// ─── Cells ────────────────────────────────────────────────────────────────────

pub fn encode_cells(ids: &[i64]) -> String {
  // A slice of integers always serialises.
  serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_owned())
}

pub fn decode_cells(s: &str) -> Result<Vec<i64>> {
  serde_json::from_str(s).map_err(|e| Error::Decode(format!("cells {s:?}: {e}")))
}

pub fn encode_ids(ids: &[Uuid]) -> String {
  let ids: Vec<String> = ids.iter().copied().map(encode_uuid).collect();
  serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_owned())
}

// ─── Row types ────────────────────────────────────────────────────────────────

/// A subscription row exactly as selected, in column order
/// `id, owner, url, notification_index, cells, starts_at, ends_at, writer,
/// updated_at`.
#[derive(Debug)]
pub struct RawSubscription {
  pub id:                 String,
  pub owner:              String,
  pub url:                String,
  pub notification_index: i64,
  pub cells:              String,
  pub starts_at:          Option<i64>,
  pub ends_at:            Option<i64>,
  pub writer:             Option<String>,
  pub updated_at:         i64,
}

impl RawSubscription {
  pub fn from_record(record: &Record) -> Result<Self> {
    if record.len() != 9 {
      return Err(Error::Decode(format!(
        "expected 9 subscription columns, got {}",
        record.len()
      )));
    }
    Ok(Self {
      id:                 record.get(0)?,
      owner:              record.get(1)?,
      url:                record.get(2)?,
      notification_index: record.get(3)?,
      cells:              record.get(4)?,
      starts_at:          record.get(5)?,
      ends_at:            record.get(6)?,
      writer:             record.get(7)?,
      updated_at:         record.get(8)?,
    })
  }

  pub fn into_subscription(self) -> Result<Subscription> {
    let notification_index = u32::try_from(self.notification_index).map_err(|_| {
      Error::Decode(format!(
        "notification_index {} out of range",
        self.notification_index
      ))
    })?;
    Ok(Subscription {
      id: decode_uuid(&self.id)?,
      owner: Owner(self.owner),
      url: self.url,
      notification_index,
      cells: CellCodec::decode(&decode_cells(&self.cells)?),
      start_time: self.starts_at.map(decode_ts).transpose()?,
      end_time: self.ends_at.map(decode_ts).transpose()?,
      writer: self.writer.unwrap_or_default(),
      version: Some(Version::from_micros(self.updated_at)),
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use rusqlite::types::Value;

  use super::*;

  #[test]
  fn timestamps_keep_microseconds() {
    let ts = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
    assert_eq!(decode_ts(encode_ts(ts)).unwrap(), ts);
    assert!(decode_ts(i64::MAX).is_err());
  }

  #[test]
  fn cells_round_trip_through_json() {
    let ids = vec![-3, 7, i64::MAX];
    assert_eq!(decode_cells(&encode_cells(&ids)).unwrap(), ids);
    assert!(decode_cells("not json").is_err());
  }

  #[test]
  fn missing_writer_decodes_as_empty() {
    let id = Uuid::new_v4();
    let raw = RawSubscription {
      id:                 encode_uuid(id),
      owner:              "uss1".into(),
      url:                "https://example.com".into(),
      notification_index: 4,
      cells:              "[]".into(),
      starts_at:          None,
      ends_at:            Some(1_000_000),
      writer:             None,
      updated_at:         42,
    };
    let sub = raw.into_subscription().unwrap();
    assert_eq!(sub.id, id);
    assert_eq!(sub.writer, "");
    assert_eq!(sub.notification_index, 4);
    assert_eq!(sub.version, Some(Version::from_micros(42)));
    assert_eq!(sub.end_time, Some(Utc.timestamp_opt(1, 0).unwrap()));
  }

  #[test]
  fn short_record_is_rejected() {
    let record = Record::from(vec![Value::Integer(1)]);
    assert!(matches!(
      RawSubscription::from_record(&record),
      Err(Error::Decode(_))
    ));
  }
}
