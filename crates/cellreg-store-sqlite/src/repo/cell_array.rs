//! Repository over the `CellArray` layout: one row per subscription with its
//! cells held in a JSON array column.
//!
//! Intersection with a region is an `EXISTS` over `json_each(cells)`; the
//! region itself is bound as a JSON array and expanded the same way.

use cellreg_core::{
  cells::CellUnion,
  store::SubscriptionRepo,
  subscription::{Owner, Subscription},
  version::Version,
};
use rusqlite::params;
use uuid::Uuid;

use super::{RepoContext, next_version, process, process_one};
use crate::{
  Error, Queryable, Result,
  encode::{encode_ts, encode_uuid},
};

macro_rules! fields {
  () => {
    "id, owner, url, notification_index, cells, starts_at, ends_at, writer, \
     updated_at"
  };
}

macro_rules! intersects_region {
  ($param:literal) => {
    concat!(
      "EXISTS (SELECT 1 FROM json_each(subscriptions.cells) AS c \
       WHERE c.value IN (SELECT value FROM json_each(",
      $param,
      ")))"
    )
  };
}

const GET: &str = concat!("SELECT ", fields!(), " FROM subscriptions WHERE id = ?1");

const INSERT: &str = concat!(
  "INSERT INTO subscriptions (id, owner, url, notification_index, cells, \
   starts_at, ends_at, writer, updated_at) \
   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) RETURNING ",
  fields!()
);

const UPDATE: &str = concat!(
  "UPDATE subscriptions SET url = ?2, notification_index = ?3, cells = ?4, \
   starts_at = ?5, ends_at = ?6, writer = ?7, updated_at = ?9 \
   WHERE id = ?1 AND updated_at = ?8 RETURNING ",
  fields!()
);

const DELETE: &str = concat!(
  "DELETE FROM subscriptions WHERE id = ?1 AND updated_at = ?2 RETURNING ",
  fields!()
);

const SEARCH: &str = concat!(
  "SELECT ",
  fields!(),
  " FROM subscriptions WHERE ",
  intersects_region!("?1"),
  " AND ends_at >= ?2 LIMIT ?3"
);

const SEARCH_BY_OWNER: &str = concat!(
  "SELECT ",
  fields!(),
  " FROM subscriptions WHERE ",
  intersects_region!("?1"),
  " AND ends_at >= ?2 AND owner = ?3 LIMIT ?4"
);

const COUNT_MAX_PER_CELL: &str = "
SELECT IFNULL(MAX(per_cell), 0) FROM (
    SELECT COUNT(*) AS per_cell
    FROM subscriptions AS s, json_each(s.cells) AS c
    WHERE s.owner = ?1
      AND s.ends_at >= ?2
      AND c.value IN (SELECT value FROM json_each(?3))
    GROUP BY c.value
)";

const INCREMENT: &str = concat!(
  "UPDATE subscriptions SET notification_index = notification_index + 1, \
   updated_at = ?3 WHERE ",
  intersects_region!("?1"),
  " AND ends_at >= ?2 RETURNING ",
  fields!()
);

const LIST_EXPIRED_FOR_WRITER: &str = concat!(
  "SELECT ",
  fields!(),
  " FROM subscriptions WHERE ends_at <= ?1 AND writer = ?2"
);

const LIST_EXPIRED_UNATTRIBUTED: &str = concat!(
  "SELECT ",
  fields!(),
  " FROM subscriptions WHERE ends_at <= ?1 AND (writer = '' OR writer IS NULL)"
);

pub struct CellArrayRepo {
  ctx: RepoContext,
}

impl CellArrayRepo {
  pub fn new(ctx: RepoContext) -> Self { Self { ctx } }
}

impl SubscriptionRepo for CellArrayRepo {
  type Error = Error;
  type Queryable = dyn Queryable;

  fn get_by_id(&self, q: &dyn Queryable, id: Uuid) -> Result<Option<Subscription>> {
    process_one(q, "get_by_id", Some(id), GET, params![encode_uuid(id)])
  }

  fn insert(&self, q: &dyn Queryable, sub: &Subscription) -> Result<Subscription> {
    let cells = self.ctx.region(&sub.cells)?;
    let version = next_version(q, "insert", Some(sub.id))?;
    let inserted = process_one(q, "insert", Some(sub.id), INSERT, params![
      encode_uuid(sub.id),
      sub.owner.as_str(),
      sub.url,
      sub.notification_index,
      cells,
      sub.start_time.map(encode_ts),
      sub.end_time.map(encode_ts),
      sub.writer,
      version,
    ])?
    .ok_or_else(|| Error::Decode("insert returned no row".into()))?;
    tracing::debug!(parent: self.ctx.span(), id = %sub.id, "inserted subscription");
    Ok(inserted)
  }

  fn update(
    &self,
    q: &dyn Queryable,
    sub: &Subscription,
    expected_version: &Version,
  ) -> Result<Option<Subscription>> {
    let cells = self.ctx.region(&sub.cells)?;
    let version = next_version(q, "update", Some(sub.id))?;
    let updated = process_one(q, "update", Some(sub.id), UPDATE, params![
      encode_uuid(sub.id),
      sub.url,
      sub.notification_index,
      cells,
      sub.start_time.map(encode_ts),
      sub.end_time.map(encode_ts),
      sub.writer,
      expected_version.as_micros(),
      version,
    ])?;
    if updated.is_none() {
      tracing::debug!(parent: self.ctx.span(), id = %sub.id, "update lost version check");
    }
    Ok(updated)
  }

  fn delete(
    &self,
    q: &dyn Queryable,
    sub: &Subscription,
    expected_version: &Version,
  ) -> Result<Option<Subscription>> {
    let deleted = process_one(q, "delete", Some(sub.id), DELETE, params![
      encode_uuid(sub.id),
      expected_version.as_micros(),
    ])?;
    if deleted.is_none() {
      tracing::debug!(parent: self.ctx.span(), id = %sub.id, "delete lost version check");
    }
    Ok(deleted)
  }

  fn search_by_cells(
    &self,
    q: &dyn Queryable,
    region: &CellUnion,
  ) -> Result<Vec<Subscription>> {
    let cells = self.ctx.region(region)?;
    process(q, "search_by_cells", None, SEARCH, params![
      cells,
      self.ctx.now_micros(),
      self.ctx.result_limit(),
    ])
  }

  fn search_by_cells_and_owner(
    &self,
    q: &dyn Queryable,
    region: &CellUnion,
    owner: &Owner,
  ) -> Result<Vec<Subscription>> {
    let cells = self.ctx.region(region)?;
    process(q, "search_by_cells_and_owner", None, SEARCH_BY_OWNER, params![
      cells,
      self.ctx.now_micros(),
      owner.as_str(),
      self.ctx.result_limit(),
    ])
  }

  fn count_max_per_cell_by_owner(
    &self,
    q: &dyn Queryable,
    region: &CellUnion,
    owner: &Owner,
  ) -> Result<u64> {
    let cells = self.ctx.region(region)?;
    let record = q
      .fetch_optional(COUNT_MAX_PER_CELL, params![
        owner.as_str(),
        self.ctx.now_micros(),
        cells,
      ])
      .map_err(Error::sqlite("count_max_per_cell_by_owner", None))?;
    let count: i64 = match record {
      Some(record) => record.get(0)?,
      None => 0,
    };
    Ok(u64::try_from(count).unwrap_or_default())
  }

  fn increment_notification_index_in_cells(
    &self,
    q: &dyn Queryable,
    region: &CellUnion,
  ) -> Result<Vec<Subscription>> {
    const OP: &str = "increment_notification_index_in_cells";
    let cells = self.ctx.region(region)?;
    let version = next_version(q, OP, None)?;
    let updated =
      process(q, OP, None, INCREMENT, params![cells, self.ctx.now_micros(), version])?;
    tracing::debug!(parent: self.ctx.span(), rows = updated.len(), "incremented notification indices");
    Ok(updated)
  }

  fn list_expired(&self, q: &dyn Queryable, writer: &str) -> Result<Vec<Subscription>> {
    let cutoff = self.ctx.expiry_cutoff();
    if writer.is_empty() {
      process(q, "list_expired", None, LIST_EXPIRED_UNATTRIBUTED, params![cutoff])
    } else {
      process(q, "list_expired", None, LIST_EXPIRED_FOR_WRITER, params![
        cutoff, writer,
      ])
    }
  }
}
