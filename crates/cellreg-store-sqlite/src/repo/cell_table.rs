//! Repository over the legacy `CellTable` layout, where each
//! `(cell_id, subscription_id)` pair is a row in `subscription_cells`.
//!
//! Writes touch both tables, so callers should run them inside a transaction
//! ([`crate::SqliteRegistry`] always does). `RETURNING` cannot see the join
//! table, so returned rows carry an empty placeholder and their cells are
//! filled in afterwards.

use std::collections::HashMap;

use cellreg_core::{
  cells::{CellCodec, CellUnion},
  store::SubscriptionRepo,
  subscription::{Owner, Subscription},
  version::Version,
};
use rusqlite::params;
use uuid::Uuid;

use super::{RepoContext, next_version, process, process_one};
use crate::{
  Error, Queryable, Result,
  encode::{decode_cells, encode_ids, encode_ts, encode_uuid},
};

macro_rules! select_fields {
  () => {
    "s.id, s.owner, s.url, s.notification_index, \
     (SELECT json_group_array(cell_id) FROM subscription_cells \
      WHERE subscription_id = s.id) AS cells, \
     s.starts_at, s.ends_at, s.writer, s.updated_at"
  };
}

macro_rules! returning_fields {
  () => {
    "id, owner, url, notification_index, '[]' AS cells, starts_at, ends_at, \
     writer, updated_at"
  };
}

macro_rules! in_region {
  ($param:literal) => {
    concat!(
      "s.id IN (SELECT subscription_id FROM subscription_cells \
       WHERE cell_id IN (SELECT value FROM json_each(",
      $param,
      ")))"
    )
  };
}

const GET: &str = concat!(
  "SELECT ",
  select_fields!(),
  " FROM subscriptions AS s WHERE s.id = ?1"
);

const INSERT: &str = concat!(
  "INSERT INTO subscriptions (id, owner, url, notification_index, starts_at, \
   ends_at, writer, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
   RETURNING ",
  returning_fields!()
);

const INSERT_CELLS: &str = "INSERT INTO subscription_cells (cell_id, subscription_id) \
                            SELECT value, ?2 FROM json_each(?1)";

const CLEAR_CELLS: &str = "DELETE FROM subscription_cells WHERE subscription_id = ?1";

const DELETE_CELLS: &str =
  "DELETE FROM subscription_cells WHERE subscription_id = ?1 RETURNING cell_id";

const CELLS_FOR_IDS: &str = "
SELECT subscription_id, json_group_array(cell_id)
FROM subscription_cells
WHERE subscription_id IN (SELECT value FROM json_each(?1))
GROUP BY subscription_id";

const UPDATE: &str = concat!(
  "UPDATE subscriptions SET url = ?2, notification_index = ?3, starts_at = ?4, \
   ends_at = ?5, writer = ?6, updated_at = ?8 \
   WHERE id = ?1 AND updated_at = ?7 RETURNING ",
  returning_fields!()
);

const DELETE: &str = concat!(
  "DELETE FROM subscriptions WHERE id = ?1 AND updated_at = ?2 RETURNING ",
  returning_fields!()
);

const SEARCH: &str = concat!(
  "SELECT ",
  select_fields!(),
  " FROM subscriptions AS s WHERE ",
  in_region!("?1"),
  " AND s.ends_at >= ?2 LIMIT ?3"
);

const SEARCH_BY_OWNER: &str = concat!(
  "SELECT ",
  select_fields!(),
  " FROM subscriptions AS s WHERE ",
  in_region!("?1"),
  " AND s.ends_at >= ?2 AND s.owner = ?3 LIMIT ?4"
);

const COUNT_MAX_PER_CELL: &str = "
SELECT IFNULL(MAX(per_cell), 0) FROM (
    SELECT COUNT(*) AS per_cell
    FROM subscription_cells AS sc
    JOIN subscriptions AS s ON s.id = sc.subscription_id
    WHERE s.owner = ?1
      AND s.ends_at >= ?2
      AND sc.cell_id IN (SELECT value FROM json_each(?3))
    GROUP BY sc.cell_id
)";

const INCREMENT: &str = concat!(
  "UPDATE subscriptions AS s SET notification_index = notification_index + 1, \
   updated_at = ?3 WHERE ",
  in_region!("?1"),
  " AND s.ends_at >= ?2 RETURNING ",
  returning_fields!()
);

const LIST_EXPIRED_FOR_WRITER: &str = concat!(
  "SELECT ",
  select_fields!(),
  " FROM subscriptions AS s WHERE s.ends_at <= ?1 AND s.writer = ?2"
);

const LIST_EXPIRED_UNATTRIBUTED: &str = concat!(
  "SELECT ",
  select_fields!(),
  " FROM subscriptions AS s \
   WHERE s.ends_at <= ?1 AND (s.writer = '' OR s.writer IS NULL)"
);

pub struct CellTableRepo {
  ctx: RepoContext,
}

impl CellTableRepo {
  pub fn new(ctx: RepoContext) -> Self { Self { ctx } }

  fn write_cells(
    &self,
    q: &dyn Queryable,
    op: &'static str,
    id: Uuid,
    cells: &str,
  ) -> Result<()> {
    q.execute(INSERT_CELLS, params![cells, encode_uuid(id)])
      .map_err(Error::sqlite(op, Some(id)))?;
    Ok(())
  }

  /// Replace the placeholder cells on rows returned by a `RETURNING` clause.
  fn hydrate(
    &self,
    q: &dyn Queryable,
    op: &'static str,
    subs: &mut [Subscription],
  ) -> Result<()> {
    if subs.is_empty() {
      return Ok(());
    }
    let ids: Vec<Uuid> = subs.iter().map(|s| s.id).collect();
    let mut by_id: HashMap<String, String> = HashMap::with_capacity(ids.len());
    for record in q
      .fetch_all(CELLS_FOR_IDS, params![encode_ids(&ids)])
      .map_err(Error::sqlite(op, None))?
    {
      by_id.insert(record.get(0)?, record.get(1)?);
    }
    for sub in subs {
      if let Some(cells) = by_id.get(&encode_uuid(sub.id)) {
        sub.cells = CellCodec::decode(&decode_cells(cells)?);
      }
    }
    Ok(())
  }
}

impl SubscriptionRepo for CellTableRepo {
  type Error = Error;
  type Queryable = dyn Queryable;

  fn get_by_id(&self, q: &dyn Queryable, id: Uuid) -> Result<Option<Subscription>> {
    process_one(q, "get_by_id", Some(id), GET, params![encode_uuid(id)])
  }

  fn insert(&self, q: &dyn Queryable, sub: &Subscription) -> Result<Subscription> {
    let cells = self.ctx.region(&sub.cells)?;
    let version = next_version(q, "insert", Some(sub.id))?;
    let mut inserted = process_one(q, "insert", Some(sub.id), INSERT, params![
      encode_uuid(sub.id),
      sub.owner.as_str(),
      sub.url,
      sub.notification_index,
      sub.start_time.map(encode_ts),
      sub.end_time.map(encode_ts),
      sub.writer,
      version,
    ])?
    .ok_or_else(|| Error::Decode("insert returned no row".into()))?;
    self.write_cells(q, "insert", sub.id, &cells)?;
    inserted.cells = sub.cells.clone();
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
    let Some(mut updated) = process_one(q, "update", Some(sub.id), UPDATE, params![
      encode_uuid(sub.id),
      sub.url,
      sub.notification_index,
      sub.start_time.map(encode_ts),
      sub.end_time.map(encode_ts),
      sub.writer,
      expected_version.as_micros(),
      version,
    ])?
    else {
      tracing::debug!(parent: self.ctx.span(), id = %sub.id, "update lost version check");
      return Ok(None);
    };

    q.execute(CLEAR_CELLS, params![encode_uuid(sub.id)])
      .map_err(Error::sqlite("update", Some(sub.id)))?;
    self.write_cells(q, "update", sub.id, &cells)?;
    updated.cells = sub.cells.clone();
    Ok(Some(updated))
  }

  fn delete(
    &self,
    q: &dyn Queryable,
    sub: &Subscription,
    expected_version: &Version,
  ) -> Result<Option<Subscription>> {
    let Some(mut deleted) = process_one(q, "delete", Some(sub.id), DELETE, params![
      encode_uuid(sub.id),
      expected_version.as_micros(),
    ])?
    else {
      tracing::debug!(parent: self.ctx.span(), id = %sub.id, "delete lost version check");
      return Ok(None);
    };

    let ids = q
      .fetch_all(DELETE_CELLS, params![encode_uuid(sub.id)])
      .map_err(Error::sqlite("delete", Some(sub.id)))?
      .iter()
      .map(|record| record.get::<i64>(0))
      .collect::<Result<Vec<_>>>()?;
    deleted.cells = CellCodec::decode(&ids);
    Ok(Some(deleted))
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
    let mut updated =
      process(q, OP, None, INCREMENT, params![cells, self.ctx.now_micros(), version])?;
    self.hydrate(q, OP, &mut updated)?;
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
