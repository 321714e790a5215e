//! Synchronous `SubscriptionRepo` implementations.
//!
//! [`CellArrayRepo`] and [`CellTableRepo`] expose identical behaviour over the
//! two physical layouts in [`crate::schema`]; [`open_repo`] picks one from the
//! database's recorded schema version.

use std::sync::Arc;

use cellreg_core::{
  cells::{CellCodec, CellUnion},
  clock::Clock,
  config::RepoConfig,
  store::SubscriptionRepo,
  subscription::Subscription,
};
use rusqlite::{Connection, ToSql};
use tracing::Span;
use uuid::Uuid;

use crate::{
  Error, Queryable, Result,
  encode::{RawSubscription, encode_cells, encode_ts},
  schema::{self, SchemaVersion},
};

/// A repository over either layout, usable behind `Arc`/`Box`.
pub type DynSubscriptionRepo =
  dyn SubscriptionRepo<Queryable = dyn Queryable, Error = Error>;

/// Current time from the database, as a SQL expression in unix microseconds.
/// SQLite's clock only resolves milliseconds, so the last three digits are
/// always zero.
macro_rules! now_millis_as_micros {
  () => {
    "(CAST(strftime('%s', 'now') AS INTEGER) * 1000000 \
     + CAST(substr(strftime('%f', 'now'), 4) AS INTEGER) * 1000)"
  };
}

/// Advances the database-wide version clock. Never repeats a value, even
/// when the wall clock stalls or steps back.
const NEXT_VERSION: &str = concat!(
  "UPDATE version_clock SET last = MAX(",
  now_millis_as_micros!(),
  ", last + 1) WHERE id = 0 RETURNING last"
);

mod cell_array;
mod cell_table;

pub use cell_array::CellArrayRepo;
pub use cell_table::CellTableRepo;

/// State shared by both layouts: how to read the clock, validate regions and
/// where to log.
#[derive(Clone)]
pub struct RepoContext {
  clock:  Arc<dyn Clock>,
  codec:  CellCodec,
  config: RepoConfig,
  span:   Span,
}

impl RepoContext {
  pub fn new(clock: Arc<dyn Clock>, config: RepoConfig, span: Span) -> Self {
    Self { clock, codec: config.codec(), config, span }
  }

  pub(crate) fn span(&self) -> &Span { &self.span }

  pub(crate) fn now_micros(&self) -> i64 { encode_ts(self.clock.now()) }

  /// Latest `ends_at` that counts as expired right now.
  pub(crate) fn expiry_cutoff(&self) -> i64 {
    let grace =
      i64::try_from(self.config.expiry_grace().as_micros()).unwrap_or(i64::MAX);
    self.now_micros().saturating_sub(grace)
  }

  pub(crate) fn result_limit(&self) -> i64 {
    i64::from(self.config.max_result_limit)
  }

  /// Validate `region` and render it as the JSON bind value.
  pub(crate) fn region(&self, region: &CellUnion) -> Result<String> {
    Ok(encode_cells(&self.codec.encode(region)?))
  }
}

/// The version to stamp on the row (or rows) a write is about to touch.
pub(crate) fn next_version(
  q: &dyn Queryable,
  op: &'static str,
  id: Option<Uuid>,
) -> Result<i64> {
  q.fetch_optional(NEXT_VERSION, &[])
    .map_err(Error::sqlite(op, id))?
    .ok_or_else(|| Error::Decode("version clock row missing".into()))?
    .get(0)
}

/// Run `sql` and decode every returned row as a subscription.
pub(crate) fn process(
  q: &dyn Queryable,
  op: &'static str,
  id: Option<Uuid>,
  sql: &str,
  params: &[&dyn ToSql],
) -> Result<Vec<Subscription>> {
  q.fetch_all(sql, params)
    .map_err(Error::sqlite(op, id))?
    .iter()
    .map(|record| RawSubscription::from_record(record)?.into_subscription())
    .collect()
}

/// Like [`process`], for statements keyed on a primary key.
pub(crate) fn process_one(
  q: &dyn Queryable,
  op: &'static str,
  id: Option<Uuid>,
  sql: &str,
  params: &[&dyn ToSql],
) -> Result<Option<Subscription>> {
  let mut subs = process(q, op, id, sql, params)?;
  if subs.len() > 1 {
    return Err(Error::TooManyRows { op, count: subs.len() });
  }
  Ok(subs.pop())
}

/// Build the repository matching `version`.
pub fn for_schema(
  version: SchemaVersion,
  ctx: RepoContext,
) -> Box<DynSubscriptionRepo> {
  match version {
    SchemaVersion::CellArray => Box::new(CellArrayRepo::new(ctx)),
    SchemaVersion::CellTable => Box::new(CellTableRepo::new(ctx)),
  }
}

/// Inspect `conn` and build the repository for its layout. The schema must
/// already exist; see [`schema::init`].
pub fn open_repo(
  conn: &Connection,
  clock: Arc<dyn Clock>,
  config: RepoConfig,
  span: Span,
) -> Result<Box<DynSubscriptionRepo>> {
  let version = schema::detect(conn)?.ok_or(Error::UnsupportedSchema(0))?;
  tracing::debug!(parent: &span, schema = ?version, "opened subscription repository");
  Ok(for_schema(version, RepoContext::new(clock, config, span)))
}
