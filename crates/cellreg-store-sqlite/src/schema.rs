//! SQL schema for the subscription store.
//!
//! Two physical layouts exist, told apart by `PRAGMA user_version`:
//!
//! - `1` ([`SchemaVersion::CellTable`]): cells live in a separate
//!   `subscription_cells` table keyed by `(cell_id, subscription_id)`.
//! - `2` ([`SchemaVersion::CellArray`]): cells are a JSON array column on
//!   `subscriptions` itself.
//!
//! A database with `user_version = 0` is empty and gets whichever layout the
//! caller asks for. Anything else is refused.
//!
//! Both layouts share `version_clock`, a single row holding the last version
//! handed out. Every write takes the next value from it, so a version is
//! never reused anywhere in the database, even for a re-inserted id.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const OP: &str = "schema";

/// Legacy layout with a cell join table.
pub const CELL_TABLE_SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS subscriptions (
    id                 TEXT PRIMARY KEY,   -- hyphenated lowercase UUID
    owner              TEXT NOT NULL,
    url                TEXT NOT NULL,
    notification_index INTEGER NOT NULL DEFAULT 0 CHECK (notification_index >= 0),
    starts_at          INTEGER,            -- unix micros
    ends_at            INTEGER,            -- unix micros
    writer             TEXT,
    updated_at         INTEGER NOT NULL    -- unix micros; server-assigned
);

-- No foreign key: rows are maintained by the repository alongside their
-- subscription.
CREATE TABLE IF NOT EXISTS subscription_cells (
    cell_id         INTEGER NOT NULL,
    subscription_id TEXT NOT NULL,
    PRIMARY KEY (cell_id, subscription_id)
);

CREATE INDEX IF NOT EXISTS subscription_cells_by_subscription
    ON subscription_cells(subscription_id);
CREATE INDEX IF NOT EXISTS subscriptions_by_owner ON subscriptions(owner);
CREATE INDEX IF NOT EXISTS subscriptions_by_ends_at ON subscriptions(ends_at);

PRAGMA user_version = 1;
";

/// Current layout with cells denormalised onto the subscription row.
pub const CELL_ARRAY_SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS subscriptions (
    id                 TEXT PRIMARY KEY,   -- hyphenated lowercase UUID
    owner              TEXT NOT NULL,
    url                TEXT NOT NULL,
    notification_index INTEGER NOT NULL DEFAULT 0 CHECK (notification_index >= 0),
    cells              TEXT NOT NULL       -- JSON array of signed cell ids
        CHECK (json_valid(cells) AND json_array_length(cells) > 0),
    starts_at          INTEGER,            -- unix micros
    ends_at            INTEGER,            -- unix micros
    writer             TEXT,
    updated_at         INTEGER NOT NULL    -- unix micros; server-assigned
);

CREATE INDEX IF NOT EXISTS subscriptions_by_owner ON subscriptions(owner);
CREATE INDEX IF NOT EXISTS subscriptions_by_ends_at ON subscriptions(ends_at);

PRAGMA user_version = 2;
";

/// Created alongside either layout and on every open, seeded from the newest
/// stored version so databases written before it existed stay consistent.
const VERSION_CLOCK: &str = "
CREATE TABLE IF NOT EXISTS version_clock (
    id   INTEGER PRIMARY KEY CHECK (id = 0),
    last INTEGER NOT NULL                -- unix micros; last version issued
);

INSERT OR IGNORE INTO version_clock (id, last)
    SELECT 0, IFNULL(MAX(updated_at), 0) FROM subscriptions;
";

/// Folds the join table into the `cells` column. Runs inside a transaction.
const MIGRATE_CELL_TABLE_TO_ARRAY: &str = "
ALTER TABLE subscriptions ADD COLUMN cells TEXT NOT NULL DEFAULT '[]';

UPDATE subscriptions SET cells = (
    SELECT json_group_array(cell_id)
    FROM subscription_cells
    WHERE subscription_id = subscriptions.id
);

DROP TABLE subscription_cells;

PRAGMA user_version = 2;
";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
  CellTable,
  #[default]
  CellArray,
}

impl SchemaVersion {
  pub fn user_version(self) -> i64 {
    match self {
      Self::CellTable => 1,
      Self::CellArray => 2,
    }
  }

  fn from_user_version(v: i64) -> Result<Option<Self>> {
    match v {
      0 => Ok(None),
      1 => Ok(Some(Self::CellTable)),
      2 => Ok(Some(Self::CellArray)),
      other => Err(Error::UnsupportedSchema(other)),
    }
  }

  fn ddl(self) -> &'static str {
    match self {
      Self::CellTable => CELL_TABLE_SCHEMA,
      Self::CellArray => CELL_ARRAY_SCHEMA,
    }
  }
}

/// The layout of an existing database; `None` if nothing has been created.
pub fn detect(conn: &Connection) -> Result<Option<SchemaVersion>> {
  let v: i64 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(Error::sqlite(OP, None))?;
  SchemaVersion::from_user_version(v)
}

/// Create `fresh` on an empty database, otherwise keep what is there.
pub fn init(conn: &Connection, fresh: SchemaVersion) -> Result<SchemaVersion> {
  let version = match detect(conn)? {
    Some(existing) => existing,
    None => {
      conn
        .execute_batch(fresh.ddl())
        .map_err(Error::sqlite(OP, None))?;
      tracing::info!(schema = ?fresh, "created subscription schema");
      fresh
    }
  };
  conn
    .execute_batch(VERSION_CLOCK)
    .map_err(Error::sqlite(OP, None))?;
  Ok(version)
}

/// Move a `CellTable` database to `CellArray`, keeping ids and versions.
/// A database already on `CellArray` is left alone.
pub fn migrate_to_cell_array(conn: &mut Connection) -> Result<SchemaVersion> {
  match detect(conn)? {
    Some(SchemaVersion::CellArray) => return Ok(SchemaVersion::CellArray),
    Some(SchemaVersion::CellTable) => {}
    None => return Err(Error::UnsupportedSchema(0)),
  }

  let tx = conn.transaction().map_err(Error::sqlite(OP, None))?;
  tx.execute_batch(MIGRATE_CELL_TABLE_TO_ARRAY)
    .map_err(Error::sqlite(OP, None))?;
  tx.execute_batch(VERSION_CLOCK)
    .map_err(Error::sqlite(OP, None))?;
  tx.commit().map_err(Error::sqlite(OP, None))?;
  tracing::info!("migrated subscription cells to the array layout");
  Ok(SchemaVersion::CellArray)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_database_gets_requested_layout() {
    let conn = Connection::open_in_memory().unwrap();
    assert_eq!(detect(&conn).unwrap(), None);
    assert_eq!(
      init(&conn, SchemaVersion::CellTable).unwrap(),
      SchemaVersion::CellTable
    );
    assert_eq!(detect(&conn).unwrap(), Some(SchemaVersion::CellTable));
  }

  #[test]
  fn existing_layout_wins_over_requested() {
    let conn = Connection::open_in_memory().unwrap();
    init(&conn, SchemaVersion::CellTable).unwrap();
    assert_eq!(
      init(&conn, SchemaVersion::CellArray).unwrap(),
      SchemaVersion::CellTable
    );
  }

  #[test]
  fn unknown_user_version_is_refused() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA user_version = 7;").unwrap();
    assert!(matches!(
      init(&conn, SchemaVersion::CellArray),
      Err(Error::UnsupportedSchema(7))
    ));
  }

  #[test]
  fn migrating_empty_database_is_refused() {
    let mut conn = Connection::open_in_memory().unwrap();
    assert!(matches!(
      migrate_to_cell_array(&mut conn),
      Err(Error::UnsupportedSchema(0))
    ));
  }

  #[test]
  fn version_clock_is_seeded_from_existing_rows() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(CELL_ARRAY_SCHEMA).unwrap();
    conn
      .execute(
        "INSERT INTO subscriptions (id, owner, url, cells, updated_at)
         VALUES ('a', 'o', 'u', '[1]', 40), ('b', 'o', 'u', '[1]', 90)",
        [],
      )
      .unwrap();

    init(&conn, SchemaVersion::CellArray).unwrap();
    init(&conn, SchemaVersion::CellArray).unwrap();
    let last: i64 = conn
      .query_row("SELECT last FROM version_clock", [], |row| row.get(0))
      .unwrap();
    assert_eq!(last, 90);
  }

  #[test]
  fn cell_array_rejects_empty_cells() {
    let conn = Connection::open_in_memory().unwrap();
    init(&conn, SchemaVersion::CellArray).unwrap();
    let err = conn
      .execute(
        "INSERT INTO subscriptions (id, owner, url, cells, updated_at)
         VALUES ('x', 'o', 'u', '[]', 0)",
        [],
      )
      .unwrap_err();
    assert!(Error::sqlite("test", None)(err).is_constraint_violation());
  }
}
