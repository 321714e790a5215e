//! The execution handle repositories run their statements against.
//!
//! Repositories take `&dyn Queryable` rather than a concrete connection type,
//! so the same repository code runs on a plain connection or inside a
//! transaction the caller controls. Repositories hold the handle as a
//! `'static` trait object, so a `Transaction` is passed by its underlying
//! connection (`&*tx`); statements still run inside it.

use rusqlite::{
  Connection, OptionalExtension, Row, ToSql, Transaction,
  types::{FromSql, Value, ValueRef},
};

use crate::{Error, Result};

/// One result row, detached from the statement that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  values: Vec<Value>,
}

impl Record {
  pub fn len(&self) -> usize { self.values.len() }

  pub fn is_empty(&self) -> bool { self.values.is_empty() }

  /// Convert column `idx` into `T`.
  pub fn get<T: FromSql>(&self, idx: usize) -> Result<T> {
    let value = self
      .values
      .get(idx)
      .ok_or_else(|| Error::Decode(format!("column {idx} out of range")))?;
    T::column_result(ValueRef::from(value))
      .map_err(|e| Error::Decode(format!("column {idx}: {e}")))
  }

  fn read(row: &Row<'_>, width: usize) -> rusqlite::Result<Self> {
    let values = (0..width)
      .map(|i| row.get::<_, Value>(i))
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Self { values })
  }
}

impl From<Vec<Value>> for Record {
  fn from(values: Vec<Value>) -> Self { Self { values } }
}

pub trait Queryable {
  /// Run `sql` and collect every row it yields. Also used for
  /// `INSERT`/`UPDATE`/`DELETE ... RETURNING`.
  fn fetch_all(
    &self,
    sql: &str,
    params: &[&dyn ToSql],
  ) -> rusqlite::Result<Vec<Record>>;

  /// Run `sql` and return its first row, if any.
  fn fetch_optional(
    &self,
    sql: &str,
    params: &[&dyn ToSql],
  ) -> rusqlite::Result<Option<Record>>;

  /// Run a statement that yields no rows; returns the number of rows changed.
  fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> rusqlite::Result<usize>;
}

impl Queryable for Connection {
  fn fetch_all(
    &self,
    sql: &str,
    params: &[&dyn ToSql],
  ) -> rusqlite::Result<Vec<Record>> {
    let mut stmt = self.prepare_cached(sql)?;
    let width = stmt.column_count();
    let records = stmt
      .query_map(params, |row| Record::read(row, width))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
  }

  fn fetch_optional(
    &self,
    sql: &str,
    params: &[&dyn ToSql],
  ) -> rusqlite::Result<Option<Record>> {
    let mut stmt = self.prepare_cached(sql)?;
    let width = stmt.column_count();
    let record = stmt
      .query_row(params, |row| Record::read(row, width))
      .optional()?;
    Ok(record)
  }

  fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> rusqlite::Result<usize> {
    let mut stmt = self.prepare_cached(sql)?;
    stmt.execute(params)
  }
}

impl Queryable for Transaction<'_> {
  fn fetch_all(
    &self,
    sql: &str,
    params: &[&dyn ToSql],
  ) -> rusqlite::Result<Vec<Record>> {
    Queryable::fetch_all(&**self, sql, params)
  }

  fn fetch_optional(
    &self,
    sql: &str,
    params: &[&dyn ToSql],
  ) -> rusqlite::Result<Option<Record>> {
    Queryable::fetch_optional(&**self, sql, params)
  }

  fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> rusqlite::Result<usize> {
    Queryable::execute(&**self, sql, params)
  }
}

#[cfg(test)]
mod tests {
  use rusqlite::params;

  use super::*;

  fn conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch(
        "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO t (id, name) VALUES (1, 'a'), (2, NULL);",
      )
      .unwrap();
    conn
  }

  #[test]
  fn fetch_all_reads_every_column() {
    let conn = conn();
    let rows = conn
      .fetch_all("SELECT id, name FROM t ORDER BY id", params![])
      .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].len(), 2);
    assert_eq!(rows[0].get::<i64>(0).unwrap(), 1);
    assert_eq!(rows[0].get::<String>(1).unwrap(), "a");
    assert_eq!(rows[1].get::<Option<String>>(1).unwrap(), None);
  }

  #[test]
  fn fetch_optional_is_none_without_rows() {
    let conn = conn();
    let none = conn
      .fetch_optional("SELECT id FROM t WHERE id = ?1", params![99])
      .unwrap();
    assert!(none.is_none());
  }

  #[test]
  fn wrong_column_type_is_a_decode_error() {
    let conn = conn();
    let row = conn
      .fetch_optional("SELECT name FROM t WHERE id = 1", params![])
      .unwrap()
      .unwrap();
    assert!(matches!(row.get::<i64>(0), Err(Error::Decode(_))));
    assert!(matches!(row.get::<i64>(5), Err(Error::Decode(_))));
  }

  #[test]
  fn transaction_delegates_to_connection() {
    let mut conn = conn();
    let tx = conn.transaction().unwrap();
    let changed = Queryable::execute(&tx, "DELETE FROM t WHERE id = ?1", params![1])
      .unwrap();
    assert_eq!(changed, 1);
    drop(tx);

    let rows = conn.fetch_all("SELECT id FROM t", params![]).unwrap();
    assert_eq!(rows.len(), 2, "dropped transaction rolls back");
  }
}
