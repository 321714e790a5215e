//! Error type for `cellreg-store-sqlite`.

use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  /// Rejected before any statement ran (e.g. an empty region).
  #[error("invalid argument: {0}")]
  InvalidArgument(#[from] cellreg_core::Error),

  #[error("{op}{}: constraint violation: {source}", id_suffix(.id))]
  ConstraintViolation {
    op:     &'static str,
    id:     Option<Uuid>,
    source: rusqlite::Error,
  },

  /// A statement expected to match at most one row matched several.
  #[error("{op}: query returned {count} rows when at most one was expected")]
  TooManyRows { op: &'static str, count: usize },

  #[error("{op}{}: storage error: {source}", id_suffix(.id))]
  Storage {
    op:     &'static str,
    id:     Option<Uuid>,
    source: rusqlite::Error,
  },

  #[error("undecodable row: {0}")]
  Decode(String),

  #[error("unsupported schema version {0}")]
  UnsupportedSchema(i64),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("{op}: no result after {after:?}")]
  Timeout { op: &'static str, after: Duration },
}

impl Error {
  /// Classify a driver error raised while running `op`.
  pub(crate) fn sqlite(
    op: &'static str,
    id: Option<Uuid>,
  ) -> impl FnOnce(rusqlite::Error) -> Self {
    move |source| match &source {
      rusqlite::Error::SqliteFailure(err, _)
        if err.code == ErrorCode::ConstraintViolation =>
      {
        Self::ConstraintViolation { op, id, source }
      }
      _ => Self::Storage { op, id, source },
    }
  }

  pub fn is_invalid_argument(&self) -> bool {
    matches!(self, Self::InvalidArgument(_))
  }

  pub fn is_constraint_violation(&self) -> bool {
    matches!(self, Self::ConstraintViolation { .. })
  }
}

fn id_suffix(id: &Option<Uuid>) -> String {
  id.map(|id| format!(" [{id}]")).unwrap_or_default()
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
