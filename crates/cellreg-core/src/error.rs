//! Error types for `cellreg-core`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
  #[error("invalid region: no cells provided")]
  EmptyRegion,

  #[error("invalid region: {count} cells exceeds the limit of {max}")]
  TooManyCells { count: usize, max: usize },

  #[error("invalid region: {0:#018x} is not a valid cell id")]
  InvalidCell(u64),

  #[error("invalid region: cell {id:#018x} is at level {level}, expected {expected}")]
  CellLevelMismatch { id: u64, level: u8, expected: u8 },

  #[error("invalid version token: {0:?}")]
  InvalidVersion(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
