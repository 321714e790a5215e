//! Hierarchical cell identifiers and the codec between cell unions and the
//! flat integer form kept in storage.
//!
//! Identifiers follow the 64-bit S2 layout: three face bits, two bits per
//! subdivision level and a trailing sentinel bit whose position encodes the
//! level. Only the arithmetic needed to validate identifiers lives here;
//! covering geographic areas with cells is the caller's job.
//!
//! Storage compares cells by exact id, so every stored cell is at one fixed
//! level. Two regions at that level intersect exactly when they share an id.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const FACE_BITS: u32 = 3;
const NUM_FACES: u8 = 6;
const POS_BITS: u32 = 2 * MAX_LEVEL as u32 + 1;

/// Deepest subdivision level.
pub const MAX_LEVEL: u8 = 30;

// ─── CellId ──────────────────────────────────────────────────────────────────

/// A single cell of the hierarchical decomposition.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CellId(pub u64);

impl CellId {
  /// Build the cell at `level` containing the leaf position `pos` on `face`.
  ///
  /// `pos` is the 61-bit Hilbert position; bits above it are ignored.
  pub fn from_face_pos_level(face: u8, pos: u64, level: u8) -> Self {
    let pos = pos & ((1 << POS_BITS) - 1);
    let leaf = (u64::from(face) << POS_BITS) + (pos | 1);
    let lsb = lsb_for_level(level.min(MAX_LEVEL));
    Self((leaf & lsb.wrapping_neg()) | lsb)
  }

  /// Reinterpret a stored signed identifier.
  pub fn from_storage(raw: i64) -> Self { Self(raw as u64) }

  /// The signed form used by storage backends.
  pub fn to_storage(self) -> i64 { self.0 as i64 }

  pub fn face(self) -> u8 { (self.0 >> (64 - FACE_BITS)) as u8 }

  fn lsb(self) -> u64 { self.0 & self.0.wrapping_neg() }

  pub fn is_valid(self) -> bool {
    self.face() < NUM_FACES && (self.lsb() & 0x1555_5555_5555_5555) != 0
  }

  /// Subdivision level. Only meaningful for valid identifiers.
  pub fn level(self) -> u8 {
    let zeros = self.0.trailing_zeros().min(2 * u32::from(MAX_LEVEL));
    MAX_LEVEL - (zeros / 2) as u8
  }
}

impl fmt::Display for CellId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:016x}", self.0)
  }
}

fn lsb_for_level(level: u8) -> u64 { 1 << (2 * u32::from(MAX_LEVEL - level)) }

// ─── CellUnion ───────────────────────────────────────────────────────────────

/// An ordered, de-duplicated set of cells approximating an area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellUnion(BTreeSet<CellId>);

impl CellUnion {
  pub fn new() -> Self { Self::default() }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn iter(&self) -> impl Iterator<Item = CellId> + '_ {
    self.0.iter().copied()
  }
}

impl FromIterator<CellId> for CellUnion {
  fn from_iter<I: IntoIterator<Item = CellId>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl<'a> IntoIterator for &'a CellUnion {
  type Item = &'a CellId;
  type IntoIter = std::collections::btree_set::Iter<'a, CellId>;

  fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Converts cell unions to and from the flat identifier list that storage
/// indexes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellCodec {
  max_cells: usize,
  level:     u8,
}

impl CellCodec {
  pub const DEFAULT_LEVEL: u8 = 13;
  pub const DEFAULT_MAX_CELLS: usize = 2_500;

  pub fn new(max_cells: usize, level: u8) -> Self { Self { max_cells, level } }

  pub fn max_cells(&self) -> usize { self.max_cells }

  /// Validate `region` and flatten it into sorted storage identifiers.
  pub fn encode(&self, region: &CellUnion) -> Result<Vec<i64>> {
    if region.is_empty() {
      return Err(Error::EmptyRegion);
    }
    if region.len() > self.max_cells {
      return Err(Error::TooManyCells {
        count: region.len(),
        max:   self.max_cells,
      });
    }

    region
      .iter()
      .map(|cell| {
        if !cell.is_valid() {
          return Err(Error::InvalidCell(cell.0));
        }
        let level = cell.level();
        if level != self.level {
          return Err(Error::CellLevelMismatch {
            id: cell.0,
            level,
            expected: self.level,
          });
        }
        Ok(cell.to_storage())
      })
      .collect()
  }

  /// Rebuild a cell union from stored identifiers.
  pub fn decode(ids: &[i64]) -> CellUnion {
    ids.iter().copied().map(CellId::from_storage).collect()
  }
}

impl Default for CellCodec {
  fn default() -> Self {
    Self::new(Self::DEFAULT_MAX_CELLS, Self::DEFAULT_LEVEL)
  }
}
