//! Tunables shared by every repository implementation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cells::CellCodec;

/// Limits applied by repositories, deserialised from the `[repository]`
/// table of the operator config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
  /// Upper bound on rows returned by a spatial search.
  pub max_result_limit:  u32,
  /// How long past `end_time` a subscription is kept before the cleanup
  /// sweep lists it.
  pub expiry_grace_secs: u64,
  /// Largest cell union accepted for writes and spatial queries.
  pub max_region_cells:  usize,
  /// Level every stored and queried cell must be at.
  pub cell_level:        u8,
}

impl RepoConfig {
  pub fn codec(&self) -> CellCodec {
    CellCodec::new(self.max_region_cells, self.cell_level)
  }

  pub fn expiry_grace(&self) -> Duration {
    Duration::from_secs(self.expiry_grace_secs)
  }
}

impl Default for RepoConfig {
  fn default() -> Self {
    Self {
      max_result_limit:  10_000,
      expiry_grace_secs: 30 * 60,
      max_region_cells:  CellCodec::DEFAULT_MAX_CELLS,
      cell_level:        CellCodec::DEFAULT_LEVEL,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_config_keeps_defaults() {
    let cfg: RepoConfig =
      serde_json::from_str(r#"{ "max_result_limit": 5 }"#).unwrap();
    assert_eq!(cfg.max_result_limit, 5);
    assert_eq!(cfg.expiry_grace(), Duration::from_secs(1800));
    assert_eq!(cfg.codec(), CellCodec::default());
  }
}
