//! The `SubscriptionRepo` trait.
//!
//! Implemented by storage backends (e.g. `cellreg-store-sqlite`). Every method
//! takes the handle to run against explicitly, so a repository works the same
//! on a bare connection and inside a transaction the caller has opened. The
//! repository never begins or commits a transaction itself.
//!
//! A lost optimistic-concurrency race is not an error: conditional writes
//! return `Ok(None)` both when the id is unknown and when the stored version
//! no longer matches, and callers re-read and retry.

use uuid::Uuid;

use crate::{
  cells::CellUnion,
  subscription::{Owner, Subscription},
  version::Version,
};

pub trait SubscriptionRepo: Send + Sync {
  /// The execution handle statements run against.
  type Queryable: ?Sized;
  type Error: std::error::Error + Send + Sync + 'static;

  /// Fetch one subscription. `None` if no row has this id.
  fn get_by_id(
    &self,
    q: &Self::Queryable,
    id: Uuid,
  ) -> Result<Option<Subscription>, Self::Error>;

  /// Persist a new subscription. The returned value carries the
  /// storage-assigned version; any version on `sub` is ignored.
  fn insert(
    &self,
    q: &Self::Queryable,
    sub: &Subscription,
  ) -> Result<Subscription, Self::Error>;

  /// Overwrite the mutable fields of `sub` if the stored version still equals
  /// `expected_version`. The owner is never changed.
  fn update(
    &self,
    q: &Self::Queryable,
    sub: &Subscription,
    expected_version: &Version,
  ) -> Result<Option<Subscription>, Self::Error>;

  /// Remove `sub` if the stored version still equals `expected_version`,
  /// returning the row as it was.
  fn delete(
    &self,
    q: &Self::Queryable,
    sub: &Subscription,
    expected_version: &Version,
  ) -> Result<Option<Subscription>, Self::Error>;

  /// Active subscriptions whose cells intersect `region`, capped at the
  /// configured result limit.
  fn search_by_cells(
    &self,
    q: &Self::Queryable,
    region: &CellUnion,
  ) -> Result<Vec<Subscription>, Self::Error>;

  fn search_by_cells_and_owner(
    &self,
    q: &Self::Queryable,
    region: &CellUnion,
    owner: &Owner,
  ) -> Result<Vec<Subscription>, Self::Error>;

  /// The largest number of `owner`'s active subscriptions indexed on any one
  /// cell of `region`; zero when there are none.
  fn count_max_per_cell_by_owner(
    &self,
    q: &Self::Queryable,
    region: &CellUnion,
    owner: &Owner,
  ) -> Result<u64, Self::Error>;

  /// Bump `notification_index` by one on every active subscription
  /// intersecting `region` in a single set-based statement and return the
  /// updated rows.
  fn increment_notification_index_in_cells(
    &self,
    q: &Self::Queryable,
    region: &CellUnion,
  ) -> Result<Vec<Subscription>, Self::Error>;

  /// Subscriptions that ended longer than the grace period ago and belong to
  /// `writer`. An empty writer matches rows with an empty or missing writer.
  fn list_expired(
    &self,
    q: &Self::Queryable,
    writer: &str,
  ) -> Result<Vec<Subscription>, Self::Error>;
}
