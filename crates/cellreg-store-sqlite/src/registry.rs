//! `SqliteRegistry`, async access to the subscription store.
//!
//! Every call is shipped to the `tokio_rusqlite` connection thread. Reads run
//! directly on the connection; writes run in an `IMMEDIATE` transaction that
//! commits when the repository call succeeds and rolls back otherwise.
//!
//! The selected repository lives behind a lock shared by every clone and is
//! read on the connection thread, so a migration switches all handles at
//! once and every call uses the layout in place when it runs.

use std::{
  path::Path,
  sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU8, Ordering},
  },
  time::Duration,
};

use cellreg_core::{
  cells::CellUnion,
  clock::Clock,
  config::RepoConfig,
  subscription::{Owner, Subscription},
  version::Version,
};
use rusqlite::{Connection, InterruptHandle, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  repo::{self, DynSubscriptionRepo, RepoContext},
  schema::{self, SchemaVersion},
};

/// Connection-level settings, deserialised from the `[store]` table of the
/// operator config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
  pub repository:           RepoConfig,
  /// Wall-clock budget for one registry call, including time spent queued
  /// behind other calls on the connection. SQLite has no server-side
  /// statement timeout. A call still queued at the deadline is skipped; one
  /// already running is interrupted, and may have committed if it was
  /// finishing at that moment.
  pub statement_timeout_ms: Option<u64>,
  /// How long to wait on a lock held by another connection.
  pub busy_timeout_ms:      u64,
  /// Layout to create when the database file is empty.
  pub fresh_schema:         SchemaVersion,
}

impl Default for RegistryConfig {
  fn default() -> Self {
    Self {
      repository:           RepoConfig::default(),
      statement_timeout_ms: Some(30_000),
      busy_timeout_ms:      5_000,
      fresh_schema:         SchemaVersion::default(),
    }
  }
}

/// Outcome of [`SqliteRegistry::sweep_expired`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub listed:  usize,
  pub deleted: Vec<Uuid>,
  /// Rows that changed between listing and deletion.
  pub skipped: usize,
}

struct Selected {
  schema: SchemaVersion,
  repo:   Arc<DynSubscriptionRepo>,
}

type SharedSelected = Arc<RwLock<Selected>>;

fn current(selected: &RwLock<Selected>) -> (SchemaVersion, Arc<DynSubscriptionRepo>) {
  let guard = selected.read().unwrap_or_else(PoisonError::into_inner);
  (guard.schema, Arc::clone(&guard.repo))
}

// Lifecycle of one call on the connection thread.
const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const ABANDONED: u8 = 2;
const FINISHED: u8 = 3;

#[derive(Clone)]
pub struct SqliteRegistry {
  conn:      tokio_rusqlite::Connection,
  selected:  SharedSelected,
  ctx:       RepoContext,
  interrupt: Arc<InterruptHandle>,
  deadline:  Option<Duration>,
}

impl SqliteRegistry {
  /// Open (or create) a registry at `path`.
  pub async fn open(
    path: impl AsRef<Path>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn, config, clock).await
  }

  /// Open an in-memory registry, for tests.
  pub async fn open_in_memory(
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, config, clock).await
  }

  async fn init(
    conn: tokio_rusqlite::Connection,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let busy = Duration::from_millis(config.busy_timeout_ms);
    let fresh = config.fresh_schema;
    let (schema, interrupt) = conn
      .call(move |conn| {
        conn.busy_timeout(busy)?;
        Ok(schema::init(conn, fresh).map(|v| (v, conn.get_interrupt_handle())))
      })
      .await??;

    let span = tracing::info_span!("subscriptions", schema = ?schema);
    let ctx = RepoContext::new(clock, config.repository, span);
    let repo = Arc::from(repo::for_schema(schema, ctx.clone()));
    Ok(Self {
      conn,
      selected: Arc::new(RwLock::new(Selected { schema, repo })),
      ctx,
      interrupt: Arc::new(interrupt),
      deadline: config.statement_timeout_ms.map(Duration::from_millis),
    })
  }

  pub fn schema(&self) -> SchemaVersion { current(&self.selected).0 }

  // ─── Execution ──────────────────────────────────────────────────────────────

  async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
  {
    let Some(deadline) = self.deadline else {
      return self.conn.call(move |conn| Ok(f(conn))).await?;
    };

    let state = Arc::new(AtomicU8::new(QUEUED));
    let call = {
      let state = Arc::clone(&state);
      self.conn.call(move |conn| {
        if state
          .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
          .is_err()
        {
          return Ok(Err(Error::Timeout { op, after: deadline }));
        }
        let out = f(conn);
        state.store(FINISHED, Ordering::Release);
        Ok(out)
      })
    };

    match tokio::time::timeout(deadline, call).await {
      Ok(result) => result?,
      Err(_) => {
        match state.compare_exchange(
          QUEUED,
          ABANDONED,
          Ordering::AcqRel,
          Ordering::Acquire,
        ) {
          Ok(_) => {
            tracing::warn!(parent: self.ctx.span(), op, ?deadline, "deadline exceeded while queued, skipping");
          }
          Err(RUNNING) => {
            self.interrupt.interrupt();
            tracing::warn!(parent: self.ctx.span(), op, ?deadline, "deadline exceeded, interrupting");
          }
          Err(_) => {
            tracing::warn!(parent: self.ctx.span(), op, ?deadline, "deadline exceeded as the call finished");
          }
        }
        Err(Error::Timeout { op, after: deadline })
      }
    }
  }

  async fn read<T, F>(&self, op: &'static str, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&DynSubscriptionRepo, &Connection) -> Result<T> + Send + 'static,
  {
    let selected = Arc::clone(&self.selected);
    self
      .run(op, move |conn| {
        let (_, repo) = current(&selected);
        f(&*repo, conn)
      })
      .await
  }

  async fn write<T, F>(&self, op: &'static str, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&DynSubscriptionRepo, &Connection) -> Result<T> + Send + 'static,
  {
    let selected = Arc::clone(&self.selected);
    self
      .run(op, move |conn| {
        let (_, repo) = current(&selected);
        let tx = conn
          .transaction_with_behavior(TransactionBehavior::Immediate)
          .map_err(Error::sqlite(op, None))?;
        let out = f(&*repo, &tx)?;
        tx.commit().map_err(Error::sqlite(op, None))?;
        Ok(out)
      })
      .await
  }

  /// Run `f` inside one `IMMEDIATE` transaction. Every repository call `f`
  /// makes through the connection it is given commits or rolls back
  /// together.
  pub async fn transaction<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&DynSubscriptionRepo, &Connection) -> Result<T> + Send + 'static,
  {
    self.write("transaction", f).await
  }

  // ─── Subscriptions ──────────────────────────────────────────────────────────

  pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Subscription>> {
    self
      .read("get_by_id", move |repo, q| repo.get_by_id(q, id))
      .await
  }

  pub async fn insert(&self, sub: Subscription) -> Result<Subscription> {
    self.write("insert", move |repo, q| repo.insert(q, &sub)).await
  }

  pub async fn update(
    &self,
    sub: Subscription,
    expected_version: Version,
  ) -> Result<Option<Subscription>> {
    self
      .write("update", move |repo, q| repo.update(q, &sub, &expected_version))
      .await
  }

  pub async fn delete(
    &self,
    sub: Subscription,
    expected_version: Version,
  ) -> Result<Option<Subscription>> {
    self
      .write("delete", move |repo, q| repo.delete(q, &sub, &expected_version))
      .await
  }

  pub async fn search_by_cells(&self, region: CellUnion) -> Result<Vec<Subscription>> {
    self
      .read("search_by_cells", move |repo, q| repo.search_by_cells(q, &region))
      .await
  }

  pub async fn search_by_cells_and_owner(
    &self,
    region: CellUnion,
    owner: Owner,
  ) -> Result<Vec<Subscription>> {
    self
      .read("search_by_cells_and_owner", move |repo, q| {
        repo.search_by_cells_and_owner(q, &region, &owner)
      })
      .await
  }

  pub async fn count_max_per_cell_by_owner(
    &self,
    region: CellUnion,
    owner: Owner,
  ) -> Result<u64> {
    self
      .read("count_max_per_cell_by_owner", move |repo, q| {
        repo.count_max_per_cell_by_owner(q, &region, &owner)
      })
      .await
  }

  pub async fn increment_notification_index_in_cells(
    &self,
    region: CellUnion,
  ) -> Result<Vec<Subscription>> {
    self
      .write("increment_notification_index_in_cells", move |repo, q| {
        repo.increment_notification_index_in_cells(q, &region)
      })
      .await
  }

  pub async fn list_expired(&self, writer: impl Into<String>) -> Result<Vec<Subscription>> {
    let writer = writer.into();
    self
      .read("list_expired", move |repo, q| repo.list_expired(q, &writer))
      .await
  }

  // ─── Maintenance ────────────────────────────────────────────────────────────

  /// Delete every subscription [`list_expired`](Self::list_expired) reports
  /// for `writer`, each guarded by the version it was listed with.
  pub async fn sweep_expired(&self, writer: impl Into<String>) -> Result<SweepReport> {
    let writer = writer.into();
    let report = self
      .write("sweep_expired", move |repo, q| {
        let expired = repo.list_expired(q, &writer)?;
        let mut report = SweepReport { listed: expired.len(), ..Default::default() };
        for sub in &expired {
          let Some(version) = &sub.version else {
            report.skipped += 1;
            continue;
          };
          match repo.delete(q, sub, version)? {
            Some(_) => report.deleted.push(sub.id),
            None => report.skipped += 1,
          }
        }
        Ok(report)
      })
      .await?;
    tracing::info!(
      parent: self.ctx.span(),
      listed = report.listed,
      deleted = report.deleted.len(),
      skipped = report.skipped,
      "swept expired subscriptions"
    );
    Ok(report)
  }

  /// Convert a `CellTable` database to `CellArray` and switch this handle,
  /// and every clone of it, to the matching repository.
  pub async fn migrate(&self) -> Result<SchemaVersion> {
    let selected = Arc::clone(&self.selected);
    let ctx = self.ctx.clone();
    self
      .run("migrate", move |conn| {
        let schema = schema::migrate_to_cell_array(conn)?;
        let mut guard = selected.write().unwrap_or_else(PoisonError::into_inner);
        if guard.schema != schema {
          *guard = Selected {
            schema,
            repo: Arc::from(repo::for_schema(schema, ctx)),
          };
        }
        Ok(schema)
      })
      .await
  }
}
