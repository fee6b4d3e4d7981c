//! SQLite-backed checkpoint store.
//!
//! All components treat a completed save as the point of commit: decisions
//! made in memory before a successful save are tentative and safe to
//! recompute after a crash. Run rows carry a monotonically increasing
//! version; a save with a stale expected version is rejected, which forces
//! the caller to re-read and retry its transition.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{NotificationRecord, PipelineRun, ReviewAssignment, RunStatus};

/// Async-safe handle to the checkpoint store.
///
/// Wraps `CheckpointStore` behind `Arc<Mutex>` and runs all access on
/// tokio's blocking thread pool via `spawn_blocking`, keeping synchronous
/// SQLite I/O off async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<CheckpointStore>>,
}

impl StoreHandle {
    pub fn new(store: CheckpointStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&CheckpointStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| StoreError::Database(anyhow!("store lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow!("store task panicked: {}", e)))?
    }

    /// Load a run, apply a pure mutation, and save it under the optimistic
    /// concurrency guard. On a version conflict the transition is recomputed
    /// from freshly loaded state, up to a bounded number of retries.
    pub async fn update_run<F>(
        &self,
        id: Uuid,
        now: chrono::DateTime<chrono::Utc>,
        mutate: F,
    ) -> Result<PipelineRun, StoreError>
    where
        F: Fn(&mut PipelineRun) -> Result<(), StoreError> + Send + Sync + Clone + 'static,
    {
        self.update_run_inner(id, now, false, mutate).await
    }

    /// Like [`StoreHandle::update_run`], but the mutation only applies while
    /// the run is still `running`. A run that left that status between the
    /// caller's read and this write (cancelled, escalated) is returned
    /// untouched, with no save and no version bump, so an in-flight stage
    /// wave can never overwrite a terminal disposition.
    pub async fn update_run_if_running<F>(
        &self,
        id: Uuid,
        now: chrono::DateTime<chrono::Utc>,
        mutate: F,
    ) -> Result<PipelineRun, StoreError>
    where
        F: Fn(&mut PipelineRun) -> Result<(), StoreError> + Send + Sync + Clone + 'static,
    {
        self.update_run_inner(id, now, true, mutate).await
    }

    async fn update_run_inner<F>(
        &self,
        id: Uuid,
        now: chrono::DateTime<chrono::Utc>,
        require_running: bool,
        mutate: F,
    ) -> Result<PipelineRun, StoreError>
    where
        F: Fn(&mut PipelineRun) -> Result<(), StoreError> + Send + Sync + Clone + 'static,
    {
        const MAX_RETRIES: u32 = 5;
        let mut last_err = StoreError::RunNotFound { id };

        for _ in 0..MAX_RETRIES {
            let mut run = self.call(move |s| s.load_run(id)).await?;
            if require_running && run.status != RunStatus::Running {
                return Ok(run);
            }
            mutate(&mut run)?;
            let expected = run.version;
            run.version = expected + 1;
            run.updated_at = now;

            let saved = run.clone();
            match self.call(move |s| s.save_run(&saved, expected)).await {
                Ok(()) => return Ok(run),
                Err(StoreError::VersionConflict {
                    id,
                    expected,
                    stored,
                }) => {
                    last_err = StoreError::VersionConflict {
                        id,
                        expected,
                        stored,
                    };
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }
}

pub struct CheckpointStore {
    conn: Connection,
}

impl CheckpointStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    state TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS assignments (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    ord INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    state TEXT NOT NULL,
                    UNIQUE(run_id, ord)
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    assignment_id TEXT,
                    kind TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    recipient TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    attempt INTEGER NOT NULL,
                    sent_at TEXT NOT NULL,
                    error TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_assignments_run ON assignments(run_id);
                CREATE INDEX IF NOT EXISTS idx_assignments_status ON assignments(status);
                CREATE INDEX IF NOT EXISTS idx_notifications_assignment
                    ON notifications(assignment_id, attempt);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn db_err(e: impl std::error::Error + Send + Sync + 'static) -> StoreError {
        StoreError::Database(anyhow!(e))
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Insert a freshly submitted run. The run must be at version 1.
    pub fn create_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let state = serde_json::to_string(run).map_err(Self::db_err)?;
        self.conn
            .execute(
                "INSERT INTO runs (id, version, status, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id.to_string(),
                    run.version as i64,
                    run.status.as_str(),
                    state,
                    run.created_at.to_rfc3339(),
                    run.updated_at.to_rfc3339(),
                ],
            )
            .map_err(Self::db_err)?;
        Ok(())
    }

    /// Persist a mutated run, guarded by optimistic concurrency.
    ///
    /// `expected_version` is the version the caller loaded; the run being
    /// saved must carry `expected_version + 1`. If the stored version moved
    /// in the meantime the write is rejected whole and the caller must
    /// reload and recompute its transition.
    pub fn save_run(&self, run: &PipelineRun, expected_version: u64) -> Result<(), StoreError> {
        let state = serde_json::to_string(run).map_err(Self::db_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET version = ?1, status = ?2, state = ?3, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    run.version as i64,
                    run.status.as_str(),
                    state,
                    run.updated_at.to_rfc3339(),
                    run.id.to_string(),
                    expected_version as i64,
                ],
            )
            .map_err(Self::db_err)?;

        if changed == 1 {
            return Ok(());
        }

        let stored: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM runs WHERE id = ?1",
                params![run.id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Self::db_err)?;

        match stored {
            Some(stored) => Err(StoreError::VersionConflict {
                id: run.id,
                expected: expected_version,
                stored: stored as u64,
            }),
            None => Err(StoreError::RunNotFound { id: run.id }),
        }
    }

    pub fn load_run(&self, id: Uuid) -> Result<PipelineRun, StoreError> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Self::db_err)?;

        let state = state.ok_or(StoreError::RunNotFound { id })?;
        serde_json::from_str(&state).map_err(Self::db_err)
    }

    /// Ids of all runs in the given status. The sweep uses this to find
    /// chains to repair and revision-reset runs to resume.
    pub fn runs_with_status(&self, status: RunStatus) -> Result<Vec<Uuid>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM runs WHERE status = ?1")
            .map_err(Self::db_err)?;
        let rows = stmt
            .query_map(params![status.as_str()], |row| row.get::<_, String>(0))
            .map_err(Self::db_err)?;

        let mut ids = Vec::new();
        for row in rows {
            let id = row.map_err(Self::db_err)?;
            ids.push(id.parse().map_err(Self::db_err)?);
        }
        Ok(ids)
    }

    // ── Assignments ───────────────────────────────────────────────────

    /// Insert the full approval chain for a run. The `UNIQUE(run_id, ord)`
    /// constraint enforces the no-gaps-no-duplicates order invariant.
    pub fn insert_assignments(&self, assignments: &[ReviewAssignment]) -> Result<(), StoreError> {
        for a in assignments {
            let state = serde_json::to_string(a).map_err(Self::db_err)?;
            self.conn
                .execute(
                    "INSERT INTO assignments (id, run_id, ord, status, state)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        a.id.to_string(),
                        a.run_id.to_string(),
                        a.ord,
                        a.status.as_str(),
                        state,
                    ],
                )
                .map_err(Self::db_err)?;
        }
        Ok(())
    }

    /// Unconditional assignment write, used only when (re)starting a chain,
    /// where resolved rows are deliberately reset. Slot transitions during
    /// review go through [`CheckpointStore::update_active_assignment`] or
    /// [`CheckpointStore::activate_assignment`] instead.
    pub fn update_assignment(&self, assignment: &ReviewAssignment) -> Result<(), StoreError> {
        let state = serde_json::to_string(assignment).map_err(Self::db_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE assignments SET status = ?1, state = ?2 WHERE id = ?3",
                params![
                    assignment.status.as_str(),
                    state,
                    assignment.id.to_string()
                ],
            )
            .map_err(Self::db_err)?;
        if changed == 0 {
            return Err(StoreError::AssignmentNotFound { id: assignment.id });
        }
        Ok(())
    }

    /// Persist a transition of an assignment that is still active (pending
    /// or held). The precondition is part of the UPDATE, so when a human
    /// decision and the sweep race for the same slot, exactly one write
    /// lands and the other gets `AssignmentConflict` instead of silently
    /// overwriting a recorded resolution.
    pub fn update_active_assignment(&self, assignment: &ReviewAssignment) -> Result<(), StoreError> {
        let state = serde_json::to_string(assignment).map_err(Self::db_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE assignments SET status = ?1, state = ?2
                 WHERE id = ?3 AND status IN ('pending', 'held')",
                params![
                    assignment.status.as_str(),
                    state,
                    assignment.id.to_string()
                ],
            )
            .map_err(Self::db_err)?;
        if changed == 1 {
            return Ok(());
        }
        self.assignment_write_rejected(assignment.id)
    }

    /// Claim a queued slot for activation. Predicated on the row still being
    /// queued, so two concurrent activations cannot both claim it.
    pub fn activate_assignment(&self, assignment: &ReviewAssignment) -> Result<(), StoreError> {
        let state = serde_json::to_string(assignment).map_err(Self::db_err)?;
        let changed = self
            .conn
            .execute(
                "UPDATE assignments SET status = ?1, state = ?2
                 WHERE id = ?3 AND status = 'queued'",
                params![
                    assignment.status.as_str(),
                    state,
                    assignment.id.to_string()
                ],
            )
            .map_err(Self::db_err)?;
        if changed == 1 {
            return Ok(());
        }
        self.assignment_write_rejected(assignment.id)
    }

    fn assignment_write_rejected(&self, id: Uuid) -> Result<(), StoreError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM assignments WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Self::db_err)?;
        match exists {
            Some(_) => Err(StoreError::AssignmentConflict { id }),
            None => Err(StoreError::AssignmentNotFound { id }),
        }
    }

    pub fn load_assignment(&self, id: Uuid) -> Result<ReviewAssignment, StoreError> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM assignments WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Self::db_err)?;

        let state = state.ok_or(StoreError::AssignmentNotFound { id })?;
        serde_json::from_str(&state).map_err(Self::db_err)
    }

    /// All assignments for a run, ordered by chain position.
    pub fn load_assignments(&self, run_id: Uuid) -> Result<Vec<ReviewAssignment>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state FROM assignments WHERE run_id = ?1 ORDER BY ord")
            .map_err(Self::db_err)?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(Self::db_err)?;

        let mut assignments = Vec::new();
        for row in rows {
            let state = row.map_err(Self::db_err)?;
            assignments.push(serde_json::from_str(&state).map_err(Self::db_err)?);
        }
        Ok(assignments)
    }

    /// Assignments across all runs that a `tick()` sweep must inspect.
    pub fn active_assignments(&self) -> Result<Vec<ReviewAssignment>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state FROM assignments WHERE status IN ('pending', 'held') ORDER BY run_id, ord")
            .map_err(Self::db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(Self::db_err)?;

        let mut assignments = Vec::new();
        for row in rows {
            let state = row.map_err(Self::db_err)?;
            assignments.push(serde_json::from_str(&state).map_err(Self::db_err)?);
        }
        Ok(assignments)
    }

    // ── Notification ledger ───────────────────────────────────────────

    /// Append one delivery attempt to the ledger. Never updated or deleted.
    pub fn append_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO notifications
                 (run_id, assignment_id, kind, channel, recipient, success, attempt, sent_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.run_id.to_string(),
                    record.assignment_id.map(|id| id.to_string()),
                    record.kind.as_str(),
                    record.channel,
                    record.recipient,
                    record.success,
                    record.attempt,
                    record.sent_at.to_rfc3339(),
                    record.error,
                ],
            )
            .map_err(Self::db_err)?;
        Ok(())
    }

    pub fn load_notifications(&self, run_id: Uuid) -> Result<Vec<NotificationRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, assignment_id, kind, channel, recipient, success, attempt, sent_at, error
                 FROM notifications WHERE run_id = ?1 ORDER BY id",
            )
            .map_err(Self::db_err)?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(Self::db_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (run_id, assignment_id, kind, channel, recipient, success, attempt, sent_at, error) =
                row.map_err(Self::db_err)?;
            records.push(NotificationRecord {
                run_id: run_id.parse().map_err(Self::db_err)?,
                assignment_id: assignment_id
                    .map(|s| s.parse())
                    .transpose()
                    .map_err(Self::db_err)?,
                kind: kind
                    .parse()
                    .map_err(|e: String| StoreError::Database(anyhow!(e)))?,
                channel,
                recipient,
                success,
                attempt,
                sent_at: chrono::DateTime::parse_from_rfc3339(&sent_at)
                    .map_err(Self::db_err)?
                    .with_timezone(&chrono::Utc),
                error,
            });
        }
        Ok(records)
    }
}
