//! Embedded SQLite adapter for the run store
//!
//! Document-database layout on an embedded engine: each entity row carries
//! a canonical JSON document, with the fields the required indices cover
//! extracted into dedicated columns. WAL journaling keeps the append-only
//! event log from blocking reads; every state transition runs inside one
//! immediate transaction, which is what makes claim/renew/release behave
//! as single compare-and-set steps even across worker processes sharing
//! the database file.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::entities::{
    AgentOutput, EventKind, EventQuery, EventRecord, NewEvent, Run, RunArtifacts, RunError,
    RunFilter, RunPhase, RunStatus, Study, Summary, SummaryFields,
};
use crate::error::StoreError;
use crate::store::{
    CancelOutcome, LeaseOutcome, PhaseUpdate, ReleaseOutcome, ReleaseRequest, RunStore,
};

/// Schema version stamped into `user_version`.
const SCHEMA_VERSION: i64 = 1;
/// Busy timeout for cross-process contention (ms).
const BUSY_TIMEOUT_MS: u64 = 5_000;
/// Default row cap for `list_runs`.
const DEFAULT_LIST_LIMIT: u32 = 100;
/// Default row cap for `get_events`.
const DEFAULT_EVENT_LIMIT: u32 = 1_000;

/// Mutable portion of a run row that stays in the JSON document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RunDoc {
    #[serde(default)]
    artifacts: RunArtifacts,
    #[serde(default)]
    error: Option<RunError>,
}

/// Durable [`RunStore`] backed by a single SQLite database file.
#[derive(Debug)]
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    /// Open (or create) a store from the configured location.
    ///
    /// `location` accepts a filesystem path, a `file:` URI, or a directory
    /// (in which case `db_name` selects the file stem inside it). Remote
    /// URIs such as `mongodb://` are rejected; this build ships the
    /// embedded adapter only.
    ///
    /// # Errors
    ///
    /// `Rejected` for unusable locations, `Backend` for SQLite open or
    /// schema failures.
    pub fn open(location: &str, db_name: &str) -> Result<Self, StoreError> {
        if location.contains("://") && !location.starts_with("file://") {
            return Err(StoreError::Rejected {
                reason: format!(
                    "'{location}' is not a local path; this build uses the embedded store adapter"
                ),
            });
        }
        let raw = location.strip_prefix("file://").unwrap_or(location);
        let mut path = Utf8PathBuf::from(raw);
        if path.as_str().is_empty() {
            return Err(StoreError::Rejected { reason: "empty store location".to_string() });
        }
        if path.is_dir() {
            path.push(format!("{db_name}.db"));
        }
        Self::open_path(&path)
    }

    /// Open (or create) a store at an explicit database file path.
    ///
    /// # Errors
    ///
    /// `Backend` when the file cannot be opened or migrated.
    pub fn open_path(path: &Utf8Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_std_path())?;
        init_connection(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory store for tests and ephemeral tooling.
    ///
    /// # Errors
    ///
    /// `Backend` on schema failures.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_connection(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a closure against the connection on the blocking pool.
    ///
    /// SQLite work is synchronous and must not run on the async executor.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Corrupt { reason: "store mutex poisoned".to_string() })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Corrupt { reason: format!("store task failed: {e}") })?
    }
}

fn init_connection(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal")?;
    conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS as i64)?;
    conn.pragma_update(None, "foreign_keys", "on")?;
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version == 0 {
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if version != SCHEMA_VERSION {
        return Err(StoreError::Rejected {
            reason: format!("unsupported store schema version {version} (want {SCHEMA_VERSION})"),
        });
    }
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS studies (
    spec_hash      TEXT PRIMARY KEY,
    canonical_spec TEXT NOT NULL,
    created_at     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id           TEXT PRIMARY KEY,
    spec_hash        TEXT NOT NULL REFERENCES studies(spec_hash),
    status           TEXT NOT NULL,
    phase            TEXT NOT NULL,
    attempt          INTEGER NOT NULL DEFAULT 0,
    claimed_by       TEXT,
    lease_expires_at INTEGER,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at       INTEGER NOT NULL,
    started_at       INTEGER,
    ended_at         INTEGER,
    doc              TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_status_created ON runs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_spec_created   ON runs(spec_hash, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_lease          ON runs(lease_expires_at);
CREATE INDEX IF NOT EXISTS idx_runs_phase_status   ON runs(phase, status);

CREATE TABLE IF NOT EXISTS summaries (
    run_id       TEXT PRIMARY KEY REFERENCES runs(run_id),
    doc          TEXT NOT NULL,
    extracted_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id  TEXT NOT NULL,
    ts      INTEGER NOT NULL,
    kind    TEXT NOT NULL,
    agent   TEXT,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_run_ts  ON events(run_id, ts);
CREATE INDEX IF NOT EXISTS idx_events_kind_ts ON events(kind, ts);

CREATE TABLE IF NOT EXISTS agent_outputs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id         TEXT NOT NULL,
    agent          TEXT NOT NULL,
    kind           TEXT NOT NULL,
    data           TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    ts             INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_outputs ON agent_outputs(run_id, agent, kind, ts);
";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn status_from_str(s: &str) -> Result<RunStatus, StoreError> {
    match s {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "succeeded" => Ok(RunStatus::Succeeded),
        "failed" => Ok(RunStatus::Failed),
        other => Err(StoreError::Corrupt { reason: format!("unknown run status '{other}'") }),
    }
}

fn phase_from_str(s: &str) -> Result<RunPhase, StoreError> {
    match s {
        "bundle" => Ok(RunPhase::Bundle),
        "execute" => Ok(RunPhase::Execute),
        "extract" => Ok(RunPhase::Extract),
        "done" => Ok(RunPhase::Done),
        other => Err(StoreError::Corrupt { reason: format!("unknown run phase '{other}'") }),
    }
}

/// Column list shared by every run SELECT so row mapping stays in sync.
const RUN_COLUMNS: &str = "run_id, spec_hash, status, phase, attempt, claimed_by, \
     lease_expires_at, cancel_requested, created_at, started_at, ended_at, doc";

fn run_from_row(row: &rusqlite::Row<'_>) -> Result<Run, StoreError> {
    let status: String = row.get(2)?;
    let phase: String = row.get(3)?;
    let doc_text: String = row.get(11)?;
    let doc: RunDoc = serde_json::from_str(&doc_text)
        .map_err(|e| StoreError::Corrupt { reason: format!("run document: {e}") })?;
    Ok(Run {
        run_id: row.get(0)?,
        spec_hash: row.get(1)?,
        status: status_from_str(&status)?,
        phase: phase_from_str(&phase)?,
        attempt: row.get::<_, i64>(4)? as u32,
        claimed_by: row.get(5)?,
        lease_expires_at: row.get::<_, Option<i64>>(6)?.map(ms_to_dt),
        cancel_requested: row.get::<_, i64>(7)? != 0,
        created_at: ms_to_dt(row.get(8)?),
        started_at: row.get::<_, Option<i64>>(9)?.map(ms_to_dt),
        ended_at: row.get::<_, Option<i64>>(10)?.map(ms_to_dt),
        artifacts: doc.artifacts,
        error: doc.error,
    })
}

fn get_run_tx(tx: &Transaction<'_>, run_id: &str) -> Result<Run, StoreError> {
    tx.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
        [run_id],
        |row| Ok(run_from_row(row)),
    )
    .optional()?
    .ok_or_else(|| StoreError::run_not_found(run_id))?
}

fn write_run_doc(tx: &Transaction<'_>, run_id: &str, run: &Run) -> Result<(), StoreError> {
    let doc = RunDoc { artifacts: run.artifacts.clone(), error: run.error.clone() };
    let text = serde_json::to_string(&doc)
        .map_err(|e| StoreError::Corrupt { reason: format!("run document: {e}") })?;
    tx.execute("UPDATE runs SET doc = ?2 WHERE run_id = ?1", params![run_id, text])?;
    Ok(())
}

/// Append one event inside an open transaction.
///
/// Event timestamps are strictly monotone per run: a burst of appends in
/// the same millisecond gets consecutive timestamps instead of ties.
fn append_event_tx(
    tx: &Transaction<'_>,
    run_id: &str,
    kind: &str,
    agent: Option<&str>,
    payload: serde_json::Value,
) -> Result<EventRecord, StoreError> {
    let last: i64 = tx.query_row(
        "SELECT COALESCE(MAX(ts), 0) FROM events WHERE run_id = ?1",
        [run_id],
        |row| row.get(0),
    )?;
    let ts = now_ms().max(last + 1);
    tx.execute(
        "INSERT INTO events (run_id, ts, kind, agent, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![run_id, ts, kind, agent, payload.to_string()],
    )?;
    Ok(EventRecord {
        seq: tx.last_insert_rowid(),
        run_id: run_id.to_string(),
        ts: ms_to_dt(ts),
        kind: kind.to_string(),
        agent: agent.map(str::to_string),
        payload,
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> Result<EventRecord, StoreError> {
    let payload_text: String = row.get(5)?;
    let payload = serde_json::from_str(&payload_text)
        .map_err(|e| StoreError::Corrupt { reason: format!("event payload: {e}") })?;
    Ok(EventRecord {
        seq: row.get(0)?,
        run_id: row.get(1)?,
        ts: ms_to_dt(row.get(2)?),
        kind: row.get(3)?,
        agent: row.get(4)?,
        payload,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn upsert_study(
        &self,
        spec_hash: &str,
        canonical_spec: &str,
    ) -> Result<Study, StoreError> {
        let spec_hash = spec_hash.to_string();
        let canonical_spec = canonical_spec.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO studies (spec_hash, canonical_spec, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![spec_hash, canonical_spec, now_ms()],
            )?;
            let study = tx.query_row(
                "SELECT spec_hash, canonical_spec, created_at FROM studies WHERE spec_hash = ?1",
                [&spec_hash],
                |row| {
                    Ok(Study {
                        spec_hash: row.get(0)?,
                        canonical_spec: row.get(1)?,
                        created_at: ms_to_dt(row.get(2)?),
                    })
                },
            )?;
            tx.commit()?;
            Ok(study)
        })
        .await
    }

    async fn get_study(&self, spec_hash: &str) -> Result<Study, StoreError> {
        let spec_hash = spec_hash.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT spec_hash, canonical_spec, created_at FROM studies WHERE spec_hash = ?1",
                [&spec_hash],
                |row| {
                    Ok(Study {
                        spec_hash: row.get(0)?,
                        canonical_spec: row.get(1)?,
                        created_at: ms_to_dt(row.get(2)?),
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "study", id: spec_hash })
        })
        .await
    }

    async fn create_run(
        &self,
        run_id: &str,
        spec_hash: &str,
    ) -> Result<(Run, EventRecord), StoreError> {
        let run_id = run_id.to_string();
        let spec_hash = spec_hash.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let study_exists: bool = tx
                .query_row("SELECT 1 FROM studies WHERE spec_hash = ?1", [&spec_hash], |_| Ok(()))
                .optional()?
                .is_some();
            if !study_exists {
                return Err(StoreError::NotFound { entity: "study", id: spec_hash });
            }
            let doc = serde_json::to_string(&RunDoc::default())
                .map_err(|e| StoreError::Corrupt { reason: e.to_string() })?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO runs \
                 (run_id, spec_hash, status, phase, attempt, cancel_requested, created_at, doc) \
                 VALUES (?1, ?2, 'queued', 'bundle', 0, 0, ?3, ?4)",
                params![run_id, spec_hash, now_ms(), doc],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict {
                    reason: format!("run '{run_id}' already exists"),
                });
            }
            let event = append_event_tx(
                &tx,
                &run_id,
                EventKind::RunCreated.as_str(),
                None,
                serde_json::json!({ "spec_hash": spec_hash }),
            )?;
            let run = get_run_tx(&tx, &run_id)?;
            tx.commit()?;
            Ok((run, event))
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                [&run_id],
                |row| Ok(run_from_row(row)),
            )
            .optional()?
            .ok_or_else(|| StoreError::run_not_found(&run_id))?
        })
        .await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1=1");
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            if let Some(spec_hash) = &filter.spec_hash {
                sql.push_str(" AND spec_hash = ?");
                args.push(Box::new(spec_hash.clone()));
            }
            if let Some(since) = filter.since {
                sql.push_str(" AND created_at >= ?");
                args.push(Box::new(since.timestamp_millis()));
            }
            sql.push_str(" ORDER BY created_at DESC, run_id DESC LIMIT ?");
            args.push(Box::new(i64::from(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT))));

            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
            let rows = stmt.query_map(params, |row| Ok(run_from_row(row)))?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(row??);
            }
            Ok(runs)
        })
        .await
    }

    async fn update_run_phase(
        &self,
        run_id: &str,
        update: PhaseUpdate,
    ) -> Result<(Run, EventRecord), StoreError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut run = get_run_tx(&tx, &run_id)?;
            if run.status != RunStatus::Running {
                return Err(StoreError::InvalidTransition {
                    reason: format!(
                        "run '{run_id}' is {}, phase updates require running",
                        run.status.as_str()
                    ),
                });
            }
            if run.phase.next() != Some(update.phase) {
                return Err(StoreError::InvalidTransition {
                    reason: format!(
                        "phase {} does not follow {} for run '{run_id}'",
                        update.phase.as_str(),
                        run.phase.as_str()
                    ),
                });
            }
            if update.phase == RunPhase::Done {
                return Err(StoreError::InvalidTransition {
                    reason: "phase done is only reachable through release".to_string(),
                });
            }
            run.artifacts.apply(&update.artifacts);
            run.phase = update.phase;
            tx.execute(
                "UPDATE runs SET phase = ?2 WHERE run_id = ?1",
                params![run_id, update.phase.as_str()],
            )?;
            write_run_doc(&tx, &run_id, &run)?;
            let event = append_event_tx(
                &tx,
                &run_id,
                EventKind::PhaseChanged.as_str(),
                None,
                serde_json::json!({
                    "phase": update.phase.as_str(),
                    "status": run.status.as_str(),
                }),
            )?;
            tx.commit()?;
            Ok((run, event))
        })
        .await
    }

    async fn insert_summary(
        &self,
        run_id: &str,
        fields: &SummaryFields,
    ) -> Result<(Summary, EventRecord), StoreError> {
        let run_id = run_id.to_string();
        let fields = fields.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // Referential check first so a bad run id reads as NotFound,
            // not a foreign key constraint.
            get_run_tx(&tx, &run_id)?;
            let extracted_ms = now_ms();
            let summary = Summary {
                run_id: run_id.clone(),
                keff: fields.keff,
                keff_std: fields.keff_std,
                keff_uncertainty_pcm: fields.uncertainty_pcm(),
                n_batches: fields.n_batches,
                n_inactive: fields.n_inactive,
                n_particles: fields.n_particles,
                extracted_at: ms_to_dt(extracted_ms),
            };
            let doc = serde_json::to_string(&summary)
                .map_err(|e| StoreError::Corrupt { reason: e.to_string() })?;
            tx.execute(
                "INSERT INTO summaries (run_id, doc, extracted_at) VALUES (?1, ?2, ?3)",
                params![run_id, doc, extracted_ms],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Conflict { reason: format!("summary for '{run_id}' exists") }
                } else {
                    StoreError::Backend(e)
                }
            })?;
            let event = append_event_tx(
                &tx,
                &run_id,
                EventKind::SummaryExtracted.as_str(),
                None,
                serde_json::json!({ "keff": fields.keff, "keff_std": fields.keff_std }),
            )?;
            tx.commit()?;
            Ok((summary, event))
        })
        .await
    }

    async fn get_summary(&self, run_id: &str) -> Result<Option<Summary>, StoreError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let doc: Option<String> = conn
                .query_row("SELECT doc FROM summaries WHERE run_id = ?1", [&run_id], |row| {
                    row.get(0)
                })
                .optional()?;
            doc.map(|text| {
                serde_json::from_str(&text)
                    .map_err(|e| StoreError::Corrupt { reason: format!("summary document: {e}") })
            })
            .transpose()
        })
        .await
    }

    async fn append_events(
        &self,
        run_id: &str,
        events: &[NewEvent],
    ) -> Result<Vec<EventRecord>, StoreError> {
        let run_id = run_id.to_string();
        let events = events.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut records = Vec::with_capacity(events.len());
            for event in events {
                records.push(append_event_tx(
                    &tx,
                    &run_id,
                    &event.kind,
                    event.agent.as_deref(),
                    event.payload,
                )?);
            }
            tx.commit()?;
            Ok(records)
        })
        .await
    }

    async fn get_events(
        &self,
        run_id: &str,
        query: &EventQuery,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let run_id = run_id.to_string();
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut sql =
                "SELECT seq, run_id, ts, kind, agent, payload FROM events WHERE run_id = ?"
                    .to_string();
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(run_id)];
            if let Some(since) = query.since {
                sql.push_str(" AND ts >= ?");
                args.push(Box::new(since.timestamp_millis()));
            }
            if let Some(kind) = &query.kind {
                sql.push_str(" AND kind = ?");
                args.push(Box::new(kind.clone()));
            }
            sql.push_str(" ORDER BY seq ASC LIMIT ?");
            args.push(Box::new(i64::from(query.limit.unwrap_or(DEFAULT_EVENT_LIMIT))));

            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
            let rows = stmt.query_map(params, |row| Ok(event_from_row(row)))?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row??);
            }
            Ok(records)
        })
        .await
    }

    async fn insert_agent_output(
        &self,
        run_id: &str,
        agent: &str,
        kind: &str,
        data: serde_json::Value,
        schema_version: u32,
    ) -> Result<AgentOutput, StoreError> {
        let run_id = run_id.to_string();
        let agent = agent.to_string();
        let kind = kind.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            get_run_tx(&tx, &run_id)?;
            let ts = now_ms();
            tx.execute(
                "INSERT INTO agent_outputs (run_id, agent, kind, data, schema_version, ts) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, agent, kind, data.to_string(), schema_version, ts],
            )?;
            tx.commit()?;
            Ok(AgentOutput { run_id, agent, kind, data, schema_version, ts: ms_to_dt(ts) })
        })
        .await
    }

    async fn get_agent_outputs(&self, run_id: &str) -> Result<Vec<AgentOutput>, StoreError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, agent, kind, data, schema_version, ts FROM agent_outputs \
                 WHERE run_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([&run_id], |row| {
                let data_text: String = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    data_text,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;
            let mut outputs = Vec::new();
            for row in rows {
                let (run_id, agent, kind, data_text, schema_version, ts) = row?;
                let data = serde_json::from_str(&data_text).map_err(|e| StoreError::Corrupt {
                    reason: format!("agent output payload: {e}"),
                })?;
                outputs.push(AgentOutput {
                    run_id,
                    agent,
                    kind,
                    data,
                    schema_version: schema_version as u32,
                    ts: ms_to_dt(ts),
                });
            }
            Ok(outputs)
        })
        .await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<(Run, EventRecord)>, StoreError> {
        let worker_id = worker_id.to_string();
        let ttl_ms = lease_ttl.as_millis() as i64;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms();
            let candidate: Option<String> = tx
                .query_row(
                    "SELECT run_id FROM runs \
                     WHERE status = 'queued' \
                        OR (status = 'running' AND lease_expires_at <= ?1) \
                     ORDER BY created_at ASC, run_id ASC LIMIT 1",
                    [now],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(run_id) = candidate else {
                return Ok(None);
            };
            // The immediate transaction already holds the write lock, so
            // the predicate re-check in the UPDATE cannot lose a race; it
            // stays as a guard against adapter misuse.
            let changed = tx.execute(
                "UPDATE runs SET status = 'running', claimed_by = ?2, lease_expires_at = ?3, \
                 attempt = attempt + 1, started_at = COALESCE(started_at, ?4) \
                 WHERE run_id = ?1 \
                   AND (status = 'queued' OR (status = 'running' AND lease_expires_at <= ?4))",
                params![run_id, worker_id, now + ttl_ms, now],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let run = get_run_tx(&tx, &run_id)?;
            let event = append_event_tx(
                &tx,
                &run_id,
                EventKind::RunClaimed.as_str(),
                None,
                serde_json::json!({
                    "worker_id": worker_id,
                    "attempt": run.attempt,
                    "lease_ttl_seconds": lease_ttl.as_secs(),
                }),
            )?;
            tx.commit()?;
            Ok(Some((run, event)))
        })
        .await
    }

    async fn renew_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        let run_id = run_id.to_string();
        let worker_id = worker_id.to_string();
        let ttl_ms = lease_ttl.as_millis() as i64;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expires = now_ms() + ttl_ms;
            let changed = tx.execute(
                "UPDATE runs SET lease_expires_at = ?3 \
                 WHERE run_id = ?1 AND claimed_by = ?2 AND status = 'running'",
                params![run_id, worker_id, expires],
            )?;
            if changed == 0 {
                // Distinguish a vanished run from a reassigned one.
                get_run_tx(&tx, &run_id)?;
                return Ok(LeaseOutcome::Stolen);
            }
            let event = append_event_tx(
                &tx,
                &run_id,
                EventKind::LeaseRenewed.as_str(),
                None,
                serde_json::json!({ "worker_id": worker_id, "lease_expires_at": expires }),
            )?;
            tx.commit()?;
            Ok(LeaseOutcome::Renewed(event))
        })
        .await
    }

    async fn release(
        &self,
        run_id: &str,
        worker_id: &str,
        request: ReleaseRequest,
    ) -> Result<ReleaseOutcome, StoreError> {
        if !request.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                reason: format!("release requires a terminal status, got {}", request.status.as_str()),
            });
        }
        if request.status == RunStatus::Failed && request.error.is_none() {
            return Err(StoreError::InvalidTransition {
                reason: "failed release requires a structured error".to_string(),
            });
        }
        let run_id = run_id.to_string();
        let worker_id = worker_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut run = get_run_tx(&tx, &run_id)?;
            if run.status != RunStatus::Running || run.claimed_by.as_deref() != Some(&worker_id) {
                return Ok(ReleaseOutcome::Stolen);
            }
            let ended = now_ms();
            run.status = request.status;
            run.phase = RunPhase::Done;
            run.claimed_by = None;
            run.lease_expires_at = None;
            run.ended_at = Some(ms_to_dt(ended));
            run.artifacts.apply(&request.artifacts);
            run.error = request.error.clone();
            tx.execute(
                "UPDATE runs SET status = ?2, phase = 'done', claimed_by = NULL, \
                 lease_expires_at = NULL, ended_at = ?3 WHERE run_id = ?1",
                params![run_id, request.status.as_str(), ended],
            )?;
            write_run_doc(&tx, &run_id, &run)?;
            let error_kind = request
                .error
                .as_ref()
                .map(|e| serde_json::to_value(e.kind).unwrap_or(serde_json::Value::Null));
            let event = append_event_tx(
                &tx,
                &run_id,
                EventKind::RunReleased.as_str(),
                None,
                serde_json::json!({
                    "worker_id": worker_id,
                    "status": request.status.as_str(),
                    "error_type": error_kind,
                }),
            )?;
            tx.commit()?;
            Ok(ReleaseOutcome::Released(Box::new(run), event))
        })
        .await
    }

    async fn request_cancel(&self, run_id: &str) -> Result<CancelOutcome, StoreError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let run = get_run_tx(&tx, &run_id)?;
            if run.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }
            tx.execute("UPDATE runs SET cancel_requested = 1 WHERE run_id = ?1", [&run_id])?;
            let event = append_event_tx(
                &tx,
                &run_id,
                EventKind::CancelRequested.as_str(),
                None,
                serde_json::json!({}),
            )?;
            tx.commit()?;
            Ok(CancelOutcome::Requested(event))
        })
        .await
    }

    async fn expire_leases(&self) -> Result<Vec<(Run, EventRecord)>, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ms();
            let victims: Vec<(String, Option<String>, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT run_id, claimed_by, attempt FROM runs \
                     WHERE status = 'running' AND lease_expires_at <= ?1 \
                     ORDER BY created_at ASC, run_id ASC",
                )?;
                let rows = stmt.query_map([now], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };
            let mut expired = Vec::with_capacity(victims.len());
            for (run_id, previous_worker, attempt) in victims {
                // Back to the full queued shape: a queued run carries no
                // claim fields and no start instant.
                tx.execute(
                    "UPDATE runs SET status = 'queued', phase = 'bundle', claimed_by = NULL, \
                     lease_expires_at = NULL, started_at = NULL WHERE run_id = ?1",
                    [&run_id],
                )?;
                let event = append_event_tx(
                    &tx,
                    &run_id,
                    EventKind::LeaseExpired.as_str(),
                    None,
                    serde_json::json!({ "worker_id": previous_worker, "attempt": attempt }),
                )?;
                let run = get_run_tx(&tx, &run_id)?;
                expired.push((run, event));
            }
            tx.commit()?;
            Ok(expired)
        })
        .await
    }
}
