use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use stockflow_core::error::{Result, StockflowError};
use stockflow_core::types::RunId;

use crate::state::ConversationState;

/// A suspended run: everything needed to pick it up again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Single-use resume token.
    pub token: String,
    pub run_id: RunId,
    /// Node that interrupted; it runs again on resume.
    pub node: String,
    /// Nodes that were still queued behind it.
    pub frontier: Vec<String>,
    pub state: ConversationState,
    /// Prompt shown to the human.
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Storage for suspended runs, keyed by resume token.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, cp: &Checkpoint) -> Result<()>;

    /// Look at a checkpoint without consuming it.
    fn get(&self, token: &str) -> Result<Option<Checkpoint>>;

    /// Remove and return a checkpoint. Of two concurrent takes, only one
    /// gets `Some`.
    fn take(&self, token: &str) -> Result<Option<Checkpoint>>;

    /// All suspended runs, oldest first.
    fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Resolve a token prefix to a full token.
    ///
    /// An exact match wins; otherwise the prefix must match exactly one token.
    fn find_by_prefix(&self, prefix: &str) -> Result<Option<String>> {
        let tokens: Vec<String> = self.list()?.into_iter().map(|cp| cp.token).collect();
        if tokens.iter().any(|t| t == prefix) {
            return Ok(Some(prefix.to_string()));
        }
        let matches: Vec<&String> = tokens.iter().filter(|t| t.starts_with(prefix)).collect();
        match matches.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some((*only).clone())),
            many => Err(StockflowError::Checkpoint(format!(
                "token prefix '{}' is ambiguous ({} suspended runs match)",
                prefix,
                many.len()
            ))),
        }
    }
}

/// Process-local store. Suspended runs are lost on exit.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    runs: Mutex<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> StockflowError {
    StockflowError::Checkpoint(format!("checkpoint store lock poisoned: {}", e))
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, cp: &Checkpoint) -> Result<()> {
        self.runs
            .lock()
            .map_err(lock_err)?
            .insert(cp.token.clone(), cp.clone());
        Ok(())
    }

    fn get(&self, token: &str) -> Result<Option<Checkpoint>> {
        Ok(self.runs.lock().map_err(lock_err)?.get(token).cloned())
    }

    fn take(&self, token: &str) -> Result<Option<Checkpoint>> {
        Ok(self.runs.lock().map_err(lock_err)?.remove(token))
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut all: Vec<Checkpoint> = self.runs.lock().map_err(lock_err)?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

/// Persistent store backed by SQLite, so a suspension survives restarts.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> StockflowError + '_ {
    move |e| StockflowError::Checkpoint(format!("{}: {}", context, e))
}

impl SqliteCheckpointStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("Failed to open checkpoint store"))?;
        Self::init(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(db_err("Failed to open checkpoint store"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS suspended_runs (
                 token TEXT PRIMARY KEY,
                 run_id TEXT NOT NULL,
                 node TEXT NOT NULL,
                 frontier_json TEXT NOT NULL,
                 state_json TEXT NOT NULL,
                 reason TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_suspended_created
                 ON suspended_runs(created_at);",
        )
        .map_err(db_err("Failed to initialize checkpoint schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            token: row.get(0)?,
            run_id: row.get(1)?,
            node: row.get(2)?,
            frontier_json: row.get(3)?,
            state_json: row.get(4)?,
            reason: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT token, run_id, node, frontier_json, state_json, reason, created_at FROM suspended_runs";

/// Row as stored; JSON columns are decoded outside the rusqlite closure.
struct RawRow {
    token: String,
    run_id: String,
    node: String,
    frontier_json: String,
    state_json: String,
    reason: String,
    created_at: String,
}

impl RawRow {
    fn decode(self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            token: self.token,
            run_id: RunId::from_str(&self.run_id),
            node: self.node,
            frontier: serde_json::from_str(&self.frontier_json)?,
            state: serde_json::from_str(&self.state_json)?,
            reason: self.reason,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StockflowError::Checkpoint(format!("bad created_at: {}", e)))?,
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, cp: &Checkpoint) -> Result<()> {
        let frontier_json = serde_json::to_string(&cp.frontier)?;
        let state_json = serde_json::to_string(&cp.state)?;
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO suspended_runs
                 (token, run_id, node, frontier_json, state_json, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                cp.token,
                cp.run_id.0,
                cp.node,
                frontier_json,
                state_json,
                cp.reason,
                cp.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err("Failed to save checkpoint"))?;
        Ok(())
    }

    fn get(&self, token: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let raw = conn
            .query_row(
                &format!("{} WHERE token = ?1", SELECT_COLUMNS),
                params![token],
                Self::row_to_checkpoint,
            )
            .optional()
            .map_err(db_err("Failed to load checkpoint"))?;
        raw.map(RawRow::decode).transpose()
    }

    fn take(&self, token: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let raw = conn
            .query_row(
                &format!("{} WHERE token = ?1", SELECT_COLUMNS),
                params![token],
                Self::row_to_checkpoint,
            )
            .optional()
            .map_err(db_err("Failed to load checkpoint"))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        conn.execute("DELETE FROM suspended_runs WHERE token = ?1", params![token])
            .map_err(db_err("Failed to delete checkpoint"))?;
        raw.decode().map(Some)
    }

    fn list(&self) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY created_at ASC", SELECT_COLUMNS))
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], Self::row_to_checkpoint)
            .map_err(db_err("Failed to list checkpoints"))?
            .collect::<rusqlite::Result<Vec<RawRow>>>()
            .map_err(db_err("Failed to read checkpoint row"))?;
        rows.into_iter().map(RawRow::decode).collect()
    }
}
