//! `PIPELINE_STATE.json` atomic persistence and a small SQLite artifact table.

use crate::errors::PipelineError;
use crate::phase::PipelineState;
use rusqlite::{Connection, params};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

const STATE_FILE_NAME: &str = "PIPELINE_STATE.json";
const CLEAR_CONFIRMATION_TOKEN: &str = "CONFIRM_CLEAR";

/// Persists `PipelineState` to `<run_dir>/PIPELINE_STATE.json`.
pub struct StateStore {
    run_dir: PathBuf,
}

impl StateStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.run_dir.join(STATE_FILE_NAME)
    }

    /// Write-temp-then-rename: a partial write can never leave a corrupt
    /// `PIPELINE_STATE.json` behind, and a reader never observes a
    /// half-written file.
    pub fn save(&self, state: &PipelineState) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.run_dir).map_err(|source| PipelineError::StoreIOError {
            path: self.run_dir.clone(),
            source,
        })?;

        let json = sorted_json(state)?;
        let target = self.state_path();
        let tmp = target.with_extension("json.tmp");

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &target)?;
            Ok(())
        };

        write().map_err(|source| PipelineError::StoreIOError {
            path: target,
            source,
        })
    }

    /// Returns the most recently committed state, or `NoStateError` if the
    /// run directory has never been saved.
    pub fn load(&self) -> Result<PipelineState, PipelineError> {
        let path = self.state_path();
        if !path.exists() {
            return Err(PipelineError::NoStateError(self.run_dir.clone()));
        }
        let content = std::fs::read_to_string(&path).map_err(|source| PipelineError::StoreIOError {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("corrupt state file {}: {e}", path.display())))
    }

    /// Removes the state file. Requires the caller to pass the explicit
    /// confirmation token so a reset is never accidental.
    pub fn clear(&self, confirmation: &str) -> Result<(), PipelineError> {
        if confirmation != CLEAR_CONFIRMATION_TOKEN {
            return Err(PipelineError::UserError(
                "clear requires the exact confirmation token".into(),
            ));
        }
        let path = self.state_path();
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| PipelineError::StoreIOError { path, source })?;
        }
        Ok(())
    }
}

/// Recursively sorts object keys so two saves of logically identical state
/// produce byte-identical files.
fn sorted_json(state: &PipelineState) -> Result<String, PipelineError> {
    let value = serde_json::to_value(state)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("failed to serialize state: {e}")))?;
    let sorted = sort_value(value);
    serde_json::to_string_pretty(&sorted)
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("failed to render sorted state: {e}")))
}

fn sort_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_value(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_value).collect())
        }
        other => other,
    }
}

/// A small key-value blob store backed by SQLite, for artifacts too large
/// or too free-form to live inside `PIPELINE_STATE.json` (graph snapshots,
/// rendered quality-gate reports). One connection per store instance; the
/// caller is responsible for not sharing a `Connection` across threads.
pub struct ArtifactStore {
    conn: Connection,
}

impl ArtifactStore {
    pub fn open(db_path: &Path) -> Result<Self, PipelineError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PipelineError::StoreIOError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("failed to open {}: {e}", db_path.display())))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS artifacts (
                run_id TEXT NOT NULL,
                key TEXT NOT NULL,
                content BLOB NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, key)
            );",
        )
        .map_err(|e| PipelineError::Other(anyhow::anyhow!("failed to initialize artifacts table: {e}")))?;
        Ok(Self { conn })
    }

    pub fn put(&self, run_id: &str, key: &str, content: &[u8]) -> Result<(), PipelineError> {
        self.conn
            .execute(
                "INSERT INTO artifacts (run_id, key, content, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id, key) DO UPDATE SET content = excluded.content, created_at = excluded.created_at",
                params![run_id, key, content, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("artifact insert failed: {e}")))?;
        Ok(())
    }

    pub fn get(&self, run_id: &str, key: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        self.conn
            .query_row(
                "SELECT content FROM artifacts WHERE run_id = ?1 AND key = ?2",
                params![run_id, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(PipelineError::Other(anyhow::anyhow!("artifact read failed: {other}"))),
            })
    }
}
