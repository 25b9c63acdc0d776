//! Persisted workflows: an uploaded file plus the ordered list of scripts
//! generated against it, replayable later. Appends are read-modify-write
//! under one lock and one transaction so concurrent steps against the same
//! workflow can never lose updates.

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::executor::{execute, ExecLimits, ExecPolicy};
use crate::synthesizer::GeneratedScript;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowScript {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    pub id: String,
    pub file_name: String,
    pub stored_file: PathBuf,
    pub scripts: Vec<WorkflowScript>,
    pub created_at: DateTime<Utc>,
}

pub struct WorkflowStore {
    conn: Mutex<Connection>,
}

impl WorkflowStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).context("failed to open workflow store")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                file_name TEXT NOT NULL,
                stored_file TEXT NOT NULL,
                scripts TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create(&self, file_name: &str, stored_file: &Path) -> Result<WorkflowRecord> {
        let record = WorkflowRecord {
            id: Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            stored_file: stored_file.to_path_buf(),
            scripts: Vec::new(),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workflows (id, file_name, stored_file, scripts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.file_name,
                record.stored_file.to_string_lossy().to_string(),
                serde_json::to_string(&record.scripts)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, file_name, stored_file, scripts, created_at
                 FROM workflows WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, file_name, stored_file, scripts, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(WorkflowRecord {
            id,
            file_name,
            stored_file: PathBuf::from(stored_file),
            scripts: serde_json::from_str(&scripts)
                .context("corrupt script list in workflow store")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Append one script to the workflow's ordered list. The read and the
    /// write happen inside a single transaction while the connection lock
    /// is held, so concurrent appends serialize instead of clobbering each
    /// other. Returns the new script count.
    pub fn append_script(&self, id: &str, script: WorkflowScript) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored: Option<String> = tx
            .query_row(
                "SELECT scripts FROM workflows WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(stored) = stored else {
            bail!("workflow not found: {id}");
        };
        let mut scripts: Vec<WorkflowScript> =
            serde_json::from_str(&stored).context("corrupt script list in workflow store")?;
        scripts.push(script);
        tx.execute(
            "UPDATE workflows SET scripts = ?1 WHERE id = ?2",
            params![serde_json::to_string(&scripts)?, id],
        )?;
        tx.commit()?;
        Ok(scripts.len())
    }
}

/// Outcome of replaying one stored script.
#[derive(Debug)]
pub struct ReplayStep {
    pub name: String,
    pub outcome: Result<Dataset, PipelineError>,
}

/// Replay every stored script in order. Each step runs against the
/// previous step's output, so the workflow behaves as one multi-step
/// transformation; replay stops at the first failing step. Returns the
/// per-step outcomes and the last good table.
pub fn replay(
    record: &WorkflowRecord,
    input: Dataset,
    limits: &ExecLimits,
    policy: ExecPolicy,
) -> (Vec<ReplayStep>, Dataset) {
    let mut current = input;
    let mut steps = Vec::new();
    for ws in &record.scripts {
        let script = GeneratedScript::new(ws.source.clone());
        match execute(&script, &current, limits, policy) {
            Ok(table) => {
                steps.push(ReplayStep {
                    name: ws.name.clone(),
                    outcome: Ok(table.clone()),
                });
                current = table;
            }
            Err(e) => {
                steps.push(ReplayStep {
                    name: ws.name.clone(),
                    outcome: Err(e),
                });
                break;
            }
        }
    }
    (steps, current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn sample_script(n: usize) -> WorkflowScript {
        WorkflowScript {
            name: format!("step-{n}"),
            source: format!("CREATE OR REPLACE TABLE result_df AS SELECT * FROM df; -- {n}"),
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = WorkflowStore::open_in_memory().unwrap();
        let created = store.create("data.csv", Path::new("/tmp/data.csv")).unwrap();
        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.file_name, "data.csv");
        assert!(fetched.scripts.is_empty());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn append_preserves_order() {
        let store = WorkflowStore::open_in_memory().unwrap();
        let wf = store.create("data.csv", Path::new("/tmp/data.csv")).unwrap();
        for n in 0..3 {
            store.append_script(&wf.id, sample_script(n)).unwrap();
        }
        let fetched = store.get(&wf.id).unwrap().unwrap();
        let names: Vec<_> = fetched.scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["step-0", "step-1", "step-2"]);
    }

    #[test]
    fn append_to_unknown_workflow_fails() {
        let store = WorkflowStore::open_in_memory().unwrap();
        assert!(store.append_script("missing", sample_script(0)).is_err());
    }

    #[test]
    fn concurrent_appends_never_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkflowStore::open(&dir.path().join("wf.sqlite3")).unwrap());
        let wf = store.create("data.csv", Path::new("/tmp/data.csv")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = Arc::clone(&store);
                let id = wf.id.clone();
                std::thread::spawn(move || store.append_script(&id, sample_script(n)).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let fetched = store.get(&wf.id).unwrap().unwrap();
        assert_eq!(fetched.scripts.len(), 8);
    }

    #[test]
    fn replay_chains_steps_and_stops_on_failure() {
        let dataset = Dataset::new(
            vec!["id".into()],
            vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]],
        )
        .unwrap();
        let record = WorkflowRecord {
            id: "wf".into(),
            file_name: "data.csv".into(),
            stored_file: PathBuf::from("/tmp/data.csv"),
            scripts: vec![
                WorkflowScript {
                    name: "filter".into(),
                    source: "CREATE OR REPLACE TABLE result_df AS SELECT * FROM df WHERE id > 1;"
                        .into(),
                },
                WorkflowScript {
                    name: "boom".into(),
                    source: "SELECT * FROM nowhere;".into(),
                },
                WorkflowScript {
                    name: "never-runs".into(),
                    source: "CREATE OR REPLACE TABLE result_df AS SELECT * FROM df;".into(),
                },
            ],
            created_at: Utc::now(),
        };

        let (steps, last) = replay(
            &record,
            dataset,
            &ExecLimits::default(),
            ExecPolicy::default(),
        );
        assert_eq!(steps.len(), 2);
        assert!(steps[0].outcome.is_ok());
        assert!(steps[1].outcome.is_err());
        // The last good table is the filtered one from step 1.
        assert_eq!(last.row_count(), 2);
    }
}
