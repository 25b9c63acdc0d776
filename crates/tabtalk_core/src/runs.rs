//! Per-invocation audit trail. Every pipeline run gets its own directory
//! holding the generated script and the outcome, so callers can always
//! show the user exactly what code ran against their data.

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::synthesizer::GeneratedScript;
use crate::util::default_runs_root;
use anyhow::Result;
use serde_json::json;
use std::{fs, path::{Path, PathBuf}};
use uuid::Uuid;

pub const SCRIPT_FILE: &str = "script.sql";
pub const OUTCOME_FILE: &str = "outcome.json";

#[derive(Debug, Clone)]
pub struct RunInfo {
    pub id: String,
    pub dir: PathBuf,
}

pub fn create_new_run(base: Option<&Path>) -> Result<RunInfo> {
    let id = Uuid::new_v4().to_string();
    let root = match base {
        Some(b) => b.to_path_buf(),
        None => default_runs_root()?,
    };
    let dir = root.join(&id);
    fs::create_dir_all(&dir)?;
    Ok(RunInfo { id, dir })
}

pub fn record_script(run_dir: &Path, script: &GeneratedScript) -> Result<()> {
    fs::write(run_dir.join(SCRIPT_FILE), script.source())?;
    Ok(())
}

pub fn record_outcome(
    run_dir: &Path,
    outcome: &Result<Dataset, PipelineError>,
) -> Result<()> {
    let v = match outcome {
        Ok(table) => json!({
            "ok": true,
            "row_count": table.row_count(),
            "columns": table.columns(),
        }),
        Err(e) => json!({
            "ok": false,
            "kind": e.kind(),
            "error": e.to_string(),
        }),
    };
    fs::write(run_dir.join(OUTCOME_FILE), serde_json::to_vec_pretty(&v)?)?;
    Ok(())
}

pub fn list_runs(limit: usize) -> Result<Vec<RunInfo>> {
    let root = default_runs_root()?;
    let mut runs = vec![];
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            runs.push(RunInfo {
                id: entry.file_name().to_string_lossy().to_string(),
                dir: entry.path(),
            });
        }
    }
    runs.sort_by(|a, b| b.id.cmp(&a.id));
    if runs.len() > limit {
        runs.truncate(limit);
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_script_and_outcome() {
        let base = tempdir().unwrap();
        let run = create_new_run(Some(base.path())).unwrap();
        record_script(&run.dir, &GeneratedScript::new("SELECT 1;")).unwrap();
        record_outcome(&run.dir, &Err(PipelineError::EmptyResult)).unwrap();

        let script = fs::read_to_string(run.dir.join(SCRIPT_FILE)).unwrap();
        assert_eq!(script, "SELECT 1;");
        let outcome: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(run.dir.join(OUTCOME_FILE)).unwrap())
                .unwrap();
        assert_eq!(outcome["ok"], json!(false));
        assert_eq!(outcome["kind"], json!("empty_result"));
    }
}
