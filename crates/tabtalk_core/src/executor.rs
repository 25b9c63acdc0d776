use crate::dataset::{float_value, Dataset};
use crate::error::PipelineError;
use crate::synthesizer::GeneratedScript;
use duckdb::Connection;
use serde_json::Value;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Name the generated script reads its input from. Part of the ABI shared
/// with the synthesizer's prompt; if either side drifts, the executor can
/// no longer locate the result.
pub const INPUT_TABLE: &str = "df";

/// Name the generated script must bind its output to.
pub const OUTPUT_TABLE: &str = "result_df";

/// Resource budget for one script execution.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    pub wall_clock: Duration,
    pub memory_limit: String,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(20),
            memory_limit: "256MB".to_string(),
        }
    }
}

/// Per-call-site policy knobs for outcomes that are neither clearly a
/// success nor clearly a failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecPolicy {
    /// When set, a valid zero-row result is reported as `EmptyResult`
    /// instead of a success.
    pub empty_result_is_error: bool,
}

/// Run a generated script against a dataset in a fresh, constrained
/// in-memory scope and return the normalized output table.
///
/// The scope contains exactly two bindings: the input table and the output
/// table pre-seeded with a copy of the input, so a script that never
/// touches the output still yields a sane result. External access is
/// revoked and the configuration locked before the untrusted script runs;
/// a watchdog interrupts the engine once the wall-clock budget elapses.
/// Script failures of any kind are caught and classified, never
/// propagated as a fault.
#[tracing::instrument(skip_all, fields(rows = dataset.row_count()))]
pub fn execute(
    script: &GeneratedScript,
    dataset: &Dataset,
    limits: &ExecLimits,
    policy: ExecPolicy,
) -> Result<Dataset, PipelineError> {
    if dataset.columns().is_empty() {
        return Err(PipelineError::InvalidOutput(
            "input dataset has no columns".into(),
        ));
    }

    let staging = tempfile::Builder::new()
        .prefix("tabtalk-exec")
        .tempdir()
        .map_err(|e| PipelineError::Execution(format!("failed to create scratch dir: {e}")))?;
    let csv_path = staging.path().join("input.csv");
    let csv_text = dataset
        .to_csv_string()
        .map_err(|e| PipelineError::Execution(format!("failed to stage dataset: {e}")))?;
    std::fs::write(&csv_path, csv_text)
        .map_err(|e| PipelineError::Execution(format!("failed to stage dataset: {e}")))?;

    let conn = Connection::open_in_memory()
        .map_err(|e| PipelineError::Execution(format!("failed to open scope: {e}")))?;

    // The one file read happens before external access is revoked.
    let quoted = csv_path.to_string_lossy().replace('\'', "''");
    conn.execute(
        &format!(
            "CREATE TABLE {INPUT_TABLE} AS SELECT * FROM read_csv_auto('{quoted}', header=true)"
        ),
        [],
    )
    .map_err(|e| PipelineError::Execution(format!("failed to load dataset: {e}")))?;
    conn.execute(
        &format!("CREATE TABLE {OUTPUT_TABLE} AS SELECT * FROM {INPUT_TABLE}"),
        [],
    )
    .map_err(|e| PipelineError::Execution(format!("failed to seed output table: {e}")))?;
    conn.execute_batch(&format!(
        "SET memory_limit='{}'; SET enable_external_access=false; SET lock_configuration=true;",
        limits.memory_limit
    ))
    .map_err(|e| PipelineError::Execution(format!("failed to constrain scope: {e}")))?;

    debug!(budget_ms = limits.wall_clock.as_millis() as u64, "running script");
    run_with_budget(&conn, script.source(), limits.wall_clock)?;

    let table = read_output(&conn)?;
    if table.is_empty() && policy.empty_result_is_error {
        return Err(PipelineError::EmptyResult);
    }
    Ok(table)
}

/// Run the script on this thread while a watchdog waits on the budget; on
/// expiry the watchdog interrupts the connection and the running batch
/// returns an interrupt error.
fn run_with_budget(
    conn: &Connection,
    source: &str,
    budget: Duration,
) -> Result<(), PipelineError> {
    let interrupt = conn.interrupt_handle();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let watchdog = thread::spawn(move || {
        if done_rx.recv_timeout(budget).is_err() {
            interrupt.interrupt();
        }
    });

    let outcome = conn.execute_batch(source);
    let _ = done_tx.send(());
    let _ = watchdog.join();

    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            let msg = e.to_string();
            if msg.to_uppercase().contains("INTERRUPT") {
                Err(PipelineError::Execution(format!(
                    "execution exceeded the {}ms wall-clock budget",
                    budget.as_millis()
                )))
            } else {
                Err(PipelineError::Execution(msg))
            }
        }
    }
}

/// Read the output binding back into a dataset. A missing or unqueryable
/// binding is `InvalidOutput`; cell values are normalized so non-finite
/// floats come back as null.
fn read_output(conn: &Connection) -> Result<Dataset, PipelineError> {
    let invalid = |e: duckdb::Error| PipelineError::InvalidOutput(e.to_string());

    let columns: Vec<String> = {
        let mut stmt = conn
            .prepare(&format!("DESCRIBE {OUTPUT_TABLE}"))
            .map_err(invalid)?;
        let mapped = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(invalid)?;
        let mut names = Vec::new();
        for name in mapped {
            names.push(name.map_err(invalid)?);
        }
        names
    };

    let mut stmt = conn
        .prepare(&format!("SELECT * FROM {OUTPUT_TABLE}"))
        .map_err(invalid)?;
    let ncols = columns.len();
    let mapped = stmt
        .query_map([], |row| {
            let mut cells = Vec::with_capacity(ncols);
            for i in 0..ncols {
                cells.push(read_cell(row, i));
            }
            Ok(cells)
        })
        .map_err(invalid)?;
    let mut rows = Vec::new();
    for row in mapped {
        rows.push(row.map_err(invalid)?);
    }

    Dataset::new(columns, rows).map_err(|e| PipelineError::InvalidOutput(e.to_string()))
}

fn read_cell(row: &duckdb::Row<'_>, i: usize) -> Value {
    if let Ok(v) = row.get::<_, i64>(i) {
        return Value::from(v);
    }
    if let Ok(v) = row.get::<_, i128>(i) {
        // Aggregates come back as HUGEINT; keep integer precision when it fits.
        return match i64::try_from(v) {
            Ok(n) => Value::from(n),
            Err(_) => float_value(v as f64),
        };
    }
    if let Ok(v) = row.get::<_, f64>(i) {
        return float_value(v);
    }
    if let Ok(v) = row.get::<_, String>(i) {
        return Value::String(v);
    }
    if let Ok(v) = row.get::<_, bool>(i) {
        return Value::Bool(v);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Dataset {
        Dataset::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![json!(1), json!("a")],
                vec![json!(1), json!("b")],
                vec![json!(2), json!("c")],
            ],
        )
        .unwrap()
    }

    fn script(sql: &str) -> GeneratedScript {
        GeneratedScript::new(sql)
    }

    #[test]
    fn identity_round_trip() {
        let ds = people();
        let out = execute(
            &script("CREATE OR REPLACE TABLE result_df AS SELECT * FROM df;"),
            &ds,
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap();
        assert_eq!(out, ds);
    }

    #[test]
    fn untouched_output_falls_back_to_input_copy() {
        let ds = people();
        let out = execute(
            &script("SELECT 1;"),
            &ds,
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap();
        assert_eq!(out, ds);
    }

    #[test]
    fn failing_script_is_classified_not_propagated() {
        let err = execute(
            &script("SELECT * FROM no_such_table;"),
            &people(),
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)), "{err:?}");
    }

    #[test]
    fn dropped_output_binding_is_invalid_output() {
        let err = execute(
            &script("DROP TABLE result_df;"),
            &people(),
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOutput(_)), "{err:?}");
    }

    #[test]
    fn single_column_result_keeps_column_name() {
        let out = execute(
            &script("CREATE OR REPLACE TABLE result_df AS SELECT name FROM df;"),
            &people(),
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap();
        assert_eq!(out.columns(), &["name".to_string()]);
        assert_eq!(out.row_count(), 3);
    }

    #[test]
    fn duplicate_count_example() {
        let out = execute(
            &script(
                "CREATE OR REPLACE TABLE result_df AS \
                 SELECT id, COUNT(*) AS \"Count\" FROM df GROUP BY id HAVING COUNT(*) > 1;",
            ),
            &people(),
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap();
        assert_eq!(out.columns(), &["id".to_string(), "Count".to_string()]);
        assert_eq!(out.rows(), &[vec![json!(1), json!(2)]]);
    }

    #[test]
    fn empty_result_policy() {
        let sql = "CREATE OR REPLACE TABLE result_df AS SELECT * FROM df WHERE id < 0;";
        let relaxed = execute(
            &script(sql),
            &people(),
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap();
        assert!(relaxed.is_empty());
        assert_eq!(relaxed.columns(), people().columns());

        let strict = execute(
            &script(sql),
            &people(),
            &ExecLimits::default(),
            ExecPolicy {
                empty_result_is_error: true,
            },
        )
        .unwrap_err();
        assert!(matches!(strict, PipelineError::EmptyResult));
    }

    #[test]
    fn file_access_is_revoked_for_scripts() {
        let err = execute(
            &script(
                "CREATE OR REPLACE TABLE result_df AS SELECT * FROM read_csv_auto('/etc/passwd');",
            ),
            &people(),
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)), "{err:?}");
    }

    #[test]
    fn wall_clock_budget_interrupts_runaway_scripts() {
        let limits = ExecLimits {
            wall_clock: Duration::from_millis(200),
            memory_limit: "256MB".into(),
        };
        let err = execute(
            &script(
                "CREATE OR REPLACE TABLE result_df AS \
                 SELECT sum(a.range * b.range) AS s FROM range(100000) a, range(100000) b;",
            ),
            &people(),
            &limits,
            ExecPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)), "{err:?}");
    }

    #[test]
    fn zero_column_dataset_is_rejected() {
        let ds = Dataset::new(vec![], vec![]).unwrap();
        let err = execute(
            &script("SELECT 1;"),
            &ds,
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidOutput(_)));
    }

    #[test]
    fn nan_and_infinity_normalize_to_null() {
        let out = execute(
            &script(
                "CREATE OR REPLACE TABLE result_df AS \
                 SELECT 'nan'::DOUBLE AS a, 'inf'::DOUBLE AS b, 1.5::DOUBLE AS c;",
            ),
            &people(),
            &ExecLimits::default(),
            ExecPolicy::default(),
        )
        .unwrap();
        assert_eq!(out.rows()[0][0], Value::Null);
        assert_eq!(out.rows()[0][1], Value::Null);
        assert_eq!(out.rows()[0][2], json!(1.5));
    }
}
