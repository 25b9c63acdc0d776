use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::executor::{execute, ExecLimits, ExecPolicy};
use crate::runs;
use crate::summary::{summarize, DEFAULT_PREVIEW_ROWS};
use crate::synthesizer::{synthesize, GeneratedScript, LlmConfig};
use std::path::Path;
use tracing::info;

/// The unified summarize → synthesize → execute component. Every entry
/// point (ad-hoc CSV, ad-hoc spreadsheet, workflow steps, CLI) goes
/// through this one implementation; they differ only in where the dataset
/// comes from and where the result goes.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub llm: LlmConfig,
    pub limits: ExecLimits,
    pub policy: ExecPolicy,
    pub preview_rows: usize,
}

/// Successful outcome of one invocation: the script that ran (returned to
/// the caller for transparency) and the normalized result table.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub script: GeneratedScript,
    pub table: Dataset,
}

impl Pipeline {
    pub fn new(llm: LlmConfig) -> Self {
        Self {
            llm,
            limits: ExecLimits::default(),
            policy: ExecPolicy::default(),
            preview_rows: DEFAULT_PREVIEW_ROWS,
        }
    }

    /// One linear pass, no feedback loop: a single model round-trip and a
    /// single execution attempt. Failures are terminal for the request and
    /// carry enough detail for the caller to re-prompt manually.
    #[tracing::instrument(skip_all, fields(instruction = %instruction))]
    pub async fn run(
        &self,
        dataset: &Dataset,
        instruction: &str,
    ) -> Result<PipelineRun, PipelineError> {
        let summary = summarize(dataset, self.preview_rows);
        let script = synthesize(&summary, instruction, &self.llm).await?;

        let ds = dataset.clone();
        let exec_script = script.clone();
        let limits = self.limits.clone();
        let policy = self.policy;
        let table = tokio::task::spawn_blocking(move || {
            execute(&exec_script, &ds, &limits, policy)
        })
        .await
        .map_err(|e| PipelineError::Execution(format!("executor task failed: {e}")))??;

        info!(rows = table.row_count(), "pipeline run complete");
        Ok(PipelineRun { script, table })
    }

    /// Like [`run`](Self::run), but leaves an audit trail in `run_dir`:
    /// the generated script (when synthesis succeeded) and the outcome.
    pub async fn run_recorded(
        &self,
        run_dir: &Path,
        dataset: &Dataset,
        instruction: &str,
    ) -> Result<PipelineRun, PipelineError> {
        let summary = summarize(dataset, self.preview_rows);
        let script = match synthesize(&summary, instruction, &self.llm).await {
            Ok(s) => s,
            Err(e) => {
                let failed: Result<Dataset, PipelineError> = Err(e.clone());
                let _ = runs::record_outcome(run_dir, &failed);
                return Err(e);
            }
        };
        let _ = runs::record_script(run_dir, &script);

        let ds = dataset.clone();
        let exec_script = script.clone();
        let limits = self.limits.clone();
        let policy = self.policy;
        let outcome = tokio::task::spawn_blocking(move || {
            execute(&exec_script, &ds, &limits, policy)
        })
        .await
        .map_err(|e| PipelineError::Execution(format!("executor task failed: {e}")))?;

        let _ = runs::record_outcome(run_dir, &outcome);
        let table = outcome?;
        info!(rows = table.row_count(), "pipeline run complete");
        Ok(PipelineRun { script, table })
    }
}
