use crate::error::PipelineError;
use crate::executor::{INPUT_TABLE, OUTPUT_TABLE};
use crate::summary::SchemaSummary;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// Explicit, per-request LLM configuration. Built once by the caller and
/// passed down; the library never reads the environment or holds a global
/// client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Conventional environment wiring for the binaries: `OPENAI_API_KEY`
    /// (required), `OPENAI_MODEL`, `OPENAI_BASE`.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY missing"))?;
        Ok(Self {
            api_key,
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            base_url: std::env::var("OPENAI_BASE").ok(),
            timeout: Duration::from_secs(60),
        })
    }
}

/// Source code returned by the model after post-processing. Asserted, not
/// guaranteed, to read from the input binding and write the output binding;
/// whether it actually does is the executor's problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedScript {
    source: String,
}

impl GeneratedScript {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn system_prompt() -> String {
    format!(
        r#"You are an assistant that writes DuckDB SQL to transform one table.

Rules:
- The input table is already loaded and is named `{input}`. Never create, load, or re-declare it.
- Bind your output by making the final statement `CREATE OR REPLACE TABLE {output} AS (...)`, even when the result is a single column.
- Use only plain SQL over `{input}`: no file access, no extensions, no PRAGMA or SET statements.
- Double-quote column names that contain spaces or unusual characters.
- Respond with the SQL script only: no markdown fences, no prose.
"#,
        input = INPUT_TABLE,
        output = OUTPUT_TABLE,
    )
}

/// One chat-completion round trip. Shared by script synthesis, the insight
/// fallback, and slide generation.
pub(crate) async fn chat_completion(
    cfg: &LlmConfig,
    system: &str,
    user: &str,
) -> Result<String, PipelineError> {
    let base = cfg
        .base_url
        .clone()
        .unwrap_or_else(|| "https://api.openai.com".into());
    let url = format!("{}/v1/chat/completions", base.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(cfg.timeout)
        .build()
        .map_err(|e| PipelineError::Upstream(e.to_string()))?;

    let body = serde_json::json!({
        "model": cfg.model,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": user}
        ],
        "temperature": 0.2
    });

    let resp = client
        .post(&url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", cfg.api_key))
        .json(&body)
        .send()
        .await
        .map_err(|e| PipelineError::Upstream(e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(PipelineError::Upstream(format!(
            "provider returned {status}: {text}"
        )));
    }

    let v: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| PipelineError::Upstream(e.to_string()))?;
    let content = v
        .pointer("/choices/0/message/content")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if content.is_empty() {
        return Err(PipelineError::Upstream("empty completion".into()));
    }
    Ok(content)
}

/// Strip Markdown code fences the model adds despite being told not to.
/// Handles an opening fence with or without a language tag and a trailing
/// fence; passes bare source through untouched.
pub fn strip_code_fences(raw: &str) -> String {
    let mut inner = raw.trim();
    if let Some(rest) = inner.strip_prefix("```") {
        inner = match rest.split_once('\n') {
            Some((_, body)) => body,
            None => rest,
        };
    }
    if let Some(rest) = inner.trim_end().strip_suffix("```") {
        inner = rest;
    }
    inner.trim().to_string()
}

static LEADING_QUERY: OnceLock<Regex> = OnceLock::new();

/// Models frequently answer with a bare query instead of binding the
/// output table. Wrap a leading SELECT/WITH into the agreed binding; leave
/// anything that already mentions the output name alone.
fn ensure_output_binding(sql: &str) -> String {
    if sql.to_lowercase().contains(OUTPUT_TABLE) {
        return sql.to_string();
    }
    let re = LEADING_QUERY
        .get_or_init(|| Regex::new(r"(?is)^\s*(select|with)\b").expect("hardcoded regex"));
    if re.is_match(sql) {
        let body = sql.trim().trim_end_matches(';');
        return format!("CREATE OR REPLACE TABLE {OUTPUT_TABLE} AS ({body});");
    }
    sql.to_string()
}

/// Produce an executable script for `instruction` against the summarized
/// table. Fails with `Upstream` when the remote call errors, times out, or
/// returns nothing usable; never validates the script's semantics.
#[tracing::instrument(skip_all, fields(model = %cfg.model))]
pub async fn synthesize(
    summary: &SchemaSummary,
    instruction: &str,
    cfg: &LlmConfig,
) -> Result<GeneratedScript, PipelineError> {
    let user = format!("{}\n{}", summary.render(), instruction);
    let raw = chat_completion(cfg, &system_prompt(), &user).await?;
    let cleaned = strip_code_fences(&raw);
    if cleaned.is_empty() {
        return Err(PipelineError::Upstream(
            "completion contained no code".into(),
        ));
    }
    let script = ensure_output_binding(&cleaned);
    debug!(script = %script, "synthesized script");
    Ok(GeneratedScript::new(script))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fence_with_language_tag() {
        let raw = "```sql\nSELECT * FROM df;\n```";
        assert_eq!(strip_code_fences(raw), "SELECT * FROM df;");
    }

    #[test]
    fn strips_plain_fence() {
        let raw = "```\nSELECT 1;\n```";
        assert_eq!(strip_code_fences(raw), "SELECT 1;");
    }

    #[test]
    fn leaves_bare_source_untouched() {
        let raw = "CREATE OR REPLACE TABLE result_df AS SELECT * FROM df;";
        assert_eq!(strip_code_fences(raw), raw);
    }

    #[test]
    fn wraps_bare_select_into_output_binding() {
        let wrapped = ensure_output_binding("SELECT id FROM df;");
        assert_eq!(
            wrapped,
            "CREATE OR REPLACE TABLE result_df AS (SELECT id FROM df);"
        );
    }

    #[test]
    fn wraps_leading_cte() {
        let wrapped = ensure_output_binding("WITH t AS (SELECT 1) SELECT * FROM t");
        assert!(wrapped.starts_with("CREATE OR REPLACE TABLE result_df AS (WITH t"));
    }

    #[test]
    fn keeps_scripts_that_bind_output() {
        let sql = "CREATE OR REPLACE TABLE result_df AS SELECT id FROM df;";
        assert_eq!(ensure_output_binding(sql), sql);
    }

    #[test]
    fn keeps_non_query_scripts() {
        let sql = "DELETE FROM somewhere;";
        assert_eq!(ensure_output_binding(sql), sql);
    }
}
