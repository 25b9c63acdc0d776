//! Chart-insight generation: a rule-based pass over the table first, and a
//! model fallback when no rule fires. Insights carry bar-chart *data*;
//! rendering an image from it is someone else's job.

use crate::dataset::Dataset;
use crate::error::PipelineError;
use crate::synthesizer::{chat_completion, LlmConfig};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Labels and values for one bar chart, already validated to be usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarChart {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

impl BarChart {
    pub fn new(labels: Vec<String>, values: Vec<f64>) -> Result<Self> {
        if labels.is_empty() || values.is_empty() || labels.len() != values.len() {
            bail!("bar chart needs non-empty labels and values of equal length");
        }
        Ok(Self { labels, values })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    pub title: String,
    pub subtitle: String,
    pub table: Vec<Value>,
    pub content: Vec<String>,
    pub chart: Option<BarChart>,
}

/// Rule-based analysis: the first column containing repeated values yields
/// a frequency insight. Returns `None` when no column has duplicates.
pub fn duplicate_insight(dataset: &Dataset) -> Option<Insight> {
    let column = dataset
        .columns()
        .iter()
        .find(|c| dataset.column_has_duplicates(c).unwrap_or(false))?
        .clone();
    let counts = dataset.value_counts(&column).ok()?;

    let mut labels = Vec::new();
    let mut values = Vec::new();
    let mut content = Vec::new();
    let mut duplicated = 0usize;
    for row in counts.rows() {
        let label = match &row[0] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let n = row[1].as_i64().unwrap_or(0);
        if n > 1 {
            duplicated += 1;
        }
        content.push(format!("{label} is repeated {n} times."));
        labels.push(label);
        values.push(n as f64);
    }

    Some(Insight {
        title: format!("Duplicate values in {column}"),
        subtitle: format!("{duplicated} distinct {column} values appear more than once."),
        table: counts.to_json_rows(),
        content,
        chart: BarChart::new(labels, values).ok(),
    })
}

/// Full insight pass: rules first, model fallback second. The fallback
/// asks the model to suggest a visualization over a bounded preview and
/// carries no chart data of its own.
pub async fn visualize(
    dataset: &Dataset,
    llm: &LlmConfig,
) -> Result<Insight, PipelineError> {
    if let Some(insight) = duplicate_insight(dataset) {
        return Ok(insight);
    }

    let preview: Vec<Value> = dataset.head(10).to_json_rows();
    let user = format!(
        "Data preview: {}\nPrompt: Suggest the best visualization for this data.",
        serde_json::to_string(&preview).unwrap_or_default()
    );
    let answer = chat_completion(
        llm,
        "You are a data analyst. Analyze the given table and suggest the best visualization.",
        &user,
    )
    .await?;

    Ok(Insight {
        title: "Model-suggested visualization".to_string(),
        subtitle: answer.clone(),
        table: preview,
        content: vec![answer],
        chart: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bar_chart_validation() {
        assert!(BarChart::new(vec![], vec![]).is_err());
        assert!(BarChart::new(vec!["a".into()], vec![1.0, 2.0]).is_err());
        assert!(BarChart::new(vec!["a".into()], vec![1.0]).is_ok());
    }

    #[test]
    fn duplicate_insight_counts_repeated_ids() {
        let ds = Dataset::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![json!(1), json!("a")],
                vec![json!(1), json!("b")],
                vec![json!(2), json!("c")],
            ],
        )
        .unwrap();
        let insight = duplicate_insight(&ds).unwrap();
        assert_eq!(insight.title, "Duplicate values in id");
        assert_eq!(insight.table[0]["id"], json!(1));
        assert_eq!(insight.table[0]["Count"], json!(2));
        let chart = insight.chart.unwrap();
        assert_eq!(chart.labels[0], "1");
        assert_eq!(chart.values[0], 2.0);
    }

    #[test]
    fn no_duplicates_means_no_rule_insight() {
        let ds = Dataset::new(
            vec!["id".into()],
            vec![vec![json!(1)], vec![json!(2)]],
        )
        .unwrap();
        assert!(duplicate_insight(&ds).is_none());
    }
}
