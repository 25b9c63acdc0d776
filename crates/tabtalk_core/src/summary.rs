use crate::dataset::Dataset;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of preview rows embedded in prompts unless a caller asks for a
/// different bound.
pub const DEFAULT_PREVIEW_ROWS: usize = 5;

/// Compact, read-only view of a dataset for prompt embedding: the column
/// list plus the first few rows. This is what keeps token cost bounded
/// regardless of how large the uploaded file is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub columns: Vec<String>,
    pub preview: Vec<Value>,
}

/// Summarize a dataset for the model. Pure and deterministic; a dataset
/// with zero columns yields an empty summary rather than an error.
pub fn summarize(dataset: &Dataset, max_preview_rows: usize) -> SchemaSummary {
    SchemaSummary {
        columns: dataset.columns().to_vec(),
        preview: dataset.head(max_preview_rows).to_json_rows(),
    }
}

impl SchemaSummary {
    /// Render the fragment of the user message that describes the data.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "The table has columns: {}.\n",
            serde_json::to_string(&self.columns).unwrap_or_default()
        ));
        if !self.preview.is_empty() {
            out.push_str("First rows as JSON:\n");
            for row in &self.preview {
                out.push_str(&row.to_string());
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dataset(rows: usize) -> Dataset {
        Dataset::new(
            vec!["x".into(), "y".into()],
            (0..rows)
                .map(|i| vec![json!(i as i64), json!(format!("r{i}"))])
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn bounded_by_preview_limit() {
        let ds = dataset(20);
        let s = summarize(&ds, 5);
        assert_eq!(s.preview.len(), 5);
        assert_eq!(s.columns, ds.columns());
    }

    #[test]
    fn idempotent() {
        let ds = dataset(7);
        let a = summarize(&ds, 5);
        let b = summarize(&ds, 5);
        assert_eq!(a.columns, b.columns);
        assert_eq!(a.preview, b.preview);
    }

    #[test]
    fn empty_dataset_yields_empty_summary() {
        let ds = Dataset::new(vec![], vec![]).unwrap();
        let s = summarize(&ds, 5);
        assert!(s.columns.is_empty());
        assert!(s.preview.is_empty());
        assert!(s.render().contains("[]"));
    }

    #[test]
    fn render_mentions_columns_and_rows() {
        let s = summarize(&dataset(2), 5);
        let text = s.render();
        assert!(text.contains("\"x\""));
        assert!(text.contains("r1"));
    }
}
