//! Slide-deck content generation: arbitrary JSON in, a list of slides out,
//! each with a title, a subtitle, and validated bar-chart data.

use crate::error::PipelineError;
use crate::insight::BarChart;
use crate::synthesizer::{chat_completion, strip_code_fences, LlmConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slide {
    pub title: String,
    pub subtitle: String,
    #[serde(rename = "bargraphJSON")]
    pub chart: BarChart,
}

fn slides_prompt() -> &'static str {
    r#"You are a presentation assistant. Given JSON input data, generate a presentation as a JSON array where each element (slide) is an object with the keys:
- "title": a short string naming the finding.
- "subtitle": a brief description for the slide.
- "bargraphJSON": an object with two arrays, "labels" and "values", holding the data for this slide's bar graph.
Ensure the output is valid JSON and nothing else."#
}

/// Parse and validate the model's slide payload. Kept separate from the
/// network call so the parsing rules are testable offline.
pub fn parse_slides(raw: &str) -> Result<Vec<Slide>, PipelineError> {
    let cleaned = strip_code_fences(raw);
    let slides: Vec<Slide> = serde_json::from_str(&cleaned).map_err(|e| {
        PipelineError::Upstream(format!("model output is not a slide array: {e}"))
    })?;
    if slides.is_empty() {
        return Err(PipelineError::Upstream("model produced no slides".into()));
    }
    for slide in &slides {
        let chart = &slide.chart;
        if chart.labels.is_empty() || chart.labels.len() != chart.values.len() {
            return Err(PipelineError::Upstream(format!(
                "slide {:?} has invalid bar chart data",
                slide.title
            )));
        }
    }
    Ok(slides)
}

/// Generate slides for the given input JSON.
#[tracing::instrument(skip_all)]
pub async fn generate_slides(
    input: &Value,
    llm: &LlmConfig,
) -> Result<Vec<Slide>, PipelineError> {
    let user = format!(
        "Input JSON:\n{}",
        serde_json::to_string(input).unwrap_or_default()
    );
    let raw = chat_completion(llm, slides_prompt(), &user).await?;
    parse_slides(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_fenced_slide_array() {
        let raw = r#"```json
[{"title": "Duplicate ids", "subtitle": "ids seen twice", "bargraphJSON": {"labels": ["1"], "values": [2]}}]
```"#;
        let slides = parse_slides(raw).unwrap();
        assert_eq!(slides.len(), 1);
        assert_eq!(slides[0].title, "Duplicate ids");
        assert_eq!(slides[0].chart.values, vec![2.0]);
    }

    #[test]
    fn rejects_non_array_output() {
        let err = parse_slides("{\"oops\": true}").unwrap_err();
        assert!(matches!(err, PipelineError::Upstream(_)));
    }

    #[test]
    fn rejects_missing_chart_data() {
        let raw = r#"[{"title": "t", "subtitle": "s"}]"#;
        assert!(parse_slides(raw).is_err());
    }

    #[test]
    fn rejects_mismatched_chart_lengths() {
        let raw = r#"[{"title": "t", "subtitle": "s", "bargraphJSON": {"labels": ["a"], "values": [1, 2]}}]"#;
        let err = parse_slides(raw).unwrap_err();
        assert!(err.to_string().contains("invalid bar chart"));
    }

    #[test]
    fn rejects_empty_array() {
        assert!(parse_slides("[]").is_err());
    }
}
