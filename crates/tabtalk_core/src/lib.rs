//! Core pipeline for prompt-driven tabular analysis: summarize a dataset for
//! an LLM, synthesize a SQL transform script from a natural-language
//! instruction, and execute that script against the data in a constrained
//! in-memory scope.

pub mod dataset;
pub mod error;
pub mod executor;
pub mod insight;
pub mod pipeline;
pub mod runs;
pub mod slides;
pub mod summary;
pub mod synthesizer;
pub mod util;
pub mod workflow;
