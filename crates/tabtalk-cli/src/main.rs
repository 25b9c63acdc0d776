use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabtalk_core::dataset::Dataset;
use tabtalk_core::insight;
use tabtalk_core::pipeline::Pipeline;
use tabtalk_core::runs::{create_new_run, list_runs, OUTCOME_FILE, SCRIPT_FILE};
use tabtalk_core::synthesizer::LlmConfig;
use tabtalk_core::util::default_data_root;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(version, about = "tabtalk — prompt-to-SQL analysis for tabular files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one prompt against a CSV/XLSX file and print or save the result
    Process {
        /// Path to the input file
        input: PathBuf,
        /// Natural-language instruction for the transformation
        prompt: String,
        /// Write the result CSV here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print duplicate/visualization insights for a file
    Visualize { input: PathBuf },
    /// Environment checks
    Doctor,
    /// Inspect recent pipeline runs
    RunsInspect {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_tracing();
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Process {
            input,
            prompt,
            output,
        } => cmd_process(&input, &prompt, output.as_deref()).await,
        Commands::Visualize { input } => cmd_visualize(&input).await,
        Commands::Doctor => cmd_doctor(),
        Commands::RunsInspect { limit } => cmd_runs_inspect(limit),
    }
}

fn install_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

async fn cmd_process(input: &Path, prompt: &str, output: Option<&Path>) -> Result<()> {
    let dataset = Dataset::from_path(input)?;
    tracing::info!(rows = dataset.row_count(), file = %input.display(), "loaded dataset");
    let pipeline = Pipeline::new(LlmConfig::from_env()?);
    let run = create_new_run(None)?;

    let done = pipeline.run_recorded(&run.dir, &dataset, prompt).await?;
    eprintln!("Generated script (run {}):\n{}\n", run.id, done.script.source());

    let csv = done.table.to_csv_string()?;
    match output {
        Some(path) => {
            fs_err::write(path, csv)?;
            println!(
                "Processed {} row(s); result saved to {}",
                done.table.row_count(),
                path.display()
            );
        }
        None => print!("{csv}"),
    }
    Ok(())
}

async fn cmd_visualize(input: &Path) -> Result<()> {
    let dataset = Dataset::from_path(input)?;
    // The rule-based pass needs no model; only fall through to the LLM
    // when no rule fires.
    let result = match insight::duplicate_insight(&dataset) {
        Some(found) => found,
        None => insight::visualize(&dataset, &LlmConfig::from_env()?).await?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_doctor() -> Result<()> {
    println!("tabtalk doctor:");
    println!(
        " - OPENAI_API_KEY: {}",
        if std::env::var("OPENAI_API_KEY").is_ok() {
            "set"
        } else {
            "MISSING"
        }
    );
    println!(
        " - OPENAI_MODEL: {}",
        std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini (default)".into())
    );
    println!(
        " - OPENAI_BASE: {}",
        std::env::var("OPENAI_BASE").unwrap_or_else(|_| "https://api.openai.com (default)".into())
    );
    match default_data_root() {
        Ok(root) => println!(" - data dir: {}", root.display()),
        Err(e) => println!(" - data dir: unavailable ({e})"),
    }
    Ok(())
}

fn cmd_runs_inspect(limit: usize) -> Result<()> {
    let runs = list_runs(limit)?;
    println!("Last {} run(s):", runs.len());
    for run in runs {
        let has_script = run.dir.join(SCRIPT_FILE).exists();
        let has_outcome = run.dir.join(OUTCOME_FILE).exists();
        println!(
            "- {}  script: {}  outcome: {}  {}",
            run.id,
            if has_script { "yes" } else { "no" },
            if has_outcome { "yes" } else { "no" },
            run.dir.display()
        );
    }
    Ok(())
}
