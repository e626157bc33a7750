use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use paperflow::paperflow_config::PaperflowConfig;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "paperflow")]
#[command(version, about = "Drive the syllabus → PYQ → question paper pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to paperflow.toml (defaults to .paperflow/paperflow.toml in the project dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Worker base URL. Overrides paperflow.toml and PAPERFLOW_BASE_URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the syllabus stage and auto-chain the PYQ and paper stages
    Run {
        #[command(flatten)]
        inputs: InputArgs,

        /// Print the final outputs as JSON instead of the progress view
        #[arg(long)]
        json: bool,
    },
    /// Run a single stage, registering dependency sessions up front
    Stage {
        /// Stage to run: syllabus, pyqs or paper
        stage: String,

        /// Session from an earlier run, e.g. `--session syllabus=abc123`
        #[arg(long = "session", value_name = "STAGE=ID")]
        sessions: Vec<String>,

        #[command(flatten)]
        inputs: InputArgs,

        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Stage inputs shared by `run` and `stage`.
#[derive(Args, Clone, Debug, Default)]
pub struct InputArgs {
    /// Syllabus file (PDF, image or text)
    #[arg(long, value_name = "FILE", conflicts_with = "syllabus_text")]
    pub syllabus: Option<PathBuf>,

    /// Syllabus given inline
    #[arg(long, value_name = "TEXT")]
    pub syllabus_text: Option<String>,

    /// Previous-year question paper file
    #[arg(long, value_name = "FILE", conflicts_with = "pyqs_text")]
    pub pyqs: Option<PathBuf>,

    /// Previous-year questions given inline
    #[arg(long, value_name = "TEXT")]
    pub pyqs_text: Option<String>,

    /// Total marks for the generated paper
    #[arg(long)]
    pub total_marks: Option<u32>,

    /// Number of questions in the generated paper
    #[arg(long)]
    pub total_questions: Option<u32>,

    /// JSON file describing the paper pattern (sections, marks, bloom targets)
    #[arg(long, value_name = "FILE")]
    pub pattern: Option<PathBuf>,

    /// Extra instructions for paper generation
    #[arg(long)]
    pub instructions: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default paperflow.toml file
    Init,
}

/// Resolve configuration and install logging. The returned guard flushes the
/// log file when dropped.
fn setup(
    cli: &Cli,
    project_dir: PathBuf,
) -> Result<(PaperflowConfig, Option<tracing_appender::non_blocking::WorkerGuard>)> {
    let config = PaperflowConfig::with_cli_args(
        project_dir,
        cli.config.clone(),
        cli.verbose,
        cli.base_url.clone(),
    )?;
    let guard = paperflow::logging::init_logging(&config.logging(), cli.verbose)?;
    Ok((config, guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { inputs, json } => {
            let (config, _log_guard) = setup(&cli, project_dir)?;
            cmd::cmd_run(&config, inputs, *json).await?;
        }
        Commands::Stage {
            stage,
            sessions,
            inputs,
            json,
        } => {
            let (config, _log_guard) = setup(&cli, project_dir)?;
            cmd::cmd_stage(&config, stage, sessions, inputs, *json).await?;
        }
        // Runs without logging so `config init` works before a valid config exists
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone())?,
    }

    Ok(())
}
