//! `kural` command-line host.
//!
//! ## Runtime note
//!
//! The orchestrator is synchronous. Native collaborators hold blocking HTTP
//! clients, so `AppState` is built (and dropped) on the main thread outside
//! the Tokio runtime; the runtime only schedules `spawn_blocking` runs and
//! listens for Ctrl-C.

mod commands;
mod settings;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use kural_core::RunId;
use settings::{default_settings_path, load_settings};
use state::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "kural", version, about = "Resumable Tamil speech relay pipeline")]
struct Cli {
    /// Settings file (default: $XDG_DATA_HOME/kural/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run (or resume) the pipeline for one or more recordings.
    Run(RunArgs),
    /// List recent runs recorded in the ledger.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the stage records of one run.
    Status {
        run_id: String,
        /// Print the run and its records as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Input recordings.
    files: Vec<PathBuf>,

    /// Also run every audio file in this directory.
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Continue the newest unfinished run of each input instead of starting fresh.
    #[arg(long, conflicts_with = "resume")]
    resume_latest: bool,

    /// Continue this run id (single input only).
    #[arg(long)]
    resume: Option<String>,

    /// Skip the enrichment stage.
    #[arg(long)]
    no_enrich: bool,

    /// Translate the enrichment output instead of the transcript.
    #[arg(long)]
    translate_enriched: bool,

    /// Target language code for translation and synthesis.
    #[arg(long)]
    target: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Use deterministic offline collaborators.
    #[arg(long)]
    stub: bool,

    /// Override the settings' parallel run limit.
    #[arg(long)]
    jobs: Option<usize>,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "kural=info,kural_core=info,kural_app=info",
        1 => "kural=debug,kural_core=debug,kural_app=debug",
        _ => "kural=trace,kural_core=trace,kural_app=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("kural: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Returns whether every requested run ended successfully.
fn run(cli: Cli) -> anyhow::Result<bool> {
    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();
    info!(path = %settings_path.display(), "settings loaded");

    match cli.command {
        Command::Run(args) => {
            if args.stub {
                settings.backend = "stub".into();
            }
            if args.no_enrich {
                settings.enrichment_enabled = false;
            }
            if args.translate_enriched {
                settings.translate_enriched = true;
            }
            if let Some(target) = &args.target {
                settings.target_language = settings::normalize_language(target, "ta");
            }
            if let Some(jobs) = args.jobs {
                settings.max_parallel_runs = jobs.clamp(1, 16);
            }

            let inputs = commands::collect_inputs(&args.files, args.input_dir.as_deref())?;
            if args.resume.is_some() && inputs.len() != 1 {
                anyhow::bail!("--resume takes exactly one input");
            }

            let state = AppState::build(settings)?;
            let mut options = state.base_options(args.output_dir);
            if let Some(run_id) = args.resume {
                options = options.resume(RunId::from(run_id));
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting async runtime")?;
            let summary = runtime.block_on(commands::run_batch(
                &state,
                inputs,
                options,
                args.resume_latest,
            ))?;
            drop(runtime);
            Ok(summary.all_ok())
        }
        Command::Runs { limit } => {
            let state = AppState::build(settings)?;
            commands::list_runs(state.ledger.as_ref(), limit)?;
            Ok(true)
        }
        Command::Status { run_id, json } => {
            let state = AppState::build(settings)?;
            commands::show_status(state.ledger.as_ref(), &RunId::from(run_id), json)?;
            Ok(true)
        }
    }
}
