use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use maestro::config::Config;
use maestro::orchestration::{
    ExitStatus, OrchestrationOptions, Orchestrator, RunMode, RunOutcome, StdoutMode,
};
use maestro::{Error, Result};

/// Maestro - parallel coding-agent task orchestrator
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)\n    MAESTRO_LOG         Full log filter directive, e.g. maestro=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a requirement or task list through the agents
    Orchestrate {
        /// The requirement in natural language
        requirement: Option<String>,

        /// Where tasks come from
        #[arg(long, value_enum, default_value_t = RunMode::Manual)]
        mode: RunMode,

        /// JSON task list (required in manual mode)
        #[arg(long)]
        tasks_file: Option<PathBuf>,

        /// Stdout format [default: config `stdout_events`, else stream-json]
        #[arg(long, value_enum)]
        output_format: Option<OutputFormat>,

        /// Minimum completed/total ratio for success, 0..1
        #[arg(long)]
        success_threshold: Option<f64>,

        /// Continue the run saved at this state.json
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Also append every event to this file
        #[arg(long)]
        save_stream: Option<PathBuf>,

        /// Upper bound on concurrently running tasks
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Essential stream-json lines on stdout
    StreamJson,
    /// Every event on stdout
    StreamJsonAll,
}

impl OutputFormat {
    fn stdout_mode(self) -> StdoutMode {
        match self {
            OutputFormat::StreamJson => StdoutMode::Essential,
            OutputFormat::StreamJsonAll => StdoutMode::All,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    maestro::log::init_with_debug(cli.debug);

    let Command::Orchestrate {
        requirement,
        mode,
        tasks_file,
        output_format,
        success_threshold,
        resume,
        save_stream,
        max_concurrency,
    } = cli.command;

    let options = OrchestrationOptions {
        requirement: requirement.unwrap_or_default(),
        mode,
        tasks_file,
        success_threshold,
        max_concurrency,
        save_stream,
        stdout_mode: output_format.map(OutputFormat::stdout_mode),
    };

    let status = match run_orchestrate(options, resume) {
        Ok(outcome) => {
            tracing::info!(
                orchestration = %outcome.orchestration_id,
                exit = outcome.exit.code(),
                "exiting"
            );
            outcome.exit
        }
        Err(e) => {
            tracing::error!(error = %e, "orchestrate failed");
            eprintln!("maestro: {}", e);
            ExitStatus::for_error(&e)
        }
    };
    ExitCode::from(status.code() as u8)
}

fn run_orchestrate(options: OrchestrationOptions, resume: Option<PathBuf>) -> Result<RunOutcome> {
    let config = Config::load().map_err(|e| match e {
        Error::TomlParse(_) | Error::InvalidInput(_) => {
            Error::InvalidInput(format!("invalid config: {}", e))
        }
        other => other,
    })?;
    let workdir = std::env::current_dir()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let orchestrator = Orchestrator::new(config, &workdir);
        let cancel = orchestrator.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling");
                cancel.cancel();
            }
        });

        match resume {
            Some(path) => orchestrator.resume(&path, options).await,
            None => orchestrator.start(options).await,
        }
    })
}
