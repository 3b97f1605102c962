use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use paper_fetch::app::App;
use paper_fetch::config::{ConfigLoader, FileConfig};
use paper_fetch::error::HarvestError;
use paper_fetch::output::{ConsoleProgress, JsonOutput, OutputMode, SilentProgress, print_summary};

#[derive(Parser)]
#[command(name = "paper-fetch")]
#[command(about = "Batch downloader for open-access scholarly PDFs")]
#[command(version, author)]
struct Cli {
    /// Input CSV with identifier, DOI and URL columns
    input: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<Utf8PathBuf>,

    #[arg(long = "input", conflicts_with = "input")]
    input_flag: Option<Utf8PathBuf>,

    /// Root of the sharded output tree
    #[arg(long)]
    output: Option<Utf8PathBuf>,

    #[arg(long)]
    scratch: Option<Utf8PathBuf>,

    /// Result log CSV
    #[arg(long)]
    log: Option<Utf8PathBuf>,

    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Seconds to wait for a download to complete
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[arg(long)]
    shard_size: Option<usize>,

    /// Contact address sent to the metadata service
    #[arg(long)]
    email: Option<String>,

    #[arg(long)]
    metadata_base_url: Option<String>,

    #[arg(long)]
    metadata_interval_ms: Option<u64>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Process only the first N rows
    #[arg(long)]
    limit: Option<usize>,

    /// Start a fresh result log instead of appending
    #[arg(long)]
    truncate_log: bool,

    #[arg(long)]
    user_agent: Option<String>,

    /// Print the run summary as JSON and suppress progress lines
    #[arg(long, alias = "non-interactive")]
    json: bool,

    #[arg(long, short = 'v')]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            input: self.input.clone().or_else(|| self.input_flag.clone()),
            output_root: self.output.clone(),
            scratch_root: self.scratch.clone(),
            log_path: self.log.clone(),
            workers: self.workers,
            download_timeout_secs: self.timeout,
            poll_interval_ms: self.poll_interval_ms,
            shard_size: self.shard_size,
            email: self.email.clone(),
            metadata_base_url: self.metadata_base_url.clone(),
            metadata_interval_ms: self.metadata_interval_ms,
            max_attempts: self.max_attempts,
            limit: self.limit,
            append_log: self.truncate_log.then_some(false),
            user_agent: self.user_agent.clone(),
            columns: None,
        }
    }

    fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::NonInteractive
        } else {
            OutputMode::Interactive
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidConfig(_)
        | HarvestError::InputRead { .. }
        | HarvestError::MissingColumn(_) => 2,
        HarvestError::Filesystem(_) | HarvestError::LogOpen { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let file = ConfigLoader::load(cli.config.as_deref())?;
    let config = ConfigLoader::resolve(file, cli.overrides())?;
    let app = App::from_config(config)?;

    match cli.output_mode() {
        OutputMode::Interactive => {
            let summary = app.run(&ConsoleProgress)?;
            print_summary(&summary);
        }
        OutputMode::NonInteractive => {
            let summary = app.run(&SilentProgress)?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
        }
    }
    Ok(())
}
