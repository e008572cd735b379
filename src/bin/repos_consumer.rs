use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use repos_consumer::config::{Config, ConfigLoader, HarvestConfig};
use repos_consumer::error::HarvestError;
use repos_consumer::harvest::DefaultHarvester;
use repos_consumer::output::JsonOutput;

#[derive(Parser)]
#[command(name = "repos-consumer")]
#[command(about = "Harvest public experiments from a remote repository into the local catalog")]
#[command(version, author)]
struct Cli {
    /// Config file (default: ./repos-consumer.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Ingest every new public experiment of the source")]
    Harvest(SourceArgs),
    #[command(about = "Show the verified identity of the source's feed")]
    Identify(SourceArgs),
    #[command(about = "List experiments in the local catalog")]
    List,
}

#[derive(Args)]
struct SourceArgs {
    /// Producer base URL; overrides `source` from the config file
    #[arg(long)]
    source: Option<String>,
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
        HarvestError::MissingConfig
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::InvalidSource(_) => 2,
        HarvestError::Transport(_)
        | HarvestError::BadAccess { .. }
        | HarvestError::OaiPmh(_)
        | HarvestError::ReposRead(_)
        | HarvestError::RemoteUserRead(_) => 3,
        HarvestError::MetsParse(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Harvest(args) => {
            let (config, source) = load_with_source(cli.config.as_deref(), args.source)?;
            let harvester = DefaultHarvester::from_config(config)?;
            let summary = harvester.harvest(&source)?;
            JsonOutput::print_summary(&summary).into_diagnostic()?;
        }
        Commands::Identify(args) => {
            let (config, source) = load_with_source(cli.config.as_deref(), args.source)?;
            let harvester = DefaultHarvester::from_config(config)?;
            let identity = harvester.identify(&source)?;
            JsonOutput::print_identity(&identity).into_diagnostic()?;
        }
        Commands::List => {
            let config = ConfigLoader::resolve(cli.config.as_deref())?;
            let harvester = DefaultHarvester::from_config(config)?;
            JsonOutput::print_list(&harvester.list()?).into_diagnostic()?;
        }
    }
    Ok(())
}

/// A `--source` flag makes the config file optional.
fn load_with_source(
    path: Option<&str>,
    source: Option<String>,
) -> Result<(HarvestConfig, String), HarvestError> {
    let config = match ConfigLoader::resolve(path) {
        Err(HarvestError::MissingConfig) if source.is_some() => {
            ConfigLoader::resolve_config(Config::default())?
        }
        other => other?,
    };
    let source = source
        .or_else(|| config.source.clone())
        .ok_or_else(|| HarvestError::ConfigParse("no source given".to_string()))?;
    Ok((config, source))
}
