//! Binary entry point for the kiln build orchestrator.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kiln::{
    BuildConfig, BuildError, BuildOutcome, BuildPipeline, BuildSettings, ConfigError,
    DirectoryBlobStore, NotifyConfig, OpsNotifier, PubSubError, RedisPubSub, RunMode,
    ScalewayBackend, ScalewayBackendError, ScalewayConfig, ShellError, SshConfig,
    SystemSshConnector, dry_run,
};

mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backend error: {0}")]
    Backend(#[from] ScalewayBackendError),
    #[error("shell error: {0}")]
    Shell(#[from] ShellError),
    #[error("broker error: {0}")]
    PubSub(#[from] PubSubError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(&cli).await {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: &Cli) -> Result<(), CliError> {
    let build_config = BuildConfig::load_without_cli_args()?;
    let settings = build_config.settings()?;

    let outcome = match RunMode::from_dry_run(cli.dry_run) {
        // Rendering needs no provider credentials.
        RunMode::DryRun => dry_run(&settings)?,
        RunMode::Execute => execute(&build_config, settings).await?,
    };
    report(&outcome);
    Ok(())
}

async fn execute(
    build_config: &BuildConfig,
    settings: BuildSettings,
) -> Result<BuildOutcome, CliError> {
    let backend = ScalewayBackend::new(ScalewayConfig::load_without_cli_args()?)?;
    let connector = SystemSshConnector::with_process_runner(SshConfig::load_without_cli_args()?)?;
    let pubsub = RedisPubSub::new(&build_config.pubsub_url)?;
    let store = DirectoryBlobStore::new(build_config.log_root.as_str());
    let notifier = OpsNotifier::from_config(&NotifyConfig::load_without_cli_args()?);

    let pipeline = BuildPipeline::new(settings, backend, connector, pubsub, store, notifier);
    Ok(pipeline.run(RunMode::Execute).await?)
}

fn report(outcome: &BuildOutcome) {
    match outcome {
        BuildOutcome::DryRunCompleted { script } => write_script(io::stdout(), script),
        BuildOutcome::Completed { session, logs } => {
            if logs.result.exit_code != Some(0) {
                warn!(
                    exit_code = ?logs.result.exit_code,
                    "provisioning script reported failure"
                );
            }
            info!(
                instance_id = session.instance_id.as_deref().unwrap_or("-"),
                stdout = %format!("{}/{}", logs.bucket, logs.stdout_key),
                stderr = %format!("{}/{}", logs.bucket, logs.stderr_key),
                "build finished"
            );
        }
    }
}

fn write_script(mut target: impl Write, script: &str) {
    write!(target, "{script}").ok();
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
