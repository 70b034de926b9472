use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;

use ntrip_monitor::config::{DEFAULT_CONFIG_PATH, MonitorConfig};
use ntrip_monitor::error::PipelineError;
use ntrip_monitor::module::reconcile::JsonFileStore;
use ntrip_monitor::module::sbc_api::SbcApiClient;
use ntrip_monitor::module::scheduled::ScheduledRunner;
use ntrip_monitor::module::sourcetable::SourceTableClient;
use ntrip_monitor::pipeline::{self, Pipeline};

#[derive(Parser)]
#[command(name = "ntrip-monitor", version, about = "SmartFix NTRIP station discovery and health monitor")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "NTRIP_MONITOR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan every caster port and update station metadata
    Scan {
        /// Also verify that online stations deliver RTCM data
        #[arg(long)]
        verify: bool,
    },
    /// Verify data flow for stored online stations
    Verify,
    /// Regenerate the port mapping and QA report from stored metadata
    Report,
    /// Update station status from the SBC site API
    ApiStatus,
    /// Run scheduled scans until interrupted
    Daemon,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match MonitorConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let _logging_guard = match ntrip_monitor::logging::init_logging(&config.log_dir, "ntrip-monitor", &config.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(pipeline_error) = e.downcast_ref::<PipelineError>() {
                tracing::error!("CRITICAL: {}", pipeline_error);
            } else {
                tracing::error!("{:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: MonitorConfig) -> Result<()> {
    tracing::info!("NTRIP monitor starting (caster {})", config.caster.host);

    let fetcher = SourceTableClient::new(config.caster_endpoint());
    let store = JsonFileStore::new(config.meta_path());
    let api_config = config.api.clone();
    let schedule = config.schedule.clone();
    let pipeline = Arc::new(Pipeline::new(config, fetcher, store));

    match command {
        Command::Scan { verify } => {
            let verify = pipeline.config().verify_on_scan(verify);
            pipeline.run_scan(verify, pipeline::now()).await?;
        }
        Command::Verify => {
            pipeline.run_verify(pipeline::now()).await?;
        }
        Command::Report => {
            let summary = pipeline.run_report(pipeline::now()).await?;
            tracing::info!("Report regenerated for {} stations", summary.stations);
        }
        Command::ApiStatus => {
            let api_config = api_config.context("No [api] section in configuration")?;
            let client = SbcApiClient::new(&api_config)?;
            let site_online = client.site_status().await?;
            pipeline.run_site_status(&site_online, pipeline::now()).await?;
        }
        Command::Daemon => {
            let mut runner = ScheduledRunner::new(pipeline, schedule);
            runner.start();
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            runner.shutdown().await;
        }
    }

    Ok(())
}
