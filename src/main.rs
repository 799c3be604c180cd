//! SFCFlow command-line entry point
//!
//! Subcommands: `build` validates the configuration and exercises the
//! container runtime path, `orchestrate` runs the control plane, and
//! `test1`/`test2`/`test3`/`testall` run the built-in scenarios against
//! the simulated runtime.
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime failure,
//! 3 partial-test failure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sfcflow::chain::DemandGenerator;
use sfcflow::config::OrchestratorConfig;
use sfcflow::driver::{ContainerApi, ResourceLimits, SimContainerApi};
use sfcflow::scenarios::{self, ScenarioReport};
use sfcflow::Orchestrator;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const EXIT_CONFIG: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_PARTIAL: u8 = 3;

#[derive(Parser)]
#[command(
    name = "sfcflow",
    about = "NFV control plane for email-security service function chains",
    version
)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "sfcflow.toml")]
    config: PathBuf,

    /// Log filter (e.g. info, sfcflow=debug)
    #[arg(long, default_value = "info", env = "SFCFLOW_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate configuration and the VNF catalogue
    Build,
    /// Run the orchestrator
    Orchestrate,
    /// Scenario: proactive scale-out from a CPU ramp
    Test1,
    /// Scenario: safe scale-in blocked on the last chained instance
    Test2,
    /// Scenario: allocation rollback on flow conflict
    Test3,
    /// All scenarios
    Testall,
}

fn load_config(path: &PathBuf) -> Result<OrchestratorConfig, u8> {
    if !path.exists() {
        if path.as_os_str() == "sfcflow.toml" {
            info!("no configuration file, using defaults");
            return Ok(OrchestratorConfig::default());
        }
        error!(path = %path.display(), "configuration file not found");
        return Err(EXIT_CONFIG);
    }
    OrchestratorConfig::load(path).map_err(|err| {
        error!(%err, "configuration rejected");
        EXIT_CONFIG
    })
}

async fn run_build(config: OrchestratorConfig) -> Result<()> {
    let api = SimContainerApi::default();
    for vnf_type in &config.vnf_types {
        let container = api
            .create(vnf_type.image(), &HashMap::new(), &ResourceLimits::default())
            .await
            .with_context(|| format!("probing image for {vnf_type}"))?;
        api.destroy(&container).await?;
        info!(%vnf_type, image = vnf_type.image(), "image ready");
    }
    info!(types = config.vnf_types.len(), "catalogue validated");
    Ok(())
}

async fn run_orchestrate(config: OrchestratorConfig) -> Result<()> {
    let api = Arc::new(SimContainerApi::default());
    let orchestrator = Orchestrator::new(config, api)?;
    orchestrator.bootstrap().await?;
    orchestrator.start().await?;

    // Background demand keeps the decision loop exercised even without an
    // external front end pushing chain requests.
    let allocator = Arc::clone(orchestrator.allocator());
    tokio::spawn(async move {
        let mut demand = DemandGenerator::new(2.0, 1);
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            for request in demand.next_batch() {
                if let Err(err) = allocator.allocate(request) {
                    warn!(%err, "chain request rejected");
                }
            }
        }
    });

    orchestrator.run_until_signal().await
}

fn report_outcome(reports: &[ScenarioReport]) -> u8 {
    let mut failed = 0;
    for report in reports {
        if report.passed {
            info!(scenario = report.name, detail = %report.detail, "PASS");
        } else {
            error!(scenario = report.name, detail = %report.detail, "FAIL");
            failed += 1;
        }
    }
    if failed == 0 {
        0
    } else {
        EXIT_PARTIAL
    }
}

async fn dispatch(cli: Cli) -> u8 {
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let outcome: Result<u8> = match cli.command {
        Command::Build => run_build(config).await.map(|()| 0),
        Command::Orchestrate => run_orchestrate(config).await.map(|()| 0),
        Command::Test1 => scenarios::proactive_scale_out()
            .await
            .map(|r| report_outcome(&[r])),
        Command::Test2 => scenarios::safe_scale_in_blocked()
            .await
            .map(|r| report_outcome(&[r])),
        Command::Test3 => scenarios::allocation_rollback()
            .await
            .map(|r| report_outcome(&[r])),
        Command::Testall => scenarios::run_all().await.map(|r| report_outcome(&r)),
    };
    match outcome {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "runtime failure");
            EXIT_RUNTIME
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };
    ExitCode::from(runtime.block_on(dispatch(cli)))
}
