use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildcheck::config::Settings;
use buildcheck::plan::{PlanFile, ScenarioPlan};
use buildcheck::scenario::{self, Harness};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Build, run and verify the scenarios in a plan
    Run(RunArgs),
    /// List the scenarios in a plan
    List(ListArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to a scenario plan (TOML)
    plan: PathBuf,

    /// Run only the named scenario (repeatable)
    #[arg(long)]
    only: Vec<String>,

    /// Maximum number of scenarios running at once
    #[arg(long, env = "BUILDCHECK_JOBS", default_value_t = 1)]
    jobs: usize,

    /// Path to the harness config file
    #[arg(long, env = "BUILDCHECK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Path to a scenario plan (TOML)
    plan: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("buildcheck error: {err:#}");
            std::process::exit(2);
        }
    }
}

/// Returns whether every selected scenario passed.
fn run() -> Result<bool> {
    let cli = Cli::parse();
    match cli.command {
        CliCommand::List(args) => {
            let plan = PlanFile::load(&args.plan)?;
            for scenario in &plan.scenarios {
                println!("{}\t(fixture: {})", scenario.name, scenario.fixture);
            }
            Ok(true)
        }
        CliCommand::Run(args) => {
            let runtime = tokio::runtime::Runtime::new()
                .context("Failed to initialize async runtime for run")?;
            runtime.block_on(run_plan(&args))
        }
    }
}

async fn run_plan(args: &RunArgs) -> Result<bool> {
    let settings = Settings::new(args.config.clone()).context("Failed to load settings")?;
    let harness = Harness::from_settings(&settings).context("Invalid settings")?;
    let plan = PlanFile::load(&args.plan)?;
    let selected = select(plan.scenarios, &args.only)?;

    info!(
        "Running {} scenario(s) from {} with up to {} job(s)",
        selected.len(),
        args.plan.display(),
        args.jobs
    );
    let reports = scenario::run_all(Arc::new(harness), selected, args.jobs).await?;

    let mut passed = 0usize;
    for report in &reports {
        println!("{report}");
        if report.passed() {
            passed += 1;
        }
    }
    println!("{passed}/{} scenario(s) passed", reports.len());
    Ok(passed == reports.len())
}

fn select(scenarios: Vec<ScenarioPlan>, only: &[String]) -> Result<Vec<ScenarioPlan>> {
    if only.is_empty() {
        return Ok(scenarios);
    }
    if let Some(missing) = only
        .iter()
        .find(|name| !scenarios.iter().any(|scenario| &scenario.name == *name))
    {
        anyhow::bail!("Unknown scenario '{missing}'");
    }
    Ok(scenarios
        .into_iter()
        .filter(|scenario| only.contains(&scenario.name))
        .collect())
}
