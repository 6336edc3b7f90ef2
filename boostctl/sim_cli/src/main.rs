#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Closed-loop simulator for the boost controller: a first-order pneumatic
//! plant driven through the real control cycle, with scripted scenarios.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use boostctl_core::ControlTelemetry;
use clap::{Args, Parser, Subcommand};
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;

/// Turbo, wastegate and engine model.
#[path = "../plant.rs"]
mod plant;

/// Scripted scenarios and their checks.
#[path = "../scenario.rs"]
mod scenario;

use scenario::{RunOptions, ScenarioKind, ScenarioOutcome};

#[derive(Parser, Debug)]
#[command(name = "boostctl-sim", version, about = "Boost controller plant simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one scenario.
    Run {
        /// Scenario to run.
        #[arg(long, value_enum)]
        scenario: ScenarioKind,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Runs every scenario in turn.
    All {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Cycles to simulate (10 ms each); defaults per scenario.
    #[arg(long)]
    cycles: Option<u64>,
    /// Aggression override in 0..=1.
    #[arg(long)]
    aggression: Option<f32>,
    /// Sensor noise seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Prints outcomes as JSON.
    #[arg(long)]
    json: bool,
    /// JSON-lines controller log.
    #[arg(long)]
    log_path: Option<PathBuf>,
    /// JSON-lines controller event log.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Include per-cycle trace records in the log.
    #[arg(long)]
    trace: bool,
}

impl CommonArgs {
    fn options(&self) -> Result<RunOptions> {
        let telemetry = if self.log_path.is_some() || self.events.is_some() {
            let mut builder = ControlTelemetry::builder("boostctl-sim").min_level(if self.trace {
                LogLevel::Trace
            } else {
                LogLevel::Debug
            });
            if let Some(path) = &self.log_path {
                builder = builder.log_path(path);
            }
            if let Some(path) = &self.events {
                builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
            }
            Some(builder.build()?)
        } else {
            None
        };
        Ok(RunOptions {
            cycles: self.cycles,
            aggression: self.aggression,
            seed: self.seed,
            telemetry,
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (kinds, common) = match &cli.command {
        Commands::Run { scenario, common } => (vec![*scenario], common),
        Commands::All { common } => (ScenarioKind::ALL.to_vec(), common),
    };
    let options = common.options()?;
    let mut outcomes = Vec::with_capacity(kinds.len());
    for kind in kinds {
        outcomes.push(scenario::run(kind, &options)?);
    }

    if common.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            print_outcome(outcome);
        }
    }

    let failed: Vec<_> = outcomes
        .iter()
        .filter(|outcome| !outcome.passed)
        .map(|outcome| format!("{:?}", outcome.scenario))
        .collect();
    if !failed.is_empty() {
        bail!("scenario checks failed: {}", failed.join(", "));
    }
    Ok(())
}

fn print_outcome(outcome: &ScenarioOutcome) {
    let verdict = if outcome.passed { "PASS" } else { "FAIL" };
    println!(
        "{verdict} {:?}: {} cycles, peak {:.2} psi, {} safety cuts, final {:?} / {}",
        outcome.scenario,
        outcome.cycles,
        outcome.peak_psi,
        outcome.safety_cuts,
        outcome.final_status.governor_state,
        outcome.final_status.mode
    );
    for check in &outcome.checks {
        let mark = if check.passed { "ok" } else { "FAILED" };
        println!("  [{mark}] {} ({})", check.name, check.detail);
    }
}
