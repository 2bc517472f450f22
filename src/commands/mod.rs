pub mod daemon;
pub mod inventory;
pub mod policy;
pub mod queue;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, utils};
use lifecycle::{DryRunDriver, LifecycleService};
use serde::de::DeserializeOwned;

/// Strata: policy-driven lifecycle automation for partitioned datasets
#[derive(Parser, Debug)]
#[command(name = "strata", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate, register and manage lifecycle policies
    Policy {
        #[command(subcommand)]
        action: policy::PolicyAction,
    },
    /// Manage the target inventory
    Targets {
        #[command(subcommand)]
        action: inventory::TargetAction,
    },
    /// Feed access signals into the temperature tracker
    Tracker {
        #[command(subcommand)]
        action: inventory::TrackerAction,
    },
    /// Run one evaluation cycle
    Evaluate {
        #[arg(long)]
        json: bool,
    },
    /// Run one execution cycle
    Execute {
        /// Dispatch at most this many operations
        #[arg(long)]
        max_operations: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show the latest eligibility decision for a policy and a target
    Explain {
        /// Policy name or id
        policy: String,
        /// Target id, `owner.name[.subobject]`
        target: String,
    },
    /// List queue entries
    Queue(queue::QueueArgs),
    /// Move a failed entry back to pending
    Requeue {
        policy: String,
        target: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Count failed attempts in a recent period
    Failures {
        /// Look-back period, e.g. `24h` or `7d`
        #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
        since: std::time::Duration,
    },
    /// Show the execution log
    Log(queue::LogArgs),
    /// Show the effective configuration
    Config {
        #[arg(long)]
        json: bool,
    },
    /// Run evaluation and execution cycles until interrupted
    Run,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = utils::load_config(self.common.config.as_ref())?;

        if let Commands::Config { json } = self.command {
            return utils::display_config(&config, json);
        }

        let service = LifecycleService::from_config(&config, Arc::new(DryRunDriver))
            .await
            .context("Failed to initialize lifecycle service")?;

        match self.command {
            Commands::Policy { action } => action.run(&service).await,
            Commands::Targets { action } => action.run(&service).await,
            Commands::Tracker { action } => action.run(&service).await,
            Commands::Evaluate { json } => queue::evaluate(&service, json).await,
            Commands::Execute {
                max_operations,
                json,
            } => queue::execute(&service, max_operations, json).await,
            Commands::Explain { policy, target } => queue::explain(&service, &policy, &target).await,
            Commands::Queue(args) => args.run(&service).await,
            Commands::Requeue {
                policy,
                target,
                actor,
            } => queue::requeue(&service, &policy, &target, &actor).await,
            Commands::Failures { since } => queue::failures(&service, since).await,
            Commands::Log(args) => args.run(&service).await,
            Commands::Run => daemon::run(Arc::new(service), &config.daemon).await,
            Commands::Config { .. } => Ok(()),
        }
    }
}

/// Read a JSON or TOML document, chosen by file extension.
pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    } else {
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
