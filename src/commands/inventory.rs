use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use lifecycle::{AccessSignal, LifecycleService, RefreshScope, TargetObject};

use super::read_document;

#[derive(Subcommand, Debug)]
pub enum TargetAction {
    /// Upsert target objects from a JSON or TOML file
    Import { file: PathBuf },
    /// List registered targets
    List,
}

impl TargetAction {
    pub async fn run(self, service: &LifecycleService) -> Result<()> {
        match self {
            TargetAction::Import { file } => {
                let targets: Vec<TargetObject> = read_document(&file)?;
                let count = service
                    .import_targets(targets)
                    .await
                    .context("Failed to import targets")?;
                println!("Imported {count} target(s).");
            }
            TargetAction::List => {
                for target in service.targets().await? {
                    println!(
                        "{:<40}  {:>14}  {:<10}  {:<8}  {}",
                        target.id().as_str(),
                        target.size_bytes,
                        target.tier,
                        target.compression_profile,
                        if target.read_only { "ro" } else { "rw" },
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
pub enum TrackerAction {
    /// Merge a batch of access signals into the access records
    Ingest {
        /// JSON array of access signals
        file: PathBuf,
        /// Restrict the update to owners matching this glob
        #[arg(long)]
        namespace: Option<String>,
    },
}

impl TrackerAction {
    pub async fn run(self, service: &LifecycleService) -> Result<()> {
        match self {
            TrackerAction::Ingest { file, namespace } => {
                let signals: Vec<AccessSignal> = read_document(&file)?;
                let scope = namespace.map_or(RefreshScope::All, RefreshScope::Namespace);
                let report = service
                    .ingest_signals(&scope, signals)
                    .await
                    .context("Failed to ingest access signals")?;
                println!(
                    "Signals: {}, records created: {}, updated: {}, unknown targets: {}, out of scope: {}",
                    report.signals_received,
                    report.records_created,
                    report.records_updated,
                    report.unknown_targets,
                    report.out_of_scope
                );
            }
        }
        Ok(())
    }
}
