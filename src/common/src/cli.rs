use clap::Parser;
use std::path::PathBuf;

/// CLI arguments shared by every strata command
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

impl CommonArgs {
    /// Default log filter for the selected verbosity.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments. `RUST_LOG` wins when set.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(args.log_level()));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        let config = match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")?
            }
            None => Configuration::load().context("Failed to load configuration")?,
        };

        config.validate().context("Configuration validation failed")?;
        Ok(config)
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("Strata Configuration:");
            println!("=====================");
            println!("Store DSN: {}", config.store.dsn);
            println!(
                "Policy priority range: {}..={}",
                config.registry.priority_min, config.registry.priority_max
            );
            println!(
                "Temperature thresholds: hot < {}d, cold >= {}d",
                config.tracker.hot_days, config.tracker.cold_days
            );
            println!(
                "Executor: max_concurrent={}, max_attempts={}, retry_base_delay={:?}",
                config.executor.max_concurrent,
                config.executor.max_attempts,
                config.executor.retry_base_delay
            );

            if config.schedule.enabled {
                println!(
                    "Maintenance window: {:02}:00-{:02}:00 {}",
                    config.schedule.start_hour, config.schedule.end_hour, config.schedule.timezone
                );
            } else {
                println!("Maintenance window: always open");
            }
        }
        Ok(())
    }
}
