use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use lifecycle::{LifecycleService, Policy, PolicyDefinition};

use super::{print_json, read_document};

#[derive(Subcommand, Debug)]
pub enum PolicyAction {
    /// Check a policy file without registering it
    Validate {
        /// Policy definition, TOML or JSON
        file: PathBuf,
    },
    /// Register a new policy
    Register {
        file: PathBuf,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Replace the definition of a registered policy
    Update {
        /// Policy name or id
        policy: String,
        file: PathBuf,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// List policies in processing order
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show a single policy
    Show { policy: String },
    Enable {
        policy: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    Disable {
        policy: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Show the audit trail of a policy
    History { policy: String },
}

impl PolicyAction {
    pub async fn run(self, service: &LifecycleService) -> Result<()> {
        let registry = service.registry();
        match self {
            PolicyAction::Validate { file } => {
                let definition: PolicyDefinition = read_document(&file)?;
                registry
                    .validate(&definition)
                    .await
                    .with_context(|| format!("Policy '{}' is invalid", definition.name))?;
                println!("Policy '{}' is valid.", definition.name);
            }
            PolicyAction::Register { file, actor } => {
                let definition: PolicyDefinition = read_document(&file)?;
                let name = definition.name.clone();
                let policy = registry
                    .register(definition, &actor)
                    .await
                    .with_context(|| format!("Failed to register policy '{name}'"))?;
                println!("Policy '{}' registered with id {}.", policy.name(), policy.id);
            }
            PolicyAction::Update {
                policy,
                file,
                actor,
            } => {
                let definition: PolicyDefinition = read_document(&file)?;
                let existing = registry.resolve(&policy).await?;
                let updated = registry
                    .update(&existing.id, definition, &actor)
                    .await
                    .with_context(|| format!("Failed to update policy '{policy}'"))?;
                println!("Policy '{}' updated.", updated.name());
            }
            PolicyAction::List { json } => {
                let policies = registry.list().await?;
                if json {
                    print_json(&policies)?;
                } else if policies.is_empty() {
                    println!("No policies registered.");
                } else {
                    for policy in &policies {
                        print_summary(policy);
                    }
                }
            }
            PolicyAction::Show { policy } => {
                let policy = registry.resolve(&policy).await?;
                print_json(&policy)?;
            }
            PolicyAction::Enable { policy, actor } => {
                let existing = registry.resolve(&policy).await?;
                registry.enable(&existing.id, &actor).await?;
                println!("Policy '{}' enabled.", existing.name());
            }
            PolicyAction::Disable { policy, actor } => {
                let existing = registry.resolve(&policy).await?;
                registry.disable(&existing.id, &actor).await?;
                println!("Policy '{}' disabled.", existing.name());
            }
            PolicyAction::History { policy } => {
                let existing = registry.resolve(&policy).await?;
                for record in registry.audit_trail(&existing.id).await? {
                    println!(
                        "{}  {:<10}  {}",
                        record.at.to_rfc3339(),
                        record.change.as_str(),
                        record.actor
                    );
                }
            }
        }
        Ok(())
    }
}

fn print_summary(policy: &Policy) {
    println!(
        "{:>5}  {:<24}  {:<11}  {:<14}  {:<8}  {}",
        policy.priority(),
        policy.name(),
        policy.definition.category.as_str(),
        policy.action().as_str(),
        if policy.is_enabled() { "enabled" } else { "disabled" },
        policy.definition.selector.namespace,
    );
}
