//! Per-pair eligibility assessment
//!
//! Produces the eligibility flag and the human-readable reason stored on
//! the queue entry. The reason lists the facts that made the decision:
//! every met condition plus the pending state change when eligible, or
//! every unmet condition when not.

use crate::policy::{Condition, Policy, PredicateContext};

/// Prefix of the reason recorded when the action would change nothing.
pub const ALREADY_AT_TARGET_STATE: &str = "already at target state";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub eligible: bool,
    pub reason: String,
}

enum Check {
    Met(String),
    Unmet(String),
}

pub fn assess(policy: &Policy, ctx: &PredicateContext<'_>) -> Assessment {
    let definition = &policy.definition;
    if let Some(state) = ctx
        .target
        .already_at_destination(definition.action, &definition.parameters)
    {
        return Assessment {
            eligible: false,
            reason: format!("{ALREADY_AT_TARGET_STATE}: {state}"),
        };
    }

    let mut met = Vec::new();
    let mut unmet = Vec::new();
    for condition in &definition.conditions {
        match check(condition, ctx) {
            Check::Met(fact) => met.push(fact),
            Check::Unmet(fact) => unmet.push(fact),
        }
    }

    if !unmet.is_empty() {
        return Assessment {
            eligible: false,
            reason: unmet.join(", "),
        };
    }

    if let Some(change) = ctx
        .target
        .pending_change(definition.action, &definition.parameters)
    {
        met.push(change);
    }
    Assessment {
        eligible: true,
        reason: met.join(", "),
    }
}

fn check(condition: &Condition, ctx: &PredicateContext<'_>) -> Check {
    match condition {
        Condition::AgeDays { min_days } => {
            let age = ctx.target.age_days(ctx.now);
            if age >= i64::from(*min_days) {
                Check::Met(format!("age {age}d ≥ {min_days}d threshold"))
            } else {
                Check::Unmet(format!("age {age}d < {min_days}d threshold"))
            }
        }
        Condition::AgeMonths { min_months } => {
            let age = ctx.target.age_months(ctx.now);
            if age >= i64::from(*min_months) {
                Check::Met(format!("age {age}mo ≥ {min_months}mo threshold"))
            } else {
                Check::Unmet(format!("age {age}mo < {min_months}mo threshold"))
            }
        }
        Condition::SizeAtLeast { min_bytes } => {
            let size = ctx.target.size_bytes;
            if size >= *min_bytes {
                Check::Met(format!(
                    "size {} ≥ {} threshold",
                    format_bytes(size),
                    format_bytes(*min_bytes)
                ))
            } else {
                Check::Unmet(format!(
                    "size {} < {} threshold",
                    format_bytes(size),
                    format_bytes(*min_bytes)
                ))
            }
        }
        Condition::Temperature { class } => {
            if ctx.temperature.is_at_least_as_cold_as(*class) {
                Check::Met(format!("temperature {} satisfies {class}", ctx.temperature))
            } else {
                Check::Unmet(format!(
                    "temperature {} is warmer than {class}",
                    ctx.temperature
                ))
            }
        }
        Condition::Custom { predicate } => {
            if predicate.evaluate(ctx) {
                Check::Met(format!("predicate ({predicate}) holds"))
            } else {
                Check::Unmet(format!("predicate ({predicate}) does not hold"))
            }
        }
    }
}

/// Compact binary-unit size, e.g. `500MB` or `1.5GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else if value.fract() == 0.0 {
        format!("{value:.0}{}", UNITS[unit])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}
