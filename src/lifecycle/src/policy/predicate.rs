//! Custom condition predicates
//!
//! Predicates are small expression trees over a fixed attribute
//! vocabulary. They are type-checked when a policy is registered and
//! evaluated against a target and its access record at evaluation time.
//! Comparisons on an attribute without a value (for example
//! `days_since_read` for a target that was never read) are false.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::target::TargetObject;
use crate::tracker::{AccessRecord, Temperature};

const MAX_DEPTH: usize = 16;

/// Attributes a predicate can inspect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    SizeBytes,
    AgeDays,
    AgeMonths,
    ReadCount,
    WriteCount,
    DaysSinceRead,
    DaysSinceWrite,
    Owner,
    Name,
    Subobject,
    Tier,
    CompressionProfile,
    ReadOnly,
    Temperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    Number,
    Text,
    Bool,
}

impl Attribute {
    pub fn as_str(self) -> &'static str {
        match self {
            Attribute::SizeBytes => "size_bytes",
            Attribute::AgeDays => "age_days",
            Attribute::AgeMonths => "age_months",
            Attribute::ReadCount => "read_count",
            Attribute::WriteCount => "write_count",
            Attribute::DaysSinceRead => "days_since_read",
            Attribute::DaysSinceWrite => "days_since_write",
            Attribute::Owner => "owner",
            Attribute::Name => "name",
            Attribute::Subobject => "subobject",
            Attribute::Tier => "tier",
            Attribute::CompressionProfile => "compression_profile",
            Attribute::ReadOnly => "read_only",
            Attribute::Temperature => "temperature",
        }
    }

    fn value_type(self) -> ValueType {
        match self {
            Attribute::SizeBytes
            | Attribute::AgeDays
            | Attribute::AgeMonths
            | Attribute::ReadCount
            | Attribute::WriteCount
            | Attribute::DaysSinceRead
            | Attribute::DaysSinceWrite => ValueType::Number,
            Attribute::Owner
            | Attribute::Name
            | Attribute::Subobject
            | Attribute::Tier
            | Attribute::CompressionProfile
            | Attribute::Temperature => ValueType::Text,
            Attribute::ReadOnly => ValueType::Bool,
        }
    }

    fn resolve(self, ctx: &PredicateContext<'_>) -> Option<Value> {
        let target = ctx.target;
        let days_since = |at: Option<DateTime<Utc>>| at.map(|t| (ctx.now - t).num_days().max(0));
        match self {
            Attribute::SizeBytes => Some(Value::Number(
                i64::try_from(target.size_bytes).unwrap_or(i64::MAX),
            )),
            Attribute::AgeDays => Some(Value::Number(target.age_days(ctx.now))),
            Attribute::AgeMonths => Some(Value::Number(target.age_months(ctx.now))),
            Attribute::ReadCount => ctx
                .access
                .map(|a| Value::Number(i64::try_from(a.read_count).unwrap_or(i64::MAX))),
            Attribute::WriteCount => ctx
                .access
                .map(|a| Value::Number(i64::try_from(a.write_count).unwrap_or(i64::MAX))),
            Attribute::DaysSinceRead => ctx
                .access
                .and_then(|a| days_since(a.last_read_at))
                .map(Value::Number),
            Attribute::DaysSinceWrite => ctx
                .access
                .and_then(|a| days_since(a.last_write_at))
                .map(Value::Number),
            Attribute::Owner => Some(Value::Text(target.owner.clone())),
            Attribute::Name => Some(Value::Text(target.name.clone())),
            Attribute::Subobject => target.subobject.clone().map(Value::Text),
            Attribute::Tier => Some(Value::Text(target.tier.clone())),
            Attribute::CompressionProfile => {
                Some(Value::Text(target.compression_profile.clone()))
            }
            Attribute::ReadOnly => Some(Value::Bool(target.read_only)),
            Attribute::Temperature => Some(Value::Text(ctx.temperature.as_str().to_string())),
        }
    }
}

/// Literal operand of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(i64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Number(_) => Some(ValueType::Number),
            Value::Text(_) => Some(ValueType::Text),
            Value::List(_) => None,
        }
    }

    fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a.eq_ignore_ascii_case(b),
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    StartsWith,
}

impl Operator {
    fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::StartsWith => "starts with",
        }
    }

    fn permitted_for(self, value_type: ValueType) -> bool {
        match value_type {
            ValueType::Number => !matches!(self, Operator::StartsWith),
            ValueType::Text => matches!(
                self,
                Operator::Eq | Operator::Ne | Operator::In | Operator::StartsWith
            ),
            ValueType::Bool => matches!(self, Operator::Eq | Operator::Ne),
        }
    }
}

/// Expression tree of a custom condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        attribute: Attribute,
        op: Operator,
        value: Value,
    },
    HasTag {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

/// Facts a predicate is evaluated against
#[derive(Debug, Clone, Copy)]
pub struct PredicateContext<'a> {
    pub target: &'a TargetObject,
    pub access: Option<&'a AccessRecord>,
    pub temperature: Temperature,
    pub now: DateTime<Utc>,
}

impl Predicate {
    /// Type-check the expression.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<(), ValidationError> {
        if depth > MAX_DEPTH {
            return Err(ValidationError::InvalidPredicate(format!(
                "expression nested deeper than {MAX_DEPTH} levels"
            )));
        }
        match self {
            Predicate::All(children) | Predicate::Any(children) => {
                if children.is_empty() {
                    return Err(ValidationError::InvalidPredicate(
                        "'all' and 'any' need at least one operand".to_string(),
                    ));
                }
                children.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
            Predicate::Not(inner) => inner.validate_at(depth + 1),
            Predicate::Compare {
                attribute,
                op,
                value,
            } => validate_comparison(*attribute, *op, value),
            Predicate::HasTag { key, .. } => {
                if key.trim().is_empty() {
                    Err(ValidationError::InvalidPredicate(
                        "tag key must not be empty".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn evaluate(&self, ctx: &PredicateContext<'_>) -> bool {
        match self {
            Predicate::All(children) => children.iter().all(|c| c.evaluate(ctx)),
            Predicate::Any(children) => children.iter().any(|c| c.evaluate(ctx)),
            Predicate::Not(inner) => !inner.evaluate(ctx),
            Predicate::Compare {
                attribute,
                op,
                value,
            } => match attribute.resolve(ctx) {
                Some(actual) => compare(&actual, *op, value),
                None => false,
            },
            Predicate::HasTag { key, value } => match (ctx.target.tags.get(key), value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            },
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |children: &[Predicate]| {
            children
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Predicate::All(children) => write!(f, "all({})", join(children)),
            Predicate::Any(children) => write!(f, "any({})", join(children)),
            Predicate::Not(inner) => write!(f, "not({inner})"),
            Predicate::Compare {
                attribute,
                op,
                value,
            } => write!(f, "{} {} {value}", attribute.as_str(), op.symbol()),
            Predicate::HasTag { key, value: None } => write!(f, "tag {key}"),
            Predicate::HasTag {
                key,
                value: Some(v),
            } => write!(f, "tag {key}={v}"),
        }
    }
}

fn validate_comparison(
    attribute: Attribute,
    op: Operator,
    value: &Value,
) -> Result<(), ValidationError> {
    let expected = attribute.value_type();
    if !op.permitted_for(expected) {
        return Err(ValidationError::InvalidPredicate(format!(
            "operator '{}' cannot be applied to '{}'",
            op.symbol(),
            attribute.as_str()
        )));
    }

    let operands: Vec<&Value> = match (op, value) {
        (Operator::In, Value::List(items)) if !items.is_empty() => items.iter().collect(),
        (Operator::In, _) => {
            return Err(ValidationError::InvalidPredicate(format!(
                "'in' on '{}' needs a non-empty list",
                attribute.as_str()
            )));
        }
        (_, v) => vec![v],
    };

    for operand in operands {
        if operand.value_type() != Some(expected) {
            return Err(ValidationError::InvalidPredicate(format!(
                "'{}' cannot be compared with {operand}",
                attribute.as_str()
            )));
        }
        if let (Attribute::Temperature, Value::Text(text)) = (attribute, operand) {
            text.parse::<Temperature>()
                .map_err(ValidationError::InvalidPredicate)?;
        }
    }
    Ok(())
}

fn compare(actual: &Value, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Eq => actual.loosely_equals(expected),
        Operator::Ne => !actual.loosely_equals(expected),
        Operator::In => match expected {
            Value::List(items) => items.iter().any(|item| actual.loosely_equals(item)),
            _ => false,
        },
        Operator::StartsWith => match (actual, expected) {
            (Value::Text(a), Value::Text(prefix)) => a.starts_with(prefix.as_str()),
            _ => false,
        },
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => match (actual, expected) {
            (Value::Number(a), Value::Number(b)) => match op {
                Operator::Lt => a < b,
                Operator::Le => a <= b,
                Operator::Gt => a > b,
                _ => a >= b,
            },
            _ => false,
        },
    }
}
