//! Storage lifecycle automation.
//!
//! Declarative policies describe what should happen to stored objects as
//! they age or cool down (compress, move to a cheaper tier, mark read-only,
//! purge). An evaluation cycle decides which policy applies to which target
//! and records every decision with its reason in a durable queue. An
//! execution cycle drains eligible queue entries through a
//! [`execution::StorageDriver`] within concurrency and scheduling limits,
//! writing an audit entry for every attempt.

pub mod audit;
pub mod error;
pub mod evaluation;
pub mod execution;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod service;
pub mod store;
pub mod target;
pub mod tracker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use audit::{AuditLog, ExecutionLogEntry, ExecutionOutcome, LogQuery};
pub use error::{
    ExecutionError, ExecutionErrorKind, LifecycleError, Result, StoreError, ValidationError,
    ValidationErrorKind,
};
pub use evaluation::{EvaluationReport, Evaluator};
pub use execution::{
    AlwaysOpen, DriverError, DriverReport, DryRunDriver, ExecutionConfig, ExecutionEngine,
    ExecutionReport, MaintenanceWindow, ScheduleGate, SkipReason, StorageDriver,
};
pub use metrics::LifecycleMetrics;
pub use policy::{
    ActionParameters, ActionType, Condition, Policy, PolicyCategory, PolicyDefinition, PolicyId,
    PolicyRegistry, TargetSelector,
};
pub use queue::{QueueEntry, QueueFilter, QueueKey, QueueStatus};
pub use service::LifecycleService;
pub use store::{InMemoryStore, LifecycleStore, SqliteStore};
pub use target::{TargetId, TargetObject};
pub use tracker::{AccessRecord, AccessSignal, AccessTracker, RefreshScope, Temperature};
