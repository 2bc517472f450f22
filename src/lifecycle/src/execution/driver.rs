//! Storage drivers
//!
//! A driver performs the physical side of an action against the storage
//! engine and reports sizes before and after. Secondary steps (statistics
//! refresh, rebuilding secondary structures) are separate calls so their
//! failure can be reported without undoing the primary action.

use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::policy::{ActionParameters, ActionType};
use crate::target::TargetObject;

/// Result of a successful primary action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverReport {
    pub before_size: u64,
    pub after_size: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::ResourceBusy, message)
    }

    pub fn insufficient_space(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::InsufficientSpace, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::PermissionDenied, message)
    }

    pub fn missing_target(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::MissingTarget, message)
    }
}

impl From<DriverError> for ExecutionError {
    fn from(error: DriverError) -> Self {
        ExecutionError::classify(error.kind, error.message)
    }
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn perform(
        &self,
        target: &TargetObject,
        action: ActionType,
        parameters: &ActionParameters,
    ) -> Result<DriverReport, DriverError>;

    async fn refresh_statistics(&self, _target: &TargetObject) -> Result<(), DriverError> {
        Ok(())
    }

    async fn rebuild_secondary_structures(
        &self,
        _target: &TargetObject,
        _parallel_degree: Option<u32>,
    ) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Logs what would happen and reports the target unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunDriver;

#[async_trait]
impl StorageDriver for DryRunDriver {
    async fn perform(
        &self,
        target: &TargetObject,
        action: ActionType,
        parameters: &ActionParameters,
    ) -> Result<DriverReport, DriverError> {
        let started = Instant::now();
        info!(
            target_id = %target.id(),
            action = %action,
            profile = ?parameters.compression_profile,
            tier = ?parameters.destination_tier,
            operation = ?parameters.custom_operation,
            "DRY RUN: would perform action"
        );
        Ok(DriverReport {
            before_size: target.size_bytes,
            after_size: target.size_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
