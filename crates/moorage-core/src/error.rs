// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy for moorage.
//!
//! Low-level I/O errors are translated into these kinds at the orchestrator
//! boundary, written into instance/backup state, and surfaced to callers as
//! structured failures; they never cross into the request-handling layer as
//! opaque errors.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::model::InstanceStatus;

/// Result type using moorage [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during routing, registry, and orchestration work.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Cluster configuration for the target is missing or invalid. Fatal:
    /// surfaced at startup or immediately to the caller, never retried.
    #[error("Routing error for '{target}': {reason}")]
    Routing {
        /// The cluster or endpoint that failed to resolve.
        target: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Concurrent mutation lost a compare-and-swap, or a uniqueness rule was
    /// violated. The caller should re-read and may retry the whole operation
    /// once.
    #[error("Conflict on {entity} '{id}': {reason}")]
    Conflict {
        /// Entity kind ("instance", "backup", "subdomain").
        entity: &'static str,
        /// Entity identifier.
        id: String,
        /// What conflicted.
        reason: String,
    },

    /// Another orchestration operation holds this instance's single-flight
    /// marker.
    #[error("Instance '{instance_id}' has operation '{operation}' in progress")]
    OperationInProgress {
        /// The instance.
        instance_id: String,
        /// The operation currently holding the marker.
        operation: String,
    },

    /// The requested status change is not an edge of the lifecycle state
    /// machine.
    #[error("Instance '{instance_id}' cannot move from '{from}' to '{to}'")]
    InvalidTransition {
        /// The instance.
        instance_id: String,
        /// Current status.
        from: InstanceStatus,
        /// Requested status.
        to: InstanceStatus,
    },

    /// The referenced record does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record kind ("instance", "backup").
        kind: &'static str,
        /// Record identifier.
        id: String,
    },

    /// A container/database/volume operation failed. Recorded as
    /// `last_error`, moves the instance to `failed`, never auto-retried.
    #[error("{operation} failed: {cause}")]
    Resource {
        /// The external operation that failed.
        operation: String,
        /// Underlying cause.
        cause: String,
    },

    /// An external call exceeded its budget. Treated as a resource failure.
    #[error("{operation} timed out after {budget:?}")]
    Timeout {
        /// The external operation that timed out.
        operation: String,
        /// The budget that was exceeded.
        budget: Duration,
    },

    /// No shared cluster has room and no configured endpoint is free to
    /// stand up a new one.
    #[error("No workload cluster capacity: {reason}")]
    Capacity {
        /// What capacity was exhausted.
        reason: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: &'static str,
        /// The validation error message.
        message: String,
    },

    /// Platform-cluster database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Build a [`Error::Resource`] from an operation name and any cause.
    pub fn resource(operation: impl Into<String>, cause: impl fmt::Display) -> Self {
        Error::Resource {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Machine-readable code for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Routing { .. } => "ROUTING_ERROR",
            Error::Conflict { .. } => "CONFLICT",
            Error::OperationInProgress { .. } => "OPERATION_IN_PROGRESS",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Resource { .. } => "RESOURCE_ERROR",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Capacity { .. } => "CAPACITY_ERROR",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Whether this is a resource-class failure (including timeouts): the
    /// kind that is written to `last_error` and never auto-retried.
    pub fn is_resource_failure(&self) -> bool {
        matches!(self, Error::Resource { .. } | Error::Timeout { .. })
    }
}
