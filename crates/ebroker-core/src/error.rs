// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the broker engine.
//!
//! Every fallible operation in the engine returns [`BrokerError`]. The error
//! carries enough structure for the two consumers that care about it: the HTTP
//! boundary (status-code mapping) and the staged manager (retry classification).

use serde::{Deserialize, Serialize};

/// Result type using BrokerError
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker request and operation processing.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// Input cannot be accepted; never retried.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field or parameter that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A referenced resource does not exist.
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// Resource kind (instance, operation, binding, ...).
        resource: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// A resource with the same identifier already exists.
    #[error("{resource} '{id}' already exists")]
    AlreadyExists {
        /// Resource kind.
        resource: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// Optimistic-lock stale write or 409 from a collaborator; refetch and retry.
    #[error("conflict on {resource}: {details}")]
    Conflict {
        /// Resource kind.
        resource: &'static str,
        /// Conflict details.
        details: String,
    },

    /// Network failure, 5xx from a dependency, or store connection loss.
    #[error("transient error during '{operation}': {details}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A step asserted a logical precondition that cannot recover.
    #[error("step '{step}' failed: {reason}")]
    StepFatal {
        /// The step that failed.
        step: String,
        /// The step-provided reason.
        reason: String,
    },

    /// Per-operation or per-step time limit reached.
    #[error("{0}")]
    Timeout(String),

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Classify this error for retry decisions in the staged manager.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } => ErrorClass::Validation,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::AlreadyExists { .. } | Self::Conflict { .. } => ErrorClass::Conflict,
            Self::Transient { .. } => ErrorClass::Transient,
            Self::StepFatal { .. } => ErrorClass::StepFatal,
            Self::Timeout(_) => ErrorClass::OperationFatal,
            Self::Internal(_) => ErrorClass::StepFatal,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Conflict)
    }

    /// Whether this is a not-found error (idempotent-delete paths treat it as done).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Stable machine-readable code, persisted in operation last-error records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ERR_VALIDATION",
            Self::NotFound { .. } => "ERR_NOT_FOUND",
            Self::AlreadyExists { .. } => "ERR_ALREADY_EXISTS",
            Self::Conflict { .. } => "ERR_CONFLICT",
            Self::Transient { .. } => "ERR_TRANSIENT",
            Self::StepFatal { .. } => "ERR_STEP_FATAL",
            Self::Timeout(_) => "ERR_TIMEOUT",
            Self::Internal(_) => "ERR_INTERNAL",
        }
    }
}

/// Coarse retry classes, one per row of the error-handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Surfaced to the caller, never retried.
    Validation,
    /// Treated as already-done on delete paths, 404 on reads.
    NotFound,
    /// Retried immediately with refetch, small bounded count.
    Conflict,
    /// Retried with backoff, bounded by step budget and operation timeout.
    Transient,
    /// Marks the operation failed with the step's reason.
    StepFatal,
    /// Operation timeout or cancel; terminal.
    OperationFatal,
}

/// Where an operation's last error originated. Persisted with the operation so
/// the failure can be attributed when users poll last_operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// The broker itself (validation, timeouts, internal logic).
    Broker,
    /// The broker database.
    Database,
    /// The cluster provisioner.
    Provisioner,
    /// The control plane hosting runtime and Kyma resources.
    ControlPlane,
    /// The target runtime cluster.
    RuntimeCluster,
    /// The data-ingress registration service.
    Edp,
    /// The hyperscaler credential pool.
    AccountPool,
    /// Not attributed.
    Unknown,
}

/// Sanitized record of the most recent step failure, stored in the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Human-readable message (sanitized; safe for last_operation polls).
    pub message: String,
    /// Stable error code.
    pub code: String,
    /// Step that reported the error, if any.
    pub step: Option<String>,
    /// Collaborator the error is attributed to.
    pub component: Dependency,
}

impl LastError {
    /// Build a last-error record from a step failure.
    pub fn from_error(err: &BrokerError, step: &str, component: Dependency) -> Self {
        Self {
            message: err.to_string(),
            code: err.code().to_string(),
            step: Some(step.to_string()),
            component,
        }
    }

    /// Build a timeout record attributed to the broker.
    pub fn timeout(message: &str) -> Self {
        Self {
            message: message.to_string(),
            code: "ERR_TIMEOUT".to_string(),
            step: None,
            component: Dependency::Broker,
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => BrokerError::NotFound {
                resource: "row",
                id: String::new(),
            },
            sqlx::Error::Database(db) if db.is_unique_violation() => BrokerError::AlreadyExists {
                resource: "row",
                id: db.constraint().unwrap_or_default().to_string(),
            },
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                BrokerError::Transient {
                    operation: "db".to_string(),
                    details: err.to_string(),
                }
            }
            _ => BrokerError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Internal(format!("json: {}", err))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Transient {
            operation: "http".to_string(),
            details: err.to_string(),
        }
    }
}
