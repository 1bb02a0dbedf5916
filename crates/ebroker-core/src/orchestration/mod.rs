// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk-upgrade orchestrations.
//!
//! An orchestration is a batch job: it resolves a target set of runtimes,
//! creates one upgrade operation per runtime, and drives them through a
//! dedicated work queue under a parallel-workers strategy. The orchestration
//! row and its operations are joined by `orchestration_id` only; traversal is
//! always a storage query, never an in-memory pointer.

pub mod manager;
pub mod resolver;

pub use self::manager::OrchestrationManager;
pub use self::resolver::RuntimeResolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::model::OperationType;

/// Kinds of batch upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationType {
    /// Upgrade the shoot cluster of each target runtime.
    UpgradeCluster,
    /// Upgrade the Kyma installation of each target runtime.
    UpgradeKyma,
}

impl OrchestrationType {
    /// Stable string form used in storage and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpgradeCluster => "upgrade_cluster",
            Self::UpgradeKyma => "upgrade_kyma",
        }
    }

    /// Parse the stable string form.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "upgrade_cluster" => Ok(Self::UpgradeCluster),
            "upgrade_kyma" => Ok(Self::UpgradeKyma),
            other => Err(BrokerError::Internal(format!(
                "unknown orchestration type '{}'",
                other
            ))),
        }
    }

    /// The operation type of the child operations this orchestration creates.
    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::UpgradeCluster => OperationType::UpgradeCluster,
            Self::UpgradeKyma => OperationType::UpgradeKyma,
        }
    }
}

/// Orchestration states. `canceling` is the only state with an obligation:
/// it may leave only for `canceled`, and only once no owned operation is
/// still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    /// Accepted, targets not yet resolved.
    Pending,
    /// Child operations are being driven.
    InProgress,
    /// All child operations succeeded (or dry run).
    Succeeded,
    /// At least one child operation failed.
    Failed,
    /// Cancel requested; waiting for in-flight operations to stop.
    Canceling,
    /// Terminal cancellation.
    Canceled,
    /// Fresh operations were created for a retry request.
    Retrying,
}

impl OrchestrationState {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Retrying => "retrying",
        }
    }

    /// Parse the stable string form.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceling" => Ok(Self::Canceling),
            "canceled" => Ok(Self::Canceled),
            "retrying" => Ok(Self::Retrying),
            other => Err(BrokerError::Internal(format!(
                "unknown orchestration state '{}'",
                other
            ))),
        }
    }

    /// Whether the state is terminal.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// A batch upgrade job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orchestration {
    /// Unique orchestration identifier.
    pub orchestration_id: String,
    /// Kind of upgrade.
    pub orchestration_type: OrchestrationType,
    /// Current state.
    pub state: OrchestrationState,
    /// Human-readable progress summary.
    pub description: String,
    /// The request as accepted.
    pub parameters: OrchestrationParameters,
    /// When the orchestration was accepted.
    pub created_at: DateTime<Utc>,
    /// Set on every persisted mutation.
    pub updated_at: DateTime<Utc>,
}

impl Orchestration {
    /// Create a fresh pending orchestration.
    pub fn new(orchestration_type: OrchestrationType, parameters: OrchestrationParameters) -> Self {
        let now = Utc::now();
        Self {
            orchestration_id: Uuid::new_v4().to_string(),
            orchestration_type,
            state: OrchestrationState::Pending,
            description: String::new(),
            parameters,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the orchestration is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

/// Parameters accepted with an orchestration request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrchestrationParameters {
    /// Which runtimes to act on.
    #[serde(default)]
    pub targets: TargetSpec,
    /// How to drive the child operations.
    #[serde(default)]
    pub strategy: StrategySpec,
    /// Resolve and record targets without dispatching operations.
    #[serde(default)]
    pub dry_run: bool,
    /// Send tenant notifications for the created operations.
    #[serde(default)]
    pub notification: bool,
    /// Failed operation ids to retry with fresh operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_operations: Vec<String>,
}

/// Include/exclude target selector. An instance is targeted when it matches
/// any include rule and no exclude rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Rules selecting runtimes into the batch.
    #[serde(default)]
    pub include: Vec<RuntimeTarget>,
    /// Rules removing runtimes from the batch.
    #[serde(default)]
    pub exclude: Vec<RuntimeTarget>,
}

/// One selector rule. All set fields must match (conjunction); `target: all`
/// matches every provisioned runtime.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeTarget {
    /// The literal `all`, matching every runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Match by global account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_account_id: Option<String>,
    /// Match by subaccount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subaccount_id: Option<String>,
    /// Match by runtime id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    /// Match by instance id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Match by plan name (e.g. `trial`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    /// Match by provider region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Match by shoot name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shoot: Option<String>,
}

/// Execution strategy for the child operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Number of parallel workers on the orchestration's queue.
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    /// When child operations become eligible to run.
    #[serde(default)]
    pub schedule: Schedule,
}

impl Default for StrategySpec {
    fn default() -> Self {
        Self {
            parallel_workers: default_parallel_workers(),
            schedule: Schedule::default(),
        }
    }
}

fn default_parallel_workers() -> usize {
    1
}

/// When an orchestration dispatches its child operations.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Schedule {
    /// Dispatch as soon as targets are resolved.
    #[default]
    Immediate,
    /// Delay each operation to the runtime's maintenance window start.
    MaintenanceWindow,
    /// Delay all operations to one fixed point in time.
    Timestamp {
        /// The dispatch time.
        at: DateTime<Utc>,
    },
}
