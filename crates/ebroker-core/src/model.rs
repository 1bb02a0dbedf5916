// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted data model.
//!
//! The operation is a single tagged record with a `op_type` discriminator and an
//! opaque `details` blob the steps mutate; typed views are parsing functions on
//! the blob, not subclasses. Orchestrations and operations are joined by
//! `orchestration_id` only, never by in-memory pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BrokerError, LastError, Result};

/// A provisioned environment owned by one tenant subaccount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique OSB service instance identifier.
    pub instance_id: String,
    /// Runtime (remote cluster) identifier; set by provisioning, immutable after.
    pub runtime_id: Option<String>,
    /// Tenant global account.
    pub global_account_id: String,
    /// Tenant subaccount.
    pub subaccount_id: String,
    /// OSB service offering id.
    pub service_id: String,
    /// OSB plan id.
    pub service_plan_id: String,
    /// Platform region the request arrived under (e.g. cf-eu10).
    pub platform_region: String,
    /// Provider region the cluster landed in (e.g. eu-central-1).
    pub provider_region: Option<String>,
    /// Console URL, set once the runtime is ready.
    pub dashboard_url: Option<String>,
    /// Full provisioning parameters as last accepted.
    pub parameters: ProvisioningParameters,
    /// When the instance row was created.
    pub created_at: DateTime<Utc>,
    /// Set on every persisted mutation.
    pub updated_at: DateTime<Utc>,
    /// Set when the instance was expired; expired instances cannot be unsuspended.
    pub expired_at: Option<DateTime<Utc>>,
    /// Optimistic-lock version.
    pub version: i32,
}

impl Instance {
    /// Whether the instance has been expired.
    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }

    /// Whether the ERS context currently marks the instance active.
    /// A missing flag counts as active.
    pub fn is_active(&self) -> bool {
        self.parameters.ers_context.active.unwrap_or(true)
    }
}

/// Lifecycle action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create a new runtime.
    Provision,
    /// Destroy the runtime and remove the instance.
    Deprovision,
    /// Change parameters of a live runtime.
    Update,
    /// Soft-deprovision keeping the instance row.
    Suspend,
    /// Re-provision a suspended instance.
    Unsuspend,
    /// Orchestrated shoot upgrade.
    UpgradeCluster,
    /// Orchestrated Kyma upgrade.
    UpgradeKyma,
}

impl OperationType {
    /// Stable string form used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Update => "update",
            Self::Suspend => "suspend",
            Self::Unsuspend => "unsuspend",
            Self::UpgradeCluster => "upgrade_cluster",
            Self::UpgradeKyma => "upgrade_kyma",
        }
    }

    /// Parse the stable string form.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "provision" => Ok(Self::Provision),
            "deprovision" => Ok(Self::Deprovision),
            "update" => Ok(Self::Update),
            "suspend" => Ok(Self::Suspend),
            "unsuspend" => Ok(Self::Unsuspend),
            "upgrade_cluster" => Ok(Self::UpgradeCluster),
            "upgrade_kyma" => Ok(Self::UpgradeKyma),
            other => Err(BrokerError::Internal(format!(
                "unknown operation type '{}'",
                other
            ))),
        }
    }

    /// Whether this operation tears a runtime down (fully or temporarily).
    pub fn is_deprovisioning(&self) -> bool {
        matches!(self, Self::Deprovision | Self::Suspend)
    }

    /// Whether this operation brings a runtime up.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provision | Self::Unsuspend)
    }
}

/// Operation states. Transitions are monotonic except `retrying -> in_progress`;
/// `succeeded`, `failed` and `canceled` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Accepted, not yet picked up by a worker.
    Pending,
    /// A worker is advancing the operation.
    InProgress,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
    /// Terminal cancellation.
    Canceled,
    /// Waiting for a scheduled re-delivery.
    Retrying,
}

impl OperationState {
    /// Stable string form used in storage and the OSB surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
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
            "canceled" => Ok(Self::Canceled),
            "retrying" => Ok(Self::Retrying),
            other => Err(BrokerError::Internal(format!(
                "unknown operation state '{}'",
                other
            ))),
        }
    }

    /// Whether the state is terminal.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// One durable state machine for a lifecycle action on one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation identifier.
    pub operation_id: String,
    /// Owning instance.
    pub instance_id: String,
    /// Discriminator for the step pipeline that processes this record.
    pub op_type: OperationType,
    /// Current state.
    pub state: OperationState,
    /// Sanitized description surfaced on last_operation polls.
    pub description: String,
    /// When the operation was accepted.
    pub created_at: DateTime<Utc>,
    /// Set on every persisted mutation.
    pub updated_at: DateTime<Utc>,
    /// Owning orchestration, for upgrade operations.
    pub orchestration_id: Option<String>,
    /// Opaque token of the in-flight provisioner operation.
    pub provisioner_operation_id: Option<String>,
    /// Runtime the operation acts on; set once, then immutable.
    pub runtime_id: Option<String>,
    /// Ordered list of completed stage names; grows only forward.
    pub finished_stages: Vec<String>,
    /// Name of the last step that ran.
    pub last_step: Option<String>,
    /// Parameters snapshot the steps work from.
    pub parameters: ProvisioningParameters,
    /// Kyma resource template carried opaque.
    pub kyma_template: Option<String>,
    /// Free-form JSON object the steps mutate to record their own progress.
    pub details: Value,
    /// Most recent step failure, sanitized.
    pub last_error: Option<LastError>,
    /// Optimistic-lock version.
    pub version: i32,
}

impl Operation {
    /// Create a fresh pending operation.
    pub fn new(
        instance_id: &str,
        op_type: OperationType,
        parameters: ProvisioningParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            op_type,
            state: OperationState::Pending,
            description: format!("{} operation created", op_type.as_str()),
            created_at: now,
            updated_at: now,
            orchestration_id: None,
            provisioner_operation_id: None,
            runtime_id: None,
            finished_stages: Vec::new(),
            last_step: None,
            parameters,
            kyma_template: None,
            details: Value::Object(Default::default()),
            last_error: None,
            version: 0,
        }
    }

    /// Whether the operation is in a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Whether the given stage has already been completed.
    pub fn is_stage_finished(&self, stage: &str) -> bool {
        self.finished_stages.iter().any(|s| s == stage)
    }

    /// Record a stage as completed. Finished stages are never revisited.
    pub fn finish_stage(&mut self, stage: &str) {
        if !self.is_stage_finished(stage) {
            self.finished_stages.push(stage.to_string());
        }
    }

    /// Read a typed value a step previously recorded under `key` in `details`.
    pub fn detail<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.details
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Record a step's own progress under `key` in `details`.
    pub fn set_detail<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let obj = self
            .details
            .as_object_mut()
            .ok_or_else(|| BrokerError::Internal("operation details is not an object".into()))?;
        obj.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Remove a previously recorded detail.
    pub fn clear_detail(&mut self, key: &str) {
        if let Some(obj) = self.details.as_object_mut() {
            obj.remove(key);
        }
    }
}

/// Parameters accepted with a provision or update request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProvisioningParameters {
    /// OSB plan id.
    pub plan_id: String,
    /// OSB service offering id.
    pub service_id: String,
    /// Platform region the request arrived under.
    #[serde(default)]
    pub platform_region: String,
    /// Region path segment of the request URL; `None` on the plain mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_platform_region: Option<String>,
    /// Environment-provisioning context from the platform.
    #[serde(default)]
    pub ers_context: ErsContext,
    /// Tenant-supplied cluster parameters.
    #[serde(default)]
    pub parameters: ClusterParameters,
}

/// Environment-provisioning (ERS) context carried by the platform.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErsContext {
    /// Tenant global account.
    #[serde(default)]
    pub global_account_id: String,
    /// Tenant subaccount.
    #[serde(default)]
    pub subaccount_id: String,
    /// Requesting user, if the platform passed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Suspension flag: `false` suspends, `true` resumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// Tenant-supplied cluster parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterParameters {
    /// Display name of the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Provider region (e.g. eu-central-1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Machine type override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    /// Hyperscaler secret chosen by credential resolution; never re-chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_secret: Option<String>,
    /// Kyma modules requested for the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<String>>,
    /// Shoot name, for own-cluster and imported runtimes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shoot_name: Option<String>,
    /// Shoot networking CIDR; changing it on update is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking_cidr: Option<String>,
}

/// Time-limited cluster access credential issued against an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// OSB binding identifier, unique per instance.
    pub binding_id: String,
    /// Owning instance.
    pub instance_id: String,
    /// When the binding was created.
    pub created_at: DateTime<Utc>,
    /// When the minted token stops working.
    pub expires_at: DateTime<Utc>,
    /// Assembled kubeconfig; encrypted at rest.
    pub kubeconfig: String,
    /// `{email} {origin}` of the creator, whitespace collapsed.
    pub created_by: String,
    /// Request parameters hash, for idempotent re-PUT detection.
    pub parameters_hash: String,
}

impl Binding {
    /// Whether the binding token is still valid at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Append-only audit row of configs observed or sent for a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Surrogate id.
    pub id: String,
    /// Runtime this state belongs to.
    pub runtime_id: String,
    /// Operation that produced the state.
    pub operation_id: String,
    /// When the state was recorded.
    pub created_at: DateTime<Utc>,
    /// Cluster config as sent to the provisioner.
    pub cluster_config: Value,
    /// Kyma config as applied.
    pub kyma_config: Value,
}

/// Frozen snapshot of an instance taken on successful deprovisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceArchive {
    /// The archived instance id.
    pub instance_id: String,
    /// Full instance snapshot.
    pub snapshot: Value,
    /// When the snapshot was taken.
    pub archived_at: DateTime<Utc>,
}

/// Log line attached to an instance, readable by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    /// Surrogate id.
    pub id: String,
    /// Instance the event belongs to.
    pub instance_id: String,
    /// When the event occurred.
    pub at: DateTime<Utc>,
    /// `info` or `error`.
    pub level: String,
    /// Event message.
    pub message: String,
}
