// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upgrade pipeline steps, driven by orchestrations.
//!
//! Both upgrade kinds start an asynchronous provisioner operation in their
//! first stage and poll it to a terminal state in the `check` stage. The
//! provisioner token survives requeues in `provisioner_operation_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clients::provisioner::{
    ProvisionerClient, ProvisionerOperationStatus, ShootUpgradeParameters,
};
use crate::error::{BrokerError, Result};
use crate::model::Operation;
use crate::process::Step;

use super::provisioning::required_runtime_id;
use super::POLL_INTERVAL;

/// Versions an orchestration asks an upgrade to move to, carried in the
/// operation's detail blob under `upgrade_versions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpgradeVersions {
    /// Target Kubernetes version for cluster upgrades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Target machine image version for cluster upgrades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_image_version: Option<String>,
    /// Target Kyma version for Kyma upgrades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyma_version: Option<String>,
}

/// Detail key the orchestration manager writes the target versions under.
pub const UPGRADE_VERSIONS_KEY: &str = "upgrade_versions";

/// Starts a shoot upgrade on the provisioner.
pub struct UpgradeClusterStep {
    provisioner: Arc<dyn ProvisionerClient>,
}

impl UpgradeClusterStep {
    /// Create the step.
    pub fn new(provisioner: Arc<dyn ProvisionerClient>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for UpgradeClusterStep {
    fn name(&self) -> &'static str {
        "upgrade_cluster"
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        if operation.provisioner_operation_id.is_some() {
            return Ok((operation, Duration::ZERO));
        }
        let runtime_id = required_runtime_id(&operation)?;
        let versions: UpgradeVersions = operation
            .detail(UPGRADE_VERSIONS_KEY)
            .unwrap_or_default();
        let token = self
            .provisioner
            .upgrade_shoot(
                &runtime_id,
                ShootUpgradeParameters {
                    kubernetes_version: versions.kubernetes_version,
                    machine_image_version: versions.machine_image_version,
                },
            )
            .await?;
        info!(
            operation_id = %operation.operation_id,
            runtime_id = %runtime_id,
            provisioner_operation_id = %token,
            "Cluster upgrade started"
        );
        operation.provisioner_operation_id = Some(token);
        Ok((operation, Duration::ZERO))
    }
}

/// Starts a Kyma upgrade on the provisioner.
pub struct UpgradeKymaStep {
    provisioner: Arc<dyn ProvisionerClient>,
}

impl UpgradeKymaStep {
    /// Create the step.
    pub fn new(provisioner: Arc<dyn ProvisionerClient>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for UpgradeKymaStep {
    fn name(&self) -> &'static str {
        "upgrade_kyma"
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        if operation.provisioner_operation_id.is_some() {
            return Ok((operation, Duration::ZERO));
        }
        let runtime_id = required_runtime_id(&operation)?;
        let versions: UpgradeVersions = operation
            .detail(UPGRADE_VERSIONS_KEY)
            .unwrap_or_default();
        let kyma_version = versions.kyma_version.unwrap_or_default();
        let token = self
            .provisioner
            .upgrade_kyma(&runtime_id, &kyma_version)
            .await?;
        info!(
            operation_id = %operation.operation_id,
            runtime_id = %runtime_id,
            provisioner_operation_id = %token,
            "Kyma upgrade started"
        );
        operation.provisioner_operation_id = Some(token);
        Ok((operation, Duration::ZERO))
    }
}

/// Polls the provisioner operation until it terminates.
pub struct CheckProvisionerOperationStep {
    provisioner: Arc<dyn ProvisionerClient>,
}

impl CheckProvisionerOperationStep {
    /// Create the step.
    pub fn new(provisioner: Arc<dyn ProvisionerClient>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl Step for CheckProvisionerOperationStep {
    fn name(&self) -> &'static str {
        "check_provisioner_operation"
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let token = operation
            .provisioner_operation_id
            .clone()
            .ok_or_else(|| BrokerError::StepFatal {
                step: self.name().to_string(),
                reason: "no provisioner operation to poll".to_string(),
            })?;
        match self.provisioner.operation_status(&token).await? {
            ProvisionerOperationStatus::Succeeded => Ok((operation, Duration::ZERO)),
            ProvisionerOperationStatus::InProgress => Ok((operation, POLL_INTERVAL)),
            ProvisionerOperationStatus::Failed(reason) => Err(BrokerError::StepFatal {
                step: self.name().to_string(),
                reason,
            }),
        }
    }
}
