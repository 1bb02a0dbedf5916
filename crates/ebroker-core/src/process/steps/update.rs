// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Update pipeline steps.
//!
//! The `cluster` stage pushes parameter changes to the control plane, the
//! `check` stage waits for the runtime to settle. Immutable fields such as
//! the networking CIDR are rejected up front.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::clients::controlplane::{ControlPlaneClient, KymaResource, RuntimeStatus};
use crate::error::{BrokerError, Result};
use crate::model::Operation;
use crate::plans;
use crate::process::Step;
use crate::storage::SharedStorage;

use super::provisioning::{kyma_resource_name, required_runtime_id};
use super::{update_instance, POLL_INTERVAL};

/// Rejects changes to fields the control plane cannot mutate in place.
pub struct ValidateUpdateStep {
    storage: SharedStorage,
}

impl ValidateUpdateStep {
    /// Create the step.
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Step for ValidateUpdateStep {
    fn name(&self) -> &'static str {
        "validate_update"
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let instance = self.storage.instances().get(&operation.instance_id).await?;
        let requested = &operation.parameters.parameters.networking_cidr;
        let current = &instance.parameters.parameters.networking_cidr;
        if requested.is_some() && requested != current {
            return Err(BrokerError::StepFatal {
                step: self.name().to_string(),
                reason: "networking CIDR cannot be changed after provisioning".to_string(),
            });
        }
        Ok((operation, Duration::ZERO))
    }
}

/// Patches the runtime resource and the Kyma module list, then persists the
/// merged parameters on the instance.
pub struct ApplyUpdateStep {
    controlplane: Arc<dyn ControlPlaneClient>,
    storage: SharedStorage,
}

impl ApplyUpdateStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>, storage: SharedStorage) -> Self {
        Self {
            controlplane,
            storage,
        }
    }
}

#[async_trait]
impl Step for ApplyUpdateStep {
    fn name(&self) -> &'static str {
        "apply_update"
    }

    fn condition(&self, operation: &Operation) -> bool {
        !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        let machine_type = operation.parameters.parameters.machine_type.clone();
        if machine_type.is_some() {
            self.controlplane
                .patch_runtime(&runtime_id, machine_type.clone())
                .await?;
        }
        let modules = operation.parameters.parameters.modules.clone();
        if let Some(modules) = modules.clone() {
            let mut kyma = KymaResource {
                name: kyma_resource_name(&runtime_id),
                runtime_id: runtime_id.clone(),
                template: operation.kyma_template.clone().unwrap_or_default(),
                modules,
                labels: Default::default(),
            };
            kyma.labels
                .insert("kyma-project.io/instance-id".to_string(), operation.instance_id.clone());
            self.controlplane.upsert_kyma(kyma).await?;
        }
        update_instance(&self.storage, &operation.instance_id, |instance| {
            if let Some(machine_type) = machine_type.clone() {
                instance.parameters.parameters.machine_type = Some(machine_type);
            }
            if let Some(modules) = modules.clone() {
                instance.parameters.parameters.modules = Some(modules);
            }
            instance.parameters.ers_context = operation.parameters.ers_context.clone();
        })
        .await?;
        info!(
            operation_id = %operation.operation_id,
            runtime_id = %runtime_id,
            "Update applied"
        );
        Ok((operation, Duration::ZERO))
    }
}

/// Waits for the runtime to report a terminal status after the patch.
pub struct CheckUpdateStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl CheckUpdateStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for CheckUpdateStep {
    fn name(&self) -> &'static str {
        "check_update"
    }

    fn condition(&self, operation: &Operation) -> bool {
        !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        match self.controlplane.runtime_status(&runtime_id).await? {
            RuntimeStatus::Ready => Ok((operation, Duration::ZERO)),
            RuntimeStatus::Provisioning => Ok((operation, POLL_INTERVAL)),
            RuntimeStatus::Failed(reason) => Err(BrokerError::StepFatal {
                step: self.name().to_string(),
                reason,
            }),
        }
    }
}
