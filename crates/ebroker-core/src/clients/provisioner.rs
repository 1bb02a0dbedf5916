// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioner client, used by the orchestrated upgrade pipelines.
//!
//! Upgrades are asynchronous on the provisioner side: the call returns an
//! opaque operation token the step stores as `provisioner_operation_id` and
//! polls until terminal.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BrokerError, Result};

/// Shoot changes requested by an upgrade.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShootUpgradeParameters {
    /// Kubernetes version to move to, if any.
    pub kubernetes_version: Option<String>,
    /// Machine image version to move to, if any.
    pub machine_image_version: Option<String>,
}

/// Terminal or in-flight status of a provisioner operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionerOperationStatus {
    /// Still running.
    InProgress,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed(String),
}

/// Asynchronous upgrade API of the provisioner.
#[async_trait]
pub trait ProvisionerClient: Send + Sync {
    /// Start a shoot upgrade; returns the provisioner operation token.
    async fn upgrade_shoot(
        &self,
        runtime_id: &str,
        parameters: ShootUpgradeParameters,
    ) -> Result<String>;
    /// Start a Kyma upgrade; returns the provisioner operation token.
    async fn upgrade_kyma(&self, runtime_id: &str, kyma_version: &str) -> Result<String>;
    /// Poll an operation.
    async fn operation_status(&self, operation_id: &str) -> Result<ProvisionerOperationStatus>;
}

#[derive(Default)]
struct FakeProvisionerState {
    operations: HashMap<String, ProvisionerOperationStatus>,
    upgrades: Vec<(String, String)>,
}

/// In-memory provisioner for tests. Operations succeed immediately unless a
/// status override is installed.
#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<FakeProvisionerState>,
}

impl FakeProvisioner {
    /// Create an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the status returned for an operation.
    pub fn set_operation_status(&self, operation_id: &str, status: ProvisionerOperationStatus) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.operations.insert(operation_id.to_string(), status);
    }

    /// `(runtime_id, kind)` pairs of upgrades started so far.
    pub fn upgrades(&self) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.upgrades.clone()
    }
}

#[async_trait]
impl ProvisionerClient for FakeProvisioner {
    async fn upgrade_shoot(
        &self,
        runtime_id: &str,
        _parameters: ShootUpgradeParameters,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let operation_id = Uuid::new_v4().to_string();
        state
            .operations
            .insert(operation_id.clone(), ProvisionerOperationStatus::Succeeded);
        state
            .upgrades
            .push((runtime_id.to_string(), "shoot".to_string()));
        Ok(operation_id)
    }

    async fn upgrade_kyma(&self, runtime_id: &str, _kyma_version: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let operation_id = Uuid::new_v4().to_string();
        state
            .operations
            .insert(operation_id.clone(), ProvisionerOperationStatus::Succeeded);
        state
            .upgrades
            .push((runtime_id.to_string(), "kyma".to_string()));
        Ok(operation_id)
    }

    async fn operation_status(&self, operation_id: &str) -> Result<ProvisionerOperationStatus> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .operations
            .get(operation_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound {
                resource: "provisioner operation",
                id: operation_id.to_string(),
            })
    }
}
