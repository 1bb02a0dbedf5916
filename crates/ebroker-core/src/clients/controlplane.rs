// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane client: runtime and Kyma resources plus kubeconfig secrets.
//!
//! Runtime and Kyma resources are declarative. `upsert` semantics: creating a
//! missing resource sets the full spec; re-applying an existing one leaves
//! creation-only spec fields untouched, so steps stay idempotent across
//! crash-and-retry.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Desired state of a runtime (shoot cluster) resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeResource {
    /// Resource name, derived from the runtime id.
    pub name: String,
    /// Runtime identifier.
    pub runtime_id: String,
    /// Owning global account.
    pub global_account_id: String,
    /// Owning subaccount.
    pub subaccount_id: String,
    /// Provider region.
    pub region: String,
    /// Machine type of the worker pool.
    pub machine_type: Option<String>,
    /// Hyperscaler credential secret to provision with.
    pub secret_name: String,
    /// Shoot name; empty until the control plane assigns one.
    pub shoot_name: Option<String>,
    /// Worker network CIDR.
    pub networking_cidr: Option<String>,
    /// Labels stamped on the resource.
    pub labels: HashMap<String, String>,
}

/// Desired state of a Kyma resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KymaResource {
    /// Resource name.
    pub name: String,
    /// Runtime the Kyma installation targets.
    pub runtime_id: String,
    /// Rendered template the resource is created from.
    pub template: String,
    /// Module list carried in the spec.
    pub modules: Vec<String>,
    /// Labels stamped on the resource.
    pub labels: HashMap<String, String>,
}

/// Observed runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Cluster is being created or reconciled.
    Provisioning,
    /// Cluster is up and serving.
    Ready,
    /// Reconciliation failed.
    Failed(String),
}

/// Access to runtime and Kyma resources and runtime admin kubeconfigs.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Create the runtime resource or leave an existing one's creation-only
    /// fields as they are.
    async fn upsert_runtime(&self, resource: RuntimeResource) -> Result<()>;
    /// Change the mutable spec fields of an existing runtime.
    async fn patch_runtime(&self, runtime_id: &str, machine_type: Option<String>) -> Result<()>;
    /// Observed status of a runtime; `NotFound` if the resource is absent.
    async fn runtime_status(&self, runtime_id: &str) -> Result<RuntimeStatus>;
    /// Whether the runtime resource still exists.
    async fn runtime_exists(&self, runtime_id: &str) -> Result<bool>;
    /// Delete the runtime resource; absent is not an error.
    async fn delete_runtime(&self, runtime_id: &str) -> Result<()>;
    /// Create or update the Kyma resource.
    async fn upsert_kyma(&self, resource: KymaResource) -> Result<()>;
    /// Whether the Kyma resource still exists.
    async fn kyma_exists(&self, name: &str) -> Result<bool>;
    /// Delete the Kyma resource; absent is not an error.
    async fn delete_kyma(&self, name: &str) -> Result<()>;
    /// Admin kubeconfig of a ready runtime, from the secret store.
    async fn admin_kubeconfig(&self, runtime_id: &str) -> Result<String>;
}

#[derive(Default)]
struct FakeState {
    runtimes: HashMap<String, RuntimeResource>,
    runtime_statuses: HashMap<String, RuntimeStatus>,
    kymas: HashMap<String, KymaResource>,
    kubeconfigs: HashMap<String, String>,
}

/// In-memory control plane for tests. Runtimes become `Ready` immediately
/// unless a status override is installed.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

impl FakeControlPlane {
    /// Create an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the observed status of a runtime.
    pub fn set_runtime_status(&self, runtime_id: &str, status: RuntimeStatus) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .runtime_statuses
            .insert(runtime_id.to_string(), status);
    }

    /// Install the admin kubeconfig returned for a runtime.
    pub fn set_admin_kubeconfig(&self, runtime_id: &str, kubeconfig: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .kubeconfigs
            .insert(runtime_id.to_string(), kubeconfig.to_string());
    }

    /// The stored runtime resource, if any.
    pub fn runtime(&self, runtime_id: &str) -> Option<RuntimeResource> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.runtimes.get(runtime_id).cloned()
    }

    /// The stored Kyma resource, if any.
    pub fn kyma(&self, name: &str) -> Option<KymaResource> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.kymas.get(name).cloned()
    }
}

#[async_trait]
impl ControlPlaneClient for FakeControlPlane {
    async fn upsert_runtime(&self, resource: RuntimeResource) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Creation-only spec fields stay as first applied.
        state
            .runtimes
            .entry(resource.runtime_id.clone())
            .or_insert(resource);
        Ok(())
    }

    async fn patch_runtime(&self, runtime_id: &str, machine_type: Option<String>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let runtime = state
            .runtimes
            .get_mut(runtime_id)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "runtime",
                id: runtime_id.to_string(),
            })?;
        if machine_type.is_some() {
            runtime.machine_type = machine_type;
        }
        Ok(())
    }

    async fn runtime_status(&self, runtime_id: &str) -> Result<RuntimeStatus> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.runtimes.contains_key(runtime_id) {
            return Err(BrokerError::NotFound {
                resource: "runtime",
                id: runtime_id.to_string(),
            });
        }
        Ok(state
            .runtime_statuses
            .get(runtime_id)
            .cloned()
            .unwrap_or(RuntimeStatus::Ready))
    }

    async fn runtime_exists(&self, runtime_id: &str) -> Result<bool> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.runtimes.contains_key(runtime_id))
    }

    async fn delete_runtime(&self, runtime_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.runtimes.remove(runtime_id);
        state.runtime_statuses.remove(runtime_id);
        Ok(())
    }

    async fn upsert_kyma(&self, resource: KymaResource) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.kymas.insert(resource.name.clone(), resource);
        Ok(())
    }

    async fn kyma_exists(&self, name: &str) -> Result<bool> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.kymas.contains_key(name))
    }

    async fn delete_kyma(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.kymas.remove(name);
        Ok(())
    }

    async fn admin_kubeconfig(&self, runtime_id: &str) -> Result<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .kubeconfigs
            .get(runtime_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound {
                resource: "kubeconfig secret",
                id: runtime_id.to_string(),
            })
    }
}
