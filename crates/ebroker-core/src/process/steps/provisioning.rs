// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning pipeline steps, shared by `provision` and `unsuspend`.
//!
//! Stage layout: `start` (ordering guard, initialisation, template, credential
//! resolution, EDP), `create_runtime` (runtime resource and readiness),
//! `apply_kyma`, `post_actions` (dashboard URL).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::clients::controlplane::{ControlPlaneClient, KymaResource, RuntimeResource, RuntimeStatus};
use crate::clients::edp::EdpApi;
use crate::error::{BrokerError, Result};
use crate::hyperscaler::{AccountProvider, HyperscalerType};
use crate::model::{Operation, OperationType, RuntimeState};
use crate::plans::{self, CloudProvider, PlansPolicy};
use crate::process::Step;
use crate::storage::SharedStorage;

use super::{POLL_INTERVAL, update_instance};

/// Kyma template applied when the request carries none.
pub const DEFAULT_KYMA_TEMPLATE: &str = r#"apiVersion: operator.kyma-project.io/v1beta2
kind: Kyma
metadata:
  name: default
  namespace: kcp-system
spec:
  channel: regular
  modules: []
"#;

fn default_region(provider: CloudProvider) -> &'static str {
    match provider {
        CloudProvider::Aws => "eu-central-1",
        CloudProvider::Azure => "westeurope",
        CloudProvider::Gcp => "europe-west3",
        CloudProvider::SapConvergedCloud => "eu-de-1",
        CloudProvider::Unknown => "",
    }
}

/// Name of the runtime resource for a runtime id.
pub fn runtime_resource_name(runtime_id: &str) -> String {
    format!("runtime-{runtime_id}")
}

/// Name of the Kyma resource for a runtime id.
pub fn kyma_resource_name(runtime_id: &str) -> String {
    format!("kyma-{runtime_id}")
}

/// Holds the operation back while a deprovisioning of the same instance is
/// still in flight.
pub struct StartStep {
    storage: SharedStorage,
}

impl StartStep {
    /// Create the step.
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Step for StartStep {
    fn name(&self) -> &'static str {
        "start"
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let last_teardown = self
            .storage
            .operations()
            .get_last_by_types(
                &operation.instance_id,
                &[OperationType::Deprovision, OperationType::Suspend],
            )
            .await?;
        if let Some(teardown) = last_teardown
            && !teardown.is_finished()
            && teardown.operation_id != operation.operation_id
        {
            info!(
                operation_id = %operation.operation_id,
                blocking = %teardown.operation_id,
                "Waiting for in-flight deprovisioning to finish"
            );
            return Ok((operation, POLL_INTERVAL));
        }
        Ok((operation, Duration::ZERO))
    }
}

/// Assigns the runtime id, denormalises instance data into the operation and
/// resolves the provider region.
pub struct InitialisationStep {
    storage: SharedStorage,
    policy: Arc<PlansPolicy>,
}

impl InitialisationStep {
    /// Create the step.
    pub fn new(storage: SharedStorage, policy: Arc<PlansPolicy>) -> Self {
        Self { storage, policy }
    }
}

#[async_trait]
impl Step for InitialisationStep {
    fn name(&self) -> &'static str {
        "initialisation"
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        let instance = self.storage.instances().get(&operation.instance_id).await?;

        if operation.runtime_id.is_none() {
            // An unsuspension reuses the runtime identity; a fresh provision
            // mints one.
            let runtime_id = instance
                .runtime_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            operation.runtime_id = Some(runtime_id);
        }
        let runtime_id = operation
            .runtime_id
            .clone()
            .unwrap_or_else(|| unreachable!("assigned above"));

        let plan = plans::plan_by_id(&operation.parameters.plan_id)?;
        let provider_region = if plans::is_trial_plan(plan.id) {
            self.policy
                .trial_provider_region(&operation.parameters.platform_region)
        } else {
            operation
                .parameters
                .parameters
                .region
                .clone()
                .unwrap_or_else(|| default_region(plan.provider).to_string())
        };
        operation.parameters.parameters.region = Some(provider_region.clone());

        update_instance(&self.storage, &operation.instance_id, |instance| {
            if instance.runtime_id.is_none() {
                instance.runtime_id = Some(runtime_id.clone());
            }
            if instance.provider_region.is_none() {
                instance.provider_region = Some(provider_region.clone());
            }
        })
        .await?;

        Ok((operation, Duration::ZERO))
    }
}

/// Seeds the operation's Kyma template when the request carried none.
pub struct InitKymaTemplateStep {
    template: String,
}

impl InitKymaTemplateStep {
    /// Create the step with the landscape's default template.
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

#[async_trait]
impl Step for InitKymaTemplateStep {
    fn name(&self) -> &'static str {
        "init_kyma_template"
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        if operation.kyma_template.is_none() {
            operation.kyma_template = Some(self.template.clone());
        }
        Ok((operation, Duration::ZERO))
    }
}

/// Resolves the hyperscaler credential secret. The chosen secret is recorded
/// in the parameters and never re-chosen on retry.
pub struct ResolveCredentialsStep {
    provider: Arc<AccountProvider>,
}

impl ResolveCredentialsStep {
    /// Create the step.
    pub fn new(provider: Arc<AccountProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Step for ResolveCredentialsStep {
    fn name(&self) -> &'static str {
        "resolve_credentials"
    }

    fn condition(&self, operation: &Operation) -> bool {
        !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    fn max_retries(&self) -> u32 {
        5
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        if operation.parameters.parameters.target_secret.is_some() {
            return Ok((operation, Duration::ZERO));
        }

        let plan = plans::plan_by_id(&operation.parameters.plan_id)?;
        let region = operation
            .parameters
            .parameters
            .region
            .clone()
            .unwrap_or_default();
        let hyperscaler = HyperscalerType::new(plan.provider, &region);
        let eu_access = plans::is_eu_restricted_access(&operation.parameters.platform_region);

        let secret = self
            .provider
            .resolve(
                &hyperscaler,
                &operation.parameters.ers_context.global_account_id,
                plan.shared_credentials,
                eu_access,
            )
            .await?;
        info!(
            operation_id = %operation.operation_id,
            secret = %secret,
            "Resolved hyperscaler credentials"
        );
        operation.parameters.parameters.target_secret = Some(secret);
        Ok((operation, Duration::ZERO))
    }
}

/// Registers the subaccount with EDP.
pub struct EdpRegistrationStep {
    edp: Arc<dyn EdpApi>,
}

impl EdpRegistrationStep {
    /// Create the step.
    pub fn new(edp: Arc<dyn EdpApi>) -> Self {
        Self { edp }
    }
}

#[async_trait]
impl Step for EdpRegistrationStep {
    fn name(&self) -> &'static str {
        "edp_registration"
    }

    fn max_retries(&self) -> u32 {
        3
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        if operation.detail::<bool>("edp_registered").unwrap_or(false) {
            return Ok((operation, Duration::ZERO));
        }
        self.edp
            .register(&operation.parameters.ers_context.subaccount_id)
            .await?;
        operation.set_detail("edp_registered", true)?;
        Ok((operation, Duration::ZERO))
    }
}

/// Applies the runtime resource in the control plane.
pub struct CreateRuntimeResourceStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl CreateRuntimeResourceStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for CreateRuntimeResourceStep {
    fn name(&self) -> &'static str {
        "create_runtime_resource"
    }

    fn condition(&self, operation: &Operation) -> bool {
        !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        let plan = plans::plan_by_id(&operation.parameters.plan_id)?;
        let target_secret = operation
            .parameters
            .parameters
            .target_secret
            .clone()
            .ok_or_else(|| BrokerError::Internal("target secret not resolved".into()))?;

        let mut labels = HashMap::new();
        labels.insert(
            "kyma-project.io/global-account-id".to_string(),
            operation.parameters.ers_context.global_account_id.clone(),
        );
        labels.insert(
            "kyma-project.io/subaccount-id".to_string(),
            operation.parameters.ers_context.subaccount_id.clone(),
        );
        labels.insert(
            "kyma-project.io/provider".to_string(),
            plan.provider.label().to_string(),
        );
        if let Some(region) = &operation.parameters.parameters.region {
            labels.insert("kyma-project.io/region".to_string(), region.clone());
        }
        // Only requests that arrived on a region-scoped mount carry the
        // platform-region label.
        if let Some(platform_region) = &operation.parameters.request_platform_region {
            labels.insert(
                "kyma-project.io/platform-region".to_string(),
                platform_region.clone(),
            );
        }

        self.controlplane
            .upsert_runtime(RuntimeResource {
                name: runtime_resource_name(&runtime_id),
                runtime_id: runtime_id.clone(),
                global_account_id: operation.parameters.ers_context.global_account_id.clone(),
                subaccount_id: operation.parameters.ers_context.subaccount_id.clone(),
                region: operation
                    .parameters
                    .parameters
                    .region
                    .clone()
                    .unwrap_or_default(),
                machine_type: operation.parameters.parameters.machine_type.clone(),
                secret_name: target_secret,
                shoot_name: operation.parameters.parameters.shoot_name.clone(),
                networking_cidr: operation.parameters.parameters.networking_cidr.clone(),
                labels,
            })
            .await?;
        Ok((operation, Duration::ZERO))
    }
}

/// Polls the runtime resource until it is ready.
pub struct CheckRuntimeResourceStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl CheckRuntimeResourceStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for CheckRuntimeResourceStep {
    fn name(&self) -> &'static str {
        "check_runtime_resource"
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
                step: "check_runtime_resource".into(),
                reason: format!("runtime provisioning failed: {reason}"),
            }),
        }
    }
}

/// Waits until the runtime's admin kubeconfig is published.
pub struct GetKubeconfigStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl GetKubeconfigStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for GetKubeconfigStep {
    fn name(&self) -> &'static str {
        "get_kubeconfig"
    }

    fn condition(&self, operation: &Operation) -> bool {
        !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        match self.controlplane.admin_kubeconfig(&runtime_id).await {
            Ok(_) => {
                operation.set_detail("kubeconfig_available", true)?;
                Ok((operation, Duration::ZERO))
            }
            Err(err) if err.is_not_found() => Ok((operation, POLL_INTERVAL)),
            Err(err) => Err(err),
        }
    }
}

/// Applies the Kyma resource carrying the requested module set and records
/// the applied config as a runtime state.
pub struct ApplyKymaResourceStep {
    controlplane: Arc<dyn ControlPlaneClient>,
    storage: SharedStorage,
}

impl ApplyKymaResourceStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>, storage: SharedStorage) -> Self {
        Self {
            controlplane,
            storage,
        }
    }
}

#[async_trait]
impl Step for ApplyKymaResourceStep {
    fn name(&self) -> &'static str {
        "apply_kyma_resource"
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        let plan = plans::plan_by_id(&operation.parameters.plan_id)?;
        let template = operation
            .kyma_template
            .clone()
            .ok_or_else(|| BrokerError::Internal("kyma template not initialised".into()))?;
        // The resource name sticks across retries.
        let name = operation
            .detail::<String>("kyma_resource_name")
            .unwrap_or_else(|| kyma_resource_name(&runtime_id));
        let modules = operation
            .parameters
            .parameters
            .modules
            .clone()
            .unwrap_or_default();

        let mut labels = HashMap::new();
        labels.insert(
            "kyma-project.io/global-account-id".to_string(),
            operation.parameters.ers_context.global_account_id.clone(),
        );
        labels.insert(
            "kyma-project.io/provider".to_string(),
            plan.provider.label().to_string(),
        );
        if let Some(region) = &operation.parameters.parameters.region {
            labels.insert("kyma-project.io/region".to_string(), region.clone());
        }
        if let Some(platform_region) = &operation.parameters.request_platform_region {
            labels.insert(
                "kyma-project.io/platform-region".to_string(),
                platform_region.clone(),
            );
        }

        let resource = KymaResource {
            name: name.clone(),
            runtime_id: runtime_id.clone(),
            template,
            modules: modules.clone(),
            labels,
        };
        self.controlplane.upsert_kyma(resource.clone()).await?;
        operation.set_detail("kyma_resource_name", &name)?;

        self.storage
            .runtime_states()
            .insert(RuntimeState {
                id: Uuid::new_v4().to_string(),
                runtime_id,
                operation_id: operation.operation_id.clone(),
                created_at: Utc::now(),
                cluster_config: serde_json::to_value(&operation.parameters.parameters)?,
                kyma_config: serde_json::json!({
                    "name": name,
                    "modules": modules,
                }),
            })
            .await?;

        Ok((operation, Duration::ZERO))
    }
}

/// Publishes the console URL on the instance.
pub struct FetchDashboardUrlStep {
    storage: SharedStorage,
}

impl FetchDashboardUrlStep {
    /// Create the step.
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Step for FetchDashboardUrlStep {
    fn name(&self) -> &'static str {
        "fetch_dashboard_url"
    }

    fn condition(&self, operation: &Operation) -> bool {
        !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        let url = format!("https://console.{runtime_id}.kyma.ondemand.com");
        update_instance(&self.storage, &operation.instance_id, |instance| {
            instance.dashboard_url = Some(url.clone());
        })
        .await?;
        Ok((operation, Duration::ZERO))
    }
}

pub(crate) fn required_runtime_id(operation: &Operation) -> Result<String> {
    operation
        .runtime_id
        .clone()
        .ok_or_else(|| BrokerError::Internal("operation has no runtime id".into()))
}
