// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deprovisioning pipeline steps, shared by `deprovision` and `suspend`.
//!
//! Every step gets its own stage so that completed teardown work survives a
//! crash without being re-entered. A suspension runs the same pipeline but
//! keeps the instance row, its subscription and its archive untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::clients::controlplane::ControlPlaneClient;
use crate::clients::edp::EdpApi;
use crate::clients::runtime_cluster::RuntimeClusterClient;
use crate::error::Result;
use crate::hyperscaler::{AccountProvider, HyperscalerType};
use crate::model::{InstanceArchive, Operation, OperationType};
use crate::plans;
use crate::process::Step;
use crate::storage::SharedStorage;

use super::POLL_INTERVAL;

use super::provisioning::{kyma_resource_name, required_runtime_id};

/// Denormalises the instance into the operation. A missing instance marks
/// the rest of the pipeline as working against an already-removed instance.
pub struct InitStep {
    storage: SharedStorage,
}

impl InitStep {
    /// Create the step.
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Step for InitStep {
    fn name(&self) -> &'static str {
        "init"
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        match self.storage.instances().get(&operation.instance_id).await {
            Ok(instance) => {
                if operation.runtime_id.is_none() {
                    operation.runtime_id = instance.runtime_id.clone();
                }
                if operation.parameters.plan_id.is_empty() {
                    operation.parameters = instance.parameters.clone();
                }
            }
            Err(err) if err.is_not_found() => {
                warn!(
                    operation_id = %operation.operation_id,
                    instance_id = %operation.instance_id,
                    "Instance already removed, continuing teardown"
                );
                operation.set_detail("instance_missing", true)?;
            }
            Err(err) => return Err(err),
        }
        Ok((operation, Duration::ZERO))
    }
}

/// Removes the BTP operator's tenant resources from the target cluster.
pub struct BtpOperatorCleanupStep {
    controlplane: Arc<dyn ControlPlaneClient>,
    cluster: Arc<dyn RuntimeClusterClient>,
}

impl BtpOperatorCleanupStep {
    /// Create the step.
    pub fn new(
        controlplane: Arc<dyn ControlPlaneClient>,
        cluster: Arc<dyn RuntimeClusterClient>,
    ) -> Self {
        Self {
            controlplane,
            cluster,
        }
    }
}

#[async_trait]
impl Step for BtpOperatorCleanupStep {
    fn name(&self) -> &'static str {
        "btp_operator_cleanup"
    }

    fn condition(&self, operation: &Operation) -> bool {
        operation.runtime_id.is_some()
            && !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        if operation.detail::<bool>("btp_cleaned").unwrap_or(false) {
            return Ok((operation, Duration::ZERO));
        }
        let runtime_id = required_runtime_id(&operation)?;
        match self.controlplane.admin_kubeconfig(&runtime_id).await {
            Ok(kubeconfig) => self.cluster.cleanup_btp_operator(&kubeconfig).await?,
            // The cluster may already be gone; nothing left to clean.
            Err(err) if err.is_not_found() => {
                info!(runtime_id = %runtime_id, "No kubeconfig, skipping BTP operator cleanup");
            }
            Err(err) => return Err(err),
        }
        operation.set_detail("btp_cleaned", true)?;
        Ok((operation, Duration::ZERO))
    }
}

/// Deregisters the subaccount from EDP.
pub struct EdpDeregistrationStep {
    edp: Arc<dyn EdpApi>,
}

impl EdpDeregistrationStep {
    /// Create the step.
    pub fn new(edp: Arc<dyn EdpApi>) -> Self {
        Self { edp }
    }
}

#[async_trait]
impl Step for EdpDeregistrationStep {
    fn name(&self) -> &'static str {
        "edp_deregistration"
    }

    // A suspension will come back; the registration stays.
    fn condition(&self, operation: &Operation) -> bool {
        operation.op_type == OperationType::Deprovision
    }

    fn max_retries(&self) -> u32 {
        3
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
        if operation.detail::<bool>("edp_deregistered").unwrap_or(false) {
            return Ok((operation, Duration::ZERO));
        }
        self.edp
            .deregister(&operation.parameters.ers_context.subaccount_id)
            .await?;
        operation.set_detail("edp_deregistered", true)?;
        Ok((operation, Duration::ZERO))
    }
}

/// Deletes the Kyma resource.
pub struct DeleteKymaResourceStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl DeleteKymaResourceStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for DeleteKymaResourceStep {
    fn name(&self) -> &'static str {
        "delete_kyma_resource"
    }

    fn condition(&self, operation: &Operation) -> bool {
        operation.runtime_id.is_some()
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        let name = operation
            .detail::<String>("kyma_resource_name")
            .unwrap_or_else(|| kyma_resource_name(&runtime_id));
        self.controlplane.delete_kyma(&name).await?;
        Ok((operation, Duration::ZERO))
    }
}

/// Waits until the Kyma resource is gone.
pub struct CheckKymaDeletedStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl CheckKymaDeletedStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for CheckKymaDeletedStep {
    fn name(&self) -> &'static str {
        "check_kyma_deleted"
    }

    fn condition(&self, operation: &Operation) -> bool {
        operation.runtime_id.is_some()
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        let name = operation
            .detail::<String>("kyma_resource_name")
            .unwrap_or_else(|| kyma_resource_name(&runtime_id));
        if self.controlplane.kyma_exists(&name).await? {
            Ok((operation, POLL_INTERVAL))
        } else {
            Ok((operation, Duration::ZERO))
        }
    }
}

/// Deletes the runtime resource.
pub struct DeleteRuntimeResourceStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl DeleteRuntimeResourceStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for DeleteRuntimeResourceStep {
    fn name(&self) -> &'static str {
        "delete_runtime_resource"
    }

    fn condition(&self, operation: &Operation) -> bool {
        operation.runtime_id.is_some()
            && !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    fn max_retries(&self) -> u32 {
        2
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        self.controlplane.delete_runtime(&runtime_id).await?;
        Ok((operation, Duration::ZERO))
    }
}

/// Waits until the runtime resource is gone.
pub struct CheckRuntimeDeletedStep {
    controlplane: Arc<dyn ControlPlaneClient>,
}

impl CheckRuntimeDeletedStep {
    /// Create the step.
    pub fn new(controlplane: Arc<dyn ControlPlaneClient>) -> Self {
        Self { controlplane }
    }
}

#[async_trait]
impl Step for CheckRuntimeDeletedStep {
    fn name(&self) -> &'static str {
        "check_runtime_deleted"
    }

    fn condition(&self, operation: &Operation) -> bool {
        operation.runtime_id.is_some()
            && !plans::is_own_cluster_plan(&operation.parameters.plan_id)
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        if self.controlplane.runtime_exists(&runtime_id).await? {
            Ok((operation, POLL_INTERVAL))
        } else {
            Ok((operation, Duration::ZERO))
        }
    }
}

/// Marks the tenant's hyperscaler subscription dirty when it is no longer
/// used by any live cluster.
pub struct ReleaseSubscriptionStep {
    provider: Arc<AccountProvider>,
}

impl ReleaseSubscriptionStep {
    /// Create the step.
    pub fn new(provider: Arc<AccountProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Step for ReleaseSubscriptionStep {
    fn name(&self) -> &'static str {
        "release_subscription"
    }

    // Suspensions keep the subscription; shared and own-cluster plans never
    // claimed one.
    fn condition(&self, operation: &Operation) -> bool {
        operation.op_type == OperationType::Deprovision
            && !plans::is_own_cluster_plan(&operation.parameters.plan_id)
            && plans::plan_by_id(&operation.parameters.plan_id)
                .map(|p| !p.shared_credentials)
                .unwrap_or(false)
    }

    fn max_retries(&self) -> u32 {
        3
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let plan = plans::plan_by_id(&operation.parameters.plan_id)?;
        let region = operation
            .parameters
            .parameters
            .region
            .clone()
            .unwrap_or_default();
        let hyperscaler = HyperscalerType::new(plan.provider, &region);
        self.provider
            .release(
                &hyperscaler,
                &operation.parameters.ers_context.global_account_id,
            )
            .await?;
        Ok((operation, Duration::ZERO))
    }
}

/// Copies the instance row into the archive.
pub struct ArchiveInstanceStep {
    storage: SharedStorage,
    enabled: bool,
    dry_run: bool,
}

impl ArchiveInstanceStep {
    /// Create the step with the archiving toggle.
    pub fn new(storage: SharedStorage, enabled: bool, dry_run: bool) -> Self {
        Self {
            storage,
            enabled,
            dry_run,
        }
    }
}

#[async_trait]
impl Step for ArchiveInstanceStep {
    fn name(&self) -> &'static str {
        "archive_instance"
    }

    fn condition(&self, operation: &Operation) -> bool {
        self.enabled && operation.op_type == OperationType::Deprovision
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let instance = match self.storage.instances().get(&operation.instance_id).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => return Ok((operation, Duration::ZERO)),
            Err(err) => return Err(err),
        };
        if self.dry_run {
            info!(instance_id = %instance.instance_id, "Dry run, not archiving instance");
            return Ok((operation, Duration::ZERO));
        }
        self.storage
            .instances_archived()
            .insert(InstanceArchive {
                instance_id: instance.instance_id.clone(),
                snapshot: serde_json::to_value(&instance)?,
                archived_at: Utc::now(),
            })
            .await?;
        Ok((operation, Duration::ZERO))
    }
}

/// Final teardown step: deletes the instance row for a full deprovision.
pub struct RemoveInstanceStep {
    storage: SharedStorage,
}

impl RemoveInstanceStep {
    /// Create the step.
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Step for RemoveInstanceStep {
    fn name(&self) -> &'static str {
        "remove_instance"
    }

    fn condition(&self, operation: &Operation) -> bool {
        operation.op_type == OperationType::Deprovision
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        self.storage.instances().delete(&operation.instance_id).await?;
        info!(instance_id = %operation.instance_id, "Instance removed");
        Ok((operation, Duration::ZERO))
    }
}

/// Deletes runtime states past the retention boundary.
pub struct CleanStep {
    storage: SharedStorage,
    enabled: bool,
    dry_run: bool,
    retention: ChronoDuration,
}

impl CleanStep {
    /// Create the step with the cleaning toggle and retention window.
    pub fn new(storage: SharedStorage, enabled: bool, dry_run: bool, retention: Duration) -> Self {
        Self {
            storage,
            enabled,
            dry_run,
            retention: ChronoDuration::from_std(retention)
                .unwrap_or_else(|_| ChronoDuration::days(14)),
        }
    }
}

#[async_trait]
impl Step for CleanStep {
    fn name(&self) -> &'static str {
        "clean"
    }

    fn condition(&self, operation: &Operation) -> bool {
        self.enabled && operation.runtime_id.is_some()
            && operation.op_type == OperationType::Deprovision
    }

    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
        let runtime_id = required_runtime_id(&operation)?;
        let boundary = Utc::now() - self.retention;
        if self.dry_run {
            info!(runtime_id = %runtime_id, "Dry run, not deleting runtime states");
            return Ok((operation, Duration::ZERO));
        }
        let deleted = self
            .storage
            .runtime_states()
            .delete_older_than(&runtime_id, boundary)
            .await?;
        if deleted > 0 {
            info!(runtime_id = %runtime_id, deleted, "Deleted old runtime states");
        }
        Ok((operation, Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::controlplane::FakeControlPlane;
    use crate::clients::runtime_cluster::FakeRuntimeCluster;
    use crate::model::{ErsContext, Instance, ProvisioningParameters};
    use crate::plans::{AWS_PLAN_ID, KYMA_SERVICE_ID, TRIAL_PLAN_ID};
    use crate::storage::MemoryStorage;

    fn params(plan_id: &str) -> ProvisioningParameters {
        ProvisioningParameters {
            plan_id: plan_id.to_string(),
            service_id: KYMA_SERVICE_ID.to_string(),
            platform_region: "cf-eu10".to_string(),
            ers_context: ErsContext {
                global_account_id: "ga-1".into(),
                subaccount_id: "sa-1".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn seed_instance(storage: &SharedStorage, plan_id: &str, runtime_id: Option<&str>) {
        storage
            .instances()
            .insert(Instance {
                instance_id: "i-1".into(),
                runtime_id: runtime_id.map(String::from),
                global_account_id: "ga-1".into(),
                subaccount_id: "sa-1".into(),
                service_id: KYMA_SERVICE_ID.into(),
                service_plan_id: plan_id.into(),
                platform_region: "cf-eu10".into(),
                provider_region: Some("eu-central-1".into()),
                dashboard_url: None,
                parameters: params(plan_id),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                expired_at: None,
                version: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_tolerates_missing_instance() {
        let storage: SharedStorage = MemoryStorage::shared();
        let op = Operation::new("i-gone", OperationType::Deprovision, params(AWS_PLAN_ID));
        let step = InitStep::new(storage.clone());

        let (op, delay) = step.run(op).await.unwrap();
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(op.detail::<bool>("instance_missing"), Some(true));
    }

    #[tokio::test]
    async fn test_init_picks_up_runtime_id() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, AWS_PLAN_ID, Some("r-1")).await;
        let op = Operation::new("i-1", OperationType::Deprovision, params(AWS_PLAN_ID));

        let (op, _) = InitStep::new(storage.clone()).run(op).await.unwrap();
        assert_eq!(op.runtime_id.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn test_btp_cleanup_skips_when_kubeconfig_is_gone() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, AWS_PLAN_ID, Some("r-1")).await;
        let controlplane = Arc::new(FakeControlPlane::new());
        let cluster = Arc::new(FakeRuntimeCluster::new());
        let step = BtpOperatorCleanupStep::new(controlplane.clone(), cluster.clone());

        let mut op = Operation::new("i-1", OperationType::Deprovision, params(AWS_PLAN_ID));
        op.runtime_id = Some("r-1".into());

        // No kubeconfig published: cleanup is skipped but recorded as done.
        let (op, _) = step.run(op).await.unwrap();
        assert_eq!(op.detail::<bool>("btp_cleaned"), Some(true));
        assert_eq!(cluster.cleanup_count("kc"), 0);

        // With a kubeconfig the cleanup actually runs (fresh operation).
        controlplane.set_admin_kubeconfig("r-1", "kc");
        let mut op = Operation::new("i-1", OperationType::Deprovision, params(AWS_PLAN_ID));
        op.runtime_id = Some("r-1".into());
        let (_, _) = step.run(op).await.unwrap();
        assert_eq!(cluster.cleanup_count("kc"), 1);
    }

    #[tokio::test]
    async fn test_suspension_keeps_instance_and_subscription() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, TRIAL_PLAN_ID, Some("r-1")).await;
        let mut op = Operation::new("i-1", OperationType::Suspend, params(TRIAL_PLAN_ID));
        op.runtime_id = Some("r-1".into());

        let remove = RemoveInstanceStep::new(storage.clone());
        assert!(!remove.condition(&op));
        let release = ReleaseSubscriptionStep::new(Arc::new(AccountProvider::new(Arc::new(
            crate::clients::gardener::FakeGardener::new(),
        ))));
        assert!(!release.condition(&op));
        let edp = EdpDeregistrationStep::new(Arc::new(crate::clients::edp::FakeEdp::new()));
        assert!(!edp.condition(&op));

        op.op_type = OperationType::Deprovision;
        assert!(remove.condition(&op));
    }

    #[tokio::test]
    async fn test_archive_then_remove() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, AWS_PLAN_ID, Some("r-1")).await;
        let mut op = Operation::new("i-1", OperationType::Deprovision, params(AWS_PLAN_ID));
        op.runtime_id = Some("r-1".into());

        let archive = ArchiveInstanceStep::new(storage.clone(), true, false);
        let (op, _) = archive.run(op).await.unwrap();
        storage.instances_archived().get("i-1").await.unwrap();

        let remove = RemoveInstanceStep::new(storage.clone());
        let (op, _) = remove.run(op).await.unwrap();
        assert!(storage.instances().get("i-1").await.is_err());

        // Re-running after the row is gone stays clean.
        let (_, _) = ArchiveInstanceStep::new(storage.clone(), true, false)
            .run(op)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clean_deletes_old_runtime_states() {
        use crate::model::RuntimeState;
        use uuid::Uuid;

        let storage: SharedStorage = MemoryStorage::shared();
        for age_days in [30, 1] {
            storage
                .runtime_states()
                .insert(RuntimeState {
                    id: Uuid::new_v4().to_string(),
                    runtime_id: "r-1".into(),
                    operation_id: "op-old".into(),
                    created_at: Utc::now() - ChronoDuration::days(age_days),
                    cluster_config: serde_json::json!({}),
                    kyma_config: serde_json::json!({}),
                })
                .await
                .unwrap();
        }

        let mut op = Operation::new("i-1", OperationType::Deprovision, params(AWS_PLAN_ID));
        op.runtime_id = Some("r-1".into());
        let step = CleanStep::new(storage.clone(), true, false, Duration::from_secs(14 * 86400));
        step.run(op).await.unwrap();

        let left = storage.runtime_states().list_by_runtime("r-1").await.unwrap();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_check_runtime() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, AWS_PLAN_ID, Some("r-1")).await;
        let controlplane = Arc::new(FakeControlPlane::new());
        controlplane
            .upsert_runtime(crate::clients::controlplane::RuntimeResource {
                name: "runtime-r-1".into(),
                runtime_id: "r-1".into(),
                global_account_id: "ga-1".into(),
                subaccount_id: "sa-1".into(),
                region: "eu-central-1".into(),
                machine_type: None,
                secret_name: "sb-1".into(),
                shoot_name: None,
                networking_cidr: None,
                labels: Default::default(),
            })
            .await
            .unwrap();

        let mut op = Operation::new("i-1", OperationType::Deprovision, params(AWS_PLAN_ID));
        op.runtime_id = Some("r-1".into());

        let check = CheckRuntimeDeletedStep::new(controlplane.clone());
        let (op, delay) = check.run(op).await.unwrap();
        assert_eq!(delay, POLL_INTERVAL);

        let delete = DeleteRuntimeResourceStep::new(controlplane.clone());
        let (op, _) = delete.run(op).await.unwrap();
        // Idempotent against an already-deleted resource.
        let (op, _) = delete.run(op).await.unwrap();

        let (_, delay) = check.run(op).await.unwrap();
        assert_eq!(delay, Duration::ZERO);
    }
}
