// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration lifecycle: scheduling, cancellation and retry.
//!
//! `execute` drives one orchestration to a terminal state. It resolves the
//! targets, creates one child operation per runtime, feeds a dedicated work
//! queue under the requested parallelism and then watches the store until
//! every child settles. Cancellation flips the orchestration to `canceling`
//! and stops pending children; in-flight children notice the canceled state
//! between steps and abandon themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::events::{BrokerEvent, EventBus};
use crate::model::{Operation, OperationState, OperationType};
use crate::process::steps::upgrade::{UpgradeVersions, UPGRADE_VERSIONS_KEY};
use crate::queue::{Executor, WorkQueue};
use crate::storage::{OperationFilter, SharedStorage};

use super::resolver::{ResolvedRuntime, RuntimeResolver};
use super::{Orchestration, OrchestrationState, OrchestrationType, Schedule};

/// Tenant-facing notifications about orchestrated maintenance. Failures are
/// logged and never block the orchestration.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Maintenance was scheduled for the given runtimes.
    async fn notify_scheduled(
        &self,
        orchestration: &Orchestration,
        runtimes: &[ResolvedRuntime],
    ) -> anyhow::Result<()>;
    /// Scheduled maintenance was canceled.
    async fn notify_canceled(&self, orchestration: &Orchestration) -> anyhow::Result<()>;
}

/// Notification gateway that only logs.
pub struct LoggingNotifications;

#[async_trait]
impl NotificationGateway for LoggingNotifications {
    async fn notify_scheduled(
        &self,
        orchestration: &Orchestration,
        runtimes: &[ResolvedRuntime],
    ) -> anyhow::Result<()> {
        info!(
            orchestration_id = %orchestration.orchestration_id,
            runtimes = runtimes.len(),
            "Maintenance scheduled"
        );
        Ok(())
    }

    async fn notify_canceled(&self, orchestration: &Orchestration) -> anyhow::Result<()> {
        info!(
            orchestration_id = %orchestration.orchestration_id,
            "Maintenance canceled"
        );
        Ok(())
    }
}

/// Drives orchestrations end to end.
pub struct OrchestrationManager {
    storage: SharedStorage,
    resolver: RuntimeResolver,
    events: Arc<EventBus>,
    notifications: Arc<dyn NotificationGateway>,
    executors: HashMap<OperationType, Arc<dyn Executor>>,
    versions: UpgradeVersions,
    speed_up: u32,
}

impl OrchestrationManager {
    /// Create a manager. Executors for the upgrade operation types are
    /// registered with [`Self::with_executor`].
    pub fn new(storage: SharedStorage, events: Arc<EventBus>) -> Self {
        Self {
            resolver: RuntimeResolver::new(storage.clone()),
            storage,
            events,
            notifications: Arc::new(LoggingNotifications),
            executors: HashMap::new(),
            versions: UpgradeVersions::default(),
            speed_up: 1,
        }
    }

    /// Register the executor driving one upgrade operation type.
    pub fn with_executor(
        mut self,
        orchestration_type: OrchestrationType,
        executor: Arc<dyn Executor>,
    ) -> Self {
        self.executors
            .insert(orchestration_type.operation_type(), executor);
        self
    }

    /// Replace the notification gateway.
    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationGateway>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Target versions stamped on every child operation.
    pub fn with_target_versions(mut self, versions: UpgradeVersions) -> Self {
        self.versions = versions;
        self
    }

    /// Divide schedule delays and watch intervals; test hook.
    pub fn speed_up(mut self, factor: u32) -> Self {
        self.speed_up = factor.max(1);
        self
    }

    /// Accept an orchestration request; returns the pending row.
    pub async fn create(
        &self,
        orchestration_type: OrchestrationType,
        parameters: super::OrchestrationParameters,
    ) -> Result<Orchestration> {
        let orchestration = Orchestration::new(orchestration_type, parameters);
        self.storage
            .orchestrations()
            .insert(orchestration.clone())
            .await?;
        info!(
            orchestration_id = %orchestration.orchestration_id,
            orchestration_type = orchestration.orchestration_type.as_str(),
            "Orchestration accepted"
        );
        Ok(orchestration)
    }

    /// Drive one orchestration to a terminal state. Long-running; callers
    /// spawn it.
    pub async fn execute(&self, orchestration_id: &str) -> Result<()> {
        let mut orchestration = self.storage.orchestrations().get(orchestration_id).await?;
        if orchestration.is_finished() {
            return Ok(());
        }

        match orchestration.state {
            OrchestrationState::Pending => {
                let runtimes = self.resolver.resolve(&orchestration.parameters.targets).await?;
                if orchestration.parameters.dry_run {
                    orchestration.state = OrchestrationState::Succeeded;
                    orchestration.description =
                        format!("Dry run: {} targets resolved", runtimes.len());
                    self.persist(orchestration).await?;
                    return Ok(());
                }
                let operations = self.schedule_operations(&orchestration, &runtimes).await?;
                orchestration.state = OrchestrationState::InProgress;
                orchestration.description = format!("Scheduled {} operations", operations.len());
                let orchestration = self.persist(orchestration).await?;
                self.events
                    .publish(BrokerEvent::OrchestrationStarted {
                        orchestration_id: orchestration.orchestration_id.clone(),
                        operations: operations.len(),
                    })
                    .await;
                if orchestration.parameters.notification
                    && let Err(err) = self
                        .notifications
                        .notify_scheduled(&orchestration, &runtimes)
                        .await
                {
                    warn!(error = %err, "Scheduling notification failed");
                }
                self.drive(&orchestration, operations).await
            }
            OrchestrationState::InProgress | OrchestrationState::Retrying | OrchestrationState::Canceling => {
                // Resume after a restart or a retry: pick up the unfinished
                // children already in the store.
                let operations = self
                    .owned_operations(&orchestration.orchestration_id)
                    .await?
                    .into_iter()
                    .filter(|op| !op.is_finished())
                    .collect();
                self.drive(&orchestration, operations).await
            }
            _ => Ok(()),
        }
    }

    /// Request cancellation. Pending children stop now, in-flight children
    /// stop at their next step boundary.
    pub async fn cancel(&self, orchestration_id: &str) -> Result<Orchestration> {
        let mut orchestration = self.storage.orchestrations().get(orchestration_id).await?;
        if orchestration.is_finished() {
            return Err(BrokerError::Conflict {
                resource: "orchestration",
                details: format!("{} is already finished", orchestration_id),
            });
        }
        let owned = self.owned_operations(orchestration_id).await?;
        for mut operation in owned {
            if matches!(
                operation.state,
                OperationState::Pending | OperationState::Retrying
            ) {
                operation.state = OperationState::Canceled;
                operation.description = "canceled by the orchestration".to_string();
                self.storage.operations().update(operation).await?;
            }
        }
        orchestration.state = if orchestration.state == OrchestrationState::Pending {
            OrchestrationState::Canceled
        } else {
            OrchestrationState::Canceling
        };
        let orchestration = self.persist(orchestration).await?;
        if orchestration.state == OrchestrationState::Canceled {
            self.events
                .publish(BrokerEvent::OrchestrationCanceled {
                    orchestration_id: orchestration.orchestration_id.clone(),
                })
                .await;
            if orchestration.parameters.notification
                && let Err(err) = self.notifications.notify_canceled(&orchestration).await
            {
                warn!(error = %err, "Cancellation notification failed");
            }
        }
        info!(
            orchestration_id = %orchestration.orchestration_id,
            state = orchestration.state.as_str(),
            "Orchestration cancel requested"
        );
        Ok(orchestration)
    }

    /// Create fresh operations for previously failed children. With an empty
    /// id list every failed child is retried. Returns the new operation ids;
    /// the caller re-executes the orchestration.
    pub async fn retry(
        &self,
        orchestration_id: &str,
        operation_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut orchestration = self.storage.orchestrations().get(orchestration_id).await?;
        if matches!(
            orchestration.state,
            OrchestrationState::Canceling | OrchestrationState::Canceled
        ) {
            return Err(BrokerError::Conflict {
                resource: "orchestration",
                details: format!("{} is being canceled", orchestration_id),
            });
        }
        let owned = self.owned_operations(orchestration_id).await?;
        let mut created = Vec::new();
        for failed in owned.iter().filter(|op| {
            op.state == OperationState::Failed
                && (operation_ids.is_empty() || operation_ids.contains(&op.operation_id))
        }) {
            let op = self
                .new_child_operation(
                    &orchestration,
                    &failed.instance_id,
                    failed.runtime_id.clone(),
                )
                .await?;
            created.push(op.operation_id);
        }
        if created.is_empty() {
            return Err(BrokerError::Validation {
                field: "operation_ids".to_string(),
                message: "no failed operations to retry".to_string(),
            });
        }
        orchestration.state = OrchestrationState::Retrying;
        orchestration.description = format!("Retrying {} operations", created.len());
        self.persist(orchestration).await?;
        Ok(created)
    }

    async fn schedule_operations(
        &self,
        orchestration: &Orchestration,
        runtimes: &[ResolvedRuntime],
    ) -> Result<Vec<Operation>> {
        let mut operations = Vec::with_capacity(runtimes.len());
        for runtime in runtimes {
            let op = self
                .new_child_operation(
                    orchestration,
                    &runtime.instance_id,
                    Some(runtime.runtime_id.clone()),
                )
                .await?;
            operations.push(op);
        }
        Ok(operations)
    }

    async fn new_child_operation(
        &self,
        orchestration: &Orchestration,
        instance_id: &str,
        runtime_id: Option<String>,
    ) -> Result<Operation> {
        let instance = self.storage.instances().get(instance_id).await?;
        let mut op = Operation::new(
            instance_id,
            orchestration.orchestration_type.operation_type(),
            instance.parameters.clone(),
        );
        op.orchestration_id = Some(orchestration.orchestration_id.clone());
        op.runtime_id = runtime_id.or(instance.runtime_id);
        op.set_detail(UPGRADE_VERSIONS_KEY, self.versions.clone())?;
        self.storage.operations().insert(op.clone()).await?;
        Ok(op)
    }

    async fn drive(&self, orchestration: &Orchestration, operations: Vec<Operation>) -> Result<()> {
        let op_type = orchestration.orchestration_type.operation_type();
        let executor = self
            .executors
            .get(&op_type)
            .cloned()
            .ok_or_else(|| {
                BrokerError::Internal(format!("no executor registered for {}", op_type.as_str()))
            })?;

        let queue = WorkQueue::with_speed_up(
            &format!("orchestration-{}", orchestration.orchestration_id),
            self.speed_up,
        );
        let workers = orchestration.parameters.strategy.parallel_workers.max(1);
        let handles = queue.spawn_workers(workers, executor);

        let delay = self.dispatch_delay(&orchestration.parameters.strategy.schedule);
        for operation in &operations {
            queue.add_after(&operation.operation_id, delay);
        }

        let outcome = self.watch(&orchestration.orchestration_id).await;
        queue.shutdown();
        for handle in handles {
            handle.abort();
        }
        outcome
    }

    // Dispatch delay per schedule. Maintenance windows open at midnight UTC.
    fn dispatch_delay(&self, schedule: &Schedule) -> Duration {
        let now = Utc::now();
        let until = match schedule {
            Schedule::Immediate => return Duration::ZERO,
            Schedule::Timestamp { at } => *at - now,
            Schedule::MaintenanceWindow => {
                let tomorrow = (now + chrono::Duration::days(1)).date_naive();
                let window = Utc
                    .from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default());
                window - now
            }
        };
        until.to_std().unwrap_or(Duration::ZERO)
    }

    async fn watch(&self, orchestration_id: &str) -> Result<()> {
        let interval = Duration::from_millis(500) / self.speed_up;
        loop {
            let orchestration = self.storage.orchestrations().get(orchestration_id).await?;
            let owned = self.owned_operations(orchestration_id).await?;
            let in_flight = owned.iter().filter(|op| !op.is_finished()).count();
            if in_flight == 0 {
                return self.finalize(orchestration, &owned).await;
            }
            sleep(interval).await;
        }
    }

    async fn finalize(
        &self,
        mut orchestration: Orchestration,
        operations: &[Operation],
    ) -> Result<()> {
        let succeeded = operations
            .iter()
            .filter(|op| op.state == OperationState::Succeeded)
            .count();
        let failed = operations
            .iter()
            .filter(|op| op.state == OperationState::Failed)
            .count();
        let canceled = operations
            .iter()
            .filter(|op| op.state == OperationState::Canceled)
            .count();

        let canceling = orchestration.state == OrchestrationState::Canceling;
        // Succeeded only when every child succeeded; a canceled child without
        // an explicit cancel request still rules it out.
        orchestration.state = if canceling {
            OrchestrationState::Canceled
        } else if failed > 0 {
            OrchestrationState::Failed
        } else if canceled > 0 {
            OrchestrationState::Canceled
        } else {
            OrchestrationState::Succeeded
        };
        orchestration.description = format!(
            "{} operations: {} succeeded, {} failed, {} canceled",
            operations.len(),
            succeeded,
            failed,
            canceled
        );
        let orchestration = self.persist(orchestration).await?;
        info!(
            orchestration_id = %orchestration.orchestration_id,
            state = orchestration.state.as_str(),
            description = %orchestration.description,
            "Orchestration finished"
        );
        if canceling {
            self.events
                .publish(BrokerEvent::OrchestrationCanceled {
                    orchestration_id: orchestration.orchestration_id.clone(),
                })
                .await;
            if orchestration.parameters.notification
                && let Err(err) = self.notifications.notify_canceled(&orchestration).await
            {
                warn!(error = %err, "Cancellation notification failed");
            }
        }
        Ok(())
    }

    async fn owned_operations(&self, orchestration_id: &str) -> Result<Vec<Operation>> {
        Ok(self
            .storage
            .operations()
            .list(&OperationFilter {
                orchestration_id: Some(orchestration_id.to_string()),
                ..Default::default()
            })
            .await?
            .items)
    }

    async fn persist(&self, mut orchestration: Orchestration) -> Result<Orchestration> {
        orchestration.updated_at = Utc::now();
        self.storage
            .orchestrations()
            .update(orchestration.clone())
            .await?;
        Ok(orchestration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Instance, ProvisioningParameters};
    use crate::orchestration::{OrchestrationParameters, RuntimeTarget, StrategySpec, TargetSpec};
    use crate::plans::{AWS_PLAN_ID, KYMA_SERVICE_ID};
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn seed_instance(storage: &SharedStorage, instance_id: &str, runtime_id: &str) {
        storage
            .instances()
            .insert(Instance {
                instance_id: instance_id.into(),
                runtime_id: Some(runtime_id.into()),
                global_account_id: "ga-1".into(),
                subaccount_id: format!("sa-{instance_id}"),
                service_id: KYMA_SERVICE_ID.into(),
                service_plan_id: AWS_PLAN_ID.into(),
                platform_region: "cf-eu10".into(),
                provider_region: Some("eu-central-1".into()),
                dashboard_url: None,
                parameters: ProvisioningParameters {
                    plan_id: AWS_PLAN_ID.into(),
                    service_id: KYMA_SERVICE_ID.into(),
                    ..Default::default()
                },
                created_at: Utc::now(),
                updated_at: Utc::now(),
                expired_at: None,
                version: 0,
            })
            .await
            .unwrap();
    }

    // Marks every delivered operation succeeded in the store.
    struct MarkSucceeded {
        storage: SharedStorage,
        delay: Duration,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Executor for MarkSucceeded {
        async fn execute(&self, operation_id: &str) -> Result<Duration> {
            sleep(self.delay).await;
            let mut op = self.storage.operations().get(operation_id).await?;
            if op.state == OperationState::Canceled {
                return Ok(Duration::ZERO);
            }
            op.state = OperationState::Succeeded;
            self.storage.operations().update(op).await?;
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(Duration::ZERO)
        }
    }

    fn all_targets() -> OrchestrationParameters {
        OrchestrationParameters {
            targets: TargetSpec {
                include: vec![RuntimeTarget {
                    target: Some("all".into()),
                    ..Default::default()
                }],
                exclude: vec![],
            },
            ..Default::default()
        }
    }

    fn manager(storage: &SharedStorage, executor: Arc<dyn Executor>) -> OrchestrationManager {
        OrchestrationManager::new(storage.clone(), Arc::new(EventBus::synchronous()))
            .with_executor(OrchestrationType::UpgradeCluster, executor.clone())
            .with_executor(OrchestrationType::UpgradeKyma, executor)
            .speed_up(100)
    }

    #[tokio::test]
    async fn test_execute_runs_all_targets_to_success() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, "i-1", "r-1").await;
        seed_instance(&storage, "i-2", "r-2").await;
        let executor = Arc::new(MarkSucceeded {
            storage: storage.clone(),
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        });
        let manager = manager(&storage, executor.clone());

        let orchestration = manager
            .create(OrchestrationType::UpgradeCluster, all_targets())
            .await
            .unwrap();
        manager.execute(&orchestration.orchestration_id).await.unwrap();

        let done = storage
            .orchestrations()
            .get(&orchestration.orchestration_id)
            .await
            .unwrap();
        assert_eq!(done.state, OrchestrationState::Succeeded);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
        assert!(done.description.contains("2 succeeded"));
    }

    // Marks the first delivered operation canceled and the rest succeeded.
    struct CancelFirst {
        storage: SharedStorage,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Executor for CancelFirst {
        async fn execute(&self, operation_id: &str) -> Result<Duration> {
            let mut op = self.storage.operations().get(operation_id).await?;
            op.state = if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
                OperationState::Canceled
            } else {
                OperationState::Succeeded
            };
            self.storage.operations().update(op).await?;
            Ok(Duration::ZERO)
        }
    }

    #[tokio::test]
    async fn test_canceled_child_prevents_a_succeeded_finish() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, "i-1", "r-1").await;
        seed_instance(&storage, "i-2", "r-2").await;
        let executor = Arc::new(CancelFirst {
            storage: storage.clone(),
            seen: AtomicUsize::new(0),
        });
        let manager = manager(&storage, executor);

        let orchestration = manager
            .create(OrchestrationType::UpgradeCluster, all_targets())
            .await
            .unwrap();
        manager.execute(&orchestration.orchestration_id).await.unwrap();

        let done = storage
            .orchestrations()
            .get(&orchestration.orchestration_id)
            .await
            .unwrap();
        assert_eq!(done.state, OrchestrationState::Canceled);
        assert!(done.description.contains("1 canceled"));
    }

    #[tokio::test]
    async fn test_dry_run_creates_no_operations() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, "i-1", "r-1").await;
        let executor = Arc::new(MarkSucceeded {
            storage: storage.clone(),
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        });
        let manager = manager(&storage, executor.clone());

        let mut params = all_targets();
        params.dry_run = true;
        let orchestration = manager
            .create(OrchestrationType::UpgradeKyma, params)
            .await
            .unwrap();
        manager.execute(&orchestration.orchestration_id).await.unwrap();

        let done = storage
            .orchestrations()
            .get(&orchestration.orchestration_id)
            .await
            .unwrap();
        assert_eq!(done.state, OrchestrationState::Succeeded);
        assert!(done.description.starts_with("Dry run"));
        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_midway_with_single_worker() {
        let storage: SharedStorage = MemoryStorage::shared();
        for i in 0..4 {
            seed_instance(&storage, &format!("i-{i}"), &format!("r-{i}")).await;
        }
        let executor = Arc::new(MarkSucceeded {
            storage: storage.clone(),
            delay: Duration::from_millis(50),
            runs: AtomicUsize::new(0),
        });
        let manager = Arc::new(manager(&storage, executor.clone()));

        let mut params = all_targets();
        params.strategy = StrategySpec {
            parallel_workers: 1,
            schedule: Schedule::Immediate,
        };
        let orchestration = manager
            .create(OrchestrationType::UpgradeCluster, params)
            .await
            .unwrap();

        let id = orchestration.orchestration_id.clone();
        let runner = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.execute(&id).await })
        };
        // Let the first operation start, then cancel.
        sleep(Duration::from_millis(75)).await;
        manager.cancel(&id).await.unwrap();
        runner.await.unwrap().unwrap();

        let done = storage.orchestrations().get(&id).await.unwrap();
        assert_eq!(done.state, OrchestrationState::Canceled);
        let ops = storage
            .operations()
            .list(&OperationFilter {
                orchestration_id: Some(id),
                ..Default::default()
            })
            .await
            .unwrap()
            .items;
        assert_eq!(ops.len(), 4);
        let canceled = ops
            .iter()
            .filter(|op| op.state == OperationState::Canceled)
            .count();
        assert!(canceled >= 1, "pending operations must be canceled");
        assert!(ops.iter().all(|op| op.is_finished()));
    }

    #[tokio::test]
    async fn test_retry_creates_fresh_operations_for_failed_children() {
        let storage: SharedStorage = MemoryStorage::shared();
        seed_instance(&storage, "i-1", "r-1").await;
        let executor = Arc::new(MarkSucceeded {
            storage: storage.clone(),
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        });
        let manager = manager(&storage, executor);

        let orchestration = manager
            .create(OrchestrationType::UpgradeCluster, all_targets())
            .await
            .unwrap();
        manager.execute(&orchestration.orchestration_id).await.unwrap();

        // Force the child into failure, then retry.
        let mut ops = manager
            .owned_operations(&orchestration.orchestration_id)
            .await
            .unwrap();
        let failed_id = ops[0].operation_id.clone();
        ops[0].state = OperationState::Failed;
        storage.operations().update(ops.remove(0)).await.unwrap();

        let created = manager
            .retry(&orchestration.orchestration_id, &[failed_id.clone()])
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_ne!(created[0], failed_id);

        manager.execute(&orchestration.orchestration_id).await.unwrap();
        let done = storage
            .orchestrations()
            .get(&orchestration.orchestration_id)
            .await
            .unwrap();
        // The original failure stays on the ledger.
        assert_eq!(done.state, OrchestrationState::Failed);
        let fresh = storage.operations().get(&created[0]).await.unwrap();
        assert_eq!(fresh.state, OperationState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_finished_orchestration_is_a_conflict() {
        let storage: SharedStorage = MemoryStorage::shared();
        let executor = Arc::new(MarkSucceeded {
            storage: storage.clone(),
            delay: Duration::ZERO,
            runs: AtomicUsize::new(0),
        });
        let manager = manager(&storage, executor);
        let orchestration = manager
            .create(OrchestrationType::UpgradeCluster, all_targets())
            .await
            .unwrap();
        manager.execute(&orchestration.orchestration_id).await.unwrap();

        let err = manager
            .cancel(&orchestration.orchestration_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Conflict { .. }));
    }
}
