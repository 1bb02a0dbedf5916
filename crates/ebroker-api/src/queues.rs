// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work queue and staged manager wiring.
//!
//! Three standing queues carry the instance lifecycle: provisioning
//! (`provision` and `unsuspend`), deprovisioning (`deprovision` and
//! `suspend`) and update. Upgrade operations run on per-orchestration queues
//! owned by the orchestration manager; only their staged managers are built
//! here. Flag-gated steps (EDP, archiving, cleaning) are registered only when
//! enabled, so a disabled feature leaves no trace in the pipeline.

use std::sync::Arc;
use std::time::Duration;

use ebroker_core::config::Config;
use ebroker_core::error::Result;
use ebroker_core::events::EventBus;
use ebroker_core::hyperscaler::AccountProvider;
use ebroker_core::model::OperationType;
use ebroker_core::plans::PlansPolicy;
use ebroker_core::process::steps::deprovisioning::{
    ArchiveInstanceStep, BtpOperatorCleanupStep, CheckKymaDeletedStep, CheckRuntimeDeletedStep,
    CleanStep, DeleteKymaResourceStep, DeleteRuntimeResourceStep, EdpDeregistrationStep, InitStep,
    ReleaseSubscriptionStep, RemoveInstanceStep,
};
use ebroker_core::process::steps::provisioning::{
    ApplyKymaResourceStep, CheckRuntimeResourceStep, CreateRuntimeResourceStep,
    DEFAULT_KYMA_TEMPLATE, EdpRegistrationStep, FetchDashboardUrlStep, GetKubeconfigStep,
    InitKymaTemplateStep, InitialisationStep, ResolveCredentialsStep, StartStep,
};
use ebroker_core::process::steps::update::{ApplyUpdateStep, CheckUpdateStep, ValidateUpdateStep};
use ebroker_core::process::steps::upgrade::{
    CheckProvisionerOperationStep, UpgradeClusterStep, UpgradeKymaStep,
};
use ebroker_core::process::{StagedManager, StagedManagerBuilder};
use ebroker_core::queue::WorkQueue;
use ebroker_core::storage::SharedStorage;
use ebroker_core::clients::controlplane::ControlPlaneClient;
use ebroker_core::clients::edp::EdpApi;
use ebroker_core::clients::gardener::GardenerClient;
use ebroker_core::clients::provisioner::ProvisionerClient;
use ebroker_core::clients::runtime_cluster::RuntimeClusterClient;
use tokio::task::JoinHandle;
use tracing::info;

/// Runtime-state audit rows older than this are removed by the clean step.
const RUNTIME_STATE_RETENTION: Duration = Duration::from_secs(14 * 24 * 3600);

/// The external collaborators the pipelines talk to.
#[derive(Clone)]
pub struct Clients {
    /// Runtime and Kyma resources plus kubeconfig secrets.
    pub controlplane: Arc<dyn ControlPlaneClient>,
    /// Hyperscaler credential secret bindings.
    pub gardener: Arc<dyn GardenerClient>,
    /// Shoot and Kyma upgrades.
    pub provisioner: Arc<dyn ProvisionerClient>,
    /// Service accounts and tokens inside tenant clusters.
    pub cluster: Arc<dyn RuntimeClusterClient>,
    /// Data-ingress registration.
    pub edp: Arc<dyn EdpApi>,
}

/// The assembled queues and managers of one broker process.
pub struct Queues {
    /// Queue of `provision` and `unsuspend` operations.
    pub provisioning: Arc<WorkQueue>,
    /// Queue of `deprovision` and `suspend` operations.
    pub deprovisioning: Arc<WorkQueue>,
    /// Queue of `update` operations.
    pub update: Arc<WorkQueue>,
    provisioning_manager: Arc<StagedManager>,
    deprovisioning_manager: Arc<StagedManager>,
    update_manager: Arc<StagedManager>,
    upgrade_cluster_manager: Arc<StagedManager>,
    upgrade_kyma_manager: Arc<StagedManager>,
}

impl Queues {
    /// Wire every pipeline from the configuration. `speed_up` divides backoff
    /// and poll sleeps; production passes 1.
    pub fn build(
        config: &Config,
        storage: SharedStorage,
        events: Arc<EventBus>,
        clients: &Clients,
        policy: Arc<PlansPolicy>,
        speed_up: u32,
    ) -> Arc<Self> {
        let account_provider = Arc::new(AccountProvider::new(clients.gardener.clone()));

        let builder = |name: &'static str, types: &[OperationType]| {
            StagedManagerBuilder::new(
                name,
                types,
                storage.clone(),
                events.clone(),
                config.operation_timeout,
                config.max_step_processing_time,
            )
            .speed_up(speed_up)
        };

        let mut provisioning = builder(
            "provisioning",
            &[OperationType::Provision, OperationType::Unsuspend],
        )
        .define_stages(&["start", "create_runtime", "apply_kyma", "post_actions"])
        .add_step("start", Arc::new(StartStep::new(storage.clone())))
        .add_step(
            "start",
            Arc::new(InitialisationStep::new(storage.clone(), policy.clone())),
        )
        .add_step(
            "start",
            Arc::new(InitKymaTemplateStep::new(DEFAULT_KYMA_TEMPLATE)),
        )
        .add_step(
            "start",
            Arc::new(ResolveCredentialsStep::new(account_provider.clone())),
        );
        if config.edp.enabled {
            provisioning = provisioning.add_step(
                "start",
                Arc::new(EdpRegistrationStep::new(clients.edp.clone())),
            );
        }
        let provisioning_manager = provisioning
            .add_step(
                "create_runtime",
                Arc::new(CreateRuntimeResourceStep::new(clients.controlplane.clone())),
            )
            .add_step(
                "create_runtime",
                Arc::new(CheckRuntimeResourceStep::new(clients.controlplane.clone())),
            )
            .add_step(
                "apply_kyma",
                Arc::new(GetKubeconfigStep::new(clients.controlplane.clone())),
            )
            .add_step(
                "apply_kyma",
                Arc::new(ApplyKymaResourceStep::new(
                    clients.controlplane.clone(),
                    storage.clone(),
                )),
            )
            .add_step(
                "post_actions",
                Arc::new(FetchDashboardUrlStep::new(storage.clone())),
            )
            .build();

        let mut stages: Vec<&'static str> = vec!["init", "btp_operator_cleanup"];
        if config.edp.enabled {
            stages.push("edp_deregistration");
        }
        stages.extend([
            "delete_kyma_resource",
            "check_kyma_deleted",
            "delete_runtime_resource",
            "check_runtime_deleted",
            "release_subscription",
        ]);
        if config.archiving.enabled {
            stages.push("archive_instance");
        }
        stages.push("remove_instance");
        if config.cleaning.enabled {
            stages.push("clean");
        }
        let mut deprovisioning = builder(
            "deprovisioning",
            &[OperationType::Deprovision, OperationType::Suspend],
        )
        .define_stages(&stages)
        .add_step("init", Arc::new(InitStep::new(storage.clone())))
        .add_step(
            "btp_operator_cleanup",
            Arc::new(BtpOperatorCleanupStep::new(
                clients.controlplane.clone(),
                clients.cluster.clone(),
            )),
        );
        if config.edp.enabled {
            deprovisioning = deprovisioning.add_step(
                "edp_deregistration",
                Arc::new(EdpDeregistrationStep::new(clients.edp.clone())),
            );
        }
        deprovisioning = deprovisioning
            .add_step(
                "delete_kyma_resource",
                Arc::new(DeleteKymaResourceStep::new(clients.controlplane.clone())),
            )
            .add_step(
                "check_kyma_deleted",
                Arc::new(CheckKymaDeletedStep::new(clients.controlplane.clone())),
            )
            .add_step(
                "delete_runtime_resource",
                Arc::new(DeleteRuntimeResourceStep::new(clients.controlplane.clone())),
            )
            .add_step(
                "check_runtime_deleted",
                Arc::new(CheckRuntimeDeletedStep::new(clients.controlplane.clone())),
            )
            .add_step(
                "release_subscription",
                Arc::new(ReleaseSubscriptionStep::new(account_provider)),
            );
        if config.archiving.enabled {
            deprovisioning = deprovisioning.add_step(
                "archive_instance",
                Arc::new(ArchiveInstanceStep::new(
                    storage.clone(),
                    true,
                    config.archiving.dry_run,
                )),
            );
        }
        deprovisioning =
            deprovisioning.add_step("remove_instance", Arc::new(RemoveInstanceStep::new(storage.clone())));
        if config.cleaning.enabled {
            deprovisioning = deprovisioning.add_step(
                "clean",
                Arc::new(CleanStep::new(
                    storage.clone(),
                    true,
                    config.cleaning.dry_run,
                    RUNTIME_STATE_RETENTION,
                )),
            );
        }
        let deprovisioning_manager = deprovisioning.build();

        let update_manager = builder("update", &[OperationType::Update])
            .define_stages(&["cluster", "check"])
            .add_step("cluster", Arc::new(ValidateUpdateStep::new(storage.clone())))
            .add_step(
                "cluster",
                Arc::new(ApplyUpdateStep::new(
                    clients.controlplane.clone(),
                    storage.clone(),
                )),
            )
            .add_step(
                "check",
                Arc::new(CheckUpdateStep::new(clients.controlplane.clone())),
            )
            .build();

        let upgrade_cluster_manager = builder("upgrade-cluster", &[OperationType::UpgradeCluster])
            .define_stages(&["upgrade", "check"])
            .add_step(
                "upgrade",
                Arc::new(UpgradeClusterStep::new(clients.provisioner.clone())),
            )
            .add_step(
                "check",
                Arc::new(CheckProvisionerOperationStep::new(
                    clients.provisioner.clone(),
                )),
            )
            .build();

        let upgrade_kyma_manager = builder("upgrade-kyma", &[OperationType::UpgradeKyma])
            .define_stages(&["kyma", "check"])
            .add_step(
                "kyma",
                Arc::new(UpgradeKymaStep::new(clients.provisioner.clone())),
            )
            .add_step(
                "check",
                Arc::new(CheckProvisionerOperationStep::new(
                    clients.provisioner.clone(),
                )),
            )
            .build();

        Arc::new(Self {
            provisioning: WorkQueue::with_speed_up("provisioning", speed_up),
            deprovisioning: WorkQueue::with_speed_up("deprovisioning", speed_up),
            update: WorkQueue::with_speed_up("update", speed_up),
            provisioning_manager,
            deprovisioning_manager,
            update_manager,
            upgrade_cluster_manager,
            upgrade_kyma_manager,
        })
    }

    /// Route a freshly stored operation to its queue.
    ///
    /// Upgrade operations are never enqueued here; the orchestration manager
    /// drives them on its own queues.
    pub fn enqueue(&self, op_type: OperationType, operation_id: &str) {
        match op_type {
            OperationType::Provision | OperationType::Unsuspend => {
                self.provisioning.add(operation_id);
            }
            OperationType::Deprovision | OperationType::Suspend => {
                self.deprovisioning.add(operation_id);
            }
            OperationType::Update => self.update.add(operation_id),
            OperationType::UpgradeCluster | OperationType::UpgradeKyma => {}
        }
    }

    /// Staged manager driving `upgrade_cluster` operations.
    pub fn upgrade_cluster_executor(&self) -> Arc<StagedManager> {
        self.upgrade_cluster_manager.clone()
    }

    /// Staged manager driving `upgrade_kyma` operations.
    pub fn upgrade_kyma_executor(&self) -> Arc<StagedManager> {
        self.upgrade_kyma_manager.clone()
    }

    /// Spawn `workers` workers per standing queue.
    pub fn start_workers(&self, workers: usize) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.extend(
            self.provisioning
                .spawn_workers(workers, self.provisioning_manager.clone()),
        );
        handles.extend(
            self.deprovisioning
                .spawn_workers(workers, self.deprovisioning_manager.clone()),
        );
        handles.extend(
            self.update
                .spawn_workers(workers, self.update_manager.clone()),
        );
        info!(workers, "Queue workers started");
        handles
    }

    /// Re-enqueue every unfinished lifecycle operation after a restart.
    pub async fn resume(&self) -> Result<usize> {
        let mut count = 0;
        count += self
            .provisioning_manager
            .resume(|id| self.provisioning.add(id))
            .await?;
        count += self
            .deprovisioning_manager
            .resume(|id| self.deprovisioning.add(id))
            .await?;
        count += self.update_manager.resume(|id| self.update.add(id)).await?;
        Ok(count)
    }

    /// Stop accepting work and let the workers drain.
    pub fn shutdown(&self) {
        self.provisioning.shutdown();
        self.deprovisioning.shutdown();
        self.update.shutdown();
    }
}
