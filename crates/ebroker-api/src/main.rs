// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker process entrypoint.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ebroker_api::queues::{Clients, Queues};
use ebroker_api::server;
use ebroker_api::state::AppState;
use ebroker_core::bindings::BindingEngine;
use ebroker_core::clients::controlplane::FakeControlPlane;
use ebroker_core::clients::edp::{EdpApi, EdpClient, FakeEdp};
use ebroker_core::clients::gardener::FakeGardener;
use ebroker_core::clients::provisioner::FakeProvisioner;
use ebroker_core::clients::runtime_cluster::FakeRuntimeCluster;
use ebroker_core::config::Config;
use ebroker_core::encryption::Encryptor;
use ebroker_core::events::EventBus;
use ebroker_core::expiration::ExpirationService;
use ebroker_core::orchestration::{OrchestrationManager, OrchestrationType};
use ebroker_core::plans::PlansPolicy;
use ebroker_core::storage::{PostgresStorage, SharedStorage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine outside local development.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ebroker=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let cipher = Encryptor::new(&config.db_secret_key)?;
    let storage = PostgresStorage::new(pool, cipher);
    storage.migrate().await?;
    let storage: SharedStorage = Arc::new(storage);

    let mut policy = PlansPolicy::default();
    if let Some(path) = &config.eu_access_whitelist_file {
        policy.load_whitelist(&std::fs::read_to_string(path)?);
    }
    if let Some(path) = &config.trial_region_mapping_file {
        policy.load_trial_region_mapping(&std::fs::read_to_string(path)?);
    }
    if let Some(path) = &config.converged_cloud_region_mapping_file {
        policy.load_converged_cloud_region_mapping(&std::fs::read_to_string(path)?);
    }
    let policy = Arc::new(policy);

    let events = Arc::new(EventBus::new());

    let edp: Arc<dyn EdpApi> = if config.edp.enabled {
        Arc::new(EdpClient::new(&config.edp.url, &config.edp.environment))
    } else {
        Arc::new(FakeEdp::new())
    };
    // In-memory collaborators; real transports mount behind the same traits.
    let clients = Clients {
        controlplane: Arc::new(FakeControlPlane::new()),
        gardener: Arc::new(FakeGardener::new()),
        provisioner: Arc::new(FakeProvisioner::new()),
        cluster: Arc::new(FakeRuntimeCluster::new()),
        edp,
    };

    let queues = Queues::build(
        &config,
        storage.clone(),
        events.clone(),
        &clients,
        policy.clone(),
        1,
    );

    let bindings = config.binding.enabled.then(|| {
        Arc::new(BindingEngine::new(
            storage.clone(),
            clients.controlplane.clone(),
            clients.cluster.clone(),
            config.binding.clone(),
        ))
    });
    let expiration = Arc::new(ExpirationService::new(
        storage.clone(),
        queues.deprovisioning.clone(),
    ));
    let orchestrations = Arc::new(
        OrchestrationManager::new(storage.clone(), events.clone())
            .with_executor(
                OrchestrationType::UpgradeCluster,
                queues.upgrade_cluster_executor(),
            )
            .with_executor(
                OrchestrationType::UpgradeKyma,
                queues.upgrade_kyma_executor(),
            ),
    );

    let _workers = queues.start_workers(config.workers_amount);
    let resumed = queues.resume().await?;
    if resumed > 0 {
        info!(resumed, "Resumed unfinished operations");
    }
    for orchestration in storage.orchestrations().list().await? {
        if !orchestration.is_finished() {
            let manager = orchestrations.clone();
            let id = orchestration.orchestration_id.clone();
            info!(orchestration_id = %id, "Resuming orchestration");
            tokio::spawn(async move {
                if let Err(err) = manager.execute(&id).await {
                    warn!(orchestration_id = %id, error = %err, "Orchestration resume failed");
                }
            });
        }
    }

    let state = Arc::new(AppState {
        storage,
        policy,
        config,
        queues: queues.clone(),
        bindings,
        expiration,
        orchestrations,
        events,
    });

    let port: u16 = std::env::var("EBROKER_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    server::serve(state, listener).await?;

    queues.shutdown();
    Ok(())
}
