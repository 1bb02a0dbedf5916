// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests driving the router over in-memory storage and fake
//! collaborators. The queue workers run for real; the tests poll storage and
//! the OSB surface the way a platform would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use ebroker_api::queues::{Clients, Queues};
use ebroker_api::server;
use ebroker_api::state::AppState;
use ebroker_core::bindings::BindingEngine;
use ebroker_core::clients::controlplane::{ControlPlaneClient, FakeControlPlane};
use ebroker_core::clients::edp::FakeEdp;
use ebroker_core::clients::gardener::{
    FakeGardener, LABEL_EU_ACCESS, LABEL_HYPERSCALER_TYPE, LABEL_SHARED,
};
use ebroker_core::clients::provisioner::FakeProvisioner;
use ebroker_core::clients::runtime_cluster::FakeRuntimeCluster;
use ebroker_core::config::{BindingConfig, Config, EdpConfig, ToggleConfig};
use ebroker_core::events::EventBus;
use ebroker_core::expiration::ExpirationService;
use ebroker_core::model::{
    ErsContext, Instance, OperationState, OperationType, ProvisioningParameters,
};
use ebroker_core::orchestration::{OrchestrationManager, OrchestrationType};
use ebroker_core::plans::{self, AWS_PLAN_ID, KYMA_SERVICE_ID, TRIAL_PLAN_ID, PlansPolicy};
use ebroker_core::storage::{MemoryStorage, SharedStorage};

const SPEED_UP: u32 = 200;
const WAIT_BUDGET: Duration = Duration::from_secs(10);

const ADMIN_KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
clusters:
- name: shoot--kyma--c-1
  cluster:
    server: https://api.c-1.example.com
    certificate-authority-data: Zm9v
"#;

struct Broker {
    router: Router,
    storage: SharedStorage,
    controlplane: Arc<FakeControlPlane>,
    provisioner: Arc<FakeProvisioner>,
    cluster: Arc<FakeRuntimeCluster>,
}

fn test_config() -> Config {
    Config {
        database_url: String::new(),
        operation_timeout: Duration::from_secs(600),
        max_step_processing_time: Duration::from_secs(300),
        workers_amount: 2,
        binding: BindingConfig::default(),
        archiving: ToggleConfig::default(),
        cleaning: ToggleConfig::default(),
        edp: EdpConfig {
            enabled: false,
            url: String::new(),
            environment: "test".into(),
        },
        db_secret_key: "0123456789abcdef0123456789abcdef".into(),
        eu_access_whitelist_file: None,
        trial_region_mapping_file: None,
        converged_cloud_region_mapping_file: None,
        default_request_region: "cf-eu10".into(),
    }
}

fn broker() -> Broker {
    let config = test_config();
    let storage = MemoryStorage::shared();
    let events = Arc::new(EventBus::synchronous());

    let controlplane = Arc::new(FakeControlPlane::new());
    let gardener = Arc::new(FakeGardener::new());
    let provisioner = Arc::new(FakeProvisioner::new());
    let cluster = Arc::new(FakeRuntimeCluster::new());
    gardener.add_binding("sb-aws", &[(LABEL_HYPERSCALER_TYPE, "aws")]);
    gardener.add_binding(
        "sb-aws-shared",
        &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_SHARED, "true")],
    );
    gardener.add_binding(
        "sb-aws-eu",
        &[
            (LABEL_HYPERSCALER_TYPE, "aws"),
            (LABEL_SHARED, "true"),
            (LABEL_EU_ACCESS, "true"),
        ],
    );

    let mut policy = PlansPolicy::default();
    policy.eu_access_whitelist.insert("ga-eu".into());
    policy.load_converged_cloud_region_mapping("cf-eu20: eu-de-1");
    let policy = Arc::new(policy);

    let clients = Clients {
        controlplane: controlplane.clone(),
        gardener: gardener.clone(),
        provisioner: provisioner.clone(),
        cluster: cluster.clone(),
        edp: Arc::new(FakeEdp::new()),
    };
    let queues = Queues::build(
        &config,
        storage.clone(),
        events.clone(),
        &clients,
        policy.clone(),
        SPEED_UP,
    );
    queues.start_workers(config.workers_amount);

    let bindings = Some(Arc::new(BindingEngine::new(
        storage.clone(),
        clients.controlplane.clone(),
        clients.cluster.clone(),
        config.binding.clone(),
    )));
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
            )
            .speed_up(SPEED_UP),
    );

    let state = Arc::new(AppState {
        storage: storage.clone(),
        policy,
        config,
        queues,
        bindings,
        expiration,
        orchestrations,
        events,
    });
    Broker {
        router: server::router(state),
        storage,
        controlplane,
        provisioner,
        cluster,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn provision_body(plan_id: &str, global_account_id: &str) -> Value {
    json!({
        "service_id": KYMA_SERVICE_ID,
        "plan_id": plan_id,
        "context": {
            "global_account_id": global_account_id,
            "subaccount_id": "sa-1",
            "user_id": "jane.doe@example.com",
        },
        "parameters": { "name": "my-cluster" },
    })
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_BUDGET;
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn last_operation_state(broker: &Broker, instance_id: &str) -> String {
    let (_, body) = send(
        &broker.router,
        "GET",
        &format!("/v2/service_instances/{instance_id}/last_operation"),
        None,
    )
    .await;
    body["state"].as_str().unwrap_or_default().to_string()
}

/// Drives a provisioning to success: accepts the request, installs the admin
/// kubeconfig once the runtime id is known, and waits for the operation to
/// finish. Returns the runtime id.
async fn provision_ready(broker: &Broker, prefix: &str, instance_id: &str, body: Value) -> String {
    let (status, response) = send(
        &broker.router,
        "PUT",
        &format!("{prefix}/service_instances/{instance_id}"),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{response}");
    assert!(response["operation"].is_string());

    wait_until("runtime id assignment", || async {
        matches!(
            broker.storage.instances().get(instance_id).await,
            Ok(instance) if instance.runtime_id.is_some()
        )
    })
    .await;
    let runtime_id = broker
        .storage
        .instances()
        .get(instance_id)
        .await
        .unwrap()
        .runtime_id
        .unwrap();
    broker
        .controlplane
        .set_admin_kubeconfig(&runtime_id, ADMIN_KUBECONFIG);

    wait_until("provisioning to succeed", || async {
        last_operation_state(broker, instance_id).await == "succeeded"
    })
    .await;
    runtime_id
}

fn plain_instance(instance_id: &str, runtime_id: &str) -> Instance {
    let now = chrono::Utc::now();
    let parameters = ProvisioningParameters {
        plan_id: AWS_PLAN_ID.into(),
        service_id: KYMA_SERVICE_ID.into(),
        platform_region: "cf-eu10".into(),
        ers_context: ErsContext {
            global_account_id: "ga-1".into(),
            subaccount_id: "sa-1".into(),
            ..Default::default()
        },
        ..Default::default()
    };
    Instance {
        instance_id: instance_id.into(),
        runtime_id: Some(runtime_id.into()),
        global_account_id: "ga-1".into(),
        subaccount_id: "sa-1".into(),
        service_id: KYMA_SERVICE_ID.into(),
        service_plan_id: AWS_PLAN_ID.into(),
        platform_region: "cf-eu10".into(),
        provider_region: Some("eu-central-1".into()),
        dashboard_url: None,
        parameters,
        created_at: now,
        updated_at: now,
        expired_at: None,
        version: 0,
    }
}

#[tokio::test]
async fn test_healthz() {
    let broker = broker();
    let (status, _) = send(&broker.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_catalog_lists_every_plan() {
    let broker = broker();
    let (status, body) = send(&broker.router, "GET", "/v2/catalog", None).await;
    assert_eq!(status, StatusCode::OK);
    let service = &body["services"][0];
    assert_eq!(service["id"], KYMA_SERVICE_ID);
    let plans = service["plans"].as_array().unwrap();
    // The plain mount has no converged-cloud region mapping.
    assert_eq!(plans.len(), plans::PLANS.len() - 1);
    let names: Vec<&str> = plans.iter().filter_map(|p| p["name"].as_str()).collect();
    assert!(names.contains(&"aws"));
    assert!(names.contains(&"trial"));
    assert!(!names.contains(&"sap-converged-cloud"));
}

#[tokio::test]
async fn test_catalog_offers_converged_cloud_only_where_mapped() {
    let broker = broker();

    let (status, body) = send(&broker.router, "GET", "/oauth/cf-eu20/v2/catalog", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<String> = body["services"][0]["plans"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["name"].as_str().map(String::from))
        .collect();
    assert!(names.contains(&"sap-converged-cloud".to_string()));

    let (status, body) = send(&broker.router, "GET", "/oauth/cf-eu10/v2/catalog", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<String> = body["services"][0]["plans"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p["name"].as_str().map(String::from))
        .collect();
    assert!(!names.contains(&"sap-converged-cloud".to_string()));
}

#[tokio::test]
async fn test_provision_happy_path() {
    let broker = broker();
    let runtime_id =
        provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    let runtime = broker.controlplane.runtime(&runtime_id).unwrap();
    assert_eq!(
        runtime.labels.get("kyma-project.io/global-account-id"),
        Some(&"ga-1".to_string())
    );
    assert_eq!(
        runtime.labels.get("kyma-project.io/subaccount-id"),
        Some(&"sa-1".to_string())
    );
    assert_eq!(
        runtime.labels.get("kyma-project.io/provider"),
        Some(&"AWS".to_string())
    );
    // The dedicated pool claimed its one binding for the tenant.
    assert_eq!(runtime.secret_name, "sb-aws");

    let kyma = broker
        .controlplane
        .kyma(&format!("kyma-{runtime_id}"))
        .unwrap();
    assert_eq!(
        kyma.labels.get("kyma-project.io/region"),
        Some(&"eu-central-1".to_string())
    );
    assert_eq!(
        kyma.labels.get("kyma-project.io/provider"),
        Some(&"AWS".to_string())
    );
    // Plain mount: no platform-region label on the resource.
    assert!(!kyma.labels.contains_key("kyma-project.io/platform-region"));

    let instance = broker.storage.instances().get("i-1").await.unwrap();
    assert!(instance.dashboard_url.unwrap().contains(&runtime_id));
    assert_eq!(instance.provider_region.as_deref(), Some("eu-central-1"));
}

#[tokio::test]
async fn test_identical_reput_returns_same_operation() {
    let broker = broker();
    let body = provision_body(AWS_PLAN_ID, "ga-1");
    let (status, first) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1",
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, second) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1",
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["operation"], second["operation"]);

    // A drifted re-PUT conflicts.
    let mut drifted = provision_body(AWS_PLAN_ID, "ga-1");
    drifted["parameters"]["name"] = json!("other-cluster");
    let (status, _) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1",
        Some(drifted),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_plan_is_rejected() {
    let broker = broker();
    let mut body = provision_body(AWS_PLAN_ID, "ga-1");
    body["plan_id"] = json!("not-a-plan");
    let (status, _) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1",
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_trial_under_eu_restricted_region() {
    let broker = broker();
    let runtime_id = provision_ready(
        &broker,
        "/oauth/cf-eu11/v2",
        "i-eu",
        provision_body(TRIAL_PLAN_ID, "ga-eu"),
    )
    .await;

    let runtime = broker.controlplane.runtime(&runtime_id).unwrap();
    // EU access forces the eu-labeled shared binding.
    assert_eq!(runtime.secret_name, "sb-aws-eu");
    let kyma = broker
        .controlplane
        .kyma(&format!("kyma-{runtime_id}"))
        .unwrap();
    assert_eq!(
        kyma.labels.get("kyma-project.io/platform-region"),
        Some(&"cf-eu11".to_string())
    );
    let instance = broker.storage.instances().get("i-eu").await.unwrap();
    assert_eq!(instance.platform_region, "cf-eu11");
}

#[tokio::test]
async fn test_eu_access_rejection_stores_nothing() {
    let broker = broker();
    let (status, body) = send(
        &broker.router,
        "PUT",
        "/oauth/cf-eu11/v2/service_instances/i-no",
        Some(provision_body(TRIAL_PLAN_ID, "ga-unlisted")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["description"].as_str().unwrap().contains("whitelisted"));

    let err = broker.storage.instances().get("i-no").await.unwrap_err();
    assert!(err.is_not_found());
    let operations = broker
        .storage
        .operations()
        .list_by_instance("i-no")
        .await
        .unwrap();
    assert!(operations.is_empty());
}

#[tokio::test]
async fn test_deprovision_removes_instance_and_second_delete_is_gone() {
    let broker = broker();
    let runtime_id =
        provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    let (status, response) = send(&broker.router, "DELETE", "/v2/service_instances/i-1", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let operation_id = response["operation"].as_str().unwrap().to_string();

    wait_until("deprovisioning to finish", || async {
        matches!(
            broker.storage.operations().get(&operation_id).await,
            Ok(op) if op.state == OperationState::Succeeded
        )
    })
    .await;

    assert!(broker.storage.instances().get("i-1").await.unwrap_err().is_not_found());
    assert!(!broker.controlplane.runtime_exists(&runtime_id).await.unwrap());

    let (status, _) = send(&broker.router, "DELETE", "/v2/service_instances/i-1", None).await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_suspend_and_unsuspend_cycle() {
    let broker = broker();
    let runtime_id =
        provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    let (status, _) = send(
        &broker.router,
        "PATCH",
        "/v2/service_instances/i-1",
        Some(json!({ "context": { "active": false } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_until("suspension to finish", || async {
        last_operation_state(&broker, "i-1").await == "succeeded"
    })
    .await;

    // The instance row survives a suspension; only the runtime is gone.
    let instance = broker.storage.instances().get("i-1").await.unwrap();
    assert_eq!(instance.runtime_id.as_deref(), Some(runtime_id.as_str()));
    assert!(!broker.controlplane.runtime_exists(&runtime_id).await.unwrap());

    let (status, _) = send(
        &broker.router,
        "PATCH",
        "/v2/service_instances/i-1",
        Some(json!({ "context": { "active": true } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_until("unsuspension to finish", || async {
        last_operation_state(&broker, "i-1").await == "succeeded"
            && matches!(
                broker.storage.operations().get_last_by_instance("i-1").await,
                Ok(op) if op.op_type == OperationType::Unsuspend
            )
    })
    .await;
    // The runtime identity is reused.
    assert!(broker.controlplane.runtime_exists(&runtime_id).await.unwrap());
}

#[tokio::test]
async fn test_expired_instance_rejects_unsuspension() {
    let broker = broker();
    provision_ready(
        &broker,
        "/v2",
        "i-t",
        provision_body(TRIAL_PLAN_ID, "ga-1"),
    )
    .await;

    let (status, response) = send(
        &broker.router,
        "PUT",
        "/expire/service_instance/i-t",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let suspend_id = response["operation"].as_str().unwrap().to_string();

    wait_until("expiration suspension to finish", || async {
        matches!(
            broker.storage.operations().get(&suspend_id).await,
            Ok(op) if op.state == OperationState::Succeeded
        )
    })
    .await;
    let instance = broker.storage.instances().get("i-t").await.unwrap();
    assert!(instance.is_expired());

    // Unsuspension of an expired instance is refused outright.
    let (status, _) = send(
        &broker.router,
        "PATCH",
        "/v2/service_instances/i-t",
        Some(json!({ "context": { "active": true } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // So is any parameter change.
    let (status, _) = send(
        &broker.router,
        "PATCH",
        "/v2/service_instances/i-t",
        Some(json!({ "parameters": { "machine_type": "m5.xlarge" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // A context-only bookkeeping update still lands.
    let (status, _) = send(
        &broker.router,
        "PATCH",
        "/v2/service_instances/i-t",
        Some(json!({ "context": { "user_id": "ops@example.com" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The last operation stays the successful suspension.
    let last = broker
        .storage
        .operations()
        .get_last_by_instance("i-t")
        .await
        .unwrap();
    assert_eq!(last.operation_id, suspend_id);
    assert_eq!(last.op_type, OperationType::Suspend);
}

#[tokio::test]
async fn test_expire_rejects_non_expirable_plan() {
    let broker = broker();
    provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;
    let (status, _) = send(
        &broker.router,
        "PUT",
        "/expire/service_instance/i-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_machine_type_reaches_the_runtime() {
    let broker = broker();
    let runtime_id =
        provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    let (status, response) = send(
        &broker.router,
        "PATCH",
        "/v2/service_instances/i-1",
        Some(json!({ "parameters": { "machine_type": "m5.xlarge" } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{response}");

    wait_until("update to finish", || async {
        last_operation_state(&broker, "i-1").await == "succeeded"
    })
    .await;
    let runtime = broker.controlplane.runtime(&runtime_id).unwrap();
    assert_eq!(runtime.machine_type.as_deref(), Some("m5.xlarge"));
    let instance = broker.storage.instances().get("i-1").await.unwrap();
    assert_eq!(
        instance.parameters.parameters.machine_type.as_deref(),
        Some("m5.xlarge")
    );
}

#[tokio::test]
async fn test_last_operation_unknown_instance_is_not_found() {
    let broker = broker();
    let (status, _) = send(
        &broker.router,
        "GET",
        "/v2/service_instances/i-missing/last_operation",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_binding_ceiling_and_idempotent_reput() {
    let broker = broker();
    provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    for n in 0..10 {
        let (status, body) = send(
            &broker.router,
            "PUT",
            &format!("/v2/service_instances/i-1/service_bindings/b-{n}"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "binding b-{n}: {body}");
        assert!(body["credentials"]["kubeconfig"].as_str().unwrap().contains("token-"));
    }

    // Identical re-PUT of an existing binding is a 200, not a new credential.
    let (status, _) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1/service_bindings/b-0",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The ceiling rejects the eleventh.
    let (status, _) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1/service_bindings/b-10",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // And the first one still reads fine.
    let (status, body) = send(
        &broker.router,
        "GET",
        "/v2/service_instances/i-1/service_bindings/b-0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["credentials"]["kubeconfig"].is_string());
}

#[tokio::test]
async fn test_binding_delete_then_delete_again_is_gone() {
    let broker = broker();
    provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    let (status, _) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1/service_bindings/b-1",
        Some(json!({ "context": { "email": "jane.doe@example.com", "origin": "subaccount" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = send(
        &broker.router,
        "DELETE",
        "/v2/service_instances/i-1/service_bindings/b-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &broker.router,
        "DELETE",
        "/v2/service_instances/i-1/service_bindings/b-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::GONE);

    let (status, _) = send(
        &broker.router,
        "GET",
        "/v2/service_instances/i-1/service_bindings/b-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_binding_expiration_outside_bounds_is_rejected() {
    let broker = broker();
    provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    let (status, _) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1/service_bindings/b-1",
        Some(json!({ "parameters": { "expiration_seconds": 30 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upgrade_cluster_orchestration_runs_to_success() {
    let broker = broker();
    broker
        .storage
        .instances()
        .insert(plain_instance("i-1", "r-1"))
        .await
        .unwrap();
    broker
        .storage
        .instances()
        .insert(plain_instance("i-2", "r-2"))
        .await
        .unwrap();

    let (status, response) = send(
        &broker.router,
        "POST",
        "/upgrade/cluster",
        Some(json!({ "targets": { "include": [{ "target": "all" }] } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let orchestration_id = response["orchestration_id"].as_str().unwrap().to_string();

    wait_until("orchestration to succeed", || async {
        let (_, body) = send(
            &broker.router,
            "GET",
            &format!("/orchestrations/{orchestration_id}"),
            None,
        )
        .await;
        body["state"] == json!("succeeded")
    })
    .await;

    let (status, body) = send(
        &broker.router,
        "GET",
        &format!("/orchestrations/{orchestration_id}/operations"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], json!(2));
    for op in body["data"].as_array().unwrap() {
        assert_eq!(op["state"], json!("succeeded"));
    }

    let mut upgraded: Vec<String> = broker
        .provisioner
        .upgrades()
        .into_iter()
        .map(|(runtime_id, _)| runtime_id)
        .collect();
    upgraded.sort();
    assert_eq!(upgraded, vec!["r-1".to_string(), "r-2".to_string()]);
}

#[tokio::test]
async fn test_dry_run_orchestration_creates_no_operations() {
    let broker = broker();
    broker
        .storage
        .instances()
        .insert(plain_instance("i-1", "r-1"))
        .await
        .unwrap();

    let (status, response) = send(
        &broker.router,
        "POST",
        "/upgrade/kyma",
        Some(json!({ "targets": { "include": [{ "target": "all" }] }, "dry_run": true })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let orchestration_id = response["orchestration_id"].as_str().unwrap().to_string();

    wait_until("dry run to succeed", || async {
        let (_, body) = send(
            &broker.router,
            "GET",
            &format!("/orchestrations/{orchestration_id}"),
            None,
        )
        .await;
        body["state"] == json!("succeeded")
    })
    .await;

    let (_, body) = send(
        &broker.router,
        "GET",
        &format!("/orchestrations/{orchestration_id}/operations"),
        None,
    )
    .await;
    assert_eq!(body["count"], json!(0));
    assert!(broker.provisioner.upgrades().is_empty());
}

#[tokio::test]
async fn test_cancel_scheduled_orchestration() {
    let broker = broker();
    for n in 0..3 {
        broker
            .storage
            .instances()
            .insert(plain_instance(&format!("i-{n}"), &format!("r-{n}")))
            .await
            .unwrap();
    }

    // Operations are scheduled well into the future so the cancel lands
    // before any of them is dispatched.
    let at = chrono::Utc::now() + chrono::Duration::hours(1);
    let (status, response) = send(
        &broker.router,
        "POST",
        "/upgrade/cluster",
        Some(json!({
            "targets": { "include": [{ "target": "all" }] },
            "strategy": {
                "parallel_workers": 1,
                "schedule": { "type": "timestamp", "at": at.to_rfc3339() },
            },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let orchestration_id = response["orchestration_id"].as_str().unwrap().to_string();

    wait_until("operations to be scheduled", || async {
        let (_, body) = send(
            &broker.router,
            "GET",
            &format!("/orchestrations/{orchestration_id}"),
            None,
        )
        .await;
        body["state"] == json!("in_progress")
    })
    .await;

    let (status, _) = send(
        &broker.router,
        "PUT",
        &format!("/orchestrations/{orchestration_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    wait_until("orchestration to cancel", || async {
        let (_, body) = send(
            &broker.router,
            "GET",
            &format!("/orchestrations/{orchestration_id}"),
            None,
        )
        .await;
        body["state"] == json!("canceled")
    })
    .await;

    let (_, body) = send(
        &broker.router,
        "GET",
        &format!("/orchestrations/{orchestration_id}/operations"),
        None,
    )
    .await;
    let canceled = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|op| op["state"] == json!("canceled"))
        .count();
    assert!(canceled >= 1, "expected canceled operations, got {body}");

    // A second cancel of the finished orchestration conflicts.
    let (status, _) = send(
        &broker.router,
        "PUT",
        &format!("/orchestrations/{orchestration_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_binding_access_is_cleaned_up_on_delete() {
    let broker = broker();
    provision_ready(&broker, "/v2", "i-1", provision_body(AWS_PLAN_ID, "ga-1")).await;

    let (status, _) = send(
        &broker.router,
        "PUT",
        "/v2/service_instances/i-1/service_bindings/b-1",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(broker.cluster.has_access(
        ADMIN_KUBECONFIG,
        &ebroker_core::clients::runtime_cluster::ClusterAccess {
            namespace: "kyma-system".into(),
            name: "kyma-binding-b-1".into(),
        },
    ));

    let (status, _) = send(
        &broker.router,
        "DELETE",
        "/v2/service_instances/i-1/service_bindings/b-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!broker.cluster.has_access(
        ADMIN_KUBECONFIG,
        &ebroker_core::clients::runtime_cluster::ClusterAccess {
            namespace: "kyma-system".into(),
            name: "kyma-binding-b-1".into(),
        },
    ));
}
