// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Open Service Broker handlers.
//!
//! Lifecycle requests are accepted with `202` and an operation id; the work
//! happens on the queues. Validation (unknown plan, EU access, parameter
//! conflicts) happens here, before any row is stored.
//!
//! Every endpoint is mounted twice: plain under `/v2` and region-scoped under
//! `/oauth/{region}/v2`; the plain mount assumes the configured default
//! platform region.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use ebroker_core::bindings::BindingRequest;
use ebroker_core::error::BrokerError;
use ebroker_core::model::{
    Binding, ClusterParameters, ErsContext, Instance, Operation, OperationState, OperationType,
    ProvisioningParameters,
};
use ebroker_core::plans::{self, KYMA_SERVICE_ID};

use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Provision and update request body.
#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    context: ErsContext,
    #[serde(default)]
    parameters: ClusterParameters,
}

/// Update request body; everything is optional on a PATCH.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    context: Option<ErsContext>,
    #[serde(default)]
    parameters: Option<ClusterParameters>,
}

/// Binding create request body.
#[derive(Debug, Default, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    parameters: BindParameters,
    #[serde(default)]
    context: BindContext,
}

#[derive(Debug, Default, Deserialize)]
struct BindParameters {
    #[serde(default)]
    expiration_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BindContext {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    origin: Option<String>,
}

/// Query parameters of a last_operation poll.
#[derive(Debug, Default, Deserialize)]
pub struct LastOperationQuery {
    #[serde(default)]
    operation: Option<String>,
}

/// GET /v2/catalog
pub async fn get_catalog(State(state): State<SharedState>) -> Json<Value> {
    catalog(&state, None)
}

/// GET /oauth/{region}/v2/catalog
pub async fn get_catalog_regional(
    State(state): State<SharedState>,
    Path(region): Path<String>,
) -> Json<Value> {
    catalog(&state, Some(&region))
}

fn catalog(state: &SharedState, platform_region: Option<&str>) -> Json<Value> {
    // The converged-cloud plan exists only where a platform region maps to
    // converged-cloud provider regions.
    let converged_cloud_offered = platform_region
        .is_some_and(|region| !state.policy.converged_cloud_regions(region).is_empty());
    let plans: Vec<Value> = plans::PLANS
        .iter()
        .filter(|p| p.id != plans::SAP_CONVERGED_CLOUD_PLAN_ID || converged_cloud_offered)
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "description": format!("Kyma environment on {}", p.provider.label()),
                "bindable": p.bindable,
            })
        })
        .collect();
    Json(json!({
        "services": [{
            "id": KYMA_SERVICE_ID,
            "name": "kymaruntime",
            "description": "Kyma environments on managed Kubernetes clusters",
            "bindable": true,
            "plan_updateable": true,
            "plans": plans,
        }]
    }))
}

fn accepted(operation_id: &str) -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "operation": operation_id }))).into_response()
}

/// PUT /v2/service_instances/{instance_id}
pub async fn put_provision(
    State(state): State<SharedState>,
    Path(instance_id): Path<String>,
    Json(body): Json<ProvisionRequest>,
) -> ApiResult<Response> {
    provision(state, None, instance_id, body).await
}

/// PUT /oauth/{region}/v2/service_instances/{instance_id}
pub async fn put_provision_regional(
    State(state): State<SharedState>,
    Path((region, instance_id)): Path<(String, String)>,
    Json(body): Json<ProvisionRequest>,
) -> ApiResult<Response> {
    provision(state, Some(region), instance_id, body).await
}

async fn provision(
    state: SharedState,
    region: Option<String>,
    instance_id: String,
    body: ProvisionRequest,
) -> ApiResult<Response> {
    if body.service_id != KYMA_SERVICE_ID {
        return Err(BrokerError::Validation {
            field: "service_id".into(),
            message: format!("unknown service {}", body.service_id),
        }
        .into());
    }
    let plan = plans::plan_by_id(&body.plan_id)?;
    let request_platform_region = region;
    let platform_region = request_platform_region
        .clone()
        .unwrap_or_else(|| state.config.default_request_region.clone());

    // Policy runs before anything is stored; a rejected request leaves no
    // instance and no operation behind.
    state.policy.validate_eu_access(
        &platform_region,
        &body.context.global_account_id,
        body.parameters.region.as_deref(),
    )?;

    let parameters = ProvisioningParameters {
        plan_id: body.plan_id.clone(),
        service_id: body.service_id.clone(),
        platform_region: platform_region.clone(),
        request_platform_region,
        ers_context: body.context,
        parameters: body.parameters,
    };

    match state.storage.instances().get(&instance_id).await {
        Ok(existing) => {
            if existing.parameters == parameters {
                // Identical re-PUT: report the stored operation again.
                let last = state
                    .storage
                    .operations()
                    .get_last_by_types(&instance_id, &[OperationType::Provision])
                    .await?
                    .ok_or_else(|| BrokerError::NotFound {
                        resource: "operation",
                        id: instance_id.clone(),
                    })?;
                return Ok(accepted(&last.operation_id));
            }
            Err(BrokerError::Conflict {
                resource: "instance",
                details: format!("{} was provisioned with different parameters", instance_id),
            }
            .into())
        }
        Err(err) if err.is_not_found() => {
            let now = chrono::Utc::now();
            let instance = Instance {
                instance_id: instance_id.clone(),
                runtime_id: None,
                global_account_id: parameters.ers_context.global_account_id.clone(),
                subaccount_id: parameters.ers_context.subaccount_id.clone(),
                service_id: parameters.service_id.clone(),
                service_plan_id: parameters.plan_id.clone(),
                platform_region,
                provider_region: None,
                dashboard_url: None,
                parameters: parameters.clone(),
                created_at: now,
                updated_at: now,
                expired_at: None,
                version: 0,
            };
            state.storage.instances().insert(instance).await?;

            let operation = Operation::new(&instance_id, OperationType::Provision, parameters);
            state.storage.operations().insert(operation.clone()).await?;
            state.queues.enqueue(operation.op_type, &operation.operation_id);
            info!(
                instance_id = %instance_id,
                operation_id = %operation.operation_id,
                plan = plan.name,
                "Provisioning accepted"
            );
            Ok(accepted(&operation.operation_id))
        }
        Err(err) => Err(err.into()),
    }
}

/// PATCH /v2/service_instances/{instance_id}
pub async fn patch_update(
    State(state): State<SharedState>,
    Path(instance_id): Path<String>,
    Json(body): Json<UpdateRequest>,
) -> ApiResult<Response> {
    update(state, instance_id, body).await
}

/// PATCH /oauth/{region}/v2/service_instances/{instance_id}
pub async fn patch_update_regional(
    State(state): State<SharedState>,
    Path((_region, instance_id)): Path<(String, String)>,
    Json(body): Json<UpdateRequest>,
) -> ApiResult<Response> {
    update(state, instance_id, body).await
}

async fn update(
    state: SharedState,
    instance_id: String,
    body: UpdateRequest,
) -> ApiResult<Response> {
    let mut instance = state.storage.instances().get(&instance_id).await?;
    require_usable(&state, &instance_id).await?;

    let active = body.context.as_ref().and_then(|c| c.active);

    if instance.is_expired() {
        if active == Some(true) {
            return Err(BrokerError::Validation {
                field: "context.active".into(),
                message: format!("instance {} is expired and cannot be unsuspended", instance_id),
            }
            .into());
        }
        if body.parameters.is_some() {
            return Err(BrokerError::Validation {
                field: "parameters".into(),
                message: format!("instance {} is expired; only context updates are accepted", instance_id),
            }
            .into());
        }
        // Context-only bookkeeping update is the one thing an expired
        // instance still accepts.
        if let Some(context) = body.context {
            merge_context(&mut instance.parameters.ers_context, context);
            state.storage.instances().update(instance).await?;
        }
        return Ok((StatusCode::OK, Json(json!({}))).into_response());
    }

    let previously_active = instance.is_active();
    if let Some(context) = body.context.clone() {
        merge_context(&mut instance.parameters.ers_context, context);
        instance = state.storage.instances().update(instance).await?;
    }

    match active {
        Some(false) => {
            let mut operation = Operation::new(
                &instance_id,
                OperationType::Suspend,
                instance.parameters.clone(),
            );
            operation.runtime_id = instance.runtime_id.clone();
            state.storage.operations().insert(operation.clone()).await?;
            state.queues.enqueue(operation.op_type, &operation.operation_id);
            info!(instance_id = %instance_id, operation_id = %operation.operation_id, "Suspension accepted");
            Ok(accepted(&operation.operation_id))
        }
        Some(true) if !previously_active => {
            let mut operation = Operation::new(
                &instance_id,
                OperationType::Unsuspend,
                instance.parameters.clone(),
            );
            operation.runtime_id = instance.runtime_id.clone();
            state.storage.operations().insert(operation.clone()).await?;
            state.queues.enqueue(operation.op_type, &operation.operation_id);
            info!(instance_id = %instance_id, operation_id = %operation.operation_id, "Unsuspension accepted");
            Ok(accepted(&operation.operation_id))
        }
        _ => {
            let Some(requested) = body.parameters else {
                // Pure context update, no pipeline involved.
                return Ok((StatusCode::OK, Json(json!({}))).into_response());
            };
            let mut parameters = instance.parameters.clone();
            if requested.machine_type.is_some() {
                parameters.parameters.machine_type = requested.machine_type;
            }
            if requested.modules.is_some() {
                parameters.parameters.modules = requested.modules;
            }
            if requested.networking_cidr.is_some() {
                parameters.parameters.networking_cidr = requested.networking_cidr;
            }
            if requested.name.is_some() {
                parameters.parameters.name = requested.name;
            }
            let mut operation = Operation::new(&instance_id, OperationType::Update, parameters);
            operation.runtime_id = instance.runtime_id.clone();
            state.storage.operations().insert(operation.clone()).await?;
            state.queues.enqueue(operation.op_type, &operation.operation_id);
            info!(instance_id = %instance_id, operation_id = %operation.operation_id, "Update accepted");
            Ok(accepted(&operation.operation_id))
        }
    }
}

fn merge_context(stored: &mut ErsContext, incoming: ErsContext) {
    if incoming.user_id.is_some() {
        stored.user_id = incoming.user_id;
    }
    if incoming.active.is_some() {
        stored.active = incoming.active;
    }
}

// Acting on an instance whose provisioning failed cannot succeed; reject with
// 422 instead of queueing doomed work.
async fn require_usable(state: &SharedState, instance_id: &str) -> ApiResult<()> {
    if let Some(last) = state
        .storage
        .operations()
        .get_last_by_types(
            instance_id,
            &[OperationType::Provision, OperationType::Unsuspend],
        )
        .await?
        && last.state == OperationState::Failed
    {
        return Err(ApiError::Unprocessable(format!(
            "provisioning of instance {} failed; the instance can only be deprovisioned",
            instance_id
        )));
    }
    Ok(())
}

/// DELETE /v2/service_instances/{instance_id}
pub async fn delete_deprovision(
    State(state): State<SharedState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Response> {
    deprovision(state, instance_id).await
}

/// DELETE /oauth/{region}/v2/service_instances/{instance_id}
pub async fn delete_deprovision_regional(
    State(state): State<SharedState>,
    Path((_region, instance_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    deprovision(state, instance_id).await
}

async fn deprovision(state: SharedState, instance_id: String) -> ApiResult<Response> {
    let instance = match state.storage.instances().get(&instance_id).await {
        Ok(instance) => instance,
        Err(err) if err.is_not_found() => {
            return Err(ApiError::Gone(format!("instance {} is gone", instance_id)));
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(pending) = state
        .storage
        .operations()
        .get_last_by_types(&instance_id, &[OperationType::Deprovision])
        .await?
        && !pending.is_finished()
    {
        return Ok(accepted(&pending.operation_id));
    }

    let mut operation = Operation::new(
        &instance_id,
        OperationType::Deprovision,
        instance.parameters.clone(),
    );
    operation.runtime_id = instance.runtime_id.clone();
    state.storage.operations().insert(operation.clone()).await?;
    state.queues.enqueue(operation.op_type, &operation.operation_id);
    info!(instance_id = %instance_id, operation_id = %operation.operation_id, "Deprovisioning accepted");
    Ok(accepted(&operation.operation_id))
}

/// GET /v2/service_instances/{instance_id}/last_operation
pub async fn get_last_operation(
    State(state): State<SharedState>,
    Path(instance_id): Path<String>,
    Query(query): Query<LastOperationQuery>,
) -> ApiResult<Response> {
    last_operation(state, instance_id, query).await
}

/// GET /oauth/{region}/v2/service_instances/{instance_id}/last_operation
pub async fn get_last_operation_regional(
    State(state): State<SharedState>,
    Path((_region, instance_id)): Path<(String, String)>,
    Query(query): Query<LastOperationQuery>,
) -> ApiResult<Response> {
    last_operation(state, instance_id, query).await
}

async fn last_operation(
    state: SharedState,
    instance_id: String,
    query: LastOperationQuery,
) -> ApiResult<Response> {
    let operation = match query.operation {
        Some(operation_id) => state.storage.operations().get(&operation_id).await?,
        None => state
            .storage
            .operations()
            .get_last_by_instance(&instance_id)
            .await?,
    };
    let osb_state = match operation.state {
        OperationState::Succeeded => "succeeded",
        OperationState::Failed | OperationState::Canceled => "failed",
        _ => "in progress",
    };
    Ok((
        StatusCode::OK,
        Json(json!({ "state": osb_state, "description": operation.description })),
    )
        .into_response())
}

fn binding_response(status: StatusCode, binding: &Binding) -> Response {
    (
        status,
        Json(json!({
            "credentials": { "kubeconfig": binding.kubeconfig },
            "metadata": {
                "expires_at": binding.expires_at.to_rfc3339(),
                "created_by": binding.created_by,
            },
        })),
    )
        .into_response()
}

fn binding_engine(state: &SharedState) -> ApiResult<&ebroker_core::bindings::BindingEngine> {
    state
        .bindings
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("binding support is disabled".into()))
}

/// PUT /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub async fn put_binding(
    State(state): State<SharedState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(body): Json<BindRequest>,
) -> ApiResult<Response> {
    let engine = binding_engine(&state)?;
    let created = engine
        .create(
            &instance_id,
            BindingRequest {
                binding_id,
                expiration_seconds: body.parameters.expiration_seconds,
                email: body.context.email,
                origin: body.context.origin,
            },
        )
        .await?;
    let status = if created.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(binding_response(status, &created.binding))
}

/// GET /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub async fn get_binding(
    State(state): State<SharedState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let engine = binding_engine(&state)?;
    let binding = engine.get(&instance_id, &binding_id).await?;
    Ok(binding_response(StatusCode::OK, &binding))
}

/// DELETE /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub async fn delete_binding(
    State(state): State<SharedState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let engine = binding_engine(&state)?;
    match engine.delete(&instance_id, &binding_id).await {
        Ok(()) => Ok((StatusCode::OK, Json(json!({}))).into_response()),
        Err(err) if err.is_not_found() => {
            Err(ApiError::Gone(format!("binding {} is gone", binding_id)))
        }
        Err(err) => Err(err.into()),
    }
}
