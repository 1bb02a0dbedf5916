// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator endpoints: expiration and batch upgrade orchestrations.
//!
//! These sit outside the OSB surface and are called by landscape tooling, not
//! by the platform. Orchestration execution is long-running and detached from
//! the request; the handlers answer as soon as the row is stored.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use ebroker_core::orchestration::{OrchestrationParameters, OrchestrationType};
use ebroker_core::storage::OperationFilter;

use crate::error::ApiResult;
use crate::state::SharedState;

/// Retry request body.
#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    operation_ids: Vec<String>,
}

/// PUT /expire/service_instance/{instance_id}
pub async fn put_expire(
    State(state): State<SharedState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Response> {
    let outcome = state.expiration.expire(&instance_id).await?;
    info!(
        instance_id = %instance_id,
        operation_id = %outcome.operation_id,
        accepted = outcome.accepted,
        "Expiration requested"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "operation": outcome.operation_id })),
    )
        .into_response())
}

/// POST /upgrade/cluster
pub async fn post_upgrade_cluster(
    State(state): State<SharedState>,
    Json(parameters): Json<OrchestrationParameters>,
) -> ApiResult<Response> {
    start_orchestration(state, OrchestrationType::UpgradeCluster, parameters).await
}

/// POST /upgrade/kyma
pub async fn post_upgrade_kyma(
    State(state): State<SharedState>,
    Json(parameters): Json<OrchestrationParameters>,
) -> ApiResult<Response> {
    start_orchestration(state, OrchestrationType::UpgradeKyma, parameters).await
}

async fn start_orchestration(
    state: SharedState,
    orchestration_type: OrchestrationType,
    parameters: OrchestrationParameters,
) -> ApiResult<Response> {
    let orchestration = state
        .orchestrations
        .create(orchestration_type, parameters)
        .await?;
    spawn_execute(&state, orchestration.orchestration_id.clone());
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "orchestration_id": orchestration.orchestration_id })),
    )
        .into_response())
}

fn spawn_execute(state: &SharedState, orchestration_id: String) {
    let manager = state.orchestrations.clone();
    tokio::spawn(async move {
        if let Err(err) = manager.execute(&orchestration_id).await {
            warn!(
                orchestration_id = %orchestration_id,
                error = %err,
                "Orchestration execution failed"
            );
        }
    });
}

/// GET /orchestrations
pub async fn list_orchestrations(State(state): State<SharedState>) -> ApiResult<Response> {
    let orchestrations = state.storage.orchestrations().list().await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "count": orchestrations.len(),
            "data": orchestrations,
        })),
    )
        .into_response())
}

/// GET /orchestrations/{orchestration_id}
pub async fn get_orchestration(
    State(state): State<SharedState>,
    Path(orchestration_id): Path<String>,
) -> ApiResult<Response> {
    let orchestration = state.storage.orchestrations().get(&orchestration_id).await?;
    Ok((StatusCode::OK, Json(json!(orchestration))).into_response())
}

/// GET /orchestrations/{orchestration_id}/operations
pub async fn list_orchestration_operations(
    State(state): State<SharedState>,
    Path(orchestration_id): Path<String>,
) -> ApiResult<Response> {
    // 404 for an unknown orchestration rather than an empty list.
    state.storage.orchestrations().get(&orchestration_id).await?;
    let page = state
        .storage
        .operations()
        .list(&OperationFilter {
            orchestration_id: Some(orchestration_id),
            ..Default::default()
        })
        .await?;
    let data: Vec<_> = page
        .items
        .iter()
        .map(|op| {
            json!({
                "operation_id": op.operation_id,
                "instance_id": op.instance_id,
                "runtime_id": op.runtime_id,
                "state": op.state.as_str(),
                "description": op.description,
            })
        })
        .collect();
    Ok((
        StatusCode::OK,
        Json(json!({ "count": page.total_count, "data": data })),
    )
        .into_response())
}

/// PUT /orchestrations/{orchestration_id}/cancel
pub async fn put_cancel_orchestration(
    State(state): State<SharedState>,
    Path(orchestration_id): Path<String>,
) -> ApiResult<Response> {
    let orchestration = state.orchestrations.cancel(&orchestration_id).await?;
    Ok((StatusCode::OK, Json(json!(orchestration))).into_response())
}

/// POST /orchestrations/{orchestration_id}/retry
pub async fn post_retry_orchestration(
    State(state): State<SharedState>,
    Path(orchestration_id): Path<String>,
    Json(body): Json<RetryRequest>,
) -> ApiResult<Response> {
    let created = state
        .orchestrations
        .retry(&orchestration_id, &body.operation_ids)
        .await?;
    spawn_execute(&state, orchestration_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "operation_ids": created })),
    )
        .into_response())
}
