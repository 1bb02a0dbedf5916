// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router assembly and the serve loop.

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::osb;
use crate::runtime_api;
use crate::state::SharedState;

/// Assemble the full route table over the shared state.
pub fn router(state: SharedState) -> Router {
    let osb_routes = Router::new()
        .route("/catalog", get(osb::get_catalog))
        .route(
            "/service_instances/{instance_id}",
            put(osb::put_provision)
                .patch(osb::patch_update)
                .delete(osb::delete_deprovision),
        )
        .route(
            "/service_instances/{instance_id}/last_operation",
            get(osb::get_last_operation),
        )
        .route(
            "/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(osb::put_binding)
                .get(osb::get_binding)
                .delete(osb::delete_binding),
        );

    let regional_routes = Router::new()
        .route("/catalog", get(osb::get_catalog_regional))
        .route(
            "/service_instances/{instance_id}",
            put(osb::put_provision_regional)
                .patch(osb::patch_update_regional)
                .delete(osb::delete_deprovision_regional),
        )
        .route(
            "/service_instances/{instance_id}/last_operation",
            get(osb::get_last_operation_regional),
        );

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/v2", osb_routes)
        .nest("/oauth/{region}/v2", regional_routes)
        .route(
            "/expire/service_instance/{instance_id}",
            put(runtime_api::put_expire),
        )
        .route("/upgrade/cluster", post(runtime_api::post_upgrade_cluster))
        .route("/upgrade/kyma", post(runtime_api::post_upgrade_kyma))
        .route("/orchestrations", get(runtime_api::list_orchestrations))
        .route(
            "/orchestrations/{orchestration_id}",
            get(runtime_api::get_orchestration),
        )
        .route(
            "/orchestrations/{orchestration_id}/operations",
            get(runtime_api::list_orchestration_operations),
        )
        .route(
            "/orchestrations/{orchestration_id}/cancel",
            put(runtime_api::put_cancel_orchestration),
        )
        .route(
            "/orchestrations/{orchestration_id}/retry",
            post(runtime_api::post_retry_orchestration),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until ctrl-c.
pub async fn serve(state: SharedState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
