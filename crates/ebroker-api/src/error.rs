// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP error mapping.
//!
//! The engine reports [`BrokerError`]; handlers translate it to OSB status
//! codes. Two HTTP-only outcomes exist on top: `410 Gone` for deletes of
//! resources that are already gone, and `422` for actions against an instance
//! whose provisioning has failed.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ebroker_core::error::BrokerError;
use serde_json::json;
use tracing::error;

/// Handler result type.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors leaving the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// An engine error, mapped by its class.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The resource existed once and will not again.
    #[error("{0}")]
    Gone(String),

    /// The instance is in a state the request cannot act on.
    #[error("{0}")]
    Unprocessable(String),

    /// The request body or parameters cannot be accepted.
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Broker(err) => match err {
                BrokerError::Validation { .. } => StatusCode::BAD_REQUEST,
                BrokerError::NotFound { .. } => StatusCode::NOT_FOUND,
                BrokerError::AlreadyExists { .. } | BrokerError::Conflict { .. } => {
                    StatusCode::CONFLICT
                }
                BrokerError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Gone(_) => StatusCode::GONE,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "description": self.to_string() }))).into_response()
    }
}
