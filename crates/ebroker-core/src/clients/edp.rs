// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EDP (event data platform) client.
//!
//! Registration is per subaccount. The API is treated as eventually
//! consistent: a `409` on register means someone already registered us, a
//! `404` on deregister means the record is already gone; both count as
//! success. Server errors are transient and retried by the calling step.

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::error::{BrokerError, Result};

/// Data-tenant registration API.
#[async_trait]
pub trait EdpApi: Send + Sync {
    /// Register a subaccount; already-registered is success.
    async fn register(&self, subaccount_id: &str) -> Result<()>;
    /// Deregister a subaccount; already-gone is success.
    async fn deregister(&self, subaccount_id: &str) -> Result<()>;
}

#[derive(Serialize)]
struct DataTenantPayload<'a> {
    name: &'a str,
    environment: &'a str,
}

/// HTTP client against a real EDP endpoint.
pub struct EdpClient {
    http: reqwest::Client,
    base_url: String,
    environment: String,
}

impl EdpClient {
    /// Create a client for the given base URL and environment namespace.
    pub fn new(base_url: &str, environment: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            environment: environment.to_string(),
        }
    }

    fn tenant_url(&self, subaccount_id: &str) -> String {
        format!(
            "{}/namespaces/{}/dataTenants/{}",
            self.base_url, self.environment, subaccount_id
        )
    }

    fn classify(status: StatusCode, action: &str, subaccount_id: &str) -> BrokerError {
        if status.is_server_error() {
            BrokerError::Transient {
                operation: format!("edp {action}"),
                details: format!("status {status} for subaccount {subaccount_id}"),
            }
        } else {
            BrokerError::StepFatal {
                step: format!("edp {action}"),
                reason: format!("status {status} for subaccount {subaccount_id}"),
            }
        }
    }
}

#[async_trait]
impl EdpApi for EdpClient {
    async fn register(&self, subaccount_id: &str) -> Result<()> {
        let url = format!(
            "{}/namespaces/{}/dataTenants",
            self.base_url, self.environment
        );
        let response = self
            .http
            .post(&url)
            .json(&DataTenantPayload {
                name: subaccount_id,
                environment: &self.environment,
            })
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                debug!(subaccount_id, "EDP data tenant already registered");
                Ok(())
            }
            s => Err(Self::classify(s, "register", subaccount_id)),
        }
    }

    async fn deregister(&self, subaccount_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.tenant_url(subaccount_id))
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(subaccount_id, "EDP data tenant already gone");
                Ok(())
            }
            s => Err(Self::classify(s, "deregister", subaccount_id)),
        }
    }
}

/// In-memory EDP for tests.
#[derive(Default)]
pub struct FakeEdp {
    registered: Mutex<Vec<String>>,
}

impl FakeEdp {
    /// Create an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently registered subaccounts.
    pub fn registered(&self) -> Vec<String> {
        self.registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl EdpApi for FakeEdp {
    async fn register(&self, subaccount_id: &str) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if !registered.iter().any(|s| s == subaccount_id) {
            registered.push(subaccount_id.to_string());
        }
        Ok(())
    }

    async fn deregister(&self, subaccount_id: &str) -> Result<()> {
        let mut registered = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        registered.retain(|s| s != subaccount_id);
        Ok(())
    }
}
