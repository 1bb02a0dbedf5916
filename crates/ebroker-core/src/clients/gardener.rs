// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gardener client: secret bindings and shoot listings for the account pool.
//!
//! Secret-binding label updates are optimistic: the write carries the
//! resource version the caller read, and a stale version yields a conflict
//! the pool retries over.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{BrokerError, Result};

/// Label marking a binding claimed by a tenant.
pub const LABEL_TENANT: &str = "tenantName";
/// Label carrying the hyperscaler type key.
pub const LABEL_HYPERSCALER_TYPE: &str = "hyperscalerType";
/// Label marking a binding withdrawn from selection.
pub const LABEL_DIRTY: &str = "dirty";
/// Label marking an operator-managed binding the pool must never recycle.
pub const LABEL_INTERNAL: &str = "internal";
/// Label marking a binding shared across tenants.
pub const LABEL_SHARED: &str = "shared";
/// Label marking an EU-access binding.
pub const LABEL_EU_ACCESS: &str = "euAccess";

/// A hyperscaler credential binding.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretBinding {
    /// Binding name; also the `target_secret` handed to provisioning.
    pub name: String,
    /// Name of the secret the binding references.
    pub secret_name: String,
    /// Selection labels.
    pub labels: HashMap<String, String>,
    /// Optimistic-concurrency token.
    pub resource_version: u64,
}

impl SecretBinding {
    /// Whether the label is present with value `"true"`.
    pub fn flag(&self, label: &str) -> bool {
        self.labels.get(label).is_some_and(|v| v == "true")
    }
}

/// A provisioned shoot cluster, as far as the pool cares.
#[derive(Debug, Clone, PartialEq)]
pub struct Shoot {
    /// Shoot name.
    pub name: String,
    /// Secret binding the shoot was provisioned with.
    pub secret_binding_name: String,
}

/// Read and label-write access to gardener secret bindings and shoots.
#[async_trait]
pub trait GardenerClient: Send + Sync {
    /// All secret bindings.
    async fn list_secret_bindings(&self) -> Result<Vec<SecretBinding>>;
    /// Write a binding's labels. Fails with a conflict when the carried
    /// resource version is stale; returns the stored binding with the bumped
    /// version on success.
    async fn update_secret_binding(&self, binding: SecretBinding) -> Result<SecretBinding>;
    /// All live shoot clusters.
    async fn list_shoots(&self) -> Result<Vec<Shoot>>;
}

/// In-memory gardener for tests.
#[derive(Default)]
pub struct FakeGardener {
    bindings: Mutex<HashMap<String, SecretBinding>>,
    shoots: Mutex<Vec<Shoot>>,
}

impl FakeGardener {
    /// Create an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret binding.
    pub fn add_binding(&self, name: &str, labels: &[(&str, &str)]) {
        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings.insert(
            name.to_string(),
            SecretBinding {
                name: name.to_string(),
                secret_name: format!("{name}-secret"),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                resource_version: 1,
            },
        );
    }

    /// Seed a shoot using a binding.
    pub fn add_shoot(&self, name: &str, secret_binding_name: &str) {
        let mut shoots = self.shoots.lock().unwrap_or_else(|e| e.into_inner());
        shoots.push(Shoot {
            name: name.to_string(),
            secret_binding_name: secret_binding_name.to_string(),
        });
    }

    /// The stored binding, if any.
    pub fn binding(&self, name: &str) -> Option<SecretBinding> {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        bindings.get(name).cloned()
    }
}

#[async_trait]
impl GardenerClient for FakeGardener {
    async fn list_secret_bindings(&self) -> Result<Vec<SecretBinding>> {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<SecretBinding> = bindings.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn update_secret_binding(&self, binding: SecretBinding) -> Result<SecretBinding> {
        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let stored = bindings
            .get_mut(&binding.name)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "secret binding",
                id: binding.name.clone(),
            })?;
        if stored.resource_version != binding.resource_version {
            return Err(BrokerError::Conflict {
                resource: "secret binding",
                details: format!(
                    "{} resource version {} is stale",
                    binding.name, binding.resource_version
                ),
            });
        }
        stored.labels = binding.labels;
        stored.resource_version += 1;
        Ok(stored.clone())
    }

    async fn list_shoots(&self) -> Result<Vec<Shoot>> {
        let shoots = self.shoots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(shoots.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let fake = FakeGardener::new();
        fake.add_binding("sb-1", &[(LABEL_HYPERSCALER_TYPE, "aws")]);

        let mut first = fake.binding("sb-1").unwrap();
        let mut second = first.clone();

        first.labels.insert(LABEL_TENANT.into(), "ga-1".into());
        fake.update_secret_binding(first).await.unwrap();

        second.labels.insert(LABEL_TENANT.into(), "ga-2".into());
        let err = fake.update_secret_binding(second).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict { .. }));

        assert_eq!(
            fake.binding("sb-1").unwrap().labels.get(LABEL_TENANT),
            Some(&"ga-1".to_string())
        );
    }
}
