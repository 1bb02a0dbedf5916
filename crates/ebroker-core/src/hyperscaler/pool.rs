// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dedicated and shared credential selection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clients::gardener::{
    GardenerClient, LABEL_DIRTY, LABEL_EU_ACCESS, LABEL_HYPERSCALER_TYPE, LABEL_INTERNAL,
    LABEL_SHARED, LABEL_TENANT, SecretBinding,
};
use crate::error::{BrokerError, Result};

use super::HyperscalerType;

// Claims race through the control plane; a handful of attempts is enough for
// two concurrent selections for the same tenant to converge.
const CLAIM_ATTEMPTS: u32 = 5;

fn matches_pool(binding: &SecretBinding, hyperscaler: &HyperscalerType, eu_access: bool) -> bool {
    binding.labels.get(LABEL_HYPERSCALER_TYPE).map(String::as_str) == Some(hyperscaler.key())
        && binding.flag(LABEL_EU_ACCESS) == eu_access
}

/// Tenant-dedicated credential selection.
pub struct AccountPool {
    gardener: Arc<dyn GardenerClient>,
}

impl AccountPool {
    /// Create a pool over a gardener client.
    pub fn new(gardener: Arc<dyn GardenerClient>) -> Self {
        Self { gardener }
    }

    /// Secret binding name for a tenant; claims an unassigned binding when
    /// the tenant has none yet.
    pub async fn secret_binding_for_tenant(
        &self,
        hyperscaler: &HyperscalerType,
        tenant: &str,
        eu_access: bool,
    ) -> Result<String> {
        for attempt in 0..CLAIM_ATTEMPTS {
            let bindings = self.gardener.list_secret_bindings().await?;

            if let Some(owned) = bindings.iter().find(|b| {
                matches_pool(b, hyperscaler, eu_access)
                    && b.labels.get(LABEL_TENANT).map(String::as_str) == Some(tenant)
            }) {
                return Ok(owned.name.clone());
            }

            let Some(candidate) = bindings.into_iter().find(|b| {
                matches_pool(b, hyperscaler, eu_access)
                    && !b.labels.contains_key(LABEL_TENANT)
                    && !b.flag(LABEL_DIRTY)
                    && !b.flag(LABEL_SHARED)
                    && !b.flag(LABEL_INTERNAL)
            }) else {
                return Err(BrokerError::Internal(format!(
                    "no unassigned secret binding available for hyperscaler {} (eu_access: {})",
                    hyperscaler.key(),
                    eu_access
                )));
            };

            let mut claimed = candidate;
            claimed
                .labels
                .insert(LABEL_TENANT.to_string(), tenant.to_string());
            match self.gardener.update_secret_binding(claimed).await {
                Ok(binding) => {
                    info!(
                        binding = %binding.name,
                        tenant,
                        hyperscaler = hyperscaler.key(),
                        "Claimed secret binding for tenant"
                    );
                    return Ok(binding.name);
                }
                // Someone else labeled the binding first; re-list and retry.
                Err(err) if err.is_retryable() => {
                    debug!(attempt, error = %err, "Secret binding claim conflicted, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(BrokerError::Transient {
            operation: "claim secret binding".into(),
            details: format!("gave up after {CLAIM_ATTEMPTS} conflicting attempts"),
        })
    }

    /// Mark the tenant's binding dirty when nothing uses it anymore.
    /// Internal, already-dirty and still-used bindings are left alone.
    pub async fn mark_unused_as_dirty(
        &self,
        hyperscaler: &HyperscalerType,
        tenant: &str,
    ) -> Result<()> {
        for attempt in 0..CLAIM_ATTEMPTS {
            let bindings = self.gardener.list_secret_bindings().await?;
            let Some(binding) = bindings.into_iter().find(|b| {
                b.labels.get(LABEL_HYPERSCALER_TYPE).map(String::as_str)
                    == Some(hyperscaler.key())
                    && b.labels.get(LABEL_TENANT).map(String::as_str) == Some(tenant)
            }) else {
                return Ok(());
            };

            if binding.flag(LABEL_INTERNAL) || binding.flag(LABEL_DIRTY) {
                return Ok(());
            }
            let shoots = self.gardener.list_shoots().await?;
            if shoots.iter().any(|s| s.secret_binding_name == binding.name) {
                debug!(binding = %binding.name, "Secret binding still in use, not marking dirty");
                return Ok(());
            }

            let mut dirty = binding;
            dirty
                .labels
                .insert(LABEL_DIRTY.to_string(), "true".to_string());
            match self.gardener.update_secret_binding(dirty).await {
                Ok(binding) => {
                    info!(binding = %binding.name, tenant, "Marked secret binding dirty");
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    debug!(attempt, error = %err, "Dirty mark conflicted, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(BrokerError::Transient {
            operation: "mark secret binding dirty".into(),
            details: format!("gave up after {CLAIM_ATTEMPTS} conflicting attempts"),
        })
    }
}

/// Least-used selection over shared credential bindings.
pub struct SharedPool {
    gardener: Arc<dyn GardenerClient>,
}

impl SharedPool {
    /// Create a pool over a gardener client.
    pub fn new(gardener: Arc<dyn GardenerClient>) -> Self {
        Self { gardener }
    }

    /// Name of the shared binding used by the fewest live clusters.
    /// Ties break lexicographically by binding name.
    pub async fn shared_secret_binding(
        &self,
        hyperscaler: &HyperscalerType,
        eu_access: bool,
    ) -> Result<String> {
        let bindings = self.gardener.list_secret_bindings().await?;
        let candidates: Vec<SecretBinding> = bindings
            .into_iter()
            .filter(|b| {
                matches_pool(b, hyperscaler, eu_access)
                    && b.flag(LABEL_SHARED)
                    && !b.flag(LABEL_DIRTY)
            })
            .collect();
        if candidates.is_empty() {
            return Err(BrokerError::Internal(format!(
                "no shared secret binding available for hyperscaler {} (eu_access: {})",
                hyperscaler.key(),
                eu_access
            )));
        }

        let shoots = self.gardener.list_shoots().await?;
        let mut usage: HashMap<&str, usize> = HashMap::new();
        for shoot in &shoots {
            *usage.entry(shoot.secret_binding_name.as_str()).or_insert(0) += 1;
        }

        let least_used = candidates
            .iter()
            .min_by(|a, b| {
                let used_a = usage.get(a.name.as_str()).copied().unwrap_or(0);
                let used_b = usage.get(b.name.as_str()).copied().unwrap_or(0);
                used_a.cmp(&used_b).then_with(|| a.name.cmp(&b.name))
            })
            .unwrap_or_else(|| unreachable!("candidates is non-empty"));
        Ok(least_used.name.clone())
    }
}

/// Facade the credential-resolution step talks to.
pub struct AccountProvider {
    dedicated: AccountPool,
    shared: SharedPool,
}

impl AccountProvider {
    /// Create a provider over a gardener client.
    pub fn new(gardener: Arc<dyn GardenerClient>) -> Self {
        Self {
            dedicated: AccountPool::new(gardener.clone()),
            shared: SharedPool::new(gardener),
        }
    }

    /// Resolve the credential secret for a runtime.
    pub async fn resolve(
        &self,
        hyperscaler: &HyperscalerType,
        tenant: &str,
        shared: bool,
        eu_access: bool,
    ) -> Result<String> {
        if shared {
            self.shared.shared_secret_binding(hyperscaler, eu_access).await
        } else {
            self.dedicated
                .secret_binding_for_tenant(hyperscaler, tenant, eu_access)
                .await
        }
    }

    /// Release the tenant's dedicated binding if nothing uses it anymore.
    pub async fn release(&self, hyperscaler: &HyperscalerType, tenant: &str) -> Result<()> {
        self.dedicated
            .mark_unused_as_dirty(hyperscaler, tenant)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::gardener::FakeGardener;
    use crate::plans::CloudProvider;

    fn aws() -> HyperscalerType {
        HyperscalerType::new(CloudProvider::Aws, "eu-central-1")
    }

    #[tokio::test]
    async fn test_dedicated_prefers_tenant_labeled_binding() {
        let gardener = Arc::new(FakeGardener::new());
        gardener.add_binding("sb-free", &[(LABEL_HYPERSCALER_TYPE, "aws")]);
        gardener.add_binding(
            "sb-mine",
            &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_TENANT, "ga-1")],
        );
        let pool = AccountPool::new(gardener);

        let name = pool
            .secret_binding_for_tenant(&aws(), "ga-1", false)
            .await
            .unwrap();
        assert_eq!(name, "sb-mine");
    }

    #[tokio::test]
    async fn test_dedicated_claims_unassigned_binding() {
        let gardener = Arc::new(FakeGardener::new());
        gardener.add_binding("sb-free", &[(LABEL_HYPERSCALER_TYPE, "aws")]);
        gardener.add_binding(
            "sb-dirty",
            &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_DIRTY, "true")],
        );
        let pool = AccountPool::new(gardener.clone());

        let name = pool
            .secret_binding_for_tenant(&aws(), "ga-1", false)
            .await
            .unwrap();
        assert_eq!(name, "sb-free");
        assert_eq!(
            gardener.binding("sb-free").unwrap().labels.get(LABEL_TENANT),
            Some(&"ga-1".to_string())
        );

        // A second resolution finds the claim instead of claiming again.
        let again = pool
            .secret_binding_for_tenant(&aws(), "ga-1", false)
            .await
            .unwrap();
        assert_eq!(again, "sb-free");
    }

    #[tokio::test]
    async fn test_dedicated_fails_when_pool_is_exhausted() {
        let gardener = Arc::new(FakeGardener::new());
        gardener.add_binding(
            "sb-other",
            &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_TENANT, "ga-2")],
        );
        let pool = AccountPool::new(gardener);

        let err = pool
            .secret_binding_for_tenant(&aws(), "ga-1", false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no unassigned secret binding"));
    }

    #[tokio::test]
    async fn test_eu_access_is_a_hard_filter() {
        let gardener = Arc::new(FakeGardener::new());
        gardener.add_binding("sb-plain", &[(LABEL_HYPERSCALER_TYPE, "aws")]);
        gardener.add_binding(
            "sb-eu",
            &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_EU_ACCESS, "true")],
        );
        let pool = AccountPool::new(gardener);

        let eu = pool
            .secret_binding_for_tenant(&aws(), "ga-1", true)
            .await
            .unwrap();
        assert_eq!(eu, "sb-eu");
        let plain = pool
            .secret_binding_for_tenant(&aws(), "ga-2", false)
            .await
            .unwrap();
        assert_eq!(plain, "sb-plain");
    }

    #[tokio::test]
    async fn test_shared_picks_least_used_with_lexicographic_tie_break() {
        let gardener = Arc::new(FakeGardener::new());
        for name in ["sb-b", "sb-a", "sb-c"] {
            gardener.add_binding(
                name,
                &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_SHARED, "true")],
            );
        }
        gardener.add_shoot("shoot-1", "sb-c");
        gardener.add_shoot("shoot-2", "sb-c");
        gardener.add_shoot("shoot-3", "sb-a");
        gardener.add_shoot("shoot-4", "sb-b");
        let pool = SharedPool::new(gardener.clone());

        // sb-a and sb-b both carry one shoot; the name breaks the tie.
        let name = pool.shared_secret_binding(&aws(), false).await.unwrap();
        assert_eq!(name, "sb-a");

        gardener.add_shoot("shoot-5", "sb-a");
        let name = pool.shared_secret_binding(&aws(), false).await.unwrap();
        assert_eq!(name, "sb-b");
    }

    #[tokio::test]
    async fn test_mark_unused_dirty_ladder() {
        let gardener = Arc::new(FakeGardener::new());
        gardener.add_binding(
            "sb-used",
            &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_TENANT, "ga-used")],
        );
        gardener.add_shoot("shoot-1", "sb-used");
        gardener.add_binding(
            "sb-internal",
            &[
                (LABEL_HYPERSCALER_TYPE, "aws"),
                (LABEL_TENANT, "ga-int"),
                (LABEL_INTERNAL, "true"),
            ],
        );
        gardener.add_binding(
            "sb-idle",
            &[(LABEL_HYPERSCALER_TYPE, "aws"), (LABEL_TENANT, "ga-idle")],
        );
        let pool = AccountPool::new(gardener.clone());

        pool.mark_unused_as_dirty(&aws(), "ga-used").await.unwrap();
        assert!(!gardener.binding("sb-used").unwrap().flag(LABEL_DIRTY));

        pool.mark_unused_as_dirty(&aws(), "ga-int").await.unwrap();
        assert!(!gardener.binding("sb-internal").unwrap().flag(LABEL_DIRTY));

        pool.mark_unused_as_dirty(&aws(), "ga-idle").await.unwrap();
        assert!(gardener.binding("sb-idle").unwrap().flag(LABEL_DIRTY));

        // Second call on an already-dirty binding is a no-op.
        pool.mark_unused_as_dirty(&aws(), "ga-idle").await.unwrap();
    }
}
