// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime-cluster client: access objects and tokens on the tenant cluster.
//!
//! Used by the binding engine (service account, cluster role, role binding,
//! bound tokens) and by deprovisioning (BTP operator cleanup). All calls are
//! addressed by the runtime's admin kubeconfig.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// The access-object triplet created for one binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterAccess {
    /// Namespace the service account lives in.
    pub namespace: String,
    /// Shared name of the service account, cluster role and role binding.
    pub name: String,
}

/// Operations the broker performs directly on tenant clusters.
#[async_trait]
pub trait RuntimeClusterClient: Send + Sync {
    /// Create the service account / cluster role / cluster role binding
    /// triplet. Already-existing objects are left in place.
    async fn ensure_access(&self, kubeconfig: &str, access: &ClusterAccess) -> Result<()>;
    /// Delete the triplet; absent objects are not an error.
    async fn delete_access(&self, kubeconfig: &str, access: &ClusterAccess) -> Result<()>;
    /// Request a bound token for the service account.
    async fn request_token(
        &self,
        kubeconfig: &str,
        access: &ClusterAccess,
        expires_after: Duration,
    ) -> Result<String>;
    /// Remove the BTP operator's tenant resources; absent is not an error.
    async fn cleanup_btp_operator(&self, kubeconfig: &str) -> Result<()>;
}

#[derive(Default)]
struct FakeClusterState {
    access: HashSet<(String, ClusterAccess)>,
    tokens_minted: u64,
    cleanups: HashMap<String, usize>,
}

/// In-memory tenant cluster for tests, keyed by kubeconfig.
#[derive(Default)]
pub struct FakeRuntimeCluster {
    state: Mutex<FakeClusterState>,
}

impl FakeRuntimeCluster {
    /// Create an empty fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the triplet currently exists on the cluster.
    pub fn has_access(&self, kubeconfig: &str, access: &ClusterAccess) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .access
            .contains(&(kubeconfig.to_string(), access.clone()))
    }

    /// How many times BTP operator cleanup ran against a cluster.
    pub fn cleanup_count(&self, kubeconfig: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state.cleanups.get(kubeconfig).unwrap_or(&0)
    }
}

#[async_trait]
impl RuntimeClusterClient for FakeRuntimeCluster {
    async fn ensure_access(&self, kubeconfig: &str, access: &ClusterAccess) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.access.insert((kubeconfig.to_string(), access.clone()));
        Ok(())
    }

    async fn delete_access(&self, kubeconfig: &str, access: &ClusterAccess) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.access.remove(&(kubeconfig.to_string(), access.clone()));
        Ok(())
    }

    async fn request_token(
        &self,
        _kubeconfig: &str,
        access: &ClusterAccess,
        expires_after: Duration,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tokens_minted += 1;
        Ok(format!(
            "token-{}-{}-{}s",
            access.name,
            state.tokens_minted,
            expires_after.as_secs()
        ))
    }

    async fn cleanup_btp_operator(&self, kubeconfig: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state.cleanups.entry(kubeconfig.to_string()).or_insert(0) += 1;
        Ok(())
    }
}
