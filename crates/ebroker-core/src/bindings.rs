// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service-binding engine.
//!
//! A binding is a short-lived kubeconfig: the broker creates the access
//! triplet on the tenant cluster, mints a bound token and hands back a
//! kubeconfig assembled around it. Bindings are never refreshed; an expired
//! binding is deleted and re-created by the platform.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::clients::controlplane::ControlPlaneClient;
use crate::clients::runtime_cluster::{ClusterAccess, RuntimeClusterClient};
use crate::config::BindingConfig;
use crate::error::{BrokerError, Result};
use crate::kubeconfig;
use crate::model::{Binding, OperationState, OperationType};
use crate::plans;
use crate::storage::SharedStorage;

/// Namespace the binding service accounts are created in.
const BINDING_NAMESPACE: &str = "kyma-system";

/// A binding create request after HTTP decoding.
#[derive(Debug, Clone, Default)]
pub struct BindingRequest {
    /// OSB binding id from the URL.
    pub binding_id: String,
    /// Token lifetime requested by the caller, if any.
    pub expiration_seconds: Option<u64>,
    /// Email of the requesting user, from the platform context.
    pub email: Option<String>,
    /// Origin of the request, from the platform context.
    pub origin: Option<String>,
}

/// Outcome of a create call.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedBinding {
    /// The stored binding.
    pub binding: Binding,
    /// Whether this call created it (false for an idempotent re-PUT).
    pub created: bool,
}

/// Creates, fetches and deletes bindings.
pub struct BindingEngine {
    storage: SharedStorage,
    controlplane: Arc<dyn ControlPlaneClient>,
    cluster: Arc<dyn RuntimeClusterClient>,
    config: BindingConfig,
}

impl BindingEngine {
    /// Create the engine.
    pub fn new(
        storage: SharedStorage,
        controlplane: Arc<dyn ControlPlaneClient>,
        cluster: Arc<dyn RuntimeClusterClient>,
        config: BindingConfig,
    ) -> Self {
        Self {
            storage,
            controlplane,
            cluster,
            config,
        }
    }

    /// Create a binding, or return the stored one for an identical re-PUT.
    pub async fn create(&self, instance_id: &str, request: BindingRequest) -> Result<CreatedBinding> {
        let instance = self.storage.instances().get(instance_id).await?;
        let plan = plans::plan_by_id(&instance.service_plan_id)?;
        if !plan.bindable {
            return Err(BrokerError::Validation {
                field: "plan_id".to_string(),
                message: format!("plan {} does not support bindings", plan.name),
            });
        }
        self.ensure_provisioned(instance_id, plan.own_cluster).await?;
        let expiration = self.expiration(&request)?;
        let parameters_hash = request_hash(&request, expiration);

        // Idempotent re-PUT: same id and same parameters returns the stored
        // binding, a different payload is a conflict.
        match self
            .storage
            .bindings()
            .get(instance_id, &request.binding_id)
            .await
        {
            Ok(existing) => {
                return if existing.parameters_hash == parameters_hash
                    && existing.is_live(Utc::now())
                {
                    Ok(CreatedBinding {
                        binding: existing,
                        created: false,
                    })
                } else {
                    Err(BrokerError::Conflict {
                        resource: "binding",
                        details: format!(
                            "binding {} exists with different parameters",
                            request.binding_id
                        ),
                    })
                };
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let runtime_id = instance.runtime_id.clone().ok_or_else(|| {
            BrokerError::Validation {
                field: "instance_id".to_string(),
                message: "instance has no runtime yet".to_string(),
            }
        })?;
        let admin_kubeconfig = self.controlplane.admin_kubeconfig(&runtime_id).await?;
        let access = ClusterAccess {
            namespace: BINDING_NAMESPACE.to_string(),
            name: format!("kyma-binding-{}", request.binding_id),
        };
        self.cluster.ensure_access(&admin_kubeconfig, &access).await?;
        let token = self
            .cluster
            .request_token(&admin_kubeconfig, &access, expiration)
            .await?;
        let cluster_info = kubeconfig::cluster_info(&admin_kubeconfig)?;
        let rendered = kubeconfig::render(&cluster_info, &token);

        let now = Utc::now();
        let binding = Binding {
            binding_id: request.binding_id.clone(),
            instance_id: instance_id.to_string(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(expiration)
                    .map_err(|e| BrokerError::Internal(e.to_string()))?,
            kubeconfig: rendered,
            created_by: created_by(&request),
            parameters_hash,
        };
        self.storage
            .bindings()
            .insert_capped(binding.clone(), self.config.max_bindings_count)
            .await?;
        info!(
            instance_id,
            binding_id = %binding.binding_id,
            expires_at = %binding.expires_at,
            "Binding created"
        );
        Ok(CreatedBinding {
            binding,
            created: true,
        })
    }

    /// Fetch a live binding. Expired bindings read as not found.
    pub async fn get(&self, instance_id: &str, binding_id: &str) -> Result<Binding> {
        let binding = self.storage.bindings().get(instance_id, binding_id).await?;
        if !binding.is_live(Utc::now()) {
            return Err(BrokerError::NotFound {
                resource: "binding",
                id: binding_id.to_string(),
            });
        }
        Ok(binding)
    }

    /// Delete a binding and its access triplet. A missing row reads as not
    /// found so the HTTP boundary can answer 410.
    pub async fn delete(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        // Best effort on the cluster side: the runtime may already be gone.
        if let Ok(instance) = self.storage.instances().get(instance_id).await
            && let Some(runtime_id) = instance.runtime_id
            && let Ok(admin_kubeconfig) = self.controlplane.admin_kubeconfig(&runtime_id).await
        {
            let access = ClusterAccess {
                namespace: BINDING_NAMESPACE.to_string(),
                name: format!("kyma-binding-{}", binding_id),
            };
            self.cluster.delete_access(&admin_kubeconfig, &access).await?;
        }
        let existed = self.storage.bindings().delete(instance_id, binding_id).await?;
        if !existed {
            return Err(BrokerError::NotFound {
                resource: "binding",
                id: binding_id.to_string(),
            });
        }
        info!(instance_id, binding_id, "Binding deleted");
        Ok(())
    }

    // Binding an instance whose runtime never finished provisioning would
    // mint tokens against nothing. Own-cluster plans skip the check.
    async fn ensure_provisioned(&self, instance_id: &str, own_cluster: bool) -> Result<()> {
        if own_cluster {
            return Ok(());
        }
        let last = self
            .storage
            .operations()
            .get_last_by_types(
                instance_id,
                &[OperationType::Provision, OperationType::Unsuspend],
            )
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                resource: "operation",
                id: instance_id.to_string(),
            })?;
        if last.state != OperationState::Succeeded {
            return Err(BrokerError::Validation {
                field: "instance_id".to_string(),
                message: format!(
                    "instance provisioning is {}, bindings need a ready runtime",
                    last.state.as_str()
                ),
            });
        }
        Ok(())
    }

    fn expiration(&self, request: &BindingRequest) -> Result<Duration> {
        let seconds = request
            .expiration_seconds
            .unwrap_or(self.config.expiration_seconds);
        if seconds < self.config.min_expiration_seconds {
            return Err(BrokerError::Validation {
                field: "expiration_seconds".to_string(),
                message: format!(
                    "{} is below the minimum of {}",
                    seconds, self.config.min_expiration_seconds
                ),
            });
        }
        if seconds > self.config.max_expiration_seconds {
            return Err(BrokerError::Validation {
                field: "expiration_seconds".to_string(),
                message: format!(
                    "{} is above the maximum of {}",
                    seconds, self.config.max_expiration_seconds
                ),
            });
        }
        Ok(Duration::from_secs(seconds))
    }
}

fn created_by(request: &BindingRequest) -> String {
    let raw = format!(
        "{} {}",
        request.email.as_deref().unwrap_or_default(),
        request.origin.as_deref().unwrap_or_default()
    );
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn request_hash(request: &BindingRequest, expiration: Duration) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.binding_id.as_bytes());
    hasher.update(expiration.as_secs().to_be_bytes());
    format!("{:x}", hasher.finalize())
}
