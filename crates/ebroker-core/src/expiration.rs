// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expiration of trial and free instances.
//!
//! Expiring an instance is a suspension with a tombstone: the instance row
//! stays, `expired_at` is set once and never cleared, and the platform
//! context is flipped inactive. Repeated expire calls are idempotent and
//! return the suspend operation already in flight or finished.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{BrokerError, Result};
use crate::model::{Operation, OperationState, OperationType};
use crate::plans;
use crate::queue::WorkQueue;
use crate::storage::SharedStorage;

/// Result of an expire call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationOutcome {
    /// The suspend operation driving the expiration.
    pub operation_id: String,
    /// Whether this call created the operation.
    pub accepted: bool,
}

/// Expires instances of expirable plans by suspending them.
pub struct ExpirationService {
    storage: SharedStorage,
    queue: Arc<WorkQueue>,
}

impl ExpirationService {
    /// Create the service over the suspend queue.
    pub fn new(storage: SharedStorage, queue: Arc<WorkQueue>) -> Self {
        Self { storage, queue }
    }

    /// Expire an instance. Idempotent: a suspend already pending, running or
    /// succeeded is returned instead of creating a second one.
    pub async fn expire(&self, instance_id: &str) -> Result<ExpirationOutcome> {
        let instance = self.storage.instances().get(instance_id).await?;
        if !plans::is_expirable_plan(&instance.service_plan_id) {
            let plan_name = plans::plan_by_id(&instance.service_plan_id)
                .map(|p| p.name)
                .unwrap_or("unknown");
            return Err(BrokerError::Validation {
                field: "plan_id".to_string(),
                message: format!("plan {} cannot be expired", plan_name),
            });
        }

        if let Some(last) = self
            .storage
            .operations()
            .get_last_by_types(instance_id, &[OperationType::Suspend])
            .await?
            && last.state != OperationState::Failed
            && last.state != OperationState::Canceled
        {
            return Ok(ExpirationOutcome {
                operation_id: last.operation_id,
                accepted: false,
            });
        }

        let mut instance = instance;
        if instance.expired_at.is_none() {
            instance.expired_at = Some(Utc::now());
        }
        instance.parameters.ers_context.active = Some(false);
        let instance = self.storage.instances().update(instance).await?;

        let mut operation = Operation::new(
            instance_id,
            OperationType::Suspend,
            instance.parameters.clone(),
        );
        operation.runtime_id = instance.runtime_id.clone();
        self.storage.operations().insert(operation.clone()).await?;
        self.queue.add(&operation.operation_id);
        info!(
            instance_id,
            operation_id = %operation.operation_id,
            "Instance expired, suspension queued"
        );
        Ok(ExpirationOutcome {
            operation_id: operation.operation_id,
            accepted: true,
        })
    }
}
