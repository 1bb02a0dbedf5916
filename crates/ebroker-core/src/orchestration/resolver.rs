// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Target resolution for orchestrations.
//!
//! Targets are resolved against the instance store at scheduling time, never
//! cached: a retry or a second orchestration sees the current population.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::model::Instance;
use crate::plans;
use crate::storage::{InstanceFilter, SharedStorage};

use super::{RuntimeTarget, TargetSpec};

/// An instance selected by an orchestration's target spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRuntime {
    /// Instance the upgrade operation will be attached to.
    pub instance_id: String,
    /// Runtime the upgrade targets.
    pub runtime_id: String,
    /// Owning global account, for window lookups and notifications.
    pub global_account_id: String,
    /// Owning subaccount.
    pub subaccount_id: String,
}

/// Resolves target specs into concrete runtimes.
pub struct RuntimeResolver {
    storage: SharedStorage,
}

impl RuntimeResolver {
    /// Create a resolver over the instance store.
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    /// Instances matched by `include` and not matched by `exclude`.
    /// Instances without an assigned runtime are never returned.
    pub async fn resolve(&self, targets: &TargetSpec) -> Result<Vec<ResolvedRuntime>> {
        let page = self
            .storage
            .instances()
            .list(&InstanceFilter {
                with_runtime_only: true,
                ..Default::default()
            })
            .await?;

        let mut resolved = Vec::new();
        for instance in page.items {
            let Some(runtime_id) = instance.runtime_id.clone() else {
                continue;
            };
            let included = targets.include.iter().any(|t| matches(t, &instance));
            let excluded = targets.exclude.iter().any(|t| matches(t, &instance));
            if included && !excluded {
                resolved.push(ResolvedRuntime {
                    instance_id: instance.instance_id.clone(),
                    runtime_id,
                    global_account_id: instance.global_account_id.clone(),
                    subaccount_id: instance.subaccount_id.clone(),
                });
            }
        }
        debug!(count = resolved.len(), "Resolved orchestration targets");
        Ok(resolved)
    }
}

// All set fields of a target must match; `target: all` short-circuits.
fn matches(target: &RuntimeTarget, instance: &Instance) -> bool {
    if target.target.as_deref() == Some("all") {
        return true;
    }
    let checks = [
        target
            .global_account_id
            .as_ref()
            .map(|v| *v == instance.global_account_id),
        target
            .subaccount_id
            .as_ref()
            .map(|v| *v == instance.subaccount_id),
        target
            .runtime_id
            .as_ref()
            .map(|v| instance.runtime_id.as_ref() == Some(v)),
        target
            .instance_id
            .as_ref()
            .map(|v| *v == instance.instance_id),
        target
            .plan_name
            .as_ref()
            .map(|v| {
                plans::plan_by_name(v).is_some_and(|p| p.id == instance.service_plan_id)
            }),
        target
            .region
            .as_ref()
            .map(|v| instance.provider_region.as_ref() == Some(v)),
        target
            .shoot
            .as_ref()
            .map(|v| instance.parameters.parameters.shoot_name.as_ref() == Some(v)),
    ];
    let mut any_set = false;
    for check in checks.into_iter().flatten() {
        any_set = true;
        if !check {
            return false;
        }
    }
    any_set
}
