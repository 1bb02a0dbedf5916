// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The steps library.
//!
//! Steps are grouped by pipeline. Every step is idempotent and records its
//! own progress in the operation's `details` blob; see the trait contract in
//! [`crate::process::Step`].

pub mod deprovisioning;
pub mod provisioning;
pub mod update;
pub mod upgrade;

use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::model::Instance;
use crate::storage::SharedStorage;

/// Poll interval of the wait-style steps.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(10);

// Instance rows are also written by the HTTP boundary, so a step's write can
// lose the version race. Refetch-and-reapply a few times before giving up
// with a retryable error.
pub(crate) async fn update_instance<F>(
    storage: &SharedStorage,
    instance_id: &str,
    mut mutate: F,
) -> Result<Instance>
where
    F: FnMut(&mut Instance),
{
    const ATTEMPTS: u32 = 3;
    for _ in 0..ATTEMPTS {
        let mut instance = storage.instances().get(instance_id).await?;
        mutate(&mut instance);
        match storage.instances().update(instance).await {
            Ok(updated) => return Ok(updated),
            Err(BrokerError::Conflict { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(BrokerError::Transient {
        operation: "update instance".into(),
        details: format!("lost the version race {ATTEMPTS} times for {instance_id}"),
    })
}
