// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory storage backend for tests and local runs.
//!
//! Matches the Postgres backend's semantics exactly: optimistic `version`
//! checks, conflict on stale writes, the binding ceiling enforced atomically
//! with the insert.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{BrokerError, Result};
use crate::model::{
    Binding, Instance, InstanceArchive, InstanceEvent, Operation, OperationType, RuntimeState,
};
use crate::orchestration::Orchestration;

use super::{
    Bindings, Events, InstanceFilter, Instances, InstancesArchived, OperationFilter, Operations,
    Orchestrations, Page, RuntimeStates, SharedStorage, Storage, page_bounds,
};

/// Storage backed by process-local maps.
#[derive(Default)]
pub struct MemoryStorage {
    instances: DashMap<String, Instance>,
    operations: DashMap<String, Operation>,
    orchestrations: DashMap<String, Orchestration>,
    runtime_states: Mutex<Vec<RuntimeState>>,
    archived: DashMap<String, InstanceArchive>,
    events: Mutex<Vec<InstanceEvent>>,
    // Bindings are keyed (instance_id, binding_id); one lock covers the
    // live-count check and the insert.
    bindings: Mutex<HashMap<(String, String), Binding>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty storage behind the shared facade handle.
    pub fn shared() -> SharedStorage {
        Arc::new(Self::new())
    }
}

impl Storage for MemoryStorage {
    fn instances(&self) -> &dyn Instances {
        self
    }
    fn operations(&self) -> &dyn Operations {
        self
    }
    fn bindings(&self) -> &dyn Bindings {
        self
    }
    fn orchestrations(&self) -> &dyn Orchestrations {
        self
    }
    fn runtime_states(&self) -> &dyn RuntimeStates {
        self
    }
    fn instances_archived(&self) -> &dyn InstancesArchived {
        self
    }
    fn events(&self) -> &dyn Events {
        self
    }
}

#[async_trait]
impl Instances for MemoryStorage {
    async fn insert(&self, instance: Instance) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.instances.entry(instance.instance_id.clone()) {
            Entry::Occupied(_) => Err(BrokerError::AlreadyExists {
                resource: "instance",
                id: instance.instance_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(instance);
                Ok(())
            }
        }
    }

    async fn get(&self, instance_id: &str) -> Result<Instance> {
        self.instances
            .get(instance_id)
            .map(|r| r.clone())
            .ok_or_else(|| BrokerError::NotFound {
                resource: "instance",
                id: instance_id.to_string(),
            })
    }

    async fn update(&self, mut instance: Instance) -> Result<Instance> {
        let mut slot =
            self.instances
                .get_mut(&instance.instance_id)
                .ok_or_else(|| BrokerError::NotFound {
                    resource: "instance",
                    id: instance.instance_id.clone(),
                })?;
        if slot.version != instance.version {
            return Err(BrokerError::Conflict {
                resource: "instance",
                details: format!(
                    "{} version {} is stale (stored {})",
                    instance.instance_id, instance.version, slot.version
                ),
            });
        }
        instance.version += 1;
        instance.updated_at = Utc::now();
        *slot = instance.clone();
        Ok(instance)
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        self.instances.remove(instance_id);
        Ok(())
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Page<Instance>> {
        let mut items: Vec<Instance> = self
            .instances
            .iter()
            .map(|r| r.clone())
            .filter(|i| {
                (filter.global_account_ids.is_empty()
                    || filter.global_account_ids.contains(&i.global_account_id))
                    && (filter.subaccount_ids.is_empty()
                        || filter.subaccount_ids.contains(&i.subaccount_id))
                    && (filter.plan_ids.is_empty() || filter.plan_ids.contains(&i.service_plan_id))
                    && (!filter.with_runtime_only || i.runtime_id.is_some())
            })
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len();
        let (start, end) = page_bounds(filter.page, filter.page_size, total);
        Ok(Page {
            items: items[start..end].to_vec(),
            total_count: total,
        })
    }
}

#[async_trait]
impl Operations for MemoryStorage {
    async fn insert(&self, operation: Operation) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.operations.entry(operation.operation_id.clone()) {
            Entry::Occupied(_) => Err(BrokerError::AlreadyExists {
                resource: "operation",
                id: operation.operation_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(operation);
                Ok(())
            }
        }
    }

    async fn get(&self, operation_id: &str) -> Result<Operation> {
        self.operations
            .get(operation_id)
            .map(|r| r.clone())
            .ok_or_else(|| BrokerError::NotFound {
                resource: "operation",
                id: operation_id.to_string(),
            })
    }

    async fn update(&self, mut operation: Operation) -> Result<Operation> {
        let mut slot =
            self.operations
                .get_mut(&operation.operation_id)
                .ok_or_else(|| BrokerError::NotFound {
                    resource: "operation",
                    id: operation.operation_id.clone(),
                })?;
        if slot.version != operation.version {
            return Err(BrokerError::Conflict {
                resource: "operation",
                details: format!(
                    "{} version {} is stale (stored {})",
                    operation.operation_id, operation.version, slot.version
                ),
            });
        }
        operation.version += 1;
        operation.updated_at = Utc::now();
        *slot = operation.clone();
        Ok(operation)
    }

    async fn list_not_finished_by_type(&self, op_type: OperationType) -> Result<Vec<Operation>> {
        let mut items: Vec<Operation> = self
            .operations
            .iter()
            .map(|r| r.clone())
            .filter(|o| o.op_type == op_type && !o.state.is_finished())
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<Operation>> {
        let mut items: Vec<Operation> = self
            .operations
            .iter()
            .map(|r| r.clone())
            .filter(|o| o.instance_id == instance_id)
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn get_last_by_instance(&self, instance_id: &str) -> Result<Operation> {
        Operations::list_by_instance(self, instance_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::NotFound {
                resource: "operation",
                id: instance_id.to_string(),
            })
    }

    async fn get_last_by_types(
        &self,
        instance_id: &str,
        types: &[OperationType],
    ) -> Result<Option<Operation>> {
        Ok(Operations::list_by_instance(self, instance_id)
            .await?
            .into_iter()
            .find(|o| types.contains(&o.op_type)))
    }

    async fn list(&self, filter: &OperationFilter) -> Result<Page<Operation>> {
        let mut items: Vec<Operation> = self
            .operations
            .iter()
            .map(|r| r.clone())
            .filter(|o| {
                (filter.states.is_empty() || filter.states.contains(&o.state))
                    && (filter.types.is_empty() || filter.types.contains(&o.op_type))
                    && filter
                        .orchestration_id
                        .as_ref()
                        .is_none_or(|id| o.orchestration_id.as_ref() == Some(id))
                    && filter.created_after.is_none_or(|t| o.created_at >= t)
                    && filter.created_before.is_none_or(|t| o.created_at < t)
            })
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len();
        let (start, end) = page_bounds(filter.page, filter.page_size, total);
        Ok(Page {
            items: items[start..end].to_vec(),
            total_count: total,
        })
    }
}

#[async_trait]
impl Bindings for MemoryStorage {
    async fn insert_capped(&self, binding: Binding, max_bindings_count: usize) -> Result<()> {
        let mut map = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let key = (binding.instance_id.clone(), binding.binding_id.clone());
        if map.contains_key(&key) {
            return Err(BrokerError::AlreadyExists {
                resource: "binding",
                id: binding.binding_id,
            });
        }
        let now = Utc::now();
        let live = map
            .values()
            .filter(|b| b.instance_id == binding.instance_id && b.is_live(now))
            .count();
        if live >= max_bindings_count {
            return Err(BrokerError::Validation {
                field: "binding".into(),
                message: format!(
                    "maximum number of non expired bindings ({}) reached",
                    max_bindings_count
                ),
            });
        }
        map.insert(key, binding);
        Ok(())
    }

    async fn get(&self, instance_id: &str, binding_id: &str) -> Result<Binding> {
        let map = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&(instance_id.to_string(), binding_id.to_string()))
            .cloned()
            .ok_or_else(|| BrokerError::NotFound {
                resource: "binding",
                id: binding_id.to_string(),
            })
    }

    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<Binding>> {
        let map = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<Binding> = map
            .values()
            .filter(|b| b.instance_id == instance_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    async fn delete(&self, instance_id: &str, binding_id: &str) -> Result<bool> {
        let mut map = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .remove(&(instance_id.to_string(), binding_id.to_string()))
            .is_some())
    }
}

#[async_trait]
impl Orchestrations for MemoryStorage {
    async fn insert(&self, orchestration: Orchestration) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self
            .orchestrations
            .entry(orchestration.orchestration_id.clone())
        {
            Entry::Occupied(_) => Err(BrokerError::AlreadyExists {
                resource: "orchestration",
                id: orchestration.orchestration_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(orchestration);
                Ok(())
            }
        }
    }

    async fn get(&self, orchestration_id: &str) -> Result<Orchestration> {
        self.orchestrations
            .get(orchestration_id)
            .map(|r| r.clone())
            .ok_or_else(|| BrokerError::NotFound {
                resource: "orchestration",
                id: orchestration_id.to_string(),
            })
    }

    async fn update(&self, mut orchestration: Orchestration) -> Result<Orchestration> {
        let mut slot = self
            .orchestrations
            .get_mut(&orchestration.orchestration_id)
            .ok_or_else(|| BrokerError::NotFound {
                resource: "orchestration",
                id: orchestration.orchestration_id.clone(),
            })?;
        orchestration.updated_at = Utc::now();
        *slot = orchestration.clone();
        Ok(orchestration)
    }

    async fn list(&self) -> Result<Vec<Orchestration>> {
        let mut items: Vec<Orchestration> =
            self.orchestrations.iter().map(|r| r.clone()).collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }
}

#[async_trait]
impl RuntimeStates for MemoryStorage {
    async fn insert(&self, state: RuntimeState) -> Result<()> {
        let mut rows = self.runtime_states.lock().unwrap_or_else(|e| e.into_inner());
        rows.push(state);
        Ok(())
    }

    async fn list_by_runtime(&self, runtime_id: &str) -> Result<Vec<RuntimeState>> {
        let rows = self.runtime_states.lock().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<RuntimeState> = rows
            .iter()
            .filter(|s| s.runtime_id == runtime_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items)
    }

    async fn get_latest_by_runtime(&self, runtime_id: &str) -> Result<Option<RuntimeState>> {
        Ok(self.list_by_runtime(runtime_id).await?.into_iter().next())
    }

    async fn delete_older_than(
        &self,
        runtime_id: &str,
        boundary: DateTime<Utc>,
    ) -> Result<usize> {
        let mut rows = self.runtime_states.lock().unwrap_or_else(|e| e.into_inner());
        let before = rows.len();
        rows.retain(|s| !(s.runtime_id == runtime_id && s.created_at < boundary));
        Ok(before - rows.len())
    }
}

#[async_trait]
impl InstancesArchived for MemoryStorage {
    async fn insert(&self, archive: InstanceArchive) -> Result<()> {
        self.archived.insert(archive.instance_id.clone(), archive);
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<InstanceArchive> {
        self.archived
            .get(instance_id)
            .map(|r| r.clone())
            .ok_or_else(|| BrokerError::NotFound {
                resource: "archived instance",
                id: instance_id.to_string(),
            })
    }
}

#[async_trait]
impl Events for MemoryStorage {
    async fn insert(&self, event: InstanceEvent) -> Result<()> {
        let mut rows = self.events.lock().unwrap_or_else(|e| e.into_inner());
        rows.push(event);
        Ok(())
    }

    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<InstanceEvent>> {
        let rows = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut items: Vec<InstanceEvent> = rows
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.at.cmp(&b.at));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationState, ProvisioningParameters};
    use chrono::Duration;

    fn instance(id: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            runtime_id: None,
            global_account_id: "ga-1".into(),
            subaccount_id: "sa-1".into(),
            service_id: "svc".into(),
            service_plan_id: "plan".into(),
            platform_region: "cf-eu10".into(),
            provider_region: None,
            dashboard_url: None,
            parameters: ProvisioningParameters::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expired_at: None,
            version: 0,
        }
    }

    fn binding(instance_id: &str, binding_id: &str, expires_in: Duration) -> Binding {
        Binding {
            binding_id: binding_id.to_string(),
            instance_id: instance_id.to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now() + expires_in,
            kubeconfig: "kubeconfig".into(),
            created_by: "tester origin".into(),
            parameters_hash: "hash".into(),
        }
    }

    #[tokio::test]
    async fn test_instance_stale_write_conflicts() {
        let store = MemoryStorage::new();
        store.instances().insert(instance("i-1")).await.unwrap();

        let fresh = store.instances().get("i-1").await.unwrap();
        let stale = fresh.clone();
        store.instances().update(fresh).await.unwrap();

        let err = store.instances().update(stale).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_operation_update_bumps_version() {
        let store = MemoryStorage::new();
        let op = Operation::new(
            "i-1",
            OperationType::Provision,
            ProvisioningParameters::default(),
        );
        let id = op.operation_id.clone();
        store.operations().insert(op).await.unwrap();

        let mut fetched = store.operations().get(&id).await.unwrap();
        fetched.state = OperationState::InProgress;
        let updated = store.operations().update(fetched).await.unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(
            store.operations().get(&id).await.unwrap().state,
            OperationState::InProgress
        );
    }

    #[tokio::test]
    async fn test_binding_ceiling_counts_live_only() {
        let store = MemoryStorage::new();
        for n in 0..2 {
            store
                .bindings()
                .insert_capped(binding("i-1", &format!("b-{n}"), Duration::minutes(10)), 2)
                .await
                .unwrap();
        }
        let err = store
            .bindings()
            .insert_capped(binding("i-1", "b-over", Duration::minutes(10)), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation { .. }));

        // An expired binding frees its slot even though the row remains.
        store.bindings().delete("i-1", "b-0").await.unwrap();
        store
            .bindings()
            .insert_capped(binding("i-1", "b-expired", Duration::minutes(-5)), 2)
            .await
            .unwrap();
        store
            .bindings()
            .insert_capped(binding("i-1", "b-new", Duration::minutes(10)), 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_last_operation_by_types() {
        let store = MemoryStorage::new();
        let mut first = Operation::new(
            "i-1",
            OperationType::Provision,
            ProvisioningParameters::default(),
        );
        first.created_at = Utc::now() - Duration::minutes(5);
        let mut second = Operation::new(
            "i-1",
            OperationType::Deprovision,
            ProvisioningParameters::default(),
        );
        second.created_at = Utc::now();
        store.operations().insert(first).await.unwrap();
        store.operations().insert(second.clone()).await.unwrap();

        let last = store.operations().get_last_by_instance("i-1").await.unwrap();
        assert_eq!(last.operation_id, second.operation_id);

        let found = store
            .operations()
            .get_last_by_types("i-1", &[OperationType::Provision])
            .await
            .unwrap();
        assert_eq!(found.unwrap().op_type, OperationType::Provision);

        let none = store
            .operations()
            .get_last_by_types("i-1", &[OperationType::Update])
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_operation_filter_paging() {
        let store = MemoryStorage::new();
        for n in 0..5 {
            let mut op = Operation::new(
                "i-1",
                OperationType::Provision,
                ProvisioningParameters::default(),
            );
            op.created_at = Utc::now() - Duration::minutes(n);
            store.operations().insert(op).await.unwrap();
        }
        let page = store
            .operations()
            .list(&OperationFilter {
                types: vec![OperationType::Provision],
                page: 2,
                page_size: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total_count, 5);
        assert_eq!(page.items.len(), 2);
    }
}
