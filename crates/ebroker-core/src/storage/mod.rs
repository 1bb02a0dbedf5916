// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage contract for the broker.
//!
//! Two backends satisfy the same contract: [`postgres::PostgresStorage`] for
//! production and [`memory::MemoryStorage`] for tests. Writers of operations
//! and instances must go through the optimistic `version` column; a stale
//! write surfaces as [`BrokerError::Conflict`] and the caller refetches.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStorage;
pub use self::postgres::PostgresStorage;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Binding, Instance, InstanceArchive, InstanceEvent, Operation, OperationState, OperationType,
    RuntimeState,
};
use crate::orchestration::Orchestration;

/// One page of a filtered listing, with the unpaged total.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items of the requested page.
    pub items: Vec<T>,
    /// Total number of rows matching the filter.
    pub total_count: usize,
}

/// Filter for operation listings. Empty vectors mean "no constraint".
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    /// Restrict to these states.
    pub states: Vec<OperationState>,
    /// Restrict to these types.
    pub types: Vec<OperationType>,
    /// Restrict to one orchestration.
    pub orchestration_id: Option<String>,
    /// Created at or after.
    pub created_after: Option<DateTime<Utc>>,
    /// Created before.
    pub created_before: Option<DateTime<Utc>>,
    /// 1-based page number; 0 means first page.
    pub page: usize,
    /// Page size; 0 means no paging.
    pub page_size: usize,
}

/// Filter for instance listings.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Restrict to these global accounts.
    pub global_account_ids: Vec<String>,
    /// Restrict to these subaccounts.
    pub subaccount_ids: Vec<String>,
    /// Restrict to these plans.
    pub plan_ids: Vec<String>,
    /// Restrict to instances whose runtime is known.
    pub with_runtime_only: bool,
    /// 1-based page number; 0 means first page.
    pub page: usize,
    /// Page size; 0 means no paging.
    pub page_size: usize,
}

/// Instance repository.
#[async_trait]
pub trait Instances: Send + Sync {
    /// Insert a new instance; fails if the id exists.
    async fn insert(&self, instance: Instance) -> Result<()>;
    /// Fetch by id.
    async fn get(&self, instance_id: &str) -> Result<Instance>;
    /// Optimistic update; returns the persisted form with the bumped version.
    async fn update(&self, instance: Instance) -> Result<Instance>;
    /// Delete the row. Missing row is not an error (idempotent delete path).
    async fn delete(&self, instance_id: &str) -> Result<()>;
    /// Filtered listing, newest first.
    async fn list(&self, filter: &InstanceFilter) -> Result<Page<Instance>>;
}

/// Operation repository.
#[async_trait]
pub trait Operations: Send + Sync {
    /// Insert a new operation; fails if the id exists.
    async fn insert(&self, operation: Operation) -> Result<()>;
    /// Fetch by id.
    async fn get(&self, operation_id: &str) -> Result<Operation>;
    /// Optimistic update; stale version yields a conflict.
    async fn update(&self, operation: Operation) -> Result<Operation>;
    /// All operations with state in {pending, in_progress, retrying} of one type.
    /// Used at startup to resume interrupted work.
    async fn list_not_finished_by_type(&self, op_type: OperationType) -> Result<Vec<Operation>>;
    /// All operations of one instance, most recent first.
    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<Operation>>;
    /// Most recent operation of one instance.
    async fn get_last_by_instance(&self, instance_id: &str) -> Result<Operation>;
    /// Most recent operation of one instance among the given types.
    async fn get_last_by_types(
        &self,
        instance_id: &str,
        types: &[OperationType],
    ) -> Result<Option<Operation>>;
    /// Filtered listing, newest first.
    async fn list(&self, filter: &OperationFilter) -> Result<Page<Operation>>;
}

/// Binding repository.
#[async_trait]
pub trait Bindings: Send + Sync {
    /// Insert while enforcing the per-instance ceiling of live bindings.
    /// The count happens inside the same transaction as the insert.
    async fn insert_capped(&self, binding: Binding, max_bindings_count: usize) -> Result<()>;
    /// Fetch one binding.
    async fn get(&self, instance_id: &str, binding_id: &str) -> Result<Binding>;
    /// All bindings of an instance.
    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<Binding>>;
    /// Delete; returns whether the row existed.
    async fn delete(&self, instance_id: &str, binding_id: &str) -> Result<bool>;
}

/// Orchestration repository.
#[async_trait]
pub trait Orchestrations: Send + Sync {
    /// Insert a new orchestration.
    async fn insert(&self, orchestration: Orchestration) -> Result<()>;
    /// Fetch by id.
    async fn get(&self, orchestration_id: &str) -> Result<Orchestration>;
    /// Update in place (single-writer; the orchestration manager owns the row).
    async fn update(&self, orchestration: Orchestration) -> Result<Orchestration>;
    /// All orchestrations, newest first.
    async fn list(&self) -> Result<Vec<Orchestration>>;
}

/// Runtime-state audit repository (append-only).
#[async_trait]
pub trait RuntimeStates: Send + Sync {
    /// Append a state row.
    async fn insert(&self, state: RuntimeState) -> Result<()>;
    /// All states of a runtime, newest first.
    async fn list_by_runtime(&self, runtime_id: &str) -> Result<Vec<RuntimeState>>;
    /// Newest state of a runtime, if any.
    async fn get_latest_by_runtime(&self, runtime_id: &str) -> Result<Option<RuntimeState>>;
    /// Delete states of a runtime created before the boundary; returns the count.
    async fn delete_older_than(
        &self,
        runtime_id: &str,
        boundary: DateTime<Utc>,
    ) -> Result<usize>;
}

/// Archive of deprovisioned instances.
#[async_trait]
pub trait InstancesArchived: Send + Sync {
    /// Store a snapshot; overwrites a previous snapshot of the same instance.
    async fn insert(&self, archive: InstanceArchive) -> Result<()>;
    /// Fetch a snapshot.
    async fn get(&self, instance_id: &str) -> Result<InstanceArchive>;
}

/// Operator-visible event log per instance.
#[async_trait]
pub trait Events: Send + Sync {
    /// Append an event line.
    async fn insert(&self, event: InstanceEvent) -> Result<()>;
    /// All events of an instance, oldest first.
    async fn list_by_instance(&self, instance_id: &str) -> Result<Vec<InstanceEvent>>;
}

/// Facade bundling all repositories. The process holds exactly one.
pub trait Storage: Send + Sync {
    /// Instance repository.
    fn instances(&self) -> &dyn Instances;
    /// Operation repository.
    fn operations(&self) -> &dyn Operations;
    /// Binding repository.
    fn bindings(&self) -> &dyn Bindings;
    /// Orchestration repository.
    fn orchestrations(&self) -> &dyn Orchestrations;
    /// Runtime-state repository.
    fn runtime_states(&self) -> &dyn RuntimeStates;
    /// Instance archive repository.
    fn instances_archived(&self) -> &dyn InstancesArchived;
    /// Event log repository.
    fn events(&self) -> &dyn Events;
}

/// Shared storage handle.
pub type SharedStorage = Arc<dyn Storage>;

pub(crate) fn page_bounds(page: usize, page_size: usize, total: usize) -> (usize, usize) {
    if page_size == 0 {
        return (0, total);
    }
    let page = page.max(1);
    let start = (page - 1) * page_size;
    let end = (start + page_size).min(total);
    (start.min(total), end)
}
