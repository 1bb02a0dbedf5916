// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The staged manager drives one operation through its stage pipeline.
//!
//! One manager instance exists per operation family (provisioning covers
//! `provision` and `unsuspend`, deprovisioning covers `deprovision` and
//! `suspend`). The manager is the only writer of its operations; the work
//! queue's coalescing guarantees at most one worker holds a given operation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Dependency, LastError, Result};
use crate::events::{BrokerEvent, EventBus};
use crate::model::{Operation, OperationState, OperationType};
use crate::queue::Executor;
use crate::storage::SharedStorage;

use super::{STEP_STARTED_AT_KEY, Step};

/// Requeue delay applied when the store itself fails transiently; the
/// operation state is left untouched.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct StepAnchor {
    step: String,
    at: DateTime<Utc>,
}

struct Stage {
    name: &'static str,
    steps: Vec<Arc<dyn Step>>,
}

/// Builder declaring the stage pipeline of a manager.
pub struct StagedManagerBuilder {
    name: &'static str,
    types: Vec<OperationType>,
    storage: SharedStorage,
    events: Arc<EventBus>,
    operation_timeout: Duration,
    max_step_processing_time: Duration,
    stages: Vec<Stage>,
    speed_up: u32,
}

impl StagedManagerBuilder {
    /// Start a builder for the given operation types.
    pub fn new(
        name: &'static str,
        types: &[OperationType],
        storage: SharedStorage,
        events: Arc<EventBus>,
        operation_timeout: Duration,
        max_step_processing_time: Duration,
    ) -> Self {
        Self {
            name,
            types: types.to_vec(),
            storage,
            events,
            operation_timeout,
            max_step_processing_time,
            stages: Vec::new(),
            speed_up: 1,
        }
    }

    /// Declare the ordered stage names. Must precede `add_step`.
    pub fn define_stages(mut self, names: &[&'static str]) -> Self {
        self.stages = names
            .iter()
            .map(|name| Stage {
                name,
                steps: Vec::new(),
            })
            .collect();
        self
    }

    /// Append a step to a declared stage.
    ///
    /// # Panics
    /// Panics at wiring time if the stage was not declared.
    pub fn add_step(mut self, stage: &str, step: Arc<dyn Step>) -> Self {
        let slot = self
            .stages
            .iter_mut()
            .find(|s| s.name == stage)
            .unwrap_or_else(|| panic!("stage '{stage}' was not declared"));
        slot.steps.push(step);
        self
    }

    /// Divide in-invocation backoff sleeps, for tests.
    pub fn speed_up(mut self, factor: u32) -> Self {
        self.speed_up = factor.max(1);
        self
    }

    /// Finish the builder.
    pub fn build(self) -> Arc<StagedManager> {
        Arc::new(StagedManager {
            name: self.name,
            types: self.types,
            storage: self.storage,
            events: self.events,
            operation_timeout: self.operation_timeout,
            max_step_processing_time: self.max_step_processing_time,
            stages: self.stages,
            speed_up: self.speed_up,
        })
    }
}

/// Executes operations of one family through their declared stages.
pub struct StagedManager {
    name: &'static str,
    types: Vec<OperationType>,
    storage: SharedStorage,
    events: Arc<EventBus>,
    operation_timeout: Duration,
    max_step_processing_time: Duration,
    stages: Vec<Stage>,
    speed_up: u32,
}

enum StepOutcome {
    Done(Operation),
    Requeue(Operation, Duration),
    Failed,
}

impl StagedManager {
    async fn persist(&self, operation: Operation) -> Result<Operation> {
        self.storage.operations().update(operation).await
    }

    async fn publish_step_processed(&self, operation: &Operation, step: &str, took: Duration, error: bool) {
        self.events
            .publish(BrokerEvent::OperationStepProcessed {
                operation_id: operation.operation_id.clone(),
                instance_id: operation.instance_id.clone(),
                op_type: operation.op_type,
                step_name: step.to_string(),
                duration: took,
                error,
                when: Utc::now(),
            })
            .await;
    }

    async fn finish_operation(
        &self,
        mut operation: Operation,
        state: OperationState,
        description: String,
    ) -> Result<()> {
        operation.state = state;
        operation.description = description;
        let operation = self.persist(operation).await?;
        info!(
            manager = self.name,
            operation_id = %operation.operation_id,
            instance_id = %operation.instance_id,
            state = state.as_str(),
            "Operation finished"
        );
        self.events
            .publish(BrokerEvent::OperationFinished {
                operation_id: operation.operation_id.clone(),
                instance_id: operation.instance_id.clone(),
                op_type: operation.op_type,
                state,
            })
            .await;
        if state == OperationState::Succeeded {
            self.events
                .publish(BrokerEvent::OperationSucceeded {
                    operation_id: operation.operation_id.clone(),
                    instance_id: operation.instance_id.clone(),
                    op_type: operation.op_type,
                })
                .await;
            if operation.op_type == OperationType::Deprovision {
                self.events
                    .publish(BrokerEvent::DeprovisioningSucceeded {
                        operation_id: operation.operation_id.clone(),
                        instance_id: operation.instance_id.clone(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn fail_operation(&self, operation: Operation, description: String) -> Result<()> {
        self.finish_operation(operation, OperationState::Failed, description)
            .await
    }

    // Per-step processing timeout. The anchor is set when the operation first
    // enters the step and survives requeues; it is cleared when the step
    // completes.
    fn step_anchor_exceeded(&self, operation: &Operation, step: &str, now: DateTime<Utc>) -> bool {
        operation
            .detail::<StepAnchor>(STEP_STARTED_AT_KEY)
            .is_some_and(|anchor| {
                anchor.step == step
                    && (now - anchor.at).to_std().unwrap_or_default() > self.max_step_processing_time
            })
    }

    async fn ensure_step_anchor(
        &self,
        mut operation: Operation,
        step: &str,
        now: DateTime<Utc>,
    ) -> Result<Operation> {
        let current = operation.detail::<StepAnchor>(STEP_STARTED_AT_KEY);
        if current.as_ref().is_none_or(|a| a.step != step) {
            operation.set_detail(
                STEP_STARTED_AT_KEY,
                StepAnchor {
                    step: step.to_string(),
                    at: now,
                },
            )?;
            operation = self.persist(operation).await?;
        }
        Ok(operation)
    }

    async fn run_step(&self, step: &dyn Step, operation: Operation) -> StepOutcome {
        let mut attempt = 0u32;
        let mut current = operation;
        loop {
            let started = std::time::Instant::now();
            let snapshot = current.clone();
            match step.run(current).await {
                Ok((op, delay)) => {
                    self.publish_step_processed(&op, step.name(), started.elapsed(), false)
                        .await;
                    return if delay.is_zero() {
                        StepOutcome::Done(op)
                    } else {
                        StepOutcome::Requeue(op, delay)
                    };
                }
                Err(err) => {
                    self.publish_step_processed(&snapshot, step.name(), started.elapsed(), true)
                        .await;
                    let retryable = err.is_retryable() && attempt < step.max_retries();
                    warn!(
                        manager = self.name,
                        operation_id = %snapshot.operation_id,
                        step = step.name(),
                        attempt,
                        error = %err,
                        retrying = retryable,
                        "Step failed"
                    );
                    if !retryable {
                        let mut failed = snapshot;
                        failed.last_error = Some(LastError::from_error(
                            &err,
                            step.name(),
                            Dependency::Broker,
                        ));
                        let description = format!("step {} failed: {}", step.name(), err);
                        if let Err(persist_err) = self.fail_operation(failed, description).await {
                            warn!(
                                manager = self.name,
                                error = %persist_err,
                                "Failed to persist operation failure"
                            );
                        }
                        return StepOutcome::Failed;
                    }
                    let backoff = step.retry_interval() * 2u32.pow(attempt) / self.speed_up;
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    current = snapshot;
                }
            }
        }
    }

    async fn process(&self, operation_id: &str) -> Result<Duration> {
        let mut operation = self.storage.operations().get(operation_id).await?;

        if operation.is_finished() {
            return Ok(Duration::ZERO);
        }
        if !self.types.contains(&operation.op_type) {
            warn!(
                manager = self.name,
                operation_id,
                op_type = operation.op_type.as_str(),
                "Operation type does not belong to this manager"
            );
            return Ok(Duration::ZERO);
        }

        if operation.state == OperationState::Pending {
            operation.state = OperationState::InProgress;
            operation.description = format!("{} in progress", operation.op_type.as_str());
            operation = self.persist(operation).await?;
            self.publish_step_processed(&operation, "accepted", Duration::ZERO, false)
                .await;
        } else if operation.state == OperationState::Retrying {
            operation.state = OperationState::InProgress;
            operation = self.persist(operation).await?;
        }

        loop {
            let Some(stage) = self
                .stages
                .iter()
                .find(|s| !operation.is_stage_finished(s.name))
            else {
                operation.clear_detail(STEP_STARTED_AT_KEY);
                let description = format!("{} succeeded", operation.op_type.as_str());
                self.finish_operation(operation, OperationState::Succeeded, description)
                    .await?;
                return Ok(Duration::ZERO);
            };

            for step in &stage.steps {
                // A cancel lands in storage while the worker holds the
                // operation; observe it between steps and abort cleanly.
                let stored = self.storage.operations().get(&operation.operation_id).await?;
                if stored.state == OperationState::Canceled {
                    info!(
                        manager = self.name,
                        operation_id = %stored.operation_id,
                        "Operation canceled, aborting"
                    );
                    return Ok(Duration::ZERO);
                }

                if !step.condition(&operation) {
                    continue;
                }

                let now = Utc::now();
                if self.step_anchor_exceeded(&operation, step.name(), now) {
                    self.fail_operation(operation, "step processing time exceeded".into())
                        .await?;
                    return Ok(Duration::ZERO);
                }
                if (now - operation.created_at).to_std().unwrap_or_default()
                    > self.operation_timeout
                {
                    let mut timed_out = operation;
                    timed_out.last_error = Some(LastError::timeout("operation timeout exceeded"));
                    self.fail_operation(timed_out, "operation has reached the time limit".into())
                        .await?;
                    return Ok(Duration::ZERO);
                }

                operation = self.ensure_step_anchor(operation, step.name(), now).await?;

                match self.run_step(step.as_ref(), operation).await {
                    StepOutcome::Done(mut op) => {
                        op.last_step = Some(step.name().to_string());
                        op.clear_detail(STEP_STARTED_AT_KEY);
                        operation = self.persist(op).await?;
                    }
                    StepOutcome::Requeue(mut op, delay) => {
                        op.last_step = Some(step.name().to_string());
                        self.persist(op).await?;
                        return Ok(delay);
                    }
                    StepOutcome::Failed => return Ok(Duration::ZERO),
                }
            }

            operation.finish_stage(stage.name);
            operation = self.persist(operation).await?;
            info!(
                manager = self.name,
                operation_id = %operation.operation_id,
                stage = stage.name,
                "Stage finished"
            );
        }
    }

    /// Re-enqueue every unfinished operation of this manager's types.
    /// Called once at startup to resume work interrupted by a restart.
    pub async fn resume(&self, enqueue: impl Fn(&str)) -> Result<usize> {
        let mut count = 0;
        for op_type in &self.types {
            for op in self
                .storage
                .operations()
                .list_not_finished_by_type(*op_type)
                .await?
            {
                enqueue(&op.operation_id);
                count += 1;
            }
        }
        if count > 0 {
            info!(manager = self.name, count, "Resumed unfinished operations");
        }
        Ok(count)
    }
}

#[async_trait]
impl Executor for StagedManager {
    async fn execute(&self, operation_id: &str) -> Result<Duration> {
        match self.process(operation_id).await {
            Ok(delay) => Ok(delay),
            // A flaky store must not fail the operation; requeue and let the
            // next delivery retry from the persisted state.
            Err(err) if err.is_retryable() => {
                warn!(
                    manager = self.name,
                    operation_id,
                    error = %err,
                    "Transient storage failure, requeueing"
                );
                Ok(STORE_RETRY_DELAY)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::model::ProvisioningParameters;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingStep {
        step_name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        detail_key: &'static str,
    }

    #[async_trait]
    impl Step for RecordingStep {
        fn name(&self) -> &'static str {
            self.step_name
        }

        async fn run(&self, mut operation: Operation) -> Result<(Operation, Duration)> {
            if operation.detail::<bool>(self.detail_key).is_none() {
                self.log.lock().unwrap().push(self.step_name.to_string());
                operation.set_detail(self.detail_key, true)?;
            }
            Ok((operation, Duration::ZERO))
        }
    }

    struct FlakyStep {
        attempts: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Step for FlakyStep {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn max_retries(&self) -> u32 {
            3
        }

        fn retry_interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.succeed_on {
                Err(BrokerError::Transient {
                    operation: "flaky".into(),
                    details: "not yet".into(),
                })
            } else {
                Ok((operation, Duration::ZERO))
            }
        }
    }

    struct FatalStep;

    #[async_trait]
    impl Step for FatalStep {
        fn name(&self) -> &'static str {
            "fatal"
        }

        async fn run(&self, _operation: Operation) -> Result<(Operation, Duration)> {
            Err(BrokerError::StepFatal {
                step: "fatal".into(),
                reason: "cannot proceed".into(),
            })
        }
    }

    struct PollingStep;

    #[async_trait]
    impl Step for PollingStep {
        fn name(&self) -> &'static str {
            "polling"
        }

        async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
            Ok((operation, Duration::from_secs(10)))
        }
    }

    fn manager_builder(storage: SharedStorage) -> StagedManagerBuilder {
        StagedManagerBuilder::new(
            "test",
            &[OperationType::Provision],
            storage,
            Arc::new(EventBus::synchronous()),
            Duration::from_secs(3600),
            Duration::from_secs(600),
        )
        .speed_up(1000)
    }

    async fn seeded_operation(storage: &SharedStorage) -> Operation {
        let op = Operation::new(
            "i-1",
            OperationType::Provision,
            ProvisioningParameters::default(),
        );
        storage.operations().insert(op.clone()).await.unwrap();
        op
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_finish() {
        let storage: SharedStorage = MemoryStorage::shared();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_builder(storage.clone())
            .define_stages(&["first", "second"])
            .add_step(
                "first",
                Arc::new(RecordingStep {
                    step_name: "a",
                    log: log.clone(),
                    detail_key: "a_done",
                }),
            )
            .add_step(
                "first",
                Arc::new(RecordingStep {
                    step_name: "b",
                    log: log.clone(),
                    detail_key: "b_done",
                }),
            )
            .add_step(
                "second",
                Arc::new(RecordingStep {
                    step_name: "c",
                    log: log.clone(),
                    detail_key: "c_done",
                }),
            )
            .build();

        let op = seeded_operation(&storage).await;
        let delay = manager.execute(&op.operation_id).await.unwrap();
        assert_eq!(delay, Duration::ZERO);

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        let stored = storage.operations().get(&op.operation_id).await.unwrap();
        assert_eq!(stored.state, OperationState::Succeeded);
        assert_eq!(stored.finished_stages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_finished_stage_is_not_revisited() {
        let storage: SharedStorage = MemoryStorage::shared();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_builder(storage.clone())
            .define_stages(&["first", "second"])
            .add_step(
                "first",
                Arc::new(RecordingStep {
                    step_name: "a",
                    log: log.clone(),
                    detail_key: "a_done",
                }),
            )
            .add_step(
                "second",
                Arc::new(RecordingStep {
                    step_name: "c",
                    log: log.clone(),
                    detail_key: "c_done",
                }),
            )
            .build();

        let mut op = seeded_operation(&storage).await;
        op = storage.operations().get(&op.operation_id).await.unwrap();
        op.finish_stage("first");
        storage.operations().update(op.clone()).await.unwrap();

        manager.execute(&op.operation_id).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried_in_place() {
        let storage: SharedStorage = MemoryStorage::shared();
        let flaky = Arc::new(FlakyStep {
            attempts: AtomicU32::new(0),
            succeed_on: 3,
        });
        let manager = manager_builder(storage.clone())
            .define_stages(&["only"])
            .add_step("only", flaky.clone())
            .build();

        let op = seeded_operation(&storage).await;
        manager.execute(&op.operation_id).await.unwrap();

        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
        let stored = storage.operations().get(&op.operation_id).await.unwrap();
        assert_eq!(stored.state, OperationState::Succeeded);
    }

    #[tokio::test]
    async fn test_fatal_error_fails_operation() {
        let storage: SharedStorage = MemoryStorage::shared();
        let manager = manager_builder(storage.clone())
            .define_stages(&["only"])
            .add_step("only", Arc::new(FatalStep))
            .build();

        let op = seeded_operation(&storage).await;
        manager.execute(&op.operation_id).await.unwrap();

        let stored = storage.operations().get(&op.operation_id).await.unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        assert!(stored.description.contains("fatal"));
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn test_polling_step_requeues_with_delay() {
        let storage: SharedStorage = MemoryStorage::shared();
        let manager = manager_builder(storage.clone())
            .define_stages(&["only"])
            .add_step("only", Arc::new(PollingStep))
            .build();

        let op = seeded_operation(&storage).await;
        let delay = manager.execute(&op.operation_id).await.unwrap();
        assert_eq!(delay, Duration::from_secs(10));

        let stored = storage.operations().get(&op.operation_id).await.unwrap();
        assert_eq!(stored.state, OperationState::InProgress);
        assert_eq!(stored.last_step.as_deref(), Some("polling"));
        assert!(stored.finished_stages.is_empty());
    }

    #[tokio::test]
    async fn test_operation_timeout_fails() {
        let storage: SharedStorage = MemoryStorage::shared();
        let manager = StagedManagerBuilder::new(
            "test",
            &[OperationType::Provision],
            storage.clone(),
            Arc::new(EventBus::synchronous()),
            Duration::from_secs(0),
            Duration::from_secs(600),
        )
        .define_stages(&["only"])
        .add_step("only", Arc::new(PollingStep))
        .build();

        let mut op = Operation::new(
            "i-1",
            OperationType::Provision,
            ProvisioningParameters::default(),
        );
        op.created_at = Utc::now() - chrono::Duration::hours(2);
        storage.operations().insert(op.clone()).await.unwrap();

        manager.execute(&op.operation_id).await.unwrap();
        let stored = storage.operations().get(&op.operation_id).await.unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        assert!(stored.description.contains("time limit"));
    }

    #[tokio::test]
    async fn test_step_processing_time_exceeded_fails() {
        let storage: SharedStorage = MemoryStorage::shared();
        let manager = StagedManagerBuilder::new(
            "test",
            &[OperationType::Provision],
            storage.clone(),
            Arc::new(EventBus::synchronous()),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
        .define_stages(&["only"])
        .add_step("only", Arc::new(PollingStep))
        .build();

        let op = seeded_operation(&storage).await;
        // First pass sets the anchor and requeues.
        manager.execute(&op.operation_id).await.unwrap();

        // Backdate the anchor past the per-step budget.
        let mut stored = storage.operations().get(&op.operation_id).await.unwrap();
        stored
            .set_detail(
                STEP_STARTED_AT_KEY,
                StepAnchor {
                    step: "polling".into(),
                    at: Utc::now() - chrono::Duration::minutes(5),
                },
            )
            .unwrap();
        storage.operations().update(stored).await.unwrap();

        manager.execute(&op.operation_id).await.unwrap();
        let stored = storage.operations().get(&op.operation_id).await.unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        assert_eq!(stored.description, "step processing time exceeded");
    }

    #[tokio::test]
    async fn test_canceled_operation_is_abandoned() {
        let storage: SharedStorage = MemoryStorage::shared();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_builder(storage.clone())
            .define_stages(&["only"])
            .add_step(
                "only",
                Arc::new(RecordingStep {
                    step_name: "a",
                    log: log.clone(),
                    detail_key: "a_done",
                }),
            )
            .build();

        let op = seeded_operation(&storage).await;
        let mut stored = storage.operations().get(&op.operation_id).await.unwrap();
        stored.state = OperationState::Canceled;
        storage.operations().update(stored).await.unwrap();

        manager.execute(&op.operation_id).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_condition_skips_step_without_done_mark() {
        struct ConditionalStep {
            log: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Step for ConditionalStep {
            fn name(&self) -> &'static str {
                "conditional"
            }

            fn condition(&self, operation: &Operation) -> bool {
                operation.parameters.plan_id == "matching"
            }

            async fn run(&self, operation: Operation) -> Result<(Operation, Duration)> {
                self.log.lock().unwrap().push("conditional".into());
                Ok((operation, Duration::ZERO))
            }
        }

        let storage: SharedStorage = MemoryStorage::shared();
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_builder(storage.clone())
            .define_stages(&["only"])
            .add_step("only", Arc::new(ConditionalStep { log: log.clone() }))
            .build();

        let op = seeded_operation(&storage).await;
        manager.execute(&op.operation_id).await.unwrap();

        assert!(log.lock().unwrap().is_empty());
        let stored = storage.operations().get(&op.operation_id).await.unwrap();
        assert_eq!(stored.state, OperationState::Succeeded);
    }
}
