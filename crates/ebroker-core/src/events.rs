// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process event bus.
//!
//! Publishers never fail and never learn about subscribers. Each published
//! event fans out to every handler subscribed to its kind; handlers run in
//! spawned tasks so a slow subscriber cannot stall a worker. Handler errors
//! are logged and dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{OperationState, OperationType};

/// Events emitted by the engine.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A step of an operation ran (successfully or not).
    OperationStepProcessed {
        /// The operation the step belongs to.
        operation_id: String,
        /// Owning instance.
        instance_id: String,
        /// Operation type.
        op_type: OperationType,
        /// The step that ran.
        step_name: String,
        /// How long the step took.
        duration: Duration,
        /// Whether the step returned an error.
        error: bool,
        /// When the step finished.
        when: DateTime<Utc>,
    },
    /// An operation reached a terminal state.
    OperationFinished {
        /// The finished operation.
        operation_id: String,
        /// Owning instance.
        instance_id: String,
        /// Operation type.
        op_type: OperationType,
        /// The terminal state.
        state: OperationState,
    },
    /// A provisioning-family operation succeeded.
    OperationSucceeded {
        /// The succeeded operation.
        operation_id: String,
        /// Owning instance.
        instance_id: String,
        /// Operation type.
        op_type: OperationType,
    },
    /// A deprovisioning operation succeeded and the instance row is gone.
    DeprovisioningSucceeded {
        /// The succeeded operation.
        operation_id: String,
        /// The removed instance.
        instance_id: String,
    },
    /// An orchestration moved from pending to in_progress.
    OrchestrationStarted {
        /// The orchestration.
        orchestration_id: String,
        /// Number of operations scheduled.
        operations: usize,
    },
    /// An orchestration finished canceling.
    OrchestrationCanceled {
        /// The orchestration.
        orchestration_id: String,
    },
}

/// Subscription key, one per event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`BrokerEvent::OperationStepProcessed`]
    OperationStepProcessed,
    /// [`BrokerEvent::OperationFinished`]
    OperationFinished,
    /// [`BrokerEvent::OperationSucceeded`]
    OperationSucceeded,
    /// [`BrokerEvent::DeprovisioningSucceeded`]
    DeprovisioningSucceeded,
    /// [`BrokerEvent::OrchestrationStarted`]
    OrchestrationStarted,
    /// [`BrokerEvent::OrchestrationCanceled`]
    OrchestrationCanceled,
}

impl BrokerEvent {
    /// The subscription key of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OperationStepProcessed { .. } => EventKind::OperationStepProcessed,
            Self::OperationFinished { .. } => EventKind::OperationFinished,
            Self::OperationSucceeded { .. } => EventKind::OperationSucceeded,
            Self::DeprovisioningSucceeded { .. } => EventKind::DeprovisioningSucceeded,
            Self::OrchestrationStarted { .. } => EventKind::OrchestrationStarted,
            Self::OrchestrationCanceled { .. } => EventKind::OrchestrationCanceled,
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Handler = Arc<dyn Fn(BrokerEvent) -> HandlerFuture + Send + Sync>;

/// Fan-out publisher.
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
    // When set, publish awaits handlers inline instead of spawning. Tests
    // subscribe, publish, and assert without sleeping.
    synchronous: bool,
}

impl EventBus {
    /// Create a bus that runs handlers in spawned tasks.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            synchronous: false,
        }
    }

    /// Create a bus that awaits handlers inline before `publish` returns.
    pub fn synchronous() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            synchronous: true,
        }
    }

    /// Register a handler for one event kind.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(BrokerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Deliver an event to every subscriber of its kind.
    pub async fn publish(&self, event: BrokerEvent) {
        let handlers: Vec<Handler> = {
            let map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&event.kind()).cloned().unwrap_or_default()
        };
        debug!(kind = ?event.kind(), subscribers = handlers.len(), "Publishing event");
        for handler in handlers {
            let event = event.clone();
            if self.synchronous {
                if let Err(err) = handler(event.clone()).await {
                    warn!(kind = ?event.kind(), error = %err, "Event handler failed");
                }
            } else {
                tokio::spawn(async move {
                    if let Err(err) = handler(event.clone()).await {
                        warn!(kind = ?event.kind(), error = %err, "Event handler failed");
                    }
                });
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
