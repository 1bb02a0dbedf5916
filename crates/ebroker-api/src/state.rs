// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handler state.

use std::sync::Arc;

use ebroker_core::bindings::BindingEngine;
use ebroker_core::config::Config;
use ebroker_core::events::EventBus;
use ebroker_core::expiration::ExpirationService;
use ebroker_core::orchestration::OrchestrationManager;
use ebroker_core::plans::PlansPolicy;
use ebroker_core::storage::SharedStorage;

use crate::queues::Queues;

/// Everything a handler may need. Built once at startup.
pub struct AppState {
    /// The storage facade.
    pub storage: SharedStorage,
    /// Landscape policy applied before any operation is stored.
    pub policy: Arc<PlansPolicy>,
    /// Engine configuration.
    pub config: Config,
    /// Lifecycle queues and managers.
    pub queues: Arc<Queues>,
    /// Binding engine; `None` when the binding endpoints are disabled.
    pub bindings: Option<Arc<BindingEngine>>,
    /// Expiration service for expirable plans.
    pub expiration: Arc<ExpirationService>,
    /// Batch upgrade orchestrations.
    pub orchestrations: Arc<OrchestrationManager>,
    /// In-process event bus.
    pub events: Arc<EventBus>,
}

/// The state handle handlers clone.
pub type SharedState = Arc<AppState>;
