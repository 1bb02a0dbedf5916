// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ebroker Core - Environment Broker Engine
//!
//! This crate provides the engine behind the OSB environment broker. It manages
//! durable operations executed as staged pipelines of idempotent steps, batch
//! orchestrations, cluster-access bindings, and hyperscaler credential pooling,
//! persisting all state to PostgreSQL for crash resilience.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    OSB HTTP boundary (ebroker-api)              │
//! └─────────────────────────────────────────────────────────────────┘
//!          │ insert Operation (pending) + enqueue
//!          ▼
//! ┌──────────────┐    pop id     ┌───────────────────┐
//! │  WorkQueue   │──────────────▶│   StagedManager   │
//! │ (per type)   │◀──────────────│  stages -> steps  │
//! └──────────────┘  retry after Δ└───────────────────┘
//!          ▲                               │
//!          │                               ▼
//! ┌────────────────────┐        ┌────────────────────┐
//! │ OrchestrationMgr   │        │  Storage (sqlx)    │──▶ EventBus
//! │ (batch upgrades)   │        │  + encrypted cols  │
//! └────────────────────┘        └────────────────────┘
//! ```
//!
//! # Operation state machine
//!
//! ```text
//!  pending ──▶ in_progress ──▶ succeeded
//!                  │ ▲
//!                  │ └── retrying
//!                  ├──▶ failed
//!                  └──▶ canceled
//! ```
//!
//! Terminal states (`succeeded`, `failed`, `canceled`) are final. Steps are
//! idempotent and record their own progress into the operation's `details`
//! blob, so an operation can be re-delivered any number of times.
//!
//! # Modules
//!
//! - [`config`]: engine configuration from environment variables
//! - [`model`]: persisted records (instances, operations, bindings, orchestrations)
//! - [`plans`]: service plan catalog, EU-access policy, trial region mapping
//! - [`storage`]: PostgreSQL and in-memory repositories behind one contract
//! - [`encryption`]: AES-256-GCM encryption for secret-bearing columns
//! - [`events`]: in-process publish/subscribe for operation lifecycle events
//! - [`queue`]: de-duplicating work queue with delayed re-enqueue and workers
//! - [`process`]: staged operation manager and the step libraries per type
//! - [`orchestration`]: batch upgrade manager, target resolution, notifications
//! - [`hyperscaler`]: credential pool (dedicated, shared, mark-dirty)
//! - [`bindings`]: cluster-access binding engine (service account + token)
//! - [`expiration`]: trial/free instance expiration service
//! - [`clients`]: narrow contracts to the provisioner, control plane, EDP

#![deny(missing_docs)]

/// Engine configuration from environment variables.
pub mod config;

/// Error types with OSB status mapping and retry classification.
pub mod error;

/// Persisted data model: instances, operations, bindings, orchestrations.
pub mod model;

/// Service plan catalog and landscape policy (EU access, trial regions).
pub mod plans;

/// AES-256-GCM encryption for secret material stored at rest.
pub mod encryption;

/// Storage contract with PostgreSQL and in-memory implementations.
pub mod storage;

/// In-process typed publish/subscribe.
pub mod events;

/// De-duplicating FIFO work queue with delayed re-enqueue.
pub mod queue;

/// Staged operation manager and step libraries.
pub mod process;

/// Batch upgrade orchestrations.
pub mod orchestration;

/// Hyperscaler credential pool.
pub mod hyperscaler;

/// Cluster-access binding engine.
pub mod bindings;

/// Kubeconfig assembly for bindings.
pub mod kubeconfig;

/// Expiration of trial and free instances.
pub mod expiration;

/// Narrow clients for external collaborators (provisioner, control plane, EDP).
pub mod clients;
