// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OSB HTTP boundary and process wiring for the environment broker.
//!
//! The engine lives in `ebroker-core`; this crate mounts it behind the Open
//! Service Broker surface plus the operator endpoints (expiration, upgrade
//! orchestrations), wires the work queues and staged managers, and owns the
//! process entrypoint.

pub mod error;
pub mod osb;
pub mod queues;
pub mod runtime_api;
pub mod server;
pub mod state;
