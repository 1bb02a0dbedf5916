// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staged operation processing.
//!
//! An operation advances through declared stages, each stage an ordered list
//! of steps. Steps are idempotent: the same step may run many times for one
//! logical advance, so each records its own progress in the operation's
//! `details` blob and early-returns when that progress is already present.
//! A finished stage is never revisited.

pub mod staged_manager;
pub mod steps;

pub use self::staged_manager::{StagedManager, StagedManagerBuilder};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Operation;

/// Detail key holding the anchor used for the per-step processing timeout.
pub(crate) const STEP_STARTED_AT_KEY: &str = "step_started_at";

/// One unit of work inside a stage.
///
/// `run` returns the mutated operation plus a requeue delay: zero means done,
/// advance to the next step; a positive delay means not done yet, persist and
/// re-deliver the whole operation after the delay. An error fails this
/// attempt; retryable errors are retried in place up to [`Step::max_retries`]
/// with exponential backoff, anything else fails the operation.
#[async_trait]
pub trait Step: Send + Sync {
    /// Step name, recorded as `last_step` and in logs.
    fn name(&self) -> &'static str;

    /// Whether the step applies to this operation. A `false` skips the step
    /// without recording it as done.
    fn condition(&self, _operation: &Operation) -> bool {
        true
    }

    /// In-invocation retries granted on retryable errors.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Base delay of the exponential backoff between in-invocation retries.
    fn retry_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Advance the operation.
    async fn run(&self, operation: Operation) -> Result<(Operation, Duration)>;
}
