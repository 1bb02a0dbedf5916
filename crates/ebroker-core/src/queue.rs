// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work queue of operation ids.
//!
//! Contracts:
//! - `add` is idempotent against items already queued.
//! - An id handed to a worker is *processing*; `add` during processing marks
//!   it *dirty* and it is re-enqueued on `done`. At most one worker holds a
//!   given id at any time, so executors need no per-id mutex.
//! - `add_after` schedules a delayed re-enqueue through a min-heap timer.
//! - `shutdown` wakes blocked workers and refuses further adds.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Processes one operation id at a time.
///
/// Returning `Ok(d)` with `d > 0` asks the queue to re-deliver the id after
/// the delay; `Ok(0)` and `Err` both end the delivery (a failed operation is
/// re-delivered only by an explicit `add`).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Process the operation; return the requeue delay.
    async fn execute(&self, operation_id: &str) -> Result<Duration>;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    // Everything queued or processing; `add` of a member is a no-op or a
    // dirty mark, never a duplicate entry.
    members: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    delayed: BinaryHeap<Reverse<(Instant, String)>>,
    shut_down: bool,
}

/// FIFO of operation ids with coalescing re-adds and delayed delivery.
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    // Wakes workers blocked in `get`. The timer loop has its own channel so
    // it can never steal a worker's permit.
    notify: Notify,
    timer_notify: Notify,
    // Test hook: delays passed to add_after are divided by this factor.
    speed_up: u32,
}

impl WorkQueue {
    /// Create an empty queue. The name appears in logs only.
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_speed_up(name, 1)
    }

    /// Create a queue whose `add_after` delays are divided by `speed_up`.
    pub fn with_speed_up(name: &str, speed_up: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            timer_notify: Notify::new(),
            speed_up: speed_up.max(1),
        })
    }

    /// Enqueue an id. No-op if already queued; a dirty mark if processing.
    pub fn add(&self, operation_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shut_down {
            warn!(queue = %self.name, operation_id, "Add after shutdown ignored");
            return;
        }
        if state.processing.contains(operation_id) {
            state.dirty.insert(operation_id.to_string());
            return;
        }
        if state.members.insert(operation_id.to_string()) {
            state.queue.push_back(operation_id.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue an id after a delay.
    pub fn add_after(&self, operation_id: &str, delay: Duration) {
        let delay = delay / self.speed_up;
        if delay.is_zero() {
            self.add(operation_id);
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shut_down {
            return;
        }
        let at = Instant::now() + delay;
        state
            .delayed
            .push(Reverse((at, operation_id.to_string())));
        drop(state);
        // Wake the timer loop so it can re-arm for the possibly-earlier entry.
        self.timer_notify.notify_waiters();
    }

    /// Block until an id is available; the id is marked processing.
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(id) = state.queue.pop_front() {
                    state.processing.insert(id.clone());
                    return Some(id);
                }
                if state.shut_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a delivery finished; a dirty id is re-enqueued.
    pub fn done(&self, operation_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.processing.remove(operation_id);
        if state.dirty.remove(operation_id) && !state.shut_down {
            state.queue.push_back(operation_id.to_string());
            drop(state);
            self.notify.notify_one();
        } else {
            state.members.remove(operation_id);
        }
    }

    /// Refuse further adds and wake every blocked worker.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shut_down = true;
        drop(state);
        self.notify.notify_waiters();
        self.timer_notify.notify_waiters();
    }

    /// Number of ids waiting for a worker.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    /// Whether no id is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn promote_due(&self) -> Option<Instant> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shut_down {
            return None;
        }
        let now = Instant::now();
        let mut promoted = false;
        while let Some(Reverse((at, _))) = state.delayed.peek() {
            if *at > now {
                break;
            }
            let Reverse((_, id)) = state.delayed.pop().unwrap_or_else(|| unreachable!());
            if state.processing.contains(&id) {
                state.dirty.insert(id);
            } else if state.members.insert(id.clone()) {
                state.queue.push_back(id);
                promoted = true;
            }
        }
        let next = state.delayed.peek().map(|Reverse((at, _))| *at);
        drop(state);
        if promoted {
            self.notify.notify_waiters();
        }
        next
    }

    /// Spawn the worker pool and the delayed-delivery timer.
    /// Workers exit once the queue shuts down and drains.
    pub fn spawn_workers(
        self: &Arc<Self>,
        workers: usize,
        executor: Arc<dyn Executor>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(workers + 1);

        let timer_queue = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                // Register for wakeups before scanning the heap; an add_after
                // racing with the scan must not be missed.
                let notified = timer_queue.timer_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let next = timer_queue.promote_due();
                let shut_down = {
                    let state = timer_queue
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    state.shut_down
                };
                if shut_down {
                    break;
                }
                match next {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {}
                            _ = &mut notified => {}
                        }
                    }
                    None => notified.await,
                }
            }
        }));

        for n in 0..workers {
            let queue = self.clone();
            let executor = executor.clone();
            handles.push(tokio::spawn(async move {
                debug!(queue = %queue.name, worker = n, "Worker started");
                while let Some(operation_id) = queue.get().await {
                    match executor.execute(&operation_id).await {
                        Ok(delay) if !delay.is_zero() => {
                            queue.add_after(&operation_id, delay);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(
                                queue = %queue.name,
                                operation_id = %operation_id,
                                error = %err,
                                "Executor failed"
                            );
                        }
                    }
                    queue.done(&operation_id);
                }
                info!(queue = %queue.name, worker = n, "Worker stopped");
            }));
        }
        handles
    }
}
