/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Bounded-concurrency batch execution with quota-aware result persistence.
//!
//! `BatchExecutor` runs N independent work items under a counting semaphore,
//! applies a uniform retry policy per item, and persists results back to the
//! record store in batches instead of one write per item. The semaphore slot
//! is held for an item's entire attempt cycle, inter-retry sleeps included.
//!
//! Per-item failures are always isolated: an item exhausting its retries —
//! or its handler panicking — never cancels sibling items. `run` resolves
//! only after every submitted item has reached a terminal state and the
//! final forced flush has completed or given up after its own bounded
//! retries.
//!
//! The executor owns its stats tracker and update buffer; there is no
//! process-wide registry. Progress is published on the shared [`EventBus`]
//! without ever blocking the work loop.

pub mod flush;
pub mod types;

pub use types::{FailedItem, RunReport, WorkHandler, WorkItem, WorkStatus};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::error::ExecutorError;
use crate::events::{CoreEvent, EventBus};
use crate::retry::RetryPolicy;
use crate::stats::{StatsSnapshot, StatsTracker};
use crate::store::{CellUpdate, RecordStore};

use flush::{flush_once, run_flusher, UpdateBuffer};

/// Bounded retries for the forced flush on the completion/cancellation path.
const FINAL_FLUSH_ATTEMPTS: u32 = 3;

/// Shared state handed to each spawned item task.
struct RunContext {
    buffer: Arc<UpdateBuffer>,
    events: EventBus,
    stats: Arc<Mutex<StatsTracker>>,
    policy: RetryPolicy,
}

impl RunContext {
    /// Folds the event into the stats, then publishes it.
    fn publish(&self, event: CoreEvent) {
        self.stats.lock().apply(&event);
        self.events.emit(event);
    }
}

enum ItemOutcome {
    Succeeded(WorkItem),
    Failed(FailedItem),
}

/// Executes batches of independent work items against the shared store.
#[derive(Clone)]
pub struct BatchExecutor {
    store: Arc<dyn RecordStore>,
    config: CoreConfig,
    events: EventBus,
    buffer: Arc<UpdateBuffer>,
    stats: Arc<Mutex<StatsTracker>>,
    stop: Arc<watch::Sender<bool>>,
}

impl BatchExecutor {
    /// Creates an executor. Configuration is validated here, before any
    /// work can begin.
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: CoreConfig,
        events: EventBus,
    ) -> Result<Self, ExecutorError> {
        config.validate()?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            buffer: Arc::new(UpdateBuffer::new(config.batch_size())),
            stats: Arc::new(Mutex::new(StatsTracker::default())),
            stop: Arc::new(stop),
            store,
            config,
            events,
        })
    }

    /// Requests a graceful stop of the current run: no new items start,
    /// in-flight items drain to completion, and the forced flush still runs.
    pub fn stop(&self) {
        info!("executor stop requested");
        let _ = self.stop.send(true);
    }

    /// Number of result updates queued but not yet persisted.
    pub fn pending_updates(&self) -> usize {
        self.buffer.len()
    }

    /// Snapshot of the current (or most recent) run's statistics.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.lock().snapshot()
    }

    /// Runs every item to a terminal state under the concurrency limit.
    ///
    /// Resolves only after all items are terminal and the final forced
    /// flush has completed or given up. The report lists every submitted
    /// item exactly once across `succeeded`, `failed`, and `skipped`.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        handler: Arc<dyn WorkHandler>,
    ) -> Result<RunReport, ExecutorError> {
        // A fresh run clears any stop left over from a previous one.
        let _ = self.stop.send(false);
        let stop_rx = self.stop.subscribe();

        *self.stats.lock() = StatsTracker::start(items.len());
        info!(items = items.len(), "starting batch run");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit()));
        let (flusher_stop, flusher_stop_rx) = watch::channel(false);
        let flusher = tokio::spawn(run_flusher(
            self.store.clone(),
            self.buffer.clone(),
            self.events.clone(),
            self.config.flush_interval(),
            self.config.quota_cooldown(),
            flusher_stop_rx,
        ));

        let context = Arc::new(RunContext {
            buffer: self.buffer.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            policy: RetryPolicy::linear(self.config.max_retries(), self.config.retry_delay()),
        });

        let mut dispatched = Vec::with_capacity(items.len());
        let mut skipped = Vec::new();
        for mut item in items {
            if *stop_rx.borrow() {
                debug!(item_id = %item.id, "run stopped, skipping item");
                item.status = WorkStatus::Skipped;
                skipped.push(item);
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ExecutorError::SemaphoreClosed)?;

            // The stop may have landed while we waited for a slot.
            if *stop_rx.borrow() {
                drop(permit);
                item.status = WorkStatus::Skipped;
                skipped.push(item);
                continue;
            }

            let fallback = item.clone();
            let handle = tokio::spawn(process_item(
                permit,
                context.clone(),
                handler.clone(),
                item,
            ));
            dispatched.push((fallback, handle));
        }

        let (fallbacks, handles): (Vec<_>, Vec<_>) = dispatched.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (fallback, result) in fallbacks.into_iter().zip(results) {
            match result {
                Ok(ItemOutcome::Succeeded(item)) => succeeded.push(item),
                Ok(ItemOutcome::Failed(failure)) => failed.push(failure),
                Err(join_err) => {
                    // A panicked handler fails its own item, never the run
                    error!(item_id = %fallback.id, error = %join_err, "work task panicked");
                    let mut item = fallback;
                    item.status = WorkStatus::Failed;
                    context.publish(CoreEvent::WorkFailed {
                        item_id: item.id.clone(),
                        attempts: 1,
                        error: "work task panicked".to_string(),
                    });
                    failed.push(FailedItem {
                        item,
                        attempts: 1,
                        last_error: join_err.to_string(),
                    });
                }
            }
        }

        // Stop the background flusher, then force the final flush even if
        // no size or interval trigger ever fired.
        let _ = flusher_stop.send(true);
        let _ = flusher.await;
        self.final_flush().await;

        let stats = {
            let mut stats = self.stats.lock();
            stats.finish();
            stats.snapshot()
        };
        info!(
            succeeded = succeeded.len(),
            failed = failed.len(),
            skipped = skipped.len(),
            "batch run finished"
        );

        Ok(RunReport {
            succeeded,
            failed,
            skipped,
            stats,
        })
    }

    /// Forced flush on the completion/cancellation path, with bounded
    /// internal retries. Gives up (loudly) rather than blocking forever.
    async fn final_flush(&self) {
        // Each pass drains at most one batch; only failures consume the
        // retry budget.
        let mut failures = 0;
        while !self.buffer.is_empty() {
            match flush_once(&self.store, &self.buffer, &self.events).await {
                Ok(_) => {}
                Err(err) => {
                    failures += 1;
                    if failures >= FINAL_FLUSH_ATTEMPTS {
                        error!(
                            remaining = self.buffer.len(),
                            error = %err,
                            "giving up on final result flush"
                        );
                        return;
                    }
                    let delay = if err.is_quota() {
                        self.config.quota_cooldown()
                    } else {
                        self.config.retry_delay()
                    };
                    warn!(
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "final flush failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Drives one item through its attempt cycle. The semaphore permit is held
/// for the whole cycle, inter-retry sleeps included.
async fn process_item(
    _permit: OwnedSemaphorePermit,
    context: Arc<RunContext>,
    handler: Arc<dyn WorkHandler>,
    mut item: WorkItem,
) -> ItemOutcome {
    item.status = WorkStatus::Processing;
    context.publish(CoreEvent::WorkStarted {
        item_id: item.id.clone(),
    });

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match handler.execute(&item).await {
            Ok(value) => {
                item.retry_count += attempt - 1;
                item.status = WorkStatus::Succeeded;
                context.buffer.push(CellUpdate::new(
                    item.location.clone(),
                    render_result(&value),
                ));
                debug!(item_id = %item.id, attempt, "work item completed");
                context.publish(CoreEvent::WorkCompleted {
                    item_id: item.id.clone(),
                    attempts: attempt,
                });
                return ItemOutcome::Succeeded(item);
            }
            Err(err) => match context.policy.delay_after(attempt) {
                Some(delay) => {
                    warn!(
                        item_id = %item.id,
                        attempt,
                        error = %err,
                        "work item failed, scheduling retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    item.retry_count += attempt;
                    item.status = WorkStatus::Failed;
                    context.buffer.push(CellUpdate::new(
                        item.location.clone(),
                        format!("failed: {}", err),
                    ));
                    error!(
                        item_id = %item.id,
                        attempts = attempt,
                        error = %err,
                        "work item failed permanently"
                    );
                    let last_error = err.to_string();
                    context.publish(CoreEvent::WorkFailed {
                        item_id: item.id.clone(),
                        attempts: attempt,
                        error: last_error.clone(),
                    });
                    return ItemOutcome::Failed(FailedItem {
                        item,
                        attempts: attempt,
                        last_error,
                    });
                }
            },
        }
    }
}

/// Renders a handler result into the persisted full-field value. Plain
/// strings are stored bare; anything else is stored as compact JSON.
fn render_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
