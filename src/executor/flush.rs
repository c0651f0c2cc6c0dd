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

//! Pending-update buffering and quota-aware flushing.
//!
//! Completed work items append full-field overwrite updates to an
//! [`UpdateBuffer`] instead of writing one remote call per item. A size
//! threshold and an interval timer independently trigger flushes; a flush
//! takes at most one batch off the front of the queue and sends it in one
//! `batch_write`. Failed batches are re-queued unchanged at the front of
//! the queue (at-least-once; updates are idempotent overwrites), and a
//! quota-exceeded failure puts the flusher to sleep for the configured
//! cooldown — the system's sole backpressure mechanism against the remote
//! rate limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::events::{CoreEvent, EventBus};
use crate::store::{CellUpdate, RecordStore};

/// Shared queue of pending result updates for one executor.
#[derive(Debug)]
pub(crate) struct UpdateBuffer {
    queue: Mutex<VecDeque<CellUpdate>>,
    size_trigger: Notify,
    batch_size: usize,
}

impl UpdateBuffer {
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            size_trigger: Notify::new(),
            batch_size,
        }
    }

    /// Appends one update, waking the flusher when the size threshold is hit.
    pub(crate) fn push(&self, update: CellUpdate) {
        let len = {
            let mut queue = self.queue.lock();
            queue.push_back(update);
            queue.len()
        };
        if len >= self.batch_size {
            self.size_trigger.notify_one();
        }
    }

    /// Takes at most one batch off the front of the queue, in insertion
    /// order. Capping at `batch_size` keeps every remote write bounded and
    /// makes flush counts predictable. Re-arms the size trigger when a full
    /// batch is still left behind.
    pub(crate) fn take_batch(&self) -> Vec<CellUpdate> {
        let mut queue = self.queue.lock();
        let take = queue.len().min(self.batch_size);
        let batch: Vec<CellUpdate> = queue.drain(..take).collect();
        if queue.len() >= self.batch_size {
            self.size_trigger.notify_one();
        }
        batch
    }

    /// Puts a failed batch back at the front of the queue, unchanged, ahead
    /// of anything enqueued since it was taken.
    pub(crate) fn requeue_front(&self, updates: Vec<CellUpdate>) {
        let mut queue = self.queue.lock();
        for update in updates.into_iter().rev() {
            queue.push_front(update);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Resolves when the size threshold trips.
    pub(crate) async fn size_triggered(&self) {
        self.size_trigger.notified().await;
    }
}

/// Attempts one flush: take a batch, send it, re-queue on failure.
///
/// Returns the number of updates persisted (0 when the queue was empty).
pub(crate) async fn flush_once(
    store: &Arc<dyn RecordStore>,
    buffer: &UpdateBuffer,
    events: &EventBus,
) -> Result<usize, StoreError> {
    let batch = buffer.take_batch();
    if batch.is_empty() {
        return Ok(0);
    }

    match store.batch_write(&batch).await {
        Ok(()) => {
            debug!(updates = batch.len(), "flush completed");
            events.emit(CoreEvent::FlushCompleted {
                updates: batch.len(),
            });
            Ok(batch.len())
        }
        Err(err) => {
            warn!(
                updates = batch.len(),
                error = %err,
                "flush failed, re-queueing batch"
            );
            buffer.requeue_front(batch);
            Err(err)
        }
    }
}

/// Background flush loop: fires on the interval timer, the size trigger, or
/// shutdown. Quota failures sleep the cooldown before the next attempt;
/// other failures wait for the next trigger (the re-queued batch goes out
/// with it).
pub(crate) async fn run_flusher(
    store: Arc<dyn RecordStore>,
    buffer: Arc<UpdateBuffer>,
    events: EventBus,
    flush_interval: Duration,
    quota_cooldown: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(flush_interval) => {}
            _ = buffer.size_triggered() => {}
            _ = shutdown.changed() => {
                debug!("flusher shutting down");
                return;
            }
        }

        if let Err(err) = flush_once(&store, &buffer, &events).await {
            if err.is_quota() {
                warn!(
                    cooldown_secs = quota_cooldown.as_secs(),
                    "quota exceeded, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(quota_cooldown) => {}
                    _ = shutdown.changed() => {
                        debug!("flusher shutting down during cooldown");
                        return;
                    }
                }
            }
        }
    }
}
