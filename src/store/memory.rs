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

//! In-memory record store for tests and simulation.
//!
//! `MemoryRecordStore` implements the full [`RecordStore`] contract against
//! process-local state and adds fault injection: scripted `batch_write`
//! failures (including quota signals) and a configurable per-operation
//! latency that widens race windows for lock contention tests.
//!
//! Clones share state, so several components (or several simulated workers)
//! can be pointed at the same store instance.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CellUpdate, RangeSelector, RecordRef, RecordRow, RecordStore};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Inner {
    cells: HashMap<RecordRef, String>,
    ranges: HashMap<RangeSelector, Vec<RecordRow>>,
    /// Scripted failures consumed by successive `batch_write` calls.
    batch_failures: VecDeque<StoreError>,
    /// Every update applied by a successful `batch_write`, in order.
    flushed: Vec<CellUpdate>,
    batch_write_calls: usize,
    range_read_calls: usize,
    latency: Duration,
}

/// Shared in-memory implementation of [`RecordStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an artificial delay to every store operation. Used to widen
    /// the race window in lock contention tests.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Scripts the next `batch_write` calls to fail with the given errors,
    /// in order. Subsequent calls succeed again.
    pub fn fail_next_batch_writes(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.inner.lock().batch_failures.extend(errors);
    }

    /// Seeds a single field value.
    pub fn seed_field(&self, location: RecordRef, value: impl Into<String>) {
        self.inner.lock().cells.insert(location, value.into());
    }

    /// Seeds the rows returned for a range selector.
    pub fn seed_rows(&self, selector: RangeSelector, rows: Vec<RecordRow>) {
        self.inner.lock().ranges.insert(selector, rows);
    }

    /// Reads a field without going through the async contract.
    pub fn field(&self, location: &RecordRef) -> Option<String> {
        self.inner.lock().cells.get(location).cloned()
    }

    /// Number of `batch_write` calls observed, failed ones included.
    pub fn batch_write_calls(&self) -> usize {
        self.inner.lock().batch_write_calls
    }

    /// Number of `get_range` calls observed.
    pub fn range_read_calls(&self) -> usize {
        self.inner.lock().range_read_calls
    }

    /// Every update applied by a successful flush, in application order.
    pub fn flushed_updates(&self) -> Vec<CellUpdate> {
        self.inner.lock().flushed.clone()
    }

    async fn simulate_latency(&self) {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_field(&self, location: &RecordRef) -> Result<Option<String>, StoreError> {
        self.simulate_latency().await;
        Ok(self.inner.lock().cells.get(location).cloned())
    }

    async fn set_field(&self, location: &RecordRef, value: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.inner
            .lock()
            .cells
            .insert(location.clone(), value.to_string());
        Ok(())
    }

    async fn get_range(&self, selector: &RangeSelector) -> Result<Vec<RecordRow>, StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.range_read_calls += 1;
        Ok(inner.ranges.get(selector).cloned().unwrap_or_default())
    }

    async fn batch_write(&self, updates: &[CellUpdate]) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock();
        inner.batch_write_calls += 1;

        if let Some(err) = inner.batch_failures.pop_front() {
            return Err(err);
        }

        for update in updates {
            inner
                .cells
                .insert(update.location.clone(), update.value.clone());
            inner.flushed.push(update.clone());
        }
        Ok(())
    }
}
