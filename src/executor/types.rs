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

//! Work item types and the handler seam for the batch executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WorkError;
use crate::stats::StatsSnapshot;
use crate::store::RecordRef;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkStatus {
    /// Loaded from the store, not yet dispatched.
    Pending,
    /// A lease is held on the underlying record.
    Leased,
    /// Currently executing under a concurrency slot.
    Processing,
    /// Terminal: the handler succeeded.
    Succeeded,
    /// Terminal: the retry budget is exhausted.
    Failed,
    /// Terminal: excluded from the run (foreign lease, retry cap, or stop).
    Skipped,
}

/// One independent unit of work drawn from the shared record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier (e.g. a normalized account identifier).
    pub id: String,
    /// Where the processing result is persisted.
    pub location: RecordRef,
    /// Opaque payload carried to the handler.
    pub payload: serde_json::Value,
    /// Failed attempts accumulated across runs. Drives the mapper's escape
    /// threshold; incremented by the executor for every failed attempt.
    pub retry_count: u32,
    /// Current lifecycle state.
    pub status: WorkStatus,
}

impl WorkItem {
    /// Creates a pending item.
    pub fn new(id: impl Into<String>, location: RecordRef, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            location,
            payload,
            retry_count: 0,
            status: WorkStatus::Pending,
        }
    }

    /// Whether the item has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            WorkStatus::Succeeded | WorkStatus::Failed | WorkStatus::Skipped
        )
    }
}

/// The work function executed for each item.
///
/// Handlers are invoked concurrently up to the configured limit and must be
/// safe to retry: a failed attempt may run again against the same item.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Processes one item, returning the value to persist on success.
    async fn execute(&self, item: &WorkItem) -> Result<serde_json::Value, WorkError>;
}

/// A terminally failed item with its failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    /// The item, with status `Failed` and its retry count updated.
    pub item: WorkItem,
    /// Attempts consumed by this run.
    pub attempts: u32,
    /// Message of the last error, for external reporting.
    pub last_error: String,
}

/// Outcome of one batch run. Every submitted item appears in exactly one of
/// the three lists; failed items are always enumerable with their last
/// error, never silently dropped.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Items that completed successfully.
    pub succeeded: Vec<WorkItem>,
    /// Items that exhausted their retry budget.
    pub failed: Vec<FailedItem>,
    /// Items never started because the run was stopped.
    pub skipped: Vec<WorkItem>,
    /// Aggregate statistics for the run.
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_is_pending() {
        let item = WorkItem::new(
            "acct-1",
            RecordRef::new("acct-1", "result"),
            serde_json::json!({"country": "us"}),
        );
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(!item.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        let mut item = WorkItem::new("a", RecordRef::new("a", "r"), serde_json::Value::Null);
        for status in [WorkStatus::Succeeded, WorkStatus::Failed, WorkStatus::Skipped] {
            item.status = status;
            assert!(item.is_terminal());
        }
        for status in [WorkStatus::Pending, WorkStatus::Leased, WorkStatus::Processing] {
            item.status = status;
            assert!(!item.is_terminal());
        }
    }
}
