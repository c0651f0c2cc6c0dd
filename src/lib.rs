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

//! # Corral
//!
//! Coordination core for fleets of worker processes that share a
//! quota-limited remote record store. The store is the only channel the
//! workers have in common: it is simultaneously the work queue, the lock
//! table, the resource catalog, and the results ledger.
//!
//! ## Components
//!
//! - **[`LeaseLock`]**: advisory mutual exclusion built from plain field
//!   reads and writes, with expiry-based recovery from crashed holders.
//!   Claims are confirmed by re-reading after a settle delay, and every
//!   I/O failure during acquisition is treated as "not acquired".
//! - **[`ResourceMapper`]**: deterministic identity-to-resource assignment
//!   by content hash, with a randomized escape hatch for identities whose
//!   home resource keeps failing, and automatic deactivation of resources
//!   that fail too many times in a row.
//! - **[`BatchExecutor`]**: bounded-concurrency work loop with per-item
//!   linear-backoff retries and batched, quota-aware result writes. Item
//!   failures are isolated; a run always resolves to a [`RunReport`].
//! - **[`StatsTracker`]**: pure aggregation of progress events into a
//!   serializable [`StatsSnapshot`].
//! - **[`RecordStore`]**: the async trait boundary to the actual store.
//!   [`MemoryRecordStore`] is the in-process implementation used for
//!   tests, with injectable latency and failures.
//!
//! Progress and coordination decisions are published as [`CoreEvent`]s on
//! a broadcast [`EventBus`]; emission never blocks, and subscribers that
//! fall behind lose old events rather than stalling the workers.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use corral::{
//!     BatchExecutor, CoreConfig, EventBus, MemoryRecordStore, RecordRef,
//!     WorkError, WorkHandler, WorkItem,
//! };
//!
//! struct Greeter;
//!
//! #[async_trait::async_trait]
//! impl WorkHandler for Greeter {
//!     async fn execute(&self, item: &WorkItem) -> Result<serde_json::Value, WorkError> {
//!         Ok(serde_json::Value::String(format!("hello, {}", item.id)))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryRecordStore::new());
//! let config = CoreConfig::builder().concurrency_limit(2).build().unwrap();
//! let executor = BatchExecutor::new(store, config, EventBus::new()).unwrap();
//!
//! let items = vec![WorkItem::new(
//!     "alice",
//!     RecordRef::new("alice", "result"),
//!     serde_json::Value::Null,
//! )];
//! let report = executor.run(items, Arc::new(Greeter)).await.unwrap();
//! assert_eq!(report.succeeded.len(), 1);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod lease;
pub mod mapper;
pub mod retry;
pub mod stats;
pub mod store;

pub use config::{CoreConfig, CoreConfigBuilder};
pub use error::{ConfigError, ExecutorError, LockError, MapperError, StoreError, WorkError};
pub use events::{CoreEvent, EventBus};
pub use executor::{BatchExecutor, FailedItem, RunReport, WorkHandler, WorkItem, WorkStatus};
pub use lease::{Lease, LeaseLock, LeaseLockConfig};
pub use mapper::{MapperConfig, Resource, ResourceMapper};
pub use retry::{Backoff, RetryPolicy};
pub use stats::{StatsSnapshot, StatsTracker};
pub use store::{
    CellUpdate, MemoryRecordStore, RangeSelector, RecordRef, RecordRow, RecordStore,
};
