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

//! Record store boundary.
//!
//! The coordination core never talks to a concrete remote tabular store;
//! it depends only on the [`RecordStore`] trait. Implementations wrap the
//! actual remote API (a spreadsheet-style service, a REST-fronted table,
//! ...) and surface its request-rate quota as
//! [`StoreError::QuotaExceeded`](crate::error::StoreError).
//!
//! The store is the *only* shared mutable resource between worker processes:
//! lease ownership, resource usage counters, and work item results all live
//! in it. It offers plain read/write primitives; no transactions and no
//! compare-and-swap are assumed to exist.

pub mod memory;

pub use memory::MemoryRecordStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Address of a single field within a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    /// Identity of the record (e.g. a normalized account identifier).
    pub record: String,
    /// Field name within the record.
    pub field: String,
}

impl RecordRef {
    /// Creates a reference to one field of one record.
    pub fn new(record: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            record: record.into(),
            field: field.into(),
        }
    }
}

/// One row returned by a range read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    /// Row key (record identity).
    pub key: String,
    /// Field name to value.
    pub fields: HashMap<String, String>,
}

impl RecordRow {
    /// Creates a row with the given key and field pairs.
    pub fn new<K, V>(key: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns a field value, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Describes a range of rows to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeSelector {
    /// Logical table (sheet) name.
    pub sheet: String,
    /// Optional partition key restricting the range (e.g. a country code).
    pub partition: Option<String>,
}

impl RangeSelector {
    /// Selects all rows of a sheet.
    pub fn sheet(name: impl Into<String>) -> Self {
        Self {
            sheet: name.into(),
            partition: None,
        }
    }

    /// Selects the rows of a sheet scoped to one partition key.
    pub fn partition(sheet: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            partition: Some(partition.into()),
        }
    }
}

/// A pending full-field overwrite queued for batched persistence.
///
/// Updates are idempotent by construction (last-write-wins overwrites, not
/// deltas), so a failed flush can safely re-enqueue them for another
/// attempt: at-least-once delivery is sufficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    /// Where the value goes.
    pub location: RecordRef,
    /// The new full value for the field.
    pub value: String,
    /// When the update was queued.
    pub queued_at: DateTime<Utc>,
}

impl CellUpdate {
    /// Creates an update queued now.
    pub fn new(location: RecordRef, value: impl Into<String>) -> Self {
        Self {
            location,
            value: value.into(),
            queued_at: Utc::now(),
        }
    }
}

/// Read/write contract over the shared remote record store.
///
/// Implementations must be safe to call concurrently from many tasks; every
/// call is an independent remote request subject to the remote quota.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Reads a single field. `Ok(None)` means the record or field is absent.
    async fn get_field(&self, location: &RecordRef) -> Result<Option<String>, StoreError>;

    /// Overwrites a single field.
    async fn set_field(&self, location: &RecordRef, value: &str) -> Result<(), StoreError>;

    /// Reads a range of rows.
    async fn get_range(&self, selector: &RangeSelector) -> Result<Vec<RecordRow>, StoreError>;

    /// Applies a batch of updates in one remote call. Fails with
    /// [`StoreError::QuotaExceeded`] when the remote rate limit is hit; in
    /// that case none, some, or all of the updates may have landed, which
    /// the idempotent update contract tolerates.
    async fn batch_write(&self, updates: &[CellUpdate]) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ref_equality() {
        assert_eq!(
            RecordRef::new("acct-1", "lease"),
            RecordRef::new("acct-1".to_string(), "lease".to_string())
        );
        assert_ne!(
            RecordRef::new("acct-1", "lease"),
            RecordRef::new("acct-1", "status")
        );
    }

    #[test]
    fn test_row_field_lookup() {
        let row = RecordRow::new("r1", [("endpoint", "10.0.0.1:8080"), ("active", "true")]);
        assert_eq!(row.field("endpoint"), Some("10.0.0.1:8080"));
        assert_eq!(row.field("missing"), None);
    }

    #[test]
    fn test_range_selector_constructors() {
        let all = RangeSelector::sheet("resources");
        assert_eq!(all.partition, None);

        let scoped = RangeSelector::partition("resources", "de");
        assert_eq!(scoped.partition.as_deref(), Some("de"));
        assert_eq!(scoped.sheet, "resources");
    }
}
