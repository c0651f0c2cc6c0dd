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

//! Error types for the coordination core.
//!
//! Each area of the crate has its own error enum:
//! - [`StoreError`] - failures at the record store boundary, including the
//!   quota signal that drives backpressure
//! - [`LockError`] - lease lock I/O failures (contention is not an error)
//! - [`MapperError`] - resource assignment failures
//! - [`WorkError`] - per-item work failures reported by handlers
//! - [`ExecutorError`] - batch executor failures
//! - [`ConfigError`] - configuration validation failures, fatal at startup
//!
//! Per-item errors are always isolated: one item exhausting its retries never
//! cancels sibling items. Only flush-level and configuration-level errors can
//! delay a whole run, and the designed response to quota pressure is a timed
//! cooldown, never a crash.

use thiserror::Error;

/// Errors surfaced by [`RecordStore`](crate::store::RecordStore) implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The remote rate limit was hit. Not retried immediately; the executor
    /// sleeps its quota cooldown before the next flush attempt.
    #[error("remote request quota exceeded")]
    QuotaExceeded,

    /// Transient network or API failure. Retryable by the caller's
    /// existing retry loop.
    #[error("store I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether the error represents quota exhaustion rather than a
    /// transient fault.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded)
    }
}

/// Errors surfaced by [`LeaseLock`](crate::lease::LeaseLock).
///
/// Losing a race or finding a valid foreign lease is *not* an error; those
/// cases return `Ok(false)` from `acquire`. Only store I/O failures appear
/// here, and they are treated as "could not acquire" by callers (the lock
/// fails closed).
#[derive(Debug, Error)]
pub enum LockError {
    /// The underlying store read or write failed.
    #[error("lease store operation failed: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced by [`ResourceMapper`](crate::mapper::ResourceMapper).
#[derive(Debug, Error)]
pub enum MapperError {
    /// The active-only pool for a partition is empty. Fatal to the specific
    /// item requiring assignment; never aborts the batch.
    #[error("no available resources for partition '{partition}'")]
    NoAvailableResources { partition: String },

    /// The resource catalog could not be read or updated.
    #[error("resource catalog operation failed: {0}")]
    Store(#[from] StoreError),
}

/// A per-item work failure reported by a
/// [`WorkHandler`](crate::executor::WorkHandler).
///
/// After the retry budget is exhausted the last `WorkError` message is
/// recorded on the failed item for external reporting.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the failure is likely to pass on retry.
    pub transient: bool,
}

impl WorkError {
    /// Creates a transient (retryable) work error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a permanent work error. Still subject to the uniform retry
    /// policy; the flag exists for handlers and consumers that distinguish.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Errors surfaced by [`BatchExecutor`](crate::executor::BatchExecutor).
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Configuration failed validation before any work began.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The concurrency semaphore was closed while dispatching work.
    #[error("executor semaphore closed during dispatch")]
    SemaphoreClosed,
}

/// Configuration validation failures. Fatal at startup, before any work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A configured value is outside its valid range.
    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
