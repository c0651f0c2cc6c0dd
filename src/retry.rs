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

//! Per-item retry policy for the batch executor.
//!
//! The retry policy is deliberately independent from the resource mapper's
//! escape policy: the executor decides *when to try again*, the mapper
//! decides *where to point the next try*. Keeping them separate keeps both
//! unit-testable on their own.

use std::time::Duration;

/// Delay scaling strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay after every failed attempt.
    Fixed,
    /// `base_delay * attempt_number`, so later attempts wait longer.
    Linear,
}

/// Uniform retry policy applied to every work item in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts. A handler that always fails is invoked
    /// exactly this many times before the item is recorded as failed.
    pub max_attempts: u32,
    /// Base delay fed into the backoff calculation.
    pub base_delay: Duration,
    /// Delay scaling strategy.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a linear-backoff policy, the default used by the executor.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    /// Delay to wait after the given failed attempt (1-based) before the
    /// next one. Returns `None` when the attempt budget is exhausted.
    pub fn delay_after(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts {
            return None;
        }
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(failed_attempt),
        };
        Some(delay)
    }
}
