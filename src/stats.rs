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

//! Pure aggregation of progress events into run statistics.
//!
//! `StatsTracker` is a side-effect-free fold over [`CoreEvent`]s: no I/O,
//! nothing clock-dependent beyond timestamps taken at start and finish. The
//! executor owns one tracker per run; external consumers get immutable
//! [`StatsSnapshot`] copies and can safely read them from any task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::CoreEvent;

/// Immutable view of run statistics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Items submitted to the run.
    pub total: usize,
    /// Items that reached a successful terminal state.
    pub completed: usize,
    /// Items that exhausted their retry budget.
    pub failed: usize,
    /// Items currently being processed.
    pub in_flight: usize,
    /// `completed / (completed + failed)`, or 0.0 before any terminal item.
    pub success_rate: f64,
    /// Terminal items per minute of elapsed run time.
    pub throughput_per_minute: f64,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished, if it has.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Event-folding statistics aggregator for one batch run.
///
/// Reset at run start via [`StatsTracker::start`]; owned exclusively by the
/// executor for the duration of the run.
#[derive(Debug, Clone, Default)]
pub struct StatsTracker {
    total: usize,
    completed: usize,
    failed: usize,
    in_flight: usize,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl StatsTracker {
    /// Starts a fresh tracker for a run of `total` items.
    pub fn start(total: usize) -> Self {
        Self {
            total,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Folds one event into the counters. Lock, flush, and resource events
    /// pass through without effect.
    pub fn apply(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::WorkStarted { .. } => {
                self.in_flight += 1;
            }
            CoreEvent::WorkCompleted { .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.completed += 1;
            }
            CoreEvent::WorkFailed { .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.failed += 1;
            }
            _ => {}
        }
    }

    /// Marks the run finished.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Produces an immutable snapshot with derived rates.
    pub fn snapshot(&self) -> StatsSnapshot {
        let terminal = self.completed + self.failed;
        let success_rate = if terminal == 0 {
            0.0
        } else {
            self.completed as f64 / terminal as f64
        };

        let throughput_per_minute = match self.started_at {
            Some(started) => {
                let end = self.finished_at.unwrap_or_else(Utc::now);
                // Sub-millisecond runs still get a meaningful rate
                let elapsed_secs = (end - started)
                    .to_std()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                if elapsed_secs <= 0.0 {
                    0.0
                } else {
                    terminal as f64 / (elapsed_secs / 60.0)
                }
            }
            None => 0.0,
        };

        StatsSnapshot {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            in_flight: self.in_flight,
            success_rate,
            throughput_per_minute,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}
