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

//! Progress event schema and publish/subscribe bus.
//!
//! Components publish discrete [`CoreEvent`]s instead of holding direct
//! references to their consumers. Dashboards, loggers, and the stats tracker
//! all observe the same stream through [`EventBus::subscribe`].
//!
//! Emission never blocks: the bus is backed by a `tokio::sync::broadcast`
//! channel, a send with no subscribers is a no-op, and a slow subscriber that
//! falls behind the channel capacity loses old events rather than stalling
//! the concurrency-limited work loop.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast channel capacity per bus.
const DEFAULT_CAPACITY: usize = 256;

/// A discrete progress event emitted by the coordination core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A work item began its first attempt.
    WorkStarted { item_id: String },
    /// A work item reached a successful terminal state.
    WorkCompleted { item_id: String, attempts: u32 },
    /// A work item exhausted its retry budget.
    WorkFailed {
        item_id: String,
        attempts: u32,
        error: String,
    },
    /// A batch of pending updates was persisted in one remote call.
    FlushCompleted { updates: usize },
    /// This worker won a lease on a resource key.
    LockAcquired {
        resource_key: String,
        owner_id: String,
    },
    /// A valid foreign lease was found, or this worker lost the race.
    LockDenied {
        resource_key: String,
        holder_id: String,
    },
    /// A resource crossed its consecutive-failure threshold.
    ResourceDeactivated { resource_id: String },
}

/// Broadcast bus carrying [`CoreEvent`]s to any number of subscribers.
///
/// Clones share the same underlying channel, so every component in one
/// coordination context can hold its own handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a bus with the default capacity (256 events).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Subscribes to the event stream from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Never blocks; silently drops the event when no
    /// subscriber is attached.
    pub fn emit(&self, event: CoreEvent) {
        trace!(?event, "emitting core event");
        let _ = self.sender.send(event);
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        // Must not panic or block
        bus.emit(CoreEvent::FlushCompleted { updates: 3 });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(CoreEvent::WorkStarted {
            item_id: "a".to_string(),
        });
        bus.emit(CoreEvent::WorkCompleted {
            item_id: "a".to_string(),
            attempts: 1,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::WorkStarted {
                item_id: "a".to_string()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::WorkCompleted {
                item_id: "a".to_string(),
                attempts: 1
            }
        );
    }

    #[test]
    fn test_event_serialization_schema() {
        let event = CoreEvent::LockDenied {
            resource_key: "acct-7".to_string(),
            holder_id: "worker-2".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"lock_denied\""));
        assert!(json.contains("acct-7"));

        let back: CoreEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
