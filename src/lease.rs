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

//! Lease-based advisory lock over the shared record store.
//!
//! `LeaseLock` provides best-effort mutual exclusion between worker
//! processes using only plain read/write primitives — the store offers no
//! compare-and-swap. The protocol is write-then-verify:
//!
//! 1. read the current lease value; if a valid foreign lease is present,
//!    give up immediately
//! 2. write our own claim
//! 3. wait a fixed confirm delay so a concurrent writer's write can land
//! 4. re-read; we hold the lock only if the stored owner is still us
//!
//! Invariant: correctness depends on the confirm delay exceeding realistic
//! write-landing variance across workers. This is an advisory lock under a
//! coarse polling model, not a consensus protocol; the delay is deliberately
//! explicit and tunable.
//!
//! Every reader re-derives lease validity from the encoded value; nothing is
//! cached centrally. An I/O failure during acquisition is always reported as
//! "could not acquire" (the lock fails closed), never as success.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::LockError;
use crate::events::{CoreEvent, EventBus};
use crate::store::{RecordRef, RecordStore};

/// Default field occupied by the lock within each record.
const DEFAULT_LOCK_FIELD: &str = "lease";

/// Legacy time-of-day lease timestamp format.
const TIME_OF_DAY_FORMAT: &str = "%H:%M:%S";

/// A decoded lease value: who claimed the resource, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Globally unique identifier of the claiming worker process.
    pub owner_id: String,
    /// When the claim was written.
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Encodes the lease into its stored wire form: `owner_id|rfc3339`.
    pub fn encode(&self) -> String {
        format!("{}|{}", self.owner_id, self.acquired_at.to_rfc3339())
    }

    /// Decodes a raw lease value. Returns `None` for empty or unparseable
    /// values, which readers treat as "no valid lease".
    ///
    /// The primary timestamp format is full RFC 3339. When
    /// `time_of_day_compat` is set, bare `HH:MM:SS` values written by older
    /// workers are also accepted: the date is assumed to be today, unless
    /// that would place the claim in the future, in which case it is assumed
    /// to be yesterday (midnight rollover correction). Compat-mode leases
    /// older than 24 hours are indistinguishable from fresh ones; that
    /// ambiguity is confined to the compatibility path.
    pub fn parse(raw: &str, now: DateTime<Utc>, time_of_day_compat: bool) -> Option<Self> {
        let (owner, timestamp) = raw.split_once('|')?;
        if owner.is_empty() {
            return None;
        }

        if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
            return Some(Self {
                owner_id: owner.to_string(),
                acquired_at: parsed.with_timezone(&Utc),
            });
        }

        if time_of_day_compat {
            if let Ok(time) = NaiveTime::parse_from_str(timestamp, TIME_OF_DAY_FORMAT) {
                let mut acquired_at = Utc.from_utc_datetime(&now.date_naive().and_time(time));
                if acquired_at > now {
                    acquired_at -= chrono::Duration::days(1);
                }
                return Some(Self {
                    owner_id: owner.to_string(),
                    acquired_at,
                });
            }
        }

        None
    }

    /// Whether this lease has outlived the expiry window at `now`.
    ///
    /// A claim from the future (clock skew) counts as zero elapsed time.
    pub fn is_expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        let elapsed = (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO);
        elapsed >= expiry
    }
}

/// Configuration for [`LeaseLock`].
#[derive(Debug, Clone)]
pub struct LeaseLockConfig {
    /// How long a lease stays valid after acquisition.
    pub expiry: Duration,
    /// Fixed wait between claim write and verification re-read. Must exceed
    /// one network round trip's worth of cross-worker write latency.
    pub confirm_delay: Duration,
    /// Field within each record occupied by the lock.
    pub lock_field: String,
    /// Accept legacy time-of-day-only lease timestamps.
    pub time_of_day_compat: bool,
}

impl Default for LeaseLockConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(300),
            confirm_delay: Duration::from_millis(500),
            lock_field: DEFAULT_LOCK_FIELD.to_string(),
            time_of_day_compat: false,
        }
    }
}

impl From<&CoreConfig> for LeaseLockConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            expiry: config.lease_expiry(),
            confirm_delay: config.lease_confirm_delay(),
            lock_field: DEFAULT_LOCK_FIELD.to_string(),
            time_of_day_compat: config.lease_time_of_day_compat(),
        }
    }
}

/// Per-record lease lock shared by all workers through the record store.
pub struct LeaseLock {
    store: Arc<dyn RecordStore>,
    config: LeaseLockConfig,
    owner_id: String,
    events: EventBus,
}

impl LeaseLock {
    /// Creates a lock with a freshly generated worker owner id.
    pub fn new(store: Arc<dyn RecordStore>, config: LeaseLockConfig, events: EventBus) -> Self {
        Self::with_owner_id(store, config, events, Uuid::new_v4().to_string())
    }

    /// Creates a lock with an explicit owner id. Owner ids must be globally
    /// unique per worker process.
    pub fn with_owner_id(
        store: Arc<dyn RecordStore>,
        config: LeaseLockConfig,
        events: EventBus,
        owner_id: String,
    ) -> Self {
        Self {
            store,
            config,
            owner_id,
            events,
        }
    }

    /// This worker's globally unique owner id.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Attempts to acquire the lease on `resource_key`.
    ///
    /// Returns `Ok(true)` only when the verification re-read still shows
    /// this worker as the owner. `Ok(false)` means a valid foreign lease
    /// exists or another worker won the race; the foreign value is left
    /// untouched. Contention is a normal skip signal, not an error.
    ///
    /// # Errors
    ///
    /// Any store I/O failure is propagated as [`LockError`] and must be
    /// treated by callers as "could not acquire".
    pub async fn acquire(&self, resource_key: &str) -> Result<bool, LockError> {
        let location = self.lock_location(resource_key);
        let raw = self.store.get_field(&location).await?;
        let now = Utc::now();

        if let Some(current) = raw
            .as_deref()
            .and_then(|v| Lease::parse(v, now, self.config.time_of_day_compat))
        {
            let expired = current.is_expired(now, self.config.expiry);
            if !expired && current.owner_id != self.owner_id {
                debug!(
                    resource_key,
                    holder = %current.owner_id,
                    "lease held by another worker, skipping"
                );
                self.events.emit(CoreEvent::LockDenied {
                    resource_key: resource_key.to_string(),
                    holder_id: current.owner_id,
                });
                return Ok(false);
            }
            if expired {
                debug!(
                    resource_key,
                    holder = %current.owner_id,
                    "found expired lease, attempting takeover"
                );
            }
        }

        let claim = Lease {
            owner_id: self.owner_id.clone(),
            acquired_at: now,
        };
        self.store.set_field(&location, &claim.encode()).await?;

        // Let any concurrent writer's write land before verifying.
        tokio::time::sleep(self.config.confirm_delay).await;

        let confirmed = self.store.get_field(&location).await?;
        let winner = confirmed
            .as_deref()
            .and_then(|v| Lease::parse(v, Utc::now(), self.config.time_of_day_compat))
            .map(|lease| lease.owner_id);

        match winner {
            Some(owner) if owner == self.owner_id => {
                info!(resource_key, "lease acquired");
                self.events.emit(CoreEvent::LockAcquired {
                    resource_key: resource_key.to_string(),
                    owner_id: self.owner_id.clone(),
                });
                Ok(true)
            }
            Some(owner) => {
                debug!(resource_key, winner = %owner, "lost lease race");
                self.events.emit(CoreEvent::LockDenied {
                    resource_key: resource_key.to_string(),
                    holder_id: owner,
                });
                Ok(false)
            }
            None => {
                // Someone cleared or corrupted the field between our write
                // and the re-read; treat as a lost race.
                warn!(resource_key, "lease value vanished during confirmation");
                self.events.emit(CoreEvent::LockDenied {
                    resource_key: resource_key.to_string(),
                    holder_id: String::new(),
                });
                Ok(false)
            }
        }
    }

    /// Releases the lease on `resource_key` by clearing the lock field.
    ///
    /// Unconditional and idempotent: always safe to call, even if this
    /// worker never held the lease.
    pub async fn release(&self, resource_key: &str) -> Result<(), LockError> {
        let location = self.lock_location(resource_key);
        self.store.set_field(&location, "").await?;
        debug!(resource_key, "lease released");
        Ok(())
    }

    fn lock_location(&self, resource_key: &str) -> RecordRef {
        RecordRef::new(resource_key, self.config.lock_field.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{CellUpdate, MemoryRecordStore, RangeSelector, RecordRow};
    use async_trait::async_trait;

    fn quick_config() -> LeaseLockConfig {
        LeaseLockConfig {
            expiry: Duration::from_secs(300),
            confirm_delay: Duration::from_millis(5),
            ..LeaseLockConfig::default()
        }
    }

    fn lock_with_owner(store: &MemoryRecordStore, owner: &str) -> LeaseLock {
        LeaseLock::with_owner_id(
            Arc::new(store.clone()),
            quick_config(),
            EventBus::new(),
            owner.to_string(),
        )
    }

    #[test]
    fn test_lease_encode_parse_roundtrip() {
        let lease = Lease {
            owner_id: "worker-1".to_string(),
            acquired_at: Utc::now(),
        };
        let parsed = Lease::parse(&lease.encode(), Utc::now(), false).unwrap();
        assert_eq!(parsed.owner_id, "worker-1");
        // RFC 3339 keeps sub-second precision
        assert_eq!(parsed.acquired_at, lease.acquired_at);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let now = Utc::now();
        assert_eq!(Lease::parse("", now, false), None);
        assert_eq!(Lease::parse("no-separator", now, false), None);
        assert_eq!(Lease::parse("|2024-01-01T00:00:00Z", now, false), None);
        assert_eq!(Lease::parse("owner|not-a-time", now, false), None);
        // Time-of-day values are rejected unless compat is on
        assert_eq!(Lease::parse("owner|12:30:00", now, false), None);
    }

    #[test]
    fn test_compat_parse_same_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap();
        let lease = Lease::parse("owner|12:30:00", now, true).unwrap();
        assert_eq!(
            lease.acquired_at,
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_compat_parse_midnight_rollover() {
        // Shortly after midnight, a 23:59:50 claim must be read as yesterday
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 30).unwrap();
        let lease = Lease::parse("owner|23:59:50", now, true).unwrap();
        assert_eq!(
            lease.acquired_at,
            Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 50).unwrap()
        );
        // 40 seconds elapsed: not expired under a 5 minute window
        assert!(!lease.is_expired(now, Duration::from_secs(300)));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let expiry = Duration::from_secs(300);
        let lease = |age: i64| Lease {
            owner_id: "w".to_string(),
            acquired_at: now - chrono::Duration::seconds(age),
        };

        // Strictly before the window closes: still valid
        assert!(!lease(299).is_expired(now, expiry));
        // At and past the window: expired
        assert!(lease(300).is_expired(now, expiry));
        assert!(lease(301).is_expired(now, expiry));
        // Future claim (clock skew) is treated as fresh
        assert!(!Lease {
            owner_id: "w".to_string(),
            acquired_at: now + chrono::Duration::seconds(60),
        }
        .is_expired(now, expiry));
    }

    #[tokio::test]
    async fn test_acquire_on_unclaimed_resource() {
        let store = MemoryRecordStore::new();
        let lock = lock_with_owner(&store, "worker-1");

        assert!(lock.acquire("acct-1").await.unwrap());
        let stored = store.field(&RecordRef::new("acct-1", "lease")).unwrap();
        assert!(stored.starts_with("worker-1|"));
    }

    #[tokio::test]
    async fn test_acquire_denied_by_valid_foreign_lease() {
        let store = MemoryRecordStore::new();
        let holder = Lease {
            owner_id: "worker-2".to_string(),
            acquired_at: Utc::now(),
        };
        store.seed_field(RecordRef::new("acct-1", "lease"), holder.encode());

        let bus = EventBus::new();
        let lock = LeaseLock::with_owner_id(
            Arc::new(store.clone()),
            quick_config(),
            bus.clone(),
            "worker-1".to_string(),
        );
        let mut rx = bus.subscribe();

        assert!(!lock.acquire("acct-1").await.unwrap());
        // The foreign value is left untouched
        assert_eq!(
            store.field(&RecordRef::new("acct-1", "lease")),
            Some(holder.encode())
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoreEvent::LockDenied { holder_id, .. } if holder_id == "worker-2"
        ));
    }

    #[tokio::test]
    async fn test_acquire_takes_over_expired_lease() {
        let store = MemoryRecordStore::new();
        let stale = Lease {
            owner_id: "worker-2".to_string(),
            acquired_at: Utc::now() - chrono::Duration::seconds(301),
        };
        store.seed_field(RecordRef::new("acct-1", "lease"), stale.encode());

        let lock = lock_with_owner(&store, "worker-1");
        assert!(lock.acquire("acct-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_treats_unparseable_value_as_absent() {
        let store = MemoryRecordStore::new();
        store.seed_field(RecordRef::new("acct-1", "lease"), "corrupted###");

        let lock = lock_with_owner(&store, "worker-1");
        assert!(lock.acquire("acct-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reacquire_own_lease() {
        let store = MemoryRecordStore::new();
        let lock = lock_with_owner(&store, "worker-1");

        assert!(lock.acquire("acct-1").await.unwrap());
        assert!(lock.acquire("acct-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryRecordStore::new();
        let lock = lock_with_owner(&store, "worker-1");

        // Releasing a lease we never held is fine
        lock.release("acct-1").await.unwrap();

        assert!(lock.acquire("acct-1").await.unwrap());
        lock.release("acct-1").await.unwrap();
        lock.release("acct-1").await.unwrap();
        assert_eq!(
            store.field(&RecordRef::new("acct-1", "lease")),
            Some(String::new())
        );
    }

    /// Store whose reads always fail; acquisition must fail closed.
    struct BrokenStore;

    #[async_trait]
    impl RecordStore for BrokenStore {
        async fn get_field(&self, _: &RecordRef) -> Result<Option<String>, StoreError> {
            Err(StoreError::Io("connection refused".to_string()))
        }
        async fn set_field(&self, _: &RecordRef, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Io("connection refused".to_string()))
        }
        async fn get_range(&self, _: &RangeSelector) -> Result<Vec<RecordRow>, StoreError> {
            Err(StoreError::Io("connection refused".to_string()))
        }
        async fn batch_write(&self, _: &[CellUpdate]) -> Result<(), StoreError> {
            Err(StoreError::Io("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_io_error_fails_closed() {
        let lock = LeaseLock::with_owner_id(
            Arc::new(BrokenStore),
            quick_config(),
            EventBus::new(),
            "worker-1".to_string(),
        );
        // Never "acquired" on I/O failure — the error propagates
        assert!(lock.acquire("acct-1").await.is_err());
    }
}
