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

//! Deterministic resource assignment with a controlled escape to random.
//!
//! `ResourceMapper` pins a logical identity (e.g. a normalized account
//! identifier) to one resource out of an interchangeable pool (e.g. network
//! egress points), stably across runs: the same identity always lands on the
//! same resource as long as the pool is unchanged. After repeated failures —
//! when an item's retry count reaches the escape threshold — the mapping
//! *escapes* to a uniformly random alternative, guaranteed to differ from
//! the deterministic choice whenever more than one resource is available.
//!
//! Pools are scoped by a partition key (e.g. a country code), filtered to
//! active resources only, sorted with numeric-aware ordering so `id_2` comes
//! before `id_10`, and cached with a TTL. Callers must not assume index
//! stability across cache refreshes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::MapperError;
use crate::events::{CoreEvent, EventBus};
use crate::store::{RangeSelector, RecordRef, RecordStore};

/// Catalog field names.
const FIELD_ENDPOINT: &str = "endpoint";
const FIELD_ACTIVE: &str = "active";
const FIELD_FAILURES: &str = "failures";
const FIELD_LAST_USED_AT: &str = "last_used_at";

/// One assignable resource from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Stable identifier, unique within the catalog.
    pub id: String,
    /// Opaque connection value handed to the work layer.
    pub endpoint: String,
    /// Consecutive failures accumulated so far.
    pub consecutive_failures: u32,
}

/// Configuration for [`ResourceMapper`].
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Retry count at which assignment switches from deterministic to random.
    pub escape_threshold: u32,
    /// Consecutive failures that deactivate a resource.
    pub failure_threshold: u32,
    /// How long a loaded pool stays cached per partition.
    pub cache_ttl: Duration,
    /// Catalog sheet holding resource rows.
    pub catalog_sheet: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            escape_threshold: 1,
            failure_threshold: 3,
            cache_ttl: Duration::from_secs(300),
            catalog_sheet: "resources".to_string(),
        }
    }
}

impl From<&CoreConfig> for MapperConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            escape_threshold: config.resource_escape_threshold(),
            failure_threshold: config.resource_failure_threshold(),
            cache_ttl: config.pool_cache_ttl(),
            catalog_sheet: "resources".to_string(),
        }
    }
}

struct CachedPool {
    loaded_at: Instant,
    resources: Vec<Resource>,
}

/// Maps logical identities onto pool resources, stably unless escaping.
pub struct ResourceMapper {
    store: Arc<dyn RecordStore>,
    config: MapperConfig,
    events: EventBus,
    cache: Mutex<HashMap<String, CachedPool>>,
}

impl ResourceMapper {
    /// Creates a mapper backed by the given store and catalog configuration.
    pub fn new(store: Arc<dyn RecordStore>, config: MapperConfig, events: EventBus) -> Self {
        Self {
            store,
            config,
            events,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Assigns a resource to `identity` within `partition`.
    ///
    /// Below the escape threshold the assignment is deterministic: the same
    /// identity maps to the same pool index for an unchanged pool. At or
    /// above the threshold a uniformly random resource is chosen, excluding
    /// the deterministic pick whenever the pool has more than one entry.
    ///
    /// # Errors
    ///
    /// [`MapperError::NoAvailableResources`] when the active-only pool for
    /// the partition is empty.
    pub async fn assign(
        &self,
        identity: &str,
        partition: &str,
        retry_count: u32,
    ) -> Result<Resource, MapperError> {
        let pool = self.pool(partition).await?;
        if pool.is_empty() {
            return Err(MapperError::NoAvailableResources {
                partition: partition.to_string(),
            });
        }

        let base = hash_index(identity, pool.len());
        let index = if retry_count < self.config.escape_threshold {
            base
        } else if pool.len() == 1 {
            0
        } else {
            // Uniform over all indices except the deterministic one
            let mut picked = rand::thread_rng().gen_range(0..pool.len() - 1);
            if picked >= base {
                picked += 1;
            }
            picked
        };

        let resource = pool[index].clone();
        debug!(
            identity,
            partition,
            retry_count,
            resource = %resource.id,
            escaped = retry_count >= self.config.escape_threshold,
            "assigned resource"
        );
        Ok(resource)
    }

    /// Records a successful use: resets the consecutive-failure counter and
    /// stamps the usage time.
    pub async fn record_success(&self, resource_id: &str) -> Result<(), MapperError> {
        self.store
            .set_field(&RecordRef::new(resource_id, FIELD_FAILURES), "0")
            .await?;
        self.store
            .set_field(
                &RecordRef::new(resource_id, FIELD_LAST_USED_AT),
                &chrono::Utc::now().to_rfc3339(),
            )
            .await?;
        Ok(())
    }

    /// Records a failed use: increments the consecutive-failure counter and
    /// deactivates the resource once the threshold is reached. Deactivation
    /// invalidates the pool cache for every partition.
    pub async fn record_failure(&self, resource_id: &str) -> Result<(), MapperError> {
        let counter_ref = RecordRef::new(resource_id, FIELD_FAILURES);
        let current: u32 = self
            .store
            .get_field(&counter_ref)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let failures = current.saturating_add(1);

        self.store
            .set_field(&counter_ref, &failures.to_string())
            .await?;

        if failures >= self.config.failure_threshold {
            warn!(
                resource_id,
                failures, "failure threshold reached, deactivating resource"
            );
            self.store
                .set_field(&RecordRef::new(resource_id, FIELD_ACTIVE), "false")
                .await?;
            self.events.emit(CoreEvent::ResourceDeactivated {
                resource_id: resource_id.to_string(),
            });
            self.invalidate_all();
        }
        Ok(())
    }

    /// Drops the cached pool for one partition.
    pub fn invalidate(&self, partition: &str) {
        self.cache.lock().remove(partition);
    }

    /// Drops every cached pool.
    pub fn invalidate_all(&self) {
        self.cache.lock().clear();
    }

    /// Returns the active-only pool for a partition, loading it through the
    /// store when the cache entry is missing or stale.
    pub async fn pool(&self, partition: &str) -> Result<Vec<Resource>, MapperError> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(partition) {
                if cached.loaded_at.elapsed() < self.config.cache_ttl {
                    return Ok(cached.resources.clone());
                }
            }
        }

        let resources = self.load_pool(partition).await?;
        info!(
            partition,
            size = resources.len(),
            "loaded resource pool"
        );
        self.cache.lock().insert(
            partition.to_string(),
            CachedPool {
                loaded_at: Instant::now(),
                resources: resources.clone(),
            },
        );
        Ok(resources)
    }

    async fn load_pool(&self, partition: &str) -> Result<Vec<Resource>, MapperError> {
        let selector = RangeSelector::partition(self.config.catalog_sheet.clone(), partition);
        let rows = self.store.get_range(&selector).await?;

        let mut resources: Vec<Resource> = Vec::with_capacity(rows.len());
        for row in rows {
            let endpoint = match row.field(FIELD_ENDPOINT) {
                Some(value) if !value.is_empty() => value.to_string(),
                _ => {
                    warn!(partition, key = %row.key, "skipping catalog row without endpoint");
                    continue;
                }
            };
            let active = row
                .field(FIELD_ACTIVE)
                .map(|v| !matches!(v.trim(), "false" | "0" | "no"))
                .unwrap_or(true);
            let consecutive_failures: u32 = row
                .field(FIELD_FAILURES)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);

            if !active || consecutive_failures >= self.config.failure_threshold {
                continue;
            }
            resources.push(Resource {
                id: row.key,
                endpoint,
                consecutive_failures,
            });
        }

        resources.sort_by(|a, b| natural_cmp(&a.id, &b.id));
        resources.dedup_by(|a, b| a.id == b.id);
        Ok(resources)
    }
}

/// Deterministic pool index for an identity: SHA-256 of the trimmed,
/// lower-cased identity, first 8 hex characters as an unsigned integer,
/// modulo the pool size.
pub(crate) fn hash_index(identity: &str, pool_size: usize) -> usize {
    let normalized = identity.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let prefix = &hex::encode(digest)[..8];
    // 8 hex characters always fit a u32
    let hash = u32::from_str_radix(prefix, 16).unwrap_or(0);
    (hash as usize) % pool_size
}

/// Numeric-aware identifier ordering: digit runs compare as numbers, so
/// `id_2` sorts before `id_10`.
fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(lc), Some(rc)) if lc.is_ascii_digit() && rc.is_ascii_digit() => {
                let ln = take_number(&mut left);
                let rn = take_number(&mut right);
                match ln.cmp(&rn) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
            }
            (Some(lc), Some(rc)) => match lc.cmp(&rc) {
                Ordering::Equal => {
                    left.next();
                    right.next();
                }
                ord => return ord,
            },
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u64 {
    let mut value: u64 = 0;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        value = value.saturating_mul(10).saturating_add(digit as u64);
        chars.next();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRecordStore, RecordRow};
    use tracing_test::traced_test;

    fn seeded_mapper(store: &MemoryRecordStore, rows: Vec<RecordRow>) -> ResourceMapper {
        seeded_mapper_with(store, rows, MapperConfig::default())
    }

    fn seeded_mapper_with(
        store: &MemoryRecordStore,
        rows: Vec<RecordRow>,
        config: MapperConfig,
    ) -> ResourceMapper {
        store.seed_rows(
            RangeSelector::partition(config.catalog_sheet.clone(), "us"),
            rows,
        );
        ResourceMapper::new(Arc::new(store.clone()), config, EventBus::new())
    }

    fn three_rows() -> Vec<RecordRow> {
        vec![
            RecordRow::new("r_1", [("endpoint", "10.0.0.1")]),
            RecordRow::new("r_2", [("endpoint", "10.0.0.2")]),
            RecordRow::new("r_3", [("endpoint", "10.0.0.3")]),
        ]
    }

    #[test]
    fn test_hash_index_known_vector() {
        // sha256("user@x.com") starts with cf509b75; 0xcf509b75 % 3 == 1
        assert_eq!(hash_index("user@x.com", 3), 1);
    }

    #[test]
    fn test_hash_index_normalizes_identity() {
        assert_eq!(
            hash_index("  User@X.Com  ", 97),
            hash_index("user@x.com", 97)
        );
    }

    #[test]
    fn test_natural_ordering() {
        let mut ids = vec!["id_10", "id_2", "id_1", "id_20", "alpha"];
        ids.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(ids, vec!["alpha", "id_1", "id_2", "id_10", "id_20"]);
    }

    #[tokio::test]
    async fn test_deterministic_assignment_is_stable() {
        let store = MemoryRecordStore::new();
        let mapper = seeded_mapper(&store, three_rows());

        let first = mapper.assign("user@x.com", "us", 0).await.unwrap();
        for _ in 0..10 {
            let again = mapper.assign("user@x.com", "us", 0).await.unwrap();
            assert_eq!(again, first);
        }
        // Known vector: base index 1 of [r_1, r_2, r_3]
        assert_eq!(first.id, "r_2");
    }

    #[tokio::test]
    async fn test_escape_never_returns_deterministic_choice() {
        let store = MemoryRecordStore::new();
        let mapper = seeded_mapper(&store, three_rows());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let escaped = mapper.assign("user@x.com", "us", 1).await.unwrap();
            assert_ne!(escaped.id, "r_2", "escape must avoid the deterministic pick");
            seen.insert(escaped.id);
        }
        // Both alternatives show up over enough samples
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_single_resource_pool_ignores_escape() {
        let store = MemoryRecordStore::new();
        let mapper = seeded_mapper(
            &store,
            vec![RecordRow::new("only", [("endpoint", "10.0.0.1")])],
        );

        let assigned = mapper.assign("user@x.com", "us", 5).await.unwrap();
        assert_eq!(assigned.id, "only");
    }

    #[tokio::test]
    async fn test_empty_pool_is_an_error() {
        let store = MemoryRecordStore::new();
        let mapper = seeded_mapper(&store, vec![]);

        let err = mapper.assign("user@x.com", "us", 0).await.unwrap_err();
        assert!(matches!(
            err,
            MapperError::NoAvailableResources { partition } if partition == "us"
        ));
    }

    #[tokio::test]
    async fn test_pool_filters_inactive_and_failed_resources() {
        let store = MemoryRecordStore::new();
        let mapper = seeded_mapper(
            &store,
            vec![
                RecordRow::new("r_1", [("endpoint", "10.0.0.1")]),
                RecordRow::new("r_2", [("endpoint", "10.0.0.2"), ("active", "false")]),
                RecordRow::new("r_3", [("endpoint", "10.0.0.3"), ("failures", "3")]),
                RecordRow::new("r_4", [("endpoint", "10.0.0.4"), ("failures", "2")]),
                // No endpoint: skipped with a warning
                RecordRow::new("r_5", [("active", "true")]),
            ],
        );

        let pool = mapper.pool("us").await.unwrap();
        let ids: Vec<&str> = pool.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r_1", "r_4"]);
        assert_eq!(pool[1].consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_pool_sorted_naturally_and_deduplicated() {
        let store = MemoryRecordStore::new();
        let mapper = seeded_mapper(
            &store,
            vec![
                RecordRow::new("px_10", [("endpoint", "a")]),
                RecordRow::new("px_2", [("endpoint", "b")]),
                RecordRow::new("px_2", [("endpoint", "b-dup")]),
                RecordRow::new("px_1", [("endpoint", "c")]),
            ],
        );

        let pool = mapper.pool("us").await.unwrap();
        let ids: Vec<&str> = pool.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["px_1", "px_2", "px_10"]);
    }

    #[tokio::test]
    async fn test_pool_cache_avoids_rereads_until_invalidated() {
        let store = MemoryRecordStore::new();
        let mapper = seeded_mapper(&store, three_rows());

        mapper.pool("us").await.unwrap();
        mapper.pool("us").await.unwrap();
        assert_eq!(store.range_read_calls(), 1);

        mapper.invalidate("us");
        mapper.pool("us").await.unwrap();
        assert_eq!(store.range_read_calls(), 2);
    }

    #[tokio::test]
    async fn test_record_success_resets_counter() {
        let store = MemoryRecordStore::new();
        store.seed_field(RecordRef::new("r_1", "failures"), "2");
        let mapper = seeded_mapper(&store, three_rows());

        mapper.record_success("r_1").await.unwrap();
        assert_eq!(
            store.field(&RecordRef::new("r_1", "failures")),
            Some("0".to_string())
        );
        assert!(store.field(&RecordRef::new("r_1", "last_used_at")).is_some());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_third_failure_deactivates_and_invalidates_cache() {
        let store = MemoryRecordStore::new();
        let bus = EventBus::new();
        store.seed_rows(
            RangeSelector::partition("resources", "us"),
            three_rows(),
        );
        let mapper = ResourceMapper::new(
            Arc::new(store.clone()),
            MapperConfig::default(),
            bus.clone(),
        );
        let mut rx = bus.subscribe();

        // Warm the cache
        mapper.pool("us").await.unwrap();
        assert_eq!(store.range_read_calls(), 1);

        mapper.record_failure("r_1").await.unwrap();
        mapper.record_failure("r_1").await.unwrap();
        assert_eq!(
            store.field(&RecordRef::new("r_1", "failures")),
            Some("2".to_string())
        );

        mapper.record_failure("r_1").await.unwrap();
        assert_eq!(
            store.field(&RecordRef::new("r_1", "active")),
            Some("false".to_string())
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoreEvent::ResourceDeactivated {
                resource_id: "r_1".to_string()
            }
        );
        assert!(logs_contain("deactivating resource"));

        // Cache was invalidated: the next pool read goes back to the store
        mapper.pool("us").await.unwrap();
        assert_eq!(store.range_read_calls(), 2);
    }
}
