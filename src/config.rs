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

//! Configuration for the coordination core.
//!
//! [`CoreConfig`] carries the recognized options from the coordination
//! surface: concurrency and retry policy, result-persistence batching, lease
//! validity, escape-mapping threshold, and quota backpressure. Values are
//! validated before any work begins; a bad configuration is fatal at startup.
//!
//! # Construction
//!
//! ```rust,ignore
//! let config = CoreConfig::builder()
//!     .concurrency_limit(8)
//!     .batch_size(25)
//!     .quota_cooldown(Duration::from_secs(30))
//!     .build()?;
//! ```

use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for one coordination context.
///
/// Defaults: 4 concurrent items, 3 attempts with
/// a 1 s linear base delay, 50-update / 5 s flush triggers, 5-minute leases
/// with a 500 ms post-write confirm delay, escape-to-random after the first
/// retry, and a 60 s cooldown after a quota-exceeded flush failure.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CoreConfig {
    concurrency_limit: usize,
    max_retries: u32,
    retry_delay: Duration,
    batch_size: usize,
    flush_interval: Duration,
    lease_expiry: Duration,
    lease_confirm_delay: Duration,
    lease_time_of_day_compat: bool,
    resource_escape_threshold: u32,
    resource_failure_threshold: u32,
    pool_cache_ttl: Duration,
    quota_cooldown: Duration,
}

impl CoreConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Maximum number of simultaneously processing work items.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Total attempts per work item.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Base delay between attempts; scaled linearly by attempt number.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Pending-update count that triggers a flush.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Interval at which the background flusher fires regardless of size.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// How long a lease stays valid after acquisition.
    pub fn lease_expiry(&self) -> Duration {
        self.lease_expiry
    }

    /// Fixed wait between writing a lease claim and re-reading it.
    pub fn lease_confirm_delay(&self) -> Duration {
        self.lease_confirm_delay
    }

    /// Whether time-of-day-only lease timestamps are accepted on parse.
    pub fn lease_time_of_day_compat(&self) -> bool {
        self.lease_time_of_day_compat
    }

    /// Retry count at which assignment switches from deterministic to random.
    pub fn resource_escape_threshold(&self) -> u32 {
        self.resource_escape_threshold
    }

    /// Consecutive failures that deactivate a resource.
    pub fn resource_failure_threshold(&self) -> u32 {
        self.resource_failure_threshold
    }

    /// How long a loaded resource pool stays cached per partition.
    pub fn pool_cache_ttl(&self) -> Duration {
        self.pool_cache_ttl
    }

    /// Sleep duration after a quota-exceeded flush failure.
    pub fn quota_cooldown(&self) -> Duration {
        self.quota_cooldown
    }

    /// Validates the configuration. Called by components at construction;
    /// any violation is fatal before work begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "max_retries",
                reason: "must be at least 1 (counts total attempts)".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lease_expiry.is_zero() {
            return Err(ConfigError::Invalid {
                field: "lease_expiry",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.resource_failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "resource_failure_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfigBuilder::default().config
    }
}

/// Builder for [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl Default for CoreConfigBuilder {
    fn default() -> Self {
        Self {
            config: CoreConfig {
                concurrency_limit: 4,
                max_retries: 3,
                retry_delay: Duration::from_secs(1),
                batch_size: 50,
                flush_interval: Duration::from_secs(5),
                lease_expiry: Duration::from_secs(300),
                lease_confirm_delay: Duration::from_millis(500),
                lease_time_of_day_compat: false,
                resource_escape_threshold: 1,
                resource_failure_threshold: 3,
                pool_cache_ttl: Duration::from_secs(300),
                quota_cooldown: Duration::from_secs(60),
            },
        }
    }
}

impl CoreConfigBuilder {
    /// Sets the maximum number of simultaneous work items.
    pub fn concurrency_limit(mut self, value: usize) -> Self {
        self.config.concurrency_limit = value;
        self
    }

    /// Sets the total attempts per work item.
    pub fn max_retries(mut self, value: u32) -> Self {
        self.config.max_retries = value;
        self
    }

    /// Sets the base inter-attempt delay.
    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.config.retry_delay = value;
        self
    }

    /// Sets the flush size threshold.
    pub fn batch_size(mut self, value: usize) -> Self {
        self.config.batch_size = value;
        self
    }

    /// Sets the background flush interval.
    pub fn flush_interval(mut self, value: Duration) -> Self {
        self.config.flush_interval = value;
        self
    }

    /// Sets the lease validity window.
    pub fn lease_expiry(mut self, value: Duration) -> Self {
        self.config.lease_expiry = value;
        self
    }

    /// Sets the post-write lease confirm delay.
    pub fn lease_confirm_delay(mut self, value: Duration) -> Self {
        self.config.lease_confirm_delay = value;
        self
    }

    /// Enables acceptance of legacy time-of-day-only lease timestamps.
    pub fn lease_time_of_day_compat(mut self, value: bool) -> Self {
        self.config.lease_time_of_day_compat = value;
        self
    }

    /// Sets the retry count at which assignment escapes to random.
    pub fn resource_escape_threshold(mut self, value: u32) -> Self {
        self.config.resource_escape_threshold = value;
        self
    }

    /// Sets the consecutive-failure count that deactivates a resource.
    pub fn resource_failure_threshold(mut self, value: u32) -> Self {
        self.config.resource_failure_threshold = value;
        self
    }

    /// Sets the per-partition pool cache TTL.
    pub fn pool_cache_ttl(mut self, value: Duration) -> Self {
        self.config.pool_cache_ttl = value;
        self
    }

    /// Sets the post-quota-failure cooldown.
    pub fn quota_cooldown(mut self, value: Duration) -> Self {
        self.config.quota_cooldown = value;
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<CoreConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();

        assert_eq!(config.concurrency_limit(), 4);
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 50);
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.lease_expiry(), Duration::from_secs(300));
        assert_eq!(config.lease_confirm_delay(), Duration::from_millis(500));
        assert!(!config.lease_time_of_day_compat());
        assert_eq!(config.resource_escape_threshold(), 1);
        assert_eq!(config.resource_failure_threshold(), 3);
        assert_eq!(config.pool_cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.quota_cooldown(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = CoreConfig::builder()
            .concurrency_limit(8)
            .max_retries(5)
            .batch_size(25)
            .flush_interval(Duration::from_secs(2))
            .quota_cooldown(Duration::from_secs(30))
            .lease_time_of_day_compat(true)
            .build()
            .unwrap();

        assert_eq!(config.concurrency_limit(), 8);
        assert_eq!(config.max_retries(), 5);
        assert_eq!(config.batch_size(), 25);
        assert_eq!(config.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.quota_cooldown(), Duration::from_secs(30));
        assert!(config.lease_time_of_day_compat());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = CoreConfig::builder()
            .concurrency_limit(0)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "concurrency_limit",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(CoreConfig::builder().batch_size(0).build().is_err());
    }

    #[test]
    fn test_zero_max_retries_rejected() {
        assert!(CoreConfig::builder().max_retries(0).build().is_err());
    }

    #[test]
    fn test_zero_lease_expiry_rejected() {
        assert!(CoreConfig::builder()
            .lease_expiry(Duration::ZERO)
            .build()
            .is_err());
    }
}
