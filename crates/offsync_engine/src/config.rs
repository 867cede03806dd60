//! Configuration for the client and its data stores.

use offsync_core::{ReadPolicy, WritePolicy};
use std::time::Duration;

/// Number of records fetched per auto-pagination window.
pub const DEFAULT_PAGE_SIZE: usize = 10_000;
/// Number of ids per `_id IN [...]` query of a delta-set fetch.
pub const DEFAULT_MAX_IDS_PER_QUERY: usize = 200;

/// Configuration of a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Application key; part of every request path.
    pub app_key: String,
    /// API host, without a trailing slash.
    pub api_host: String,
    /// Records per auto-pagination window.
    pub page_size: usize,
    /// Ids per chunk of a delta-set fetch.
    pub max_ids_per_query: usize,
    /// Number of push transmissions that may run at once, across collections.
    pub push_concurrency: usize,
    /// Timeout of a single transport call.
    pub request_timeout: Duration,
    /// Store defaults.
    pub store: StoreOptions,
}

impl ClientConfig {
    /// Creates a configuration for an application.
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            api_host: "https://baas.example.com".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_ids_per_query: DEFAULT_MAX_IDS_PER_QUERY,
            push_concurrency: 4,
            request_timeout: Duration::from_secs(60),
            store: StoreOptions::default(),
        }
    }

    /// Sets the API host.
    pub fn with_api_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.api_host = host.trim_end_matches('/').to_string();
        self
    }

    /// Sets the auto-pagination window size.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Sets the number of ids per delta-set chunk.
    pub fn with_max_ids_per_query(mut self, size: usize) -> Self {
        self.max_ids_per_query = size.max(1);
        self
    }

    /// Sets the number of concurrent push transmissions.
    pub fn with_push_concurrency(mut self, workers: usize) -> Self {
        self.push_concurrency = workers.max(1);
        self
    }

    /// Sets the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the store defaults.
    pub fn with_store_options(mut self, options: StoreOptions) -> Self {
        self.store = options;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Per-store behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Fetch only changed records when the cache is not empty.
    pub delta_set: bool,
    /// Split large result sets into parallel windows.
    pub auto_pagination: bool,
    /// Policy of reads that do not name one.
    pub read_policy: ReadPolicy,
    /// Policy of writes that do not name one.
    pub write_policy: WritePolicy,
}

impl StoreOptions {
    /// Enables or disables delta-set fetches.
    pub fn with_delta_set(mut self, enabled: bool) -> Self {
        self.delta_set = enabled;
        self
    }

    /// Enables or disables auto-pagination.
    pub fn with_auto_pagination(mut self, enabled: bool) -> Self {
        self.auto_pagination = enabled;
        self
    }

    /// Sets the default read policy.
    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    /// Sets the default write policy.
    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            delta_set: false,
            auto_pagination: false,
            read_policy: ReadPolicy::LocalThenNetwork,
            write_policy: WritePolicy::LocalThenNetwork,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("kid_app")
            .with_api_host("https://api.example.com/")
            .with_page_size(500)
            .with_max_ids_per_query(50)
            .with_push_concurrency(0)
            .with_request_timeout(Duration::from_secs(5));

        assert_eq!(config.app_key, "kid_app");
        assert_eq!(config.api_host, "https://api.example.com");
        assert_eq!(config.page_size, 500);
        assert_eq!(config.max_ids_per_query, 50);
        assert_eq!(config.push_concurrency, 1);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.page_size, 10_000);
        assert_eq!(config.max_ids_per_query, 200);
        assert!(!config.store.delta_set);
        assert_eq!(config.store.read_policy, ReadPolicy::LocalThenNetwork);
    }
}
