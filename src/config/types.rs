use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level gateway configuration.
///
/// Everything here is infrastructure: where the routing service lives, how
/// the endpoint connection pool is sized, budget/cache tuning, and
/// per-service federation overrides. There is no hot reload — the
/// configuration is immutable for the lifetime of the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub endpoint: EndpointConfig,

    #[serde(default)]
    pub retry_budget: RetryBudgetConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Federation defaults applied to every service.
    #[serde(default)]
    pub federation: FederationConfig,

    /// Per-service overrides, keyed by service id
    /// (`dataselect`, `station`, `availability`, `wfcatalog`).
    #[serde(default)]
    pub services: HashMap<String, ServiceOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum accepted request body size in bytes. Larger POST bodies are
    /// rejected with 413 at ingress.
    #[serde(default = "default_client_max_size")]
    pub client_max_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_max_size: default_client_max_size(),
        }
    }
}

fn default_client_max_size() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// URL of the routing service `query` endpoint.
    #[serde(default = "default_routing_url")]
    pub url: String,

    /// Connection pool size towards the routing service.
    #[serde(default = "default_routing_connection_limit")]
    pub connection_limit: usize,

    /// Total per-call timeout in seconds.
    #[serde(default = "default_routing_timeout")]
    pub timeout: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            url: default_routing_url(),
            connection_limit: default_routing_connection_limit(),
            timeout: default_routing_timeout(),
        }
    }
}

fn default_routing_url() -> String {
    "http://localhost/eidaws/routing/1/query".to_string()
}

fn default_routing_connection_limit() -> usize {
    4
}

fn default_routing_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// HTTP method for endpoint requests: "GET" or "POST".
    #[serde(default = "default_request_method")]
    pub request_method: String,

    /// Process-wide cap on pooled endpoint connections.
    #[serde(default = "default_endpoint_connection_limit")]
    pub connection_limit: usize,

    /// Per-host cap on pooled endpoint connections.
    #[serde(default = "default_endpoint_connection_limit_per_host")]
    pub connection_limit_per_host: usize,

    /// TCP connect timeout in seconds.
    #[serde(default = "default_timeout_connect")]
    pub timeout_connect: f64,

    /// Socket read timeout in seconds (time between received chunks).
    #[serde(default = "default_timeout_sock_read")]
    pub timeout_sock_read: f64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            request_method: default_request_method(),
            connection_limit: default_endpoint_connection_limit(),
            connection_limit_per_host: default_endpoint_connection_limit_per_host(),
            timeout_connect: default_timeout_connect(),
            timeout_sock_read: default_timeout_sock_read(),
        }
    }
}

fn default_request_method() -> String {
    "GET".to_string()
}

fn default_endpoint_connection_limit() -> usize {
    20
}

fn default_endpoint_connection_limit_per_host() -> usize {
    10
}

fn default_timeout_connect() -> f64 {
    2.0
}

fn default_timeout_sock_read() -> f64 {
    30.0
}

/// Per-endpoint error-rate accounting (see `budget` module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBudgetConfig {
    /// Error ratio (percent, 0–100) above which an endpoint is cut off.
    #[serde(default = "default_budget_threshold")]
    pub threshold: f64,

    /// Sliding window length in seconds; counters older than this expire.
    #[serde(default = "default_budget_ttl")]
    pub ttl: u64,

    /// Number of fixed-size buckets approximating the window.
    #[serde(default = "default_budget_window_size")]
    pub window_size: usize,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            threshold: default_budget_threshold(),
            ttl: default_budget_ttl(),
            window_size: default_budget_window_size(),
        }
    }
}

fn default_budget_threshold() -> f64 {
    5.0
}

fn default_budget_ttl() -> u64 {
    3600
}

fn default_budget_window_size() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Entry lifetime in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,

    /// Upper bound on stored entries; inserts evict expired entries first.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    1024
}

/// Federation behavior for one service. The `[federation]` table holds the
/// defaults; `[services.<id>]` entries override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Upper bound on concurrent workers per client request.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Ceiling on any single resolved stream-epoch duration, in days.
    /// `None` disables the check.
    #[serde(default)]
    pub max_stream_epoch_duration: Option<u32>,

    /// Ceiling on the summed duration of all resolved stream epochs, in days.
    #[serde(default)]
    pub max_total_stream_epoch_duration: Option<u32>,

    /// Wall-clock budget for the whole federated response, in seconds.
    #[serde(default = "default_streaming_timeout")]
    pub streaming_timeout: u64,

    /// Chunk length for split-align formats, in days.
    #[serde(default = "default_split_duration")]
    pub split_duration: u32,

    /// Backwards-scan window for JSON tail recovery, in bytes.
    #[serde(default = "default_rescan_window")]
    pub rescan_window: usize,

    /// Memory bound for out-of-order chunks held by the ordered drain, in
    /// bytes. Producers are backpressured beyond it.
    #[serde(default = "default_drain_buffer_bytes")]
    pub drain_buffer_bytes: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_stream_epoch_duration: None,
            max_total_stream_epoch_duration: None,
            streaming_timeout: default_streaming_timeout(),
            split_duration: default_split_duration(),
            rescan_window: default_rescan_window(),
            drain_buffer_bytes: default_drain_buffer_bytes(),
        }
    }
}

fn default_drain_buffer_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_pool_size() -> usize {
    8
}

fn default_streaming_timeout() -> u64 {
    600
}

fn default_split_duration() -> u32 {
    30
}

fn default_rescan_window() -> usize {
    8192
}

/// Sparse per-service override of `FederationConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOverrides {
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub max_stream_epoch_duration: Option<u32>,
    #[serde(default)]
    pub max_total_stream_epoch_duration: Option<u32>,
    #[serde(default)]
    pub streaming_timeout: Option<u64>,
    #[serde(default)]
    pub split_duration: Option<u32>,
    #[serde(default)]
    pub rescan_window: Option<usize>,
}

impl AppConfig {
    /// Effective federation settings for `service_id`: the `[federation]`
    /// defaults with any `[services.<id>]` overrides applied.
    pub fn federation_for(&self, service_id: &str) -> FederationConfig {
        let mut cfg = self.federation.clone();
        if let Some(ov) = self.services.get(service_id) {
            if let Some(v) = ov.pool_size {
                cfg.pool_size = v;
            }
            if let Some(v) = ov.max_stream_epoch_duration {
                cfg.max_stream_epoch_duration = Some(v);
            }
            if let Some(v) = ov.max_total_stream_epoch_duration {
                cfg.max_total_stream_epoch_duration = Some(v);
            }
            if let Some(v) = ov.streaming_timeout {
                cfg.streaming_timeout = v;
            }
            if let Some(v) = ov.split_duration {
                cfg.split_duration = v;
            }
            if let Some(v) = ov.rescan_window {
                cfg.rescan_window = v;
            }
        }
        cfg
    }
}
