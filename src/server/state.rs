use crate::budget::RetryBudget;
use crate::cache::{CacheStore, MemoryCache};
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::routing::RouteResolver;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Shared application context, cheaply cloneable.
///
/// All cross-cutting dependencies live here and are threaded explicitly
/// through constructors — the endpoint HTTP pool, the routing client, the
/// retry budget, the cache store, and the metrics handle. There are no
/// process-wide singletons.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub resolver: RouteResolver,
    pub endpoint_client: reqwest::Client,
    pub budget: Arc<RetryBudget>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub metrics: Metrics,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Result<Self> {
        let metrics = Metrics::install();
        Self::with_metrics(config, metrics)
    }

    /// Build a context around an existing metrics handle. Used by tests that
    /// assemble several contexts in one process.
    pub fn with_metrics(config: AppConfig, metrics: Metrics) -> Result<Self> {
        let resolver = RouteResolver::new(&config.routing)?;

        let endpoint_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(config.endpoint.timeout_connect))
            .read_timeout(Duration::from_secs_f64(config.endpoint.timeout_sock_read))
            .pool_max_idle_per_host(config.endpoint.connection_limit_per_host)
            .build()?;

        let budget = Arc::new(RetryBudget::new(config.retry_budget.clone()));

        let cache: Option<Arc<dyn CacheStore>> = if config.cache.enabled {
            Some(Arc::new(MemoryCache::new(
                Duration::from_secs(config.cache.ttl),
                config.cache.max_entries,
            )))
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            resolver,
            endpoint_client,
            budget,
            cache,
            metrics,
        })
    }
}
