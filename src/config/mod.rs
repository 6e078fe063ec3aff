pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl AppConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used so the gateway can start with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: AppConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides for deployment-specific settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SEISGATE_ROUTING_URL") {
            self.routing.url = v;
        }
        if let Ok(v) = std::env::var("SEISGATE_ENDPOINT_REQUEST_METHOD") {
            self.endpoint.request_method = v;
        }
        if let Ok(v) = std::env::var("SEISGATE_ENDPOINT_CONNECTION_LIMIT") {
            if let Ok(n) = v.parse::<usize>() {
                self.endpoint.connection_limit = n;
            }
        }
        if let Ok(v) = std::env::var("SEISGATE_CLIENT_MAX_SIZE") {
            if let Ok(n) = v.parse::<u64>() {
                self.server.client_max_size = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.routing.url.starts_with("http://") && !self.routing.url.starts_with("https://") {
            anyhow::bail!("routing.url must be an http(s) URL: {}", self.routing.url);
        }
        match self.endpoint.request_method.as_str() {
            "GET" | "POST" => {}
            other => anyhow::bail!("endpoint.request_method must be GET or POST, got {other}"),
        }
        if !(0.0..=100.0).contains(&self.retry_budget.threshold) {
            anyhow::bail!(
                "retry_budget.threshold must be within 0..=100, got {}",
                self.retry_budget.threshold
            );
        }
        if self.retry_budget.window_size == 0 {
            anyhow::bail!("retry_budget.window_size must be at least 1");
        }
        if self.federation.pool_size == 0 {
            anyhow::bail!("federation.pool_size must be at least 1");
        }
        for (id, ov) in &self.services {
            if matches!(ov.pool_size, Some(0)) {
                anyhow::bail!("services.{id}.pool_size must be at least 1");
            }
            if matches!(ov.split_duration, Some(0)) {
                anyhow::bail!("services.{id}.split_duration must be at least 1");
            }
        }
        if self.federation.split_duration == 0 {
            anyhow::bail!("federation.split_duration must be at least 1");
        }
        Ok(())
    }
}
