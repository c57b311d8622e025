pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used so the gateway starts with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
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
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    /// Environment variable overrides for connection/infra settings.
    /// Rate-limit rules are never sourced from the environment; they arrive
    /// through the admin surface (or the optional preload file).
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORTCULLIS_UPSTREAM_URL") {
            self.upstream.url = v;
        }
        if let Ok(v) = std::env::var("PORTCULLIS_STORE_URL") {
            self.store.url = v;
        }
        if let Ok(v) = std::env::var("PORTCULLIS_STORE_BACKEND") {
            self.store.backend = v;
        }
        if let Ok(v) = std::env::var("PORTCULLIS_ANALYTICS_DATABASE_URL") {
            self.analytics.database_url = v;
        }
        if let Ok(v) = std::env::var("PORTCULLIS_ANALYTICS_ENABLED") {
            self.analytics.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("PORTCULLIS_TRUST_FORWARDED_FOR") {
            self.proxy.trust_forwarded_for = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("PORTCULLIS_RULES_FILE") {
            self.rules.file = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.proxy.path_prefix.starts_with('/') {
            anyhow::bail!("proxy.path_prefix must start with '/'");
        }
        match self.store.backend.as_str() {
            "redis" | "memory" => {}
            other => anyhow::bail!("store.backend must be \"redis\" or \"memory\", got {other:?}"),
        }
        if self.limiter.limit == 0 {
            anyhow::bail!("limiter.limit must be positive");
        }
        if self.limiter.window.is_zero() {
            anyhow::bail!("limiter.window must be positive");
        }
        if self.broker.subscriber_capacity == 0 {
            anyhow::bail!("broker.subscriber_capacity must be positive");
        }
        if self.analytics.buffer == 0 || self.analytics.batch_size == 0 {
            anyhow::bail!("analytics.buffer and analytics.batch_size must be positive");
        }
        // Upstream URL shape is checked here so a malformed target fails at
        // startup instead of on the first proxied request.
        crate::upstream::validate_base_url(&self.upstream.url)
            .map_err(|e| anyhow::anyhow!("upstream.url: {e}"))?;
        Ok(())
    }
}
