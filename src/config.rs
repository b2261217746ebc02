use crate::errors::{AppError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Admission-control settings: the policy table plus store tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Upper bound on distinct tracked keys before LRU eviction kicks in
    pub max_tracked_keys: usize,
    /// Interval between background sweeps of expired window entries
    pub sweep_interval_seconds: u64,
    /// Bound on principal resolution before falling back to the IP key
    pub principal_resolve_timeout_ms: u64,
    /// Named policies, one per route class (default, auth, upload, ...)
    pub policies: HashMap<String, PolicyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
    #[serde(default)]
    pub skip_successful: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        // Determine environment
        let environment = env::var("GATEKEEPER_ENV").unwrap_or_else(|_| "development".to_string());

        // Build configuration
        let config = config::Config::builder()
            // Start with default config
            .add_source(config::File::with_name("config/default"))
            // Add environment-specific config
            .add_source(config::File::with_name(&format!("config/{}", environment)).required(false))
            // Add environment variables with prefix GATEKEEPER
            // e.g., GATEKEEPER__SERVER__PORT=8080
            .add_source(
                config::Environment::with_prefix("GATEKEEPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Configuration(e.to_string()))?;

        // Deserialize into our Config struct
        config
            .try_deserialize()
            .map_err(|e| AppError::Configuration(e.to_string()))
    }

    /// Validate configuration; invalid policies must fail before serving traffic
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Configuration("Invalid port number".to_string()));
        }

        if self.rate_limit.max_tracked_keys == 0 {
            return Err(AppError::Configuration(
                "max_tracked_keys must be positive".to_string(),
            ));
        }

        if self.rate_limit.sweep_interval_seconds == 0 {
            return Err(AppError::Configuration(
                "sweep_interval_seconds must be positive".to_string(),
            ));
        }

        if !self.rate_limit.policies.contains_key("default") {
            return Err(AppError::Configuration(
                "A 'default' rate limit policy is required".to_string(),
            ));
        }

        for (name, policy) in &self.rate_limit.policies {
            if policy.max_requests == 0 {
                return Err(AppError::Configuration(format!(
                    "Policy '{}': max_requests must be positive",
                    name
                )));
            }
            if policy.window_seconds == 0 {
                return Err(AppError::Configuration(format!(
                    "Policy '{}': window_seconds must be positive",
                    name
                )));
            }
        }

        Ok(())
    }
}
