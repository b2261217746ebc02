use crate::config::RateLimitConfig;
use crate::errors::{AppError, Result};
use crate::rate_limit::key::KeyGenerator;
use std::collections::HashMap;
use std::sync::Arc;

/// One class of routes' admission rules. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Policy {
    pub max_requests: u32,
    pub window_seconds: u64,
    /// When true, only previously-rejected requests count toward the quota.
    /// Used for auth-style endpoints that should throttle failed attempts.
    pub skip_successful: bool,
    pub key_generator: KeyGenerator,
}

impl Policy {
    pub fn new(max_requests: u32, window_seconds: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(AppError::Configuration(
                "max_requests must be positive".to_string(),
            ));
        }
        if window_seconds == 0 {
            return Err(AppError::Configuration(
                "window_seconds must be positive".to_string(),
            ));
        }
        Ok(Self {
            max_requests,
            window_seconds,
            skip_successful: false,
            key_generator: KeyGenerator::AddressBased,
        })
    }

    pub fn with_skip_successful(mut self, skip_successful: bool) -> Self {
        self.skip_successful = skip_successful;
        self
    }

    pub fn window_millis(&self) -> u64 {
        self.window_seconds * 1000
    }
}

/// Static table of named policies, one per route class.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    /// Build the registry from configuration, failing fast on any invalid
    /// policy so a misconfigured limiter never serves traffic.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let mut policies = HashMap::new();

        for (name, policy_config) in &config.policies {
            let policy = Policy::new(policy_config.max_requests, policy_config.window_seconds)
                .map_err(|e| AppError::Configuration(format!("Policy '{}': {}", name, e)))?
                .with_skip_successful(policy_config.skip_successful);
            policies.insert(name.clone(), Arc::new(policy));
        }

        if !policies.contains_key("default") {
            return Err(AppError::Configuration(
                "A 'default' rate limit policy is required".to_string(),
            ));
        }

        Ok(Self { policies })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies.get(name).cloned()
    }

    /// Override the key strategy for one policy, e.g. to attach a
    /// principal resolver to the auth class. Validated at startup.
    pub fn set_key_generator(&mut self, name: &str, generator: KeyGenerator) -> Result<()> {
        match self.policies.get_mut(name) {
            Some(policy) => {
                let mut updated = (**policy).clone();
                updated.key_generator = generator;
                *policy = Arc::new(updated);
                Ok(())
            }
            None => Err(AppError::Configuration(format!(
                "Cannot set key generator: unknown policy '{}'",
                name
            ))),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
