use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitConfig;
use crate::session::SessionLimits;
use crate::thermal::DegradationDelays;

pub const ENV_CONTEXT_SIZE: &str = "IRIS_CONTEXT_SIZE";
pub const ENV_MAX_NEW_TOKENS: &str = "IRIS_MAX_NEW_TOKENS";
pub const ENV_QUEUE_CAPACITY: &str = "IRIS_QUEUE_CAPACITY";
pub const ENV_RATE_LIMIT_MAX: &str = "IRIS_RATE_LIMIT_MAX";
pub const ENV_RATE_LIMIT_WINDOW_SECS: &str = "IRIS_RATE_LIMIT_WINDOW_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Context window; also the `max_len` handed to the engine.
    pub context_size: usize,
    pub max_new_tokens: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub rate_limit: RateLimitConfig,
    pub degradation: DegradationDelays,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            max_new_tokens: 1024,
            queue_capacity: 3,
            batch_size: 512,
            rate_limit: RateLimitConfig::default(),
            degradation: DegradationDelays::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_str(json).context("parse coordinator config")?;
        Ok(cfg.validated())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read coordinator config {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("load {}", path.display()))
    }

    /// Defaults, then the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `IRIS_*` overrides from `lookup`. Unparsable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring invalid config override");
                    None
                }
            }
        };

        if let Some(v) = parsed(ENV_CONTEXT_SIZE) {
            self.context_size = v as usize;
        }
        if let Some(v) = parsed(ENV_MAX_NEW_TOKENS) {
            self.max_new_tokens = v as usize;
        }
        if let Some(v) = parsed(ENV_QUEUE_CAPACITY) {
            self.queue_capacity = v as usize;
        }
        if let Some(v) = parsed(ENV_RATE_LIMIT_MAX) {
            self.rate_limit.max_requests = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(v) = parsed(ENV_RATE_LIMIT_WINDOW_SECS) {
            self.rate_limit.window_secs = v;
        }
        self.validated()
    }

    /// Zero limits make no sense; clamp them to 1.
    pub fn validated(mut self) -> Self {
        self.context_size = self.context_size.max(1);
        self.max_new_tokens = self.max_new_tokens.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.batch_size = self.batch_size.max(1);
        self.rate_limit.max_requests = self.rate_limit.max_requests.max(1);
        self.rate_limit.window_secs = self.rate_limit.window_secs.max(1);
        self
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            context_size: self.context_size,
            max_new_tokens: self.max_new_tokens,
        }
    }
}
