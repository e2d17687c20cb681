//! Expansion Configuration
//!
//! Endpoints, timeouts and namespace seed. Loaded from `XLANG_*` environment
//! variables (after `.env`) or from YAML.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::DEFAULT_CHUNK_SIZE;
use crate::error::{ExpansionError, Result};
use crate::proto::ApiServiceDescriptor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionConfig {
    /// Expansion service address, e.g. `localhost:8097`.
    pub expansion_endpoint: String,
    /// Artifact service address. Empty means "same as the expansion endpoint".
    pub artifact_endpoint: String,
    pub connect_timeout_ms: u64,
    /// Deadline for a unary call, or for the first response of an artifact stream.
    /// Chunks already flowing are not cut off by it.
    pub request_timeout_ms: u64,
    pub namespace_seed: String,
    pub artifact_chunk_size: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            expansion_endpoint: String::new(),
            artifact_endpoint: String::new(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            namespace_seed: "external".to_string(),
            artifact_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ExpansionConfig {
    /// Reads `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("XLANG_EXPANSION_ENDPOINT") {
            config.expansion_endpoint = v;
        }
        if let Some(v) = lookup("XLANG_ARTIFACT_ENDPOINT") {
            config.artifact_endpoint = v;
        }
        if let Some(v) = lookup("XLANG_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = parse("XLANG_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("XLANG_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse("XLANG_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("XLANG_NAMESPACE_SEED") {
            config.namespace_seed = v;
        }
        if let Some(v) = lookup("XLANG_ARTIFACT_CHUNK_SIZE") {
            config.artifact_chunk_size = parse("XLANG_ARTIFACT_CHUNK_SIZE", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ExpansionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ExpansionError::Config("timeouts must be positive".to_string()));
        }
        if self.artifact_chunk_size == 0 {
            return Err(ExpansionError::Config(
                "artifact_chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn expansion_service(&self) -> ApiServiceDescriptor {
        ApiServiceDescriptor {
            url: self.expansion_endpoint.clone(),
        }
    }

    pub fn artifact_service(&self) -> ApiServiceDescriptor {
        let url = if self.artifact_endpoint.is_empty() {
            &self.expansion_endpoint
        } else {
            &self.artifact_endpoint
        };
        ApiServiceDescriptor { url: url.clone() }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ExpansionError::Config(format!("{}={:?}: {}", key, value, e)))
}
