//! Configuration management for Turnstile.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Algorithm, FailurePolicy, RateSettings};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Global limiter parameters
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Route identifier to limiter binding
    #[serde(default = "default_routes")]
    pub routes: BTreeMap<String, RouteConfig>,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            limits: LimitsConfig::default(),
            routes: default_routes(),
            debug: false,
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub database: u32,

    /// Per-transaction timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for every key the limiters write
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: 0,
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl StoreConfig {
    /// Connection URL for the store.
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

/// Limiter parameters shared by every route unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Target admitted requests per second
    #[serde(default = "default_rate_threshold")]
    pub rate_threshold: f64,

    /// Ceiling no configured rate threshold may exceed
    #[serde(default = "default_max_rate_threshold")]
    pub max_rate_threshold: f64,

    /// Admitted requests per window
    #[serde(default = "default_tokens_per_bucket")]
    pub tokens_per_bucket: u64,

    /// Decision when the store is unreachable
    #[serde(default)]
    pub on_store_failure: FailurePolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_threshold: default_rate_threshold(),
            max_rate_threshold: default_max_rate_threshold(),
            tokens_per_bucket: default_tokens_per_bucket(),
            on_store_failure: FailurePolicy::default(),
        }
    }
}

fn default_rate_threshold() -> f64 {
    5.0
}

fn default_max_rate_threshold() -> f64 {
    1000.0
}

fn default_tokens_per_bucket() -> u64 {
    10
}

/// Binding of one route to an algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub algorithm: Algorithm,

    /// Overrides `limits.rate_threshold`
    #[serde(default)]
    pub rate_threshold: Option<f64>,

    /// Overrides `limits.tokens_per_bucket`
    #[serde(default)]
    pub tokens_per_bucket: Option<u64>,

    /// Key namespace; defaults to the algorithm name so routes sharing an
    /// algorithm share its counters
    #[serde(default)]
    pub namespace: Option<String>,
}

impl RouteConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            rate_threshold: None,
            tokens_per_bucket: None,
            namespace: None,
        }
    }
}

fn default_routes() -> BTreeMap<String, RouteConfig> {
    [
        ("dummy", Algorithm::Unlimited),
        ("token", Algorithm::TokenBucket),
        ("leaky_token", Algorithm::LeakyBucket),
        ("fixed_window", Algorithm::FixedWindow),
        ("sliding_window_log", Algorithm::SlidingWindowLog),
        ("sliding_window_prorate", Algorithm::SlidingWindowProrate),
    ]
    .into_iter()
    .map(|(route, algorithm)| (route.to_string(), RouteConfig::new(algorithm)))
    .collect()
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `TURNSTILE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TURNSTILE")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that must not serve traffic.
    pub fn validate(&self) -> Result<()> {
        if self.store.key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "store.key_prefix must not be empty".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.routes.is_empty() {
            return Err(TurnstileError::Config(
                "at least one route is required".to_string(),
            ));
        }

        // Routes on one namespace share counters.
        let mut namespaces: BTreeMap<String, (&str, Algorithm, RateSettings)> = BTreeMap::new();
        for (route, route_config) in &self.routes {
            let settings = self.settings_for(route)?;
            let namespace = self.namespace_for(route_config);
            if let Some((other, algorithm, other_settings)) = namespaces.get(&namespace) {
                if *algorithm != route_config.algorithm || *other_settings != settings {
                    return Err(TurnstileError::Config(format!(
                        "routes '{}' and '{}' share namespace '{}' with different limits",
                        other, route, namespace
                    )));
                }
                continue;
            }
            namespaces.insert(namespace, (route.as_str(), route_config.algorithm, settings));
        }
        Ok(())
    }

    /// Effective limiter settings for `route`.
    pub fn settings_for(&self, route: &str) -> Result<RateSettings> {
        let route_config = self
            .routes
            .get(route)
            .ok_or_else(|| TurnstileError::Config(format!("unknown route '{}'", route)))?;

        RateSettings::new(
            route_config
                .tokens_per_bucket
                .unwrap_or(self.limits.tokens_per_bucket),
            route_config
                .rate_threshold
                .unwrap_or(self.limits.rate_threshold),
            self.limits.max_rate_threshold,
        )
        .map_err(|e| match e {
            TurnstileError::Config(msg) => {
                TurnstileError::Config(format!("route '{}': {}", route, msg))
            }
            other => other,
        })
    }

    /// Store key namespace for a route.
    pub fn namespace_for(&self, route_config: &RouteConfig) -> String {
        let suffix = route_config
            .namespace
            .as_deref()
            .unwrap_or_else(|| route_config.algorithm.as_str());
        format!("{}:{}", self.store.key_prefix, suffix)
    }
}
