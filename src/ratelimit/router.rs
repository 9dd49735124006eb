//! Route dispatch.
//!
//! Maps route identifiers to their limiters. The request layer calls
//! [`Router::admit`] once per request and answers 429 on `Deny`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument, trace};

use super::admit::{AdmitError, Decision};
use super::algorithm::Algorithm;
use super::limiter::RateLimiter;
use crate::clock::{Clock, SystemClock};
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::store::{CounterStore, RedisStore};

/// Route identifier to rate limiter mapping.
///
/// All limiters share one store handle, built once at startup.
pub struct Router {
    routes: BTreeMap<String, Arc<RateLimiter>>,
}

impl Router {
    /// Create a router with no routes.
    pub fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    /// Build every configured route against `store`, reading time from `clock`.
    pub fn from_config(
        config: &TurnstileConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut router = Router::new();
        for (route, route_config) in &config.routes {
            let settings = config.settings_for(route)?;
            let namespace = config.namespace_for(route_config);
            let strategy = route_config
                .algorithm
                .build(store.clone(), clock.clone(), settings, &namespace);

            info!(
                route = %route,
                algorithm = %route_config.algorithm,
                capacity = settings.capacity(),
                rate_threshold = settings.rate_threshold(),
                window_secs = settings.window_secs(),
                namespace = %namespace,
                "Registered rate limiter"
            );
            router.insert(RateLimiter::new(
                route.clone(),
                strategy,
                config.limits.on_store_failure,
            ));
        }
        Ok(router)
    }

    /// Connect to the configured Redis store and build every route on it,
    /// using the wall clock.
    pub async fn connect(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;
        let store = RedisStore::connect(&config.store.url(), config.store.timeout()).await?;
        Self::from_config(config, Arc::new(store), Arc::new(SystemClock))
    }

    /// Register a limiter under its route, replacing any previous one.
    pub fn insert(&mut self, limiter: RateLimiter) {
        self.routes
            .insert(limiter.route().to_string(), Arc::new(limiter));
    }

    /// The limiter for `route`, if any.
    pub fn get(&self, route: &str) -> Option<Arc<RateLimiter>> {
        self.routes.get(route).cloned()
    }

    /// Registered routes and their algorithms, sorted by route.
    pub fn routes(&self) -> impl Iterator<Item = (&str, Algorithm)> {
        self.routes
            .iter()
            .map(|(route, limiter)| (route.as_str(), limiter.algorithm()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Decide whether a request on `route` may proceed.
    #[instrument(skip(self))]
    pub async fn admit(&self, route: &str) -> std::result::Result<Decision, AdmitError> {
        let limiter = self
            .routes
            .get(route)
            .ok_or_else(|| AdmitError::RouteNotFound(route.to_string()))?;

        let decision = limiter.admit().await?;
        trace!(decision = ?decision, "Admission decided");
        Ok(decision)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
