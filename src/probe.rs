//! Synthetic load harness.
//!
//! Offers requests to a route at a fixed rate and measures how many are
//! admitted, for checking a deployment against its configured threshold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{AdmitError, Decision, Router};

/// Highest offered rate, in requests per second.
pub const MAX_RATE: f64 = 100_000.0;

/// Most requests a single run may offer.
pub const MAX_REQUESTS: u64 = 1_000_000;

/// Outcome of one probe run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub route: String,
    pub algorithm: String,
    /// Offered requests per second
    pub target_rate: f64,
    pub duration_secs: f64,
    pub offered: u64,
    pub allowed: u64,
    pub denied: u64,
    pub errors: u64,
    /// Admitted requests per second over the run
    pub observed_rate: f64,
    /// Share of offered requests admitted
    pub accept_ratio: f64,
}

impl std::fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): offered {:.2}/s for {:.1}s -> {} allowed, {} denied, {} errors; observed {:.2}/s ({:.0}% accepted)",
            self.route,
            self.algorithm,
            self.target_rate,
            self.duration_secs,
            self.allowed,
            self.denied,
            self.errors,
            self.observed_rate,
            self.accept_ratio * 100.0,
        )
    }
}

/// Offer `rate` requests per second to `route` for `duration`.
///
/// Each request runs as its own task so a slow store does not lower the
/// offered rate.
pub async fn run(
    router: &Router,
    route: &str,
    rate: f64,
    duration: Duration,
) -> Result<ProbeReport> {
    if !rate.is_finite() || rate <= 0.0 || rate > MAX_RATE {
        return Err(TurnstileError::Config(format!(
            "probe rate must be in (0, {}], got {}",
            MAX_RATE, rate
        )));
    }
    let limiter = router
        .get(route)
        .ok_or_else(|| AdmitError::RouteNotFound(route.to_string()))?;

    let total = (rate * duration.as_secs_f64()).round().max(1.0);
    if total > MAX_REQUESTS as f64 {
        return Err(TurnstileError::Config(format!(
            "probe would offer {} requests, more than the limit of {}",
            total, MAX_REQUESTS
        )));
    }
    let total = total as u64;
    let period = Duration::try_from_secs_f64(1.0 / rate)
        .ok()
        .filter(|period| !period.is_zero())
        .ok_or_else(|| {
            TurnstileError::Config(format!("probe rate {} has no usable tick period", rate))
        })?;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    info!(route = %route, rate = rate, requests = total, "Starting probe");
    let started = Instant::now();

    let mut pending = Vec::with_capacity(total as usize);
    for _ in 0..total {
        ticker.tick().await;
        let limiter = Arc::clone(&limiter);
        pending.push(tokio::spawn(async move { limiter.admit().await }));
    }

    let (mut allowed, mut denied, mut errors) = (0, 0, 0);
    for outcome in join_all(pending).await {
        match outcome {
            Ok(Ok(Decision::Allow)) => allowed += 1,
            Ok(Ok(Decision::Deny)) => denied += 1,
            Ok(Err(err)) => {
                debug!(error = %err, "Probe request failed");
                errors += 1;
            }
            Err(err) => {
                debug!(error = %err, "Probe task failed");
                errors += 1;
            }
        }
    }

    let duration_secs = duration.as_secs_f64();
    let report = ProbeReport {
        route: route.to_string(),
        algorithm: limiter.algorithm().to_string(),
        target_rate: rate,
        duration_secs,
        offered: total,
        allowed,
        denied,
        errors,
        observed_rate: allowed as f64 / duration_secs,
        accept_ratio: allowed as f64 / total as f64,
    };
    info!(
        route = %route,
        elapsed_ms = started.elapsed().as_millis() as u64,
        allowed = report.allowed,
        denied = report.denied,
        errors = report.errors,
        observed_rate = report.observed_rate,
        "Probe finished"
    );
    Ok(report)
}

/// Probe at half, exactly, and twice the route's threshold.
pub async fn sweep(
    router: &Router,
    route: &str,
    rate_threshold: f64,
    duration: Duration,
) -> Result<Vec<ProbeReport>> {
    let mut reports = Vec::with_capacity(3);
    for rate in [rate_threshold / 2.0, rate_threshold, rate_threshold * 2.0] {
        reports.push(run(router, route, rate, duration).await?);
    }
    Ok(reports)
}
