//! Turnstile - Admission Control Against a Shared Counter Store
//!
//! This crate decides, per request, whether to admit or reject it so that
//! aggregate traffic stays under a configured rate. Five algorithms are
//! provided, each performing exactly one atomic transaction per decision
//! against a counter store shared by every process serving traffic.

pub mod clock;
pub mod config;
pub mod error;
pub mod probe;
pub mod ratelimit;
pub mod store;
