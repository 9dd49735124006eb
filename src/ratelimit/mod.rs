//! Rate limiting algorithms and admission dispatch.

mod admit;
mod algorithm;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod router;
mod sliding_log;
mod sliding_prorate;
mod token_bucket;
mod window;

pub use admit::{Admit, AdmitError, Decision};
pub use algorithm::{Algorithm, Unlimited};
pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use limiter::{FailurePolicy, RateLimiter};
pub use router::Router;
pub use sliding_log::SlidingWindowLog;
pub use sliding_prorate::SlidingWindowProrate;
pub use token_bucket::TokenBucket;
pub use window::RateSettings;
