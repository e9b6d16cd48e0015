//! Prelude module - Commonly used types for quick imports
//!
//! This module re-exports the most commonly used types from Resilio,
//! allowing users to import them with a single `use resilio::prelude::*;`
//! statement instead of importing each type individually.

// Core types - always available
pub use crate::config::ResilienceConfig;
pub use crate::error::{InvokeError, ResilioError};
pub use crate::invoker::{AlwaysTransient, ErrorClassifier, NeverTransient, ProtectedInvoker};

// Components
pub use crate::circuit_breaker::CircuitBreaker;
pub use crate::limiters::TokenBucketLimiter;
pub use crate::retry_queue::{RequestContext, RetryQueue};

// Feature-gated exports
#[cfg(feature = "monitoring")]
pub use crate::telemetry::Metrics;
