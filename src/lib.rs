//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Resilio - Client-side Resilience Core
//!
//! Protects a remote service from overload and keeps the caller's request
//! flow correct under partial failure.
//!
//! # API Layers
//!
//! ## Prelude (Quick Start)
//!
//! Use `use resilio::prelude::*;` to import all commonly used types.
//!
//! ## Components
//!
//! - [`TokenBucketLimiter`] - Admission control with FIFO waiters
//! - [`CircuitBreaker`] - Closed / Open / HalfOpen failure tracking
//! - [`RetryQueue`] - Bounded drop-oldest queue of deferred operations
//! - [`ProtectedInvoker`] - Composes the three into one invocation path
//!
//! ## Extensions (feature-gated)
//!
//! - Prometheus metrics (requires `monitoring` feature)
//! - Demo binary (requires `demo` feature)
//!
//! # Examples
//!
//! ```rust
//! use resilio::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let invoker = ProtectedInvoker::from_config(&ResilienceConfig::default()).unwrap();
//!
//!     let result = invoker
//!         .execute(
//!             RequestContext::new("classify"),
//!             || async { Ok::<_, std::io::Error>("cat") },
//!             |e: &std::io::Error| e.kind() == std::io::ErrorKind::TimedOut,
//!         )
//!         .await;
//!     assert_eq!(result.unwrap(), "cat");
//! }
//! ```

pub mod prelude;

pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod error;
pub mod invoker;
pub mod invoker_manager;
pub mod limiters;
pub mod retry_queue;
#[cfg(feature = "monitoring")]
pub mod telemetry;

// 重新导出常用类型
pub use circuit_breaker::CircuitBreaker;
pub use config::{
    CircuitBreakerConfig, RateLimiterConfig, ResilienceConfig, RetryQueueConfig,
};
pub use error::{
    CircuitBreakerStats, CircuitState, InvokeError, LimiterStats, QueueStats, ResilioError,
    StorageError,
};
pub use invoker::{AlwaysTransient, ErrorClassifier, NeverTransient, ProtectedInvoker};
pub use invoker_manager::{InvokerManager, GLOBAL_INVOKER_MANAGER};
pub use limiters::TokenBucketLimiter;
pub use retry_queue::{
    deferred_call, DeferredCall, DrainReport, EnqueueOutcome, MemoryQueueStore, QueueFullWarning,
    QueueStore, QueuedOperation, QueuedRecord, ReplayOutcome, RequestContext, RetryQueue,
};
#[cfg(feature = "monitoring")]
pub use telemetry::{set_global_metrics, try_global, Metrics};
