//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! Centralized configuration constants for Resilio.
//!
//! Defaults used by the configuration layer and the component constructors.

// ============================================================================
// Token Bucket Constants
// ============================================================================

/// Default burst capacity of the token bucket.
pub const DEFAULT_BUCKET_CAPACITY: u64 = 20;

/// Default sustained refill rate (tokens per second).
pub const DEFAULT_REFILL_RATE: f64 = 10.0;

/// Fixed-point scale for token accounting.
///
/// One whole token is stored as `TOKEN_SCALE` micro-tokens so that
/// fractional refill progress survives short polling intervals.
pub const TOKEN_SCALE: u64 = 1_000_000;

// ============================================================================
// Circuit Breaker Constants
// ============================================================================

/// Default failure threshold for circuit breaker.
///
/// The circuit breaker transitions to open state after this many failures.
pub const DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD: u64 = 5;

/// Default success threshold for circuit breaker half-open state.
///
/// The circuit breaker transitions to closed state after this many successes in half-open state.
pub const DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD: u64 = 3;

/// Default reset timeout for circuit breaker (60 seconds).
///
/// How long the circuit breaker remains open before attempting to half-open.
pub const DEFAULT_CIRCUIT_BREAKER_RESET_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Retry Queue Constants
// ============================================================================

/// Default maximum number of deferred operations kept for replay.
pub const DEFAULT_RETRY_QUEUE_MAX_SIZE: usize = 100;

/// Default interval of the background drain task (30 seconds).
pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 30;
