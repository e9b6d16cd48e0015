//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 监控指标模块
//!
//! 将限流器、熔断器和重试队列的运行状态导出为 Prometheus 指标。
//!
//! # 示例
//!
//! ```rust
//! use resilio::telemetry::Metrics;
//!
//! let metrics = Metrics::new().unwrap();
//! metrics.requests_total.inc();
//! assert!(metrics.gather().contains("resilio_requests_total"));
//! ```

use crate::error::{CircuitState, LimiterStats, QueueStats};
use crate::retry_queue::DrainReport;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::error;

/// 监控指标
#[derive(Clone)]
pub struct Metrics {
    /// 受保护调用总数
    pub requests_total: Counter,
    /// 获得执行机会的调用数
    pub requests_allowed: Counter,
    /// 被熔断器拒绝的调用数
    pub requests_rejected: Counter,
    /// 等待令牌被取消的调用数
    pub requests_cancelled: Counter,
    /// 操作失败数
    pub operation_failures: Counter,
    /// 入队数
    pub queue_enqueued: Counter,
    /// 因容量淘汰的条目数
    pub queue_evicted: Counter,
    /// 重放成功数
    pub queue_replayed: Counter,
    /// 等待令牌的耗时分布
    pub permission_wait: Histogram,
    /// 令牌桶当前令牌数
    pub limiter_tokens: Gauge,
    /// 等待中的调用数
    pub limiter_waiters: Gauge,
    /// 熔断器状态（0 关闭, 1 半开, 2 打开）
    pub breaker_state: Gauge,
    /// 重试队列长度
    pub queue_size: Gauge,
    registry: Registry,
}

static GLOBAL_METRICS: OnceLock<Arc<Metrics>> = OnceLock::new();

/// 设置全局指标实例，只有第一次调用生效
pub fn set_global_metrics(metrics: Arc<Metrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

/// 获取全局指标实例
pub fn try_global() -> Option<Arc<Metrics>> {
    GLOBAL_METRICS.get().cloned()
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    /// 创建指标并注册到独立的 Registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let permission_wait = Histogram::with_opts(
            HistogramOpts::new(
                "resilio_permission_wait_seconds",
                "Time spent waiting for a rate limiter token",
            )
            .buckets(vec![0.0, 0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(permission_wait.clone()))?;

        Ok(Self {
            requests_total: counter(
                &registry,
                "resilio_requests_total",
                "Total number of protected invocations",
            )?,
            requests_allowed: counter(
                &registry,
                "resilio_requests_allowed_total",
                "Invocations that reached the operation",
            )?,
            requests_rejected: counter(
                &registry,
                "resilio_requests_rejected_total",
                "Invocations rejected by an open circuit",
            )?,
            requests_cancelled: counter(
                &registry,
                "resilio_requests_cancelled_total",
                "Invocations cancelled while waiting for a token",
            )?,
            operation_failures: counter(
                &registry,
                "resilio_operation_failures_total",
                "Operations that returned an error",
            )?,
            queue_enqueued: counter(
                &registry,
                "resilio_retry_queue_enqueued_total",
                "Operations deferred to the retry queue",
            )?,
            queue_evicted: counter(
                &registry,
                "resilio_retry_queue_evicted_total",
                "Queued operations dropped due to capacity",
            )?,
            queue_replayed: counter(
                &registry,
                "resilio_retry_queue_replayed_total",
                "Queued operations replayed successfully",
            )?,
            permission_wait,
            limiter_tokens: gauge(
                &registry,
                "resilio_limiter_tokens",
                "Tokens currently available in the bucket",
            )?,
            limiter_waiters: gauge(
                &registry,
                "resilio_limiter_waiters",
                "Callers waiting for a token",
            )?,
            breaker_state: gauge(
                &registry,
                "resilio_circuit_breaker_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            )?,
            queue_size: gauge(
                &registry,
                "resilio_retry_queue_size",
                "Operations waiting in the retry queue",
            )?,
            registry,
        })
    }

    /// 收集所有指标，返回 Prometheus 文本格式
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("编码指标失败: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// 记录一次获得令牌的等待
    pub fn record_permission(&self, waited: Duration) {
        self.requests_total.inc();
        self.requests_allowed.inc();
        self.permission_wait.observe(waited.as_secs_f64());
    }

    /// 记录熔断拒绝
    pub fn record_rejection(&self) {
        self.requests_total.inc();
        self.requests_rejected.inc();
    }

    /// 记录等待取消
    pub fn record_cancellation(&self) {
        self.requests_total.inc();
        self.requests_cancelled.inc();
    }

    /// 记录操作失败
    pub fn record_failure(&self) {
        self.operation_failures.inc();
    }

    /// 记录入队
    pub fn record_enqueue(&self, evicted: bool) {
        self.queue_enqueued.inc();
        if evicted {
            self.queue_evicted.inc();
        }
    }

    /// 记录一次排空
    pub fn record_drain(&self, report: &DrainReport) {
        self.queue_replayed.inc_by(report.succeeded as f64);
        self.queue_size.set(report.remaining as f64);
    }

    /// 同步限流器状态
    pub fn observe_limiter(&self, stats: &LimiterStats) {
        self.limiter_tokens.set(stats.available_tokens);
        self.limiter_waiters.set(stats.waiting as f64);
    }

    /// 同步熔断器状态
    pub fn observe_breaker(&self, state: CircuitState) {
        self.breaker_state.set(state.as_gauge());
    }

    /// 同步队列状态
    pub fn observe_queue(&self, stats: &QueueStats) {
        self.queue_size.set(stats.size as f64);
    }
}
