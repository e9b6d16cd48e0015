//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 受保护调用
//!
//! 将熔断器、令牌桶限流器和重试队列组合成一条调用路径：
//!
//! 1. 熔断器拒绝时立即返回 [`InvokeError::CircuitOpen`]，操作不执行
//! 2. 等待限流器放行
//! 3. 执行操作，并按结果更新熔断器
//! 4. 失败且被判定为瞬时错误时，将操作放入重试队列
//!
//! 原始错误总是返回给调用方。队列的重放由 [`ProtectedInvoker::drain_retry_queue`]
//! 或后台排空任务单独触发。

use crate::circuit_breaker::CircuitBreaker;
use crate::config::ResilienceConfig;
use crate::error::{InvokeError, ResilioError};
use crate::limiters::TokenBucketLimiter;
use crate::retry_queue::{deferred_call, DrainReport, ReplayOutcome, RequestContext, RetryQueue};
#[cfg(feature = "monitoring")]
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 错误分类器
///
/// 判断一个失败是否值得稍后重放（如超时、连接中断），而不是永久错误（如 4xx）。
pub trait ErrorClassifier<E>: Send + Sync {
    fn is_transient(&self, error: &E) -> bool;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_transient(&self, error: &E) -> bool {
        self(error)
    }
}

/// 所有错误都视为瞬时错误
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysTransient;

impl<E> ErrorClassifier<E> for AlwaysTransient {
    fn is_transient(&self, _error: &E) -> bool {
        true
    }
}

/// 所有错误都视为永久错误
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverTransient;

impl<E> ErrorClassifier<E> for NeverTransient {
    fn is_transient(&self, _error: &E) -> bool {
        false
    }
}

/// 受保护调用器
pub struct ProtectedInvoker {
    limiter: Arc<TokenBucketLimiter>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<RetryQueue>,
    drain_interval: Duration,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "monitoring")]
    metrics: Option<Arc<Metrics>>,
}

impl ProtectedInvoker {
    /// 由已有组件组装
    pub fn new(
        limiter: Arc<TokenBucketLimiter>,
        breaker: Arc<CircuitBreaker>,
        queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            limiter,
            breaker,
            queue,
            drain_interval: Duration::from_secs(crate::constants::DEFAULT_DRAIN_INTERVAL_SECS),
            drain_task: Mutex::new(None),
            #[cfg(feature = "monitoring")]
            metrics: None,
        }
    }

    /// 从配置创建
    ///
    /// 启用 `monitoring` 且已通过 [`set_global_metrics`](crate::telemetry::set_global_metrics)
    /// 设置全局指标时，自动附加该指标。
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ResilioError> {
        config.validate().map_err(ResilioError::ConfigError)?;

        let limiter = TokenBucketLimiter::from_config(&config.limiter)?;
        let breaker = CircuitBreaker::from_config(config.circuit_breaker.clone())?;
        let queue = RetryQueue::new(config.retry_queue.max_size);

        let mut invoker = Self::new(Arc::new(limiter), Arc::new(breaker), Arc::new(queue));
        invoker.drain_interval = config.retry_queue.drain_interval;
        #[cfg(feature = "monitoring")]
        {
            invoker.metrics = crate::telemetry::try_global();
            if invoker.metrics.is_some() {
                debug!("受保护调用器使用全局监控指标");
            }
        }
        info!(
            "创建受保护调用器: capacity={}, refill_rate={}, failure_threshold={}, max_queue={}",
            config.limiter.capacity,
            config.limiter.refill_rate,
            config.circuit_breaker.failure_threshold,
            config.retry_queue.max_size
        );
        Ok(invoker)
    }

    /// 附加监控指标
    #[cfg(feature = "monitoring")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 执行受保护的调用
    ///
    /// # 参数
    /// - `context`: 请求上下文，入队时随操作保存
    /// - `operation`: 可重复调用的异步操作
    /// - `classifier`: 判断失败是否为瞬时错误
    ///
    /// # 返回
    /// - `Ok(T)`: 操作成功
    /// - `Err(InvokeError::CircuitOpen)`: 熔断器打开，操作未执行
    /// - `Err(InvokeError::RateLimitCancelled)`: 等待令牌时限流器被关闭
    /// - `Err(InvokeError::OperationFailed(E))`: 操作失败，错误原样返回
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        context: RequestContext,
        operation: F,
        classifier: C,
    ) -> Result<T, InvokeError<E>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        C: ErrorClassifier<E>,
    {
        if !self.breaker.can_make_request() {
            warn!("熔断器打开，拒绝调用: operation={}", context.operation);
            #[cfg(feature = "monitoring")]
            if let Some(metrics) = &self.metrics {
                metrics.record_rejection();
            }
            return Err(InvokeError::CircuitOpen);
        }

        let started = Instant::now();
        if let Err(e) = self.limiter.wait_for_permission().await {
            debug!("等待令牌被取消: operation={}, error={}", context.operation, e);
            #[cfg(feature = "monitoring")]
            if let Some(metrics) = &self.metrics {
                metrics.record_cancellation();
            }
            return Err(InvokeError::RateLimitCancelled);
        }
        let waited = started.elapsed();
        if !waited.is_zero() {
            debug!("获得令牌: operation={}, waited={:?}", context.operation, waited);
        }
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_permission(waited);
            metrics.observe_limiter(&self.limiter.get_stats());
        }

        let result = match operation().await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                #[cfg(feature = "monitoring")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure();
                }

                if classifier.is_transient(&e) {
                    debug!("瞬时错误，操作进入重试队列: operation={}, error={}", context.operation, e);
                    self.defer(context, operation).await;
                } else {
                    debug!("永久错误，不重试: operation={}, error={}", context.operation, e);
                }
                Err(InvokeError::OperationFailed(e))
            }
        };

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_breaker(self.breaker.get_state());
        }
        result
    }

    async fn defer<T, E, F, Fut>(&self, context: RequestContext, operation: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let call = deferred_call(move || {
            let pending = operation();
            async move {
                pending.await?;
                Ok::<(), anyhow::Error>(())
            }
        });

        let outcome = self.queue.enqueue(context, call).await;
        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_enqueue(outcome.warning.is_some());
            metrics.observe_queue(&self.queue.get_stats());
        }
        #[cfg(not(feature = "monitoring"))]
        let _ = outcome;
    }

    /// 重放重试队列
    ///
    /// 每个条目都要经过熔断器和限流器。熔断器打开时整轮跳过，
    /// 排空过程中熔断器打开则剩余条目留到下一轮。
    pub async fn drain_retry_queue(&self) -> DrainReport {
        if !self.breaker.can_make_request() {
            warn!("熔断器打开，跳过重试队列排空: size={}", self.queue.size());
            return DrainReport {
                remaining: self.queue.size(),
                ..Default::default()
            };
        }

        let report = self
            .queue
            .drain_with(|operation| async move {
                if !self.breaker.can_make_request() {
                    return ReplayOutcome::Skipped;
                }
                if self.limiter.wait_for_permission().await.is_err() {
                    return ReplayOutcome::Skipped;
                }
                match operation.replay().await {
                    Ok(()) => {
                        self.breaker.record_success();
                        ReplayOutcome::Succeeded
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        ReplayOutcome::Failed(e)
                    }
                }
            })
            .await;

        #[cfg(feature = "monitoring")]
        if let Some(metrics) = &self.metrics {
            metrics.record_drain(&report);
            metrics.observe_breaker(self.breaker.get_state());
        }
        report
    }

    /// 启动后台排空任务
    ///
    /// 任务只持有弱引用，调用器释放后自动退出。重复调用会替换旧任务。
    pub fn start_drain_task(self: &Arc<Self>, interval: Duration) {
        let interval = if interval.is_zero() {
            self.drain_interval
        } else {
            interval
        };
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(invoker) = weak.upgrade() else {
                    break;
                };
                if !invoker.queue.is_empty() {
                    invoker.drain_retry_queue().await;
                }
            }
            debug!("后台排空任务退出");
        });

        if let Some(previous) = self.drain_task.lock().replace(handle) {
            previous.abort();
        }
        info!("启动后台排空任务: interval={:?}", interval);
    }

    /// 停止后台排空任务
    pub fn stop_drain_task(&self) {
        if let Some(handle) = self.drain_task.lock().take() {
            handle.abort();
            info!("停止后台排空任务");
        }
    }

    /// 后台排空任务是否在运行
    pub fn is_draining(&self) -> bool {
        self.drain_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 关闭调用器
    ///
    /// 停止排空任务并关闭限流器，等待中的调用返回 `RateLimitCancelled`。
    pub fn shutdown(&self) {
        self.stop_drain_task();
        self.limiter.shutdown();
        info!("受保护调用器已关闭: pending_retries={}", self.queue.size());
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    /// 配置中的排空间隔
    pub fn drain_interval(&self) -> Duration {
        self.drain_interval
    }
}

impl Drop for ProtectedInvoker {
    fn drop(&mut self) {
        if let Some(handle) = self.drain_task.get_mut().take() {
            handle.abort();
        }
    }
}
