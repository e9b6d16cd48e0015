//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 熔断器实现
//!
//! 提供熔断器功能，支持三状态转换和惰性恢复探测。
//!
//! # 特性
//!
//! - **三状态**: Closed（关闭）、Open（打开）、HalfOpen（半开）
//! - **自动熔断**: 失败次数达到阈值自动熔断
//! - **惰性恢复**: 不使用后台定时器，Open → HalfOpen 在 `can_make_request` 中判定
//! - **线性一致**: 所有状态由一把互斥锁保护，每个操作原子完成
//! - **统计信息**: 提供详细的统计信息

pub use crate::config::CircuitBreakerConfig;
use crate::error::{CircuitBreakerStats, CircuitState, InvokeError, ResilioError};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, trace, warn};

/// 熔断器内部状态
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    total_calls: u64,
    rejected_calls: u64,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.last_state_change = Instant::now();
        match to {
            CircuitState::Open => warn!(
                "熔断器状态变更: {:?} -> Open (failure_count={})",
                from, self.failure_count
            ),
            _ => info!("熔断器状态变更: {:?} -> {:?}", from, to),
        }
    }
}

/// 熔断器
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// 创建新的熔断器
    ///
    /// # 参数
    /// - `config`: 熔断器配置
    ///
    /// # 示例
    /// ```rust
    /// use resilio::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    ///
    /// let config = CircuitBreakerConfig::new(5, 3, Duration::from_secs(60));
    /// let breaker = CircuitBreaker::new(config);
    /// assert!(breaker.can_make_request());
    /// ```
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            "创建熔断器: failure_threshold={}, success_threshold={}, reset_timeout={:?}",
            config.failure_threshold, config.success_threshold, config.reset_timeout
        );

        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_calls: 0,
                rejected_calls: 0,
                last_failure_time: None,
                last_state_change: Instant::now(),
            }),
            config,
        }
    }

    /// 从配置创建，配置无效时返回错误
    pub fn from_config(config: CircuitBreakerConfig) -> Result<Self, ResilioError> {
        config.validate().map_err(ResilioError::ConfigError)?;
        Ok(Self::new(config))
    }

    /// 当前是否允许发起请求
    ///
    /// Open 状态下，距最后一次失败超过 `reset_timeout` 时转为 HalfOpen 并放行。
    pub fn can_make_request(&self) -> bool {
        let mut state = self.state.lock();
        state.total_calls += 1;

        let allowed = match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.reset_timeout {
                    state.success_count = 0;
                    state.transition(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            state.rejected_calls += 1;
            trace!("熔断器打开，拒绝请求");
        }
        allowed
    }

    /// 记录一次成功
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.transition(CircuitState::Closed);
                } else {
                    trace!(
                        "操作成功（半开状态）: {}/{}",
                        state.success_count,
                        self.config.success_threshold
                    );
                }
            }
            CircuitState::Open => {
                warn!("熔断器打开状态下收到成功响应");
            }
        }
    }

    /// 记录一次失败
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                state.last_failure_time = Some(Instant::now());
                if state.failure_count >= self.config.failure_threshold {
                    state.transition(CircuitState::Open);
                } else {
                    trace!(
                        "操作失败（关闭状态）: {}/{}",
                        state.failure_count,
                        self.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                // 探测失败，立即回到打开状态
                state.failure_count = self.config.failure_threshold;
                state.success_count = 0;
                state.last_failure_time = Some(Instant::now());
                state.transition(CircuitState::Open);
            }
            CircuitState::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// 执行操作，自动处理熔断逻辑
    ///
    /// # 返回
    /// - `Ok(T)`: 操作成功
    /// - `Err(InvokeError::CircuitOpen)`: 熔断器打开，操作未执行
    /// - `Err(InvokeError::OperationFailed(E))`: 操作失败
    ///
    /// # 示例
    /// ```rust
    /// use resilio::circuit_breaker::CircuitBreaker;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let breaker = CircuitBreaker::default();
    /// let result = breaker.execute(|| async { Ok::<u32, std::io::Error>(7) }).await;
    /// assert_eq!(result.unwrap(), 7);
    /// # }
    /// ```
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, InvokeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_make_request() {
            return Err(InvokeError::CircuitOpen);
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(InvokeError::OperationFailed(e))
            }
        }
    }

    /// 检查熔断器是否打开
    pub fn is_open(&self) -> bool {
        self.get_state() == CircuitState::Open
    }

    /// 检查熔断器是否半开
    pub fn is_half_open(&self) -> bool {
        self.get_state() == CircuitState::HalfOpen
    }

    /// 检查熔断器是否关闭
    pub fn is_closed(&self) -> bool {
        self.get_state() == CircuitState::Closed
    }

    /// 获取当前状态（不触发 Open → HalfOpen 判定）
    pub fn get_state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// 当前失败计数
    pub fn failure_count(&self) -> u64 {
        self.state.lock().failure_count
    }

    /// 当前成功计数（半开状态）
    pub fn success_count(&self) -> u64 {
        self.state.lock().success_count
    }

    /// 重置熔断器到关闭状态
    pub fn reset(&self) {
        info!("重置熔断器");
        let mut state = self.state.lock();
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
        state.transition(CircuitState::Closed);
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_calls: state.total_calls,
            rejected_calls: state.rejected_calls,
            last_failure_time: state.last_failure_time.and_then(to_wall_clock),
            last_state_change: to_wall_clock(state.last_state_change),
        }
    }

    /// 获取配置
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// 将单调时钟时间换算为墙钟时间
fn to_wall_clock(instant: Instant) -> Option<chrono::DateTime<chrono::Utc>> {
    let duration = chrono::Duration::from_std(instant.elapsed()).ok()?;
    Some(chrono::Utc::now() - duration)
}
