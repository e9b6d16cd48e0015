//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 限流器模块
//!
//! 令牌桶准入控制：以 `refill_rate` 的稳定速率放行请求，允许最多 `capacity` 的突发。
//!
//! # 特性
//!
//! - **定点计数**: 令牌以百万分之一为单位记账，短间隔轮询不会丢失小数进度
//! - **FIFO 公平**: 等待者严格按到达顺序获得令牌，新请求不会插队
//! - **共享调度**: 每个限流器只有一个补充调度任务，每攒够一个令牌唤醒队首一个等待者
//! - **可取消**: 丢弃等待中的 future 会移除等待项，竞态下已发放的令牌会被退回

use crate::config::RateLimiterConfig;
use crate::constants::{DEFAULT_REFILL_RATE, TOKEN_SCALE};
use crate::error::{LimiterStats, ResilioError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// 每个微令牌对应的纳秒数（速率为 1 令牌/秒时）
const NANOS_PER_MICRO_TOKEN: f64 = (1_000_000_000 / TOKEN_SCALE) as f64;

/// 排队中的等待者
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

/// 令牌桶的可变状态，只在持有互斥锁时访问
struct BucketState {
    /// 当前令牌数（微令牌）
    tokens: u64,
    /// 最后补充时间
    last_refill: Instant,
    /// FIFO 等待队列
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    /// 已关闭，不再发放令牌
    closed: bool,
    granted_total: u64,
    queued_grants: u64,
    cancelled_waits: u64,
}

/// 调度任务与限流器共享的部分
struct BucketShared {
    capacity: u64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    wakeup: Notify,
}

impl BucketShared {
    fn max_tokens(&self) -> u64 {
        self.capacity.saturating_mul(TOKEN_SCALE)
    }

    /// 按流逝时间补充令牌
    ///
    /// 时间戳只推进补充的微令牌所对应的时长，不足一个微令牌的余量留到下次；
    /// 桶满时余量作废，时间戳直接对齐到当前时刻。
    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let added = (elapsed.as_nanos() as f64 * self.refill_rate / NANOS_PER_MICRO_TOKEN) as u64;
        if added == 0 {
            return;
        }

        let tokens = state.tokens.saturating_add(added);
        if tokens >= self.max_tokens() {
            state.tokens = self.max_tokens();
            state.last_refill = now;
        } else {
            state.tokens = tokens;
            let consumed = (added as f64 * NANOS_PER_MICRO_TOKEN / self.refill_rate) as u64;
            state.last_refill = (state.last_refill + Duration::from_nanos(consumed)).min(now);
        }
    }

    /// 按 FIFO 顺序为等待者发放令牌，直到令牌或等待者耗尽
    fn grant_waiters(&self, state: &mut BucketState) {
        while state.tokens >= TOKEN_SCALE {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };

            state.tokens -= TOKEN_SCALE;
            if waiter.grant.send(()).is_err() {
                // 接收端已丢弃，令牌退回给下一个等待者
                state.tokens += TOKEN_SCALE;
                state.cancelled_waits += 1;
                continue;
            }

            state.granted_total += 1;
            state.queued_grants += 1;
            trace!("令牌发放给等待者: id={}", waiter.id);
        }
    }

    /// 距离下一个整令牌的时间；没有等待者时返回 None
    fn next_token_in(&self, state: &BucketState) -> Option<Duration> {
        if state.waiters.is_empty() {
            return None;
        }
        let deficit = TOKEN_SCALE.saturating_sub(state.tokens);
        let nanos = (deficit as f64 * NANOS_PER_MICRO_TOKEN / self.refill_rate).ceil();
        Some(Duration::from_nanos(nanos as u64))
    }

    fn available_tokens(&self, state: &BucketState) -> f64 {
        state.tokens as f64 / TOKEN_SCALE as f64
    }
}

/// 令牌桶限流器
///
/// 令牌以恒定速率补充到桶中，请求到达时消费一个令牌；
/// 令牌不足时请求进入 FIFO 队列挂起，直到轮到它并攒够令牌。
///
/// # 示例
/// ```rust
/// use resilio::limiters::TokenBucketLimiter;
///
/// #[tokio::main]
/// async fn main() {
///     // 容量为 20，补充速率为 10 令牌/秒
///     let limiter = TokenBucketLimiter::new(20, 10.0);
///
///     limiter.wait_for_permission().await.unwrap();
///     assert!(limiter.available_tokens() < 20.0);
/// }
/// ```
pub struct TokenBucketLimiter {
    shared: Arc<BucketShared>,
    /// 补充调度任务句柄
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl TokenBucketLimiter {
    /// 创建新的令牌桶限流器
    ///
    /// # 参数
    /// - `capacity`: 桶的最大容量（至少为 1）
    /// - `refill_rate`: 令牌补充速率（令牌/秒），非正数时退回默认值
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let refill_rate = if refill_rate.is_finite() && refill_rate > 0.0 {
            refill_rate
        } else {
            warn!(
                "无效的填充速率 {}，使用默认值 {}",
                refill_rate, DEFAULT_REFILL_RATE
            );
            DEFAULT_REFILL_RATE
        };

        info!(
            "创建令牌桶限流器: capacity={}, refill_rate={}/s",
            capacity, refill_rate
        );

        Self {
            shared: Arc::new(BucketShared {
                capacity,
                refill_rate,
                state: Mutex::new(BucketState {
                    tokens: capacity.saturating_mul(TOKEN_SCALE),
                    last_refill: Instant::now(),
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    closed: false,
                    granted_total: 0,
                    queued_grants: 0,
                    cancelled_waits: 0,
                }),
                wakeup: Notify::new(),
            }),
            scheduler: Mutex::new(None),
        }
    }

    /// 从配置创建，配置无效时返回错误
    pub fn from_config(config: &RateLimiterConfig) -> Result<Self, ResilioError> {
        config.validate().map_err(ResilioError::ConfigError)?;
        Ok(Self::new(config.capacity, config.refill_rate))
    }

    /// 等待并消费一个令牌
    ///
    /// 只挂起当前任务。等待者严格按调用顺序获得令牌；
    /// 丢弃返回的 future 即取消等待，不会消耗令牌。
    ///
    /// # 返回
    /// - `Ok(())`: 已消费一个令牌
    /// - `Err(ResilioError::RateLimitCancelled)`: 限流器在等待期间被关闭
    pub async fn wait_for_permission(&self) -> Result<(), ResilioError> {
        let (id, receiver, was_idle) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(ResilioError::RateLimitCancelled);
            }

            self.shared.refill(&mut state, Instant::now());

            if state.waiters.is_empty() && state.tokens >= TOKEN_SCALE {
                state.tokens -= TOKEN_SCALE;
                state.granted_total += 1;
                return Ok(());
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (grant, receiver) = oneshot::channel();
            let was_idle = state.waiters.is_empty();
            state.waiters.push_back(Waiter { id, grant });
            debug!("令牌不足，进入等待队列: id={}, queued={}", id, state.waiters.len());
            (id, receiver, was_idle)
        };

        self.ensure_scheduler();
        if was_idle {
            self.shared.wakeup.notify_one();
        }

        let mut pending = PendingWait {
            shared: &self.shared,
            id,
            receiver,
            finished: false,
        };

        let result = (&mut pending.receiver).await;
        pending.finished = true;
        result.map_err(|_| ResilioError::RateLimitCancelled)
    }

    /// 带超时的等待
    ///
    /// 超时后等待项被移除，返回 `RateLimitTimeout`。
    pub async fn wait_for_permission_timeout(&self, deadline: Duration) -> Result<(), ResilioError> {
        match tokio::time::timeout(deadline, self.wait_for_permission()).await {
            Ok(result) => result,
            Err(_) => {
                debug!("等待令牌超时: {:?}", deadline);
                Err(ResilioError::RateLimitTimeout(deadline))
            }
        }
    }

    /// 非阻塞地尝试消费一个令牌
    ///
    /// 有等待者排队时总是失败，保证不插队。
    pub fn try_acquire(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        self.shared.refill(&mut state, Instant::now());
        if state.waiters.is_empty() && state.tokens >= TOKEN_SCALE {
            state.tokens -= TOKEN_SCALE;
            state.granted_total += 1;
            true
        } else {
            false
        }
    }

    /// 当前是否有可用的整令牌（不消费）
    pub fn can_make_request(&self) -> bool {
        let mut state = self.shared.state.lock();
        self.shared.refill(&mut state, Instant::now());
        state.tokens >= TOKEN_SCALE
    }

    /// 重置令牌桶为满，并立即按顺序唤醒等待者
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.tokens = self.shared.max_tokens();
        state.last_refill = Instant::now();
        let queued = state.waiters.len();
        self.shared.grant_waiters(&mut state);
        drop(state);

        self.shared.wakeup.notify_one();
        info!("重置令牌桶: capacity={}, resumed_waiters={}", self.shared.capacity, queued);
    }

    /// 关闭限流器
    ///
    /// 停止调度任务，所有等待者收到 `RateLimitCancelled`，之后的等待立即失败。
    pub fn shutdown(&self) {
        let waiters: Vec<Waiter> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.waiters.drain(..).collect()
        };
        let cancelled = waiters.len();
        drop(waiters);

        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
        info!("关闭令牌桶限流器: cancelled_waiters={}", cancelled);
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// 当前可用令牌数（含小数部分）
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.shared.state.lock();
        self.shared.refill(&mut state, Instant::now());
        self.shared.available_tokens(&state)
    }

    /// 排队中的等待者数量
    pub fn waiting_count(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// 桶容量
    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// 补充速率（令牌/秒）
    pub fn refill_rate(&self) -> f64 {
        self.shared.refill_rate
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> LimiterStats {
        let mut state = self.shared.state.lock();
        self.shared.refill(&mut state, Instant::now());
        LimiterStats {
            capacity: self.shared.capacity,
            available_tokens: self.shared.available_tokens(&state),
            waiting: state.waiters.len(),
            granted_total: state.granted_total,
            queued_grants: state.queued_grants,
            cancelled_waits: state.cancelled_waits,
        }
    }

    /// 确保调度任务在运行
    fn ensure_scheduler(&self) {
        let mut scheduler = self.scheduler.lock();
        let running = scheduler
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        if !running {
            debug!("启动令牌补充调度任务");
            *scheduler = Some(tokio::spawn(Self::run_scheduler(Arc::clone(&self.shared))));
        }
    }

    /// 补充调度循环
    ///
    /// 每轮补充令牌并唤醒队首等待者，然后睡到下一个整令牌；队列为空时挂起等待通知。
    async fn run_scheduler(shared: Arc<BucketShared>) {
        loop {
            let next = {
                let mut state = shared.state.lock();
                if state.closed {
                    break;
                }
                shared.refill(&mut state, Instant::now());
                shared.grant_waiters(&mut state);
                shared.next_token_in(&state)
            };

            match next {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shared.wakeup.notified() => {}
                    }
                }
                None => shared.wakeup.notified().await,
            }
        }
        debug!("令牌补充调度任务退出");
    }
}

impl Drop for TokenBucketLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.get_mut().take() {
            handle.abort();
        }
    }
}

/// 挂起中的等待
///
/// 未完成就被丢弃时，从队列中移除等待项；若令牌已在竞态中发放则退回。
struct PendingWait<'a> {
    shared: &'a Arc<BucketShared>,
    id: u64,
    receiver: oneshot::Receiver<()>,
    finished: bool,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut state = self.shared.state.lock();
        if let Some(position) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(position);
            state.cancelled_waits += 1;
            debug!("取消等待: id={}", self.id);
        } else if self.receiver.try_recv().is_ok() {
            state.tokens = (state.tokens + TOKEN_SCALE).min(self.shared.max_tokens());
            state.granted_total = state.granted_total.saturating_sub(1);
            state.queued_grants = state.queued_grants.saturating_sub(1);
            state.cancelled_waits += 1;
            self.shared.grant_waiters(&mut state);
            debug!("取消等待，退回已发放的令牌: id={}", self.id);
        }
    }
}
