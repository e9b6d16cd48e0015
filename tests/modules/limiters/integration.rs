//! 令牌桶限流器集成测试
//!
//! 测试突发、持续速率、公平性和取消

use crate::common::{init_tracing, test_config};
use parking_lot::Mutex;
use resilio::error::ResilioError;
use resilio::limiters::TokenBucketLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_ok, assert_pending, assert_ready_ok, task};

/// 等待直到指定数量的调用在排队
async fn until_waiting(limiter: &TokenBucketLimiter, count: usize) {
    while limiter.waiting_count() < count {
        tokio::task::yield_now().await;
    }
}

/// 突发 20 个立即放行，第 21 个等待约 100ms
#[tokio::test(start_paused = true)]
async fn test_burst_then_steady_rate() {
    init_tracing();
    let limiter = TokenBucketLimiter::from_config(&test_config().limiter).unwrap();

    let started = Instant::now();
    for _ in 0..20 {
        limiter.wait_for_permission().await.unwrap();
    }
    assert_eq!(started.elapsed(), Duration::ZERO);

    limiter.wait_for_permission().await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(110), "waited {:?}", waited);
}

/// 令牌耗尽时等待挂起，补充后完成
#[tokio::test(start_paused = true)]
async fn test_wait_is_pending_until_refill() {
    let limiter = TokenBucketLimiter::new(1, 10.0);
    assert_ok!(limiter.wait_for_permission().await);

    let mut wait = task::spawn(limiter.wait_for_permission());
    assert_pending!(wait.poll());
    assert_eq!(limiter.waiting_count(), 1);

    tokio::time::sleep(Duration::from_millis(101)).await;
    assert!(wait.is_woken());
    assert_ready_ok!(wait.poll());
    assert_eq!(limiter.waiting_count(), 0);
}

/// 超过突发后，持续速率约为每秒 10 个
#[tokio::test(start_paused = true)]
async fn test_sustained_rate_past_burst() {
    let limiter = TokenBucketLimiter::new(20, 10.0);

    let started = Instant::now();
    for _ in 0..40 {
        limiter.wait_for_permission().await.unwrap();
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2100), "elapsed {:?}", elapsed);
    assert_eq!(limiter.get_stats().granted_total, 40);
}

/// 并发等待者按调用顺序获得令牌
#[tokio::test(start_paused = true)]
async fn test_concurrent_waiters_granted_in_call_order() {
    let limiter = Arc::new(TokenBucketLimiter::new(1, 10.0));
    limiter.wait_for_permission().await.unwrap();

    let grants = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for caller in 0..8 {
        let task_limiter = Arc::clone(&limiter);
        let grants = Arc::clone(&grants);
        handles.push(tokio::spawn(async move {
            task_limiter.wait_for_permission().await.unwrap();
            grants.lock().push(caller);
        }));
        until_waiting(&limiter, caller + 1).await;
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*grants.lock(), (0..8).collect::<Vec<_>>());
}

/// 取消的等待者不消耗令牌，后续等待者顺延
#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_does_not_consume() {
    let limiter = Arc::new(TokenBucketLimiter::new(1, 10.0));
    limiter.wait_for_permission().await.unwrap();

    let cancelled = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.wait_for_permission().await })
    };
    until_waiting(&limiter, 1).await;

    let survivor = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            limiter.wait_for_permission().await.unwrap();
            Instant::now()
        })
    };
    until_waiting(&limiter, 2).await;

    let started = Instant::now();
    cancelled.abort();
    let _ = cancelled.await;
    assert_eq!(limiter.waiting_count(), 1);

    let granted_at = survivor.await.unwrap();
    assert!(granted_at - started <= Duration::from_millis(100));
    assert!(limiter.available_tokens() < 1.0);
}

/// 超时包装移除等待项并返回超时错误
#[tokio::test(start_paused = true)]
async fn test_caller_deadline() {
    let limiter = TokenBucketLimiter::new(1, 1.0);
    limiter.wait_for_permission().await.unwrap();

    let result = limiter
        .wait_for_permission_timeout(Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(ResilioError::RateLimitTimeout(_))));
    assert_eq!(limiter.waiting_count(), 0);
    assert_eq!(limiter.get_stats().cancelled_waits, 1);

    assert_ok!(
        limiter
            .wait_for_permission_timeout(Duration::from_secs(2))
            .await
    );
}

/// 关闭后新的等待立即失败
#[tokio::test]
async fn test_wait_after_shutdown_fails() {
    let limiter = TokenBucketLimiter::new(5, 10.0);
    limiter.shutdown();
    assert!(limiter.is_closed());
    assert!(matches!(
        limiter.wait_for_permission().await,
        Err(ResilioError::RateLimitCancelled)
    ));
    assert!(!limiter.try_acquire());
}
