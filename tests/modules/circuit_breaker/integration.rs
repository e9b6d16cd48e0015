//! 熔断器模块集成测试
//!
//! 测试完整的状态循环和 execute 包装

use resilio::circuit_breaker::CircuitBreaker;
use resilio::config::ResilienceConfig;
use resilio::error::{CircuitState, InvokeError};
use std::io;
use std::time::Duration;

fn breaker_from_toml() -> CircuitBreaker {
    let config = ResilienceConfig::from_toml_str(
        r#"
[circuit_breaker]
failure_threshold = 5
success_threshold = 3
reset_timeout = "60s"
"#,
    )
    .unwrap();
    CircuitBreaker::from_config(config.circuit_breaker).unwrap()
}

async fn failing() -> Result<(), io::Error> {
    Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
}

/// 测试熔断器的完整状态循环: Closed -> Open -> HalfOpen -> Open -> HalfOpen -> Closed
#[tokio::test(start_paused = true)]
async fn test_full_state_cycle() {
    let breaker = breaker_from_toml();

    for _ in 0..5 {
        assert!(breaker.execute(failing).await.is_err());
    }
    assert_eq!(breaker.get_state(), CircuitState::Open);
    assert!(matches!(
        breaker.execute(failing).await,
        Err(InvokeError::CircuitOpen)
    ));

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(matches!(
        breaker.execute(failing).await,
        Err(InvokeError::OperationFailed(_))
    ));
    assert_eq!(breaker.get_state(), CircuitState::Open);
    assert_eq!(breaker.failure_count(), 5);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(!breaker.can_make_request());

    tokio::time::advance(Duration::from_secs(31)).await;
    for _ in 0..3 {
        let value = breaker
            .execute(|| async { Ok::<_, io::Error>("ok") })
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }
    assert_eq!(breaker.get_state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.success_count(), 0);
}

/// 打开状态下失败只累加计数，不延长打开时间
#[tokio::test(start_paused = true)]
async fn test_open_failures_do_not_extend_timeout() {
    let breaker = breaker_from_toml();
    for _ in 0..5 {
        breaker.record_failure();
    }

    tokio::time::advance(Duration::from_secs(30)).await;
    breaker.record_failure();
    assert_eq!(breaker.failure_count(), 6);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(breaker.can_make_request());
    assert!(breaker.is_half_open());
}

/// 统计信息反映拒绝次数和最后失败时间
#[tokio::test]
async fn test_stats_track_rejections() {
    let breaker = breaker_from_toml();
    for _ in 0..5 {
        breaker.record_failure();
    }
    for _ in 0..4 {
        assert!(!breaker.can_make_request());
    }

    let stats = breaker.get_stats();
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.failure_count, 5);
    assert_eq!(stats.rejected_calls, 4);
    assert!(stats.last_failure_time.is_some());

    breaker.reset();
    let stats = breaker.get_stats();
    assert_eq!(stats.state, CircuitState::Closed);
    assert!(stats.last_failure_time.is_none());
}

/// 多个任务并发记录失败，计数不丢失
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_are_linearizable() {
    let breaker = std::sync::Arc::new(CircuitBreaker::new(
        resilio::config::CircuitBreakerConfig::new(1000, 3, Duration::from_secs(60)),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    breaker.record_failure();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(breaker.failure_count(), 800);
    assert!(breaker.is_closed());
}
