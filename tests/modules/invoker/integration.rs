//! 受保护调用集成测试
//!
//! 测试故障、熔断、入队、恢复和排空的完整流程

use crate::common::{init_tracing, is_network_error, test_config, FlakyBackend};
use resilio::error::{CircuitState, InvokeError};
use resilio::invoker::{NeverTransient, ProtectedInvoker};
use resilio::invoker_manager::GLOBAL_INVOKER_MANAGER;
use resilio::retry_queue::RequestContext;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// 后端掉线到恢复的完整流程
#[tokio::test(start_paused = true)]
async fn test_outage_and_recovery() {
    init_tracing();
    let invoker = Arc::new(ProtectedInvoker::from_config(&test_config()).unwrap());
    let backend = FlakyBackend::offline();

    let mut opened_after = None;
    for i in 0..10u32 {
        let result = invoker
            .execute(
                RequestContext::new("score").with_metadata("item", i.to_string()),
                backend.operation(i),
                is_network_error,
            )
            .await;
        match result {
            Err(InvokeError::OperationFailed(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            Err(InvokeError::CircuitOpen) => {
                opened_after.get_or_insert(i);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    assert_eq!(opened_after, Some(5));
    assert_eq!(backend.calls(), 5);
    assert_eq!(invoker.queue().size(), 5);
    assert_eq!(invoker.breaker().get_state(), CircuitState::Open);

    backend.set_online(true);
    invoker.start_drain_task(test_config().retry_queue.drain_interval);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(invoker.queue().size(), 5, "drain must wait for the circuit");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(invoker.queue().is_empty());
    assert_eq!(backend.served(), 5);
    assert_eq!(invoker.breaker().get_state(), CircuitState::Closed);

    invoker.shutdown();
    assert!(!invoker.is_draining());
}

/// 永久错误返回给调用方，不入队
#[tokio::test]
async fn test_permanent_errors_surface_without_queueing() {
    let invoker = ProtectedInvoker::from_config(&test_config()).unwrap();

    let result = invoker
        .execute(
            RequestContext::new("lookup"),
            || async { Err::<u32, _>(io::Error::new(io::ErrorKind::NotFound, "404")) },
            is_network_error,
        )
        .await;

    let err = result.unwrap_err();
    assert!(err.was_attempted());
    assert_eq!(err.operation_error().map(|e| e.kind()), Some(io::ErrorKind::NotFound));
    assert!(invoker.queue().is_empty());
    assert_eq!(invoker.breaker().failure_count(), 1);
}

/// 共享的调用器在多个任务之间限流
#[tokio::test(start_paused = true)]
async fn test_shared_invoker_applies_one_budget() {
    let invoker = GLOBAL_INVOKER_MANAGER
        .get_or_create("integration-shared", &test_config())
        .unwrap();
    let backend = FlakyBackend::online();

    let started = tokio::time::Instant::now();
    let handles: Vec<_> = (0..30u32)
        .map(|i| {
            let invoker = GLOBAL_INVOKER_MANAGER.get("integration-shared").unwrap();
            let operation = backend.operation(i);
            tokio::spawn(async move {
                invoker
                    .execute(RequestContext::new("batch"), operation, NeverTransient)
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(backend.served(), 30);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(invoker.limiter().get_stats().granted_total, 30);

    GLOBAL_INVOKER_MANAGER.remove("integration-shared");
    assert!(GLOBAL_INVOKER_MANAGER.get("integration-shared").is_none());
}

/// 附加指标后可导出调用统计
#[cfg(feature = "monitoring")]
#[tokio::test]
async fn test_metrics_reflect_invocations() {
    use resilio::telemetry::Metrics;

    let metrics = Arc::new(Metrics::new().unwrap());
    let invoker = ProtectedInvoker::from_config(&test_config())
        .unwrap()
        .with_metrics(metrics.clone());
    let backend = FlakyBackend::offline();

    for i in 0..6 {
        let _ = invoker
            .execute(RequestContext::new("m"), backend.operation(i), is_network_error)
            .await;
    }

    assert_eq!(metrics.requests_total.get(), 6.0);
    assert_eq!(metrics.requests_allowed.get(), 5.0);
    assert_eq!(metrics.requests_rejected.get(), 1.0);
    assert_eq!(metrics.queue_enqueued.get(), 5.0);
    assert_eq!(metrics.breaker_state.get(), 2.0);
    assert!(metrics.gather().contains("resilio_retry_queue_size 5"));
}
