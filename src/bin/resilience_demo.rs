//! 弹性调用演示
//!
//! 模拟一个间歇性掉线的远端服务，展示限流、熔断、入队和排空的完整流程。
//!
//! ```bash
//! cargo run --features demo --bin resilience_demo -- [config.yaml]
//! ```

use resilio::prelude::*;
use resilio::retry_queue::MemoryQueueStore;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 模拟的远端服务
struct FlakyService {
    online: AtomicBool,
    served: AtomicU64,
}

impl FlakyService {
    async fn call(&self, payload: u64) -> Result<u64, io::Error> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.online.load(Ordering::SeqCst) {
            self.served.fetch_add(1, Ordering::SeqCst);
            Ok(payload * 2)
        } else {
            Err(io::Error::new(io::ErrorKind::TimedOut, "service unreachable"))
        }
    }
}

fn is_network_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

fn load_config() -> anyhow::Result<ResilienceConfig> {
    match std::env::args().nth(1) {
        Some(path) => Ok(ResilienceConfig::from_file(path)?),
        None => Ok(ResilienceConfig::from_yaml_str(
            r#"
limiter:
  capacity: 5
  refill_rate: 20.0
circuit_breaker:
  failure_threshold: 3
  success_threshold: 2
  reset_timeout: 1s
retry_queue:
  max_size: 8
  drain_interval: 500ms
"#,
        )?),
    }
}

async fn run_batch(
    invoker: &ProtectedInvoker,
    service: &Arc<FlakyService>,
    label: &str,
    count: u64,
) {
    let started = Instant::now();
    let (mut ok, mut failed, mut rejected) = (0, 0, 0);

    for payload in 0..count {
        let service = Arc::clone(service);
        let result = invoker
            .execute(
                RequestContext::new("double").with_metadata("payload", payload.to_string()),
                move || {
                    let service = Arc::clone(&service);
                    async move { service.call(payload).await }
                },
                is_network_error,
            )
            .await;

        match result {
            Ok(_) => ok += 1,
            Err(InvokeError::CircuitOpen) => rejected += 1,
            Err(_) => failed += 1,
        }
    }

    info!(
        "[{}] ok={}, failed={}, rejected={}, queued={}, state={:?}, elapsed={:?}",
        label,
        ok,
        failed,
        rejected,
        invoker.queue().size(),
        invoker.breaker().get_state(),
        started.elapsed()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let store = Arc::new(MemoryQueueStore::new());
    let invoker = Arc::new(ProtectedInvoker::new(
        Arc::new(TokenBucketLimiter::from_config(&config.limiter)?),
        Arc::new(CircuitBreaker::from_config(config.circuit_breaker.clone())?),
        Arc::new(RetryQueue::new(config.retry_queue.max_size).with_store(store.clone())),
    ));

    let service = Arc::new(FlakyService {
        online: AtomicBool::new(true),
        served: AtomicU64::new(0),
    });

    info!("=== 阶段 1: 服务正常，突发后按速率放行 ===");
    run_batch(&invoker, &service, "healthy", 10).await;

    info!("=== 阶段 2: 服务掉线，失败入队直到熔断 ===");
    service.online.store(false, Ordering::SeqCst);
    run_batch(&invoker, &service, "offline", 10).await;

    info!("=== 阶段 3: 服务恢复，后台任务排空队列 ===");
    service.online.store(true, Ordering::SeqCst);
    invoker.start_drain_task(config.retry_queue.drain_interval);
    tokio::time::sleep(config.circuit_breaker.reset_timeout + config.retry_queue.drain_interval * 2)
        .await;

    let stats = invoker.queue().get_stats();
    info!(
        "队列: size={}, enqueued={}, evicted={}, replayed={}, saves={}",
        stats.size,
        stats.enqueued_total,
        stats.evicted_total,
        stats.replayed_total,
        store.save_count()
    );
    info!(
        "熔断器: {:?}, 服务累计处理: {}",
        invoker.breaker().get_stats(),
        service.served.load(Ordering::SeqCst)
    );

    invoker.shutdown();
    Ok(())
}
