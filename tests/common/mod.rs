//! 测试通用工具模块
//!
//! 提供测试中常用的工具函数和辅助结构。

#![allow(dead_code)]

use futures::future::BoxFuture;
use futures::FutureExt;
use resilio::config::ResilienceConfig;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// 初始化测试日志，重复调用无副作用
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("resilio=debug"))
        .with_test_writer()
        .try_init();
}

/// 可切换在线状态的模拟后端
#[derive(Default)]
pub struct FlakyBackend {
    online: AtomicBool,
    calls: AtomicUsize,
    served: AtomicUsize,
}

impl FlakyBackend {
    pub fn online() -> Arc<Self> {
        let backend = Arc::new(Self::default());
        backend.set_online(true);
        backend
    }

    pub fn offline() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// 返回一个可重复调用的操作；离线时以超时失败
    pub fn operation(
        self: &Arc<Self>,
        payload: u32,
    ) -> impl Fn() -> BoxFuture<'static, Result<u32, io::Error>> + Send + Sync + 'static {
        let backend = Arc::clone(self);
        move || {
            let backend = Arc::clone(&backend);
            async move {
                backend.calls.fetch_add(1, Ordering::SeqCst);
                if backend.online.load(Ordering::SeqCst) {
                    backend.served.fetch_add(1, Ordering::SeqCst);
                    Ok(payload)
                } else {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "backend timed out"))
                }
            }
            .boxed()
        }
    }
}

/// 网络类错误视为瞬时错误
pub fn is_network_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

/// 测试配置
pub fn test_config() -> ResilienceConfig {
    ResilienceConfig::from_yaml_str(
        r#"
limiter:
  capacity: 20
  refill_rate: 10.0
circuit_breaker:
  failure_threshold: 5
  success_threshold: 3
  reset_timeout: 60s
retry_queue:
  max_size: 100
  drain_interval: 30s
"#,
    )
    .expect("test config should parse")
}
