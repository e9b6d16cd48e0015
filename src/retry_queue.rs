//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 离线重试队列
//!
//! 暂存因瞬时故障失败的操作，由外部调度按 FIFO 顺序重放。
//!
//! # 特性
//!
//! - **有界**: 超出 `max_size` 时淘汰最旧的条目，并以 [`QueueFullWarning`] 上报而不是报错
//! - **重放**: `drain` 按入队顺序尝试每个操作，成功的移除，失败的保留并累加重试次数
//! - **持久化钩子**: 通过注入的 [`QueueStore`] 在每次变更后保存可序列化的部分

use crate::error::{QueueStats, ResilioError, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 重放一次的结果
pub type ReplayFuture = BoxFuture<'static, anyhow::Result<()>>;

/// 类型擦除后的可重放操作
pub type DeferredCall = Arc<dyn Fn() -> ReplayFuture + Send + Sync>;

/// 由异步闭包构造 [`DeferredCall`]
pub fn deferred_call<F, Fut>(f: F) -> DeferredCall
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// 请求上下文
///
/// 随操作一起入队，持久化后可用于重建操作。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// 操作名称
    pub operation: String,
    /// 目标端点
    pub endpoint: Option<String>,
    /// 附加元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 队列条目中可序列化的部分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRecord {
    pub id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub context: RequestContext,
}

/// 排队中的操作
#[derive(Clone)]
pub struct QueuedOperation {
    record: QueuedRecord,
    call: DeferredCall,
}

impl QueuedOperation {
    fn new(context: RequestContext, call: DeferredCall) -> Self {
        Self {
            record: QueuedRecord {
                id: Uuid::new_v4(),
                enqueued_at: Utc::now(),
                retry_count: 0,
                context,
            },
            call,
        }
    }

    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn retry_count(&self) -> u32 {
        self.record.retry_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.record.enqueued_at
    }

    pub fn context(&self) -> &RequestContext {
        &self.record.context
    }

    pub fn record(&self) -> &QueuedRecord {
        &self.record
    }

    /// 重放一次
    pub fn replay(&self) -> ReplayFuture {
        (self.call)()
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// 入队时淘汰了旧条目
#[derive(Debug, Clone)]
pub struct QueueFullWarning {
    /// 被淘汰的条目
    pub evicted: QueuedRecord,
    /// 队列容量
    pub max_size: usize,
}

/// 入队结果
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub id: Uuid,
    pub warning: Option<QueueFullWarning>,
}

/// 单个条目的重放结果
#[derive(Debug)]
pub enum ReplayOutcome {
    /// 成功，条目移除
    Succeeded,
    /// 失败，条目保留并累加重试次数
    Failed(anyhow::Error),
    /// 未尝试，条目保持原样
    Skipped,
}

/// 一次排空的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub remaining: usize,
}

/// 队列持久化钩子
///
/// 核心只在变更点调用这些钩子，不关心存储格式。
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 加载上次保存的条目
    async fn load(&self) -> Result<Vec<QueuedRecord>, StorageError>;

    /// 保存当前全部条目
    async fn save(&self, records: &[QueuedRecord]) -> Result<(), StorageError>;

    /// 清除已保存的条目
    async fn clear(&self) -> Result<(), StorageError>;
}

/// 内存存储实现
///
/// 以 JSON 文本保存快照，进程内有效。
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    snapshot: Mutex<Option<String>>,
    saves: AtomicU64,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调用 `save` 的次数
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<QueuedRecord>, StorageError> {
        match self.snapshot.lock().as_deref() {
            Some(json) => serde_json::from_str(json)
                .map_err(|e| StorageError::SerializationError(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, records: &[QueuedRecord]) -> Result<(), StorageError> {
        let json = serde_json::to_string(records)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        *self.snapshot.lock() = Some(json);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        *self.snapshot.lock() = None;
        Ok(())
    }
}

/// 队列计数器
#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    evicted: AtomicU64,
    replayed: AtomicU64,
    replay_failures: AtomicU64,
    persistence_errors: AtomicU64,
}

/// 有界重试队列
pub struct RetryQueue {
    entries: Mutex<VecDeque<QueuedOperation>>,
    max_size: usize,
    store: Option<Arc<dyn QueueStore>>,
    /// 串行化排空
    drain_lock: tokio::sync::Mutex<()>,
    /// 串行化保存，保证后一次保存的快照不旧于前一次
    persist_lock: tokio::sync::Mutex<()>,
    counters: QueueCounters,
}

impl RetryQueue {
    /// 创建新的重试队列
    ///
    /// # 参数
    /// - `max_size`: 最大长度（至少为 1）
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        info!("创建重试队列: max_size={}", max_size);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_size)),
            max_size,
            store: None,
            drain_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            counters: QueueCounters::default(),
        }
    }

    /// 注入持久化钩子
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 入队
    ///
    /// 队列已满时先淘汰最旧的条目，结果中携带 [`QueueFullWarning`]。
    pub async fn enqueue(&self, context: RequestContext, call: DeferredCall) -> EnqueueOutcome {
        let operation = QueuedOperation::new(context, call);
        let id = operation.id();

        let warning = {
            let mut entries = self.entries.lock();
            let evicted = if entries.len() >= self.max_size {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(operation);
            evicted
        }
        .map(|evicted| {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(
                "重试队列已满，淘汰最旧的操作: id={}, operation={}, max_size={}",
                evicted.id(),
                evicted.context().operation,
                self.max_size
            );
            QueueFullWarning {
                evicted: evicted.record,
                max_size: self.max_size,
            }
        });

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!("操作入队: id={}", id);
        self.persist().await;

        EnqueueOutcome { id, warning }
    }

    /// 按 FIFO 顺序重放所有条目
    pub async fn drain(&self) -> DrainReport {
        self.drain_with(|operation| async move {
            match operation.replay().await {
                Ok(()) => ReplayOutcome::Succeeded,
                Err(e) => ReplayOutcome::Failed(e),
            }
        })
        .await
    }

    /// 通过自定义的尝试函数排空
    ///
    /// 排空开始时对队列做快照，期间新入队的条目留到下一轮；
    /// 期间被淘汰的条目不再尝试。
    pub async fn drain_with<F, Fut>(&self, attempt: F) -> DrainReport
    where
        F: Fn(QueuedOperation) -> Fut,
        Fut: Future<Output = ReplayOutcome>,
    {
        let _guard = self.drain_lock.lock().await;
        let snapshot: Vec<QueuedOperation> = self.entries.lock().iter().cloned().collect();
        let mut report = DrainReport::default();

        for operation in snapshot {
            let id = operation.id();
            if !self.contains(id) {
                continue;
            }

            match attempt(operation).await {
                ReplayOutcome::Succeeded => {
                    report.attempted += 1;
                    report.succeeded += 1;
                    self.entries.lock().retain(|entry| entry.id() != id);
                    self.counters.replayed.fetch_add(1, Ordering::Relaxed);
                    debug!("重放成功: id={}", id);
                }
                ReplayOutcome::Failed(e) => {
                    report.attempted += 1;
                    report.failed += 1;
                    if let Some(entry) = self.entries.lock().iter_mut().find(|e| e.id() == id) {
                        entry.record.retry_count += 1;
                    }
                    self.counters.replay_failures.fetch_add(1, Ordering::Relaxed);
                    debug!("重放失败，保留到下一轮: id={}, error={}", id, e);
                }
                ReplayOutcome::Skipped => {
                    report.skipped += 1;
                }
            }
        }

        report.remaining = self.size();
        if report.attempted > 0 {
            self.persist().await;
        }

        info!(
            "重试队列排空完成: attempted={}, succeeded={}, failed={}, skipped={}, remaining={}",
            report.attempted, report.succeeded, report.failed, report.skipped, report.remaining
        );
        report
    }

    /// 从持久化钩子恢复
    ///
    /// `rehydrate` 根据请求上下文重建可执行的操作，返回 None 的记录被丢弃。
    pub async fn restore<F>(&self, rehydrate: F) -> Result<usize, ResilioError>
    where
        F: Fn(&RequestContext) -> Option<DeferredCall>,
    {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let records = store.load().await?;
        let mut restored = 0;
        {
            let mut entries = self.entries.lock();
            for record in records {
                if entries.iter().any(|entry| entry.id() == record.id) {
                    continue;
                }
                let Some(call) = rehydrate(&record.context) else {
                    warn!(
                        "无法重建操作，丢弃: id={}, operation={}",
                        record.id, record.context.operation
                    );
                    continue;
                };
                if entries.len() >= self.max_size {
                    if let Some(evicted) = entries.pop_front() {
                        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "恢复时重试队列已满，淘汰最旧的操作: id={}, operation={}, max_size={}",
                            evicted.id(),
                            evicted.context().operation,
                            self.max_size
                        );
                    }
                }
                entries.push_back(QueuedOperation { record, call });
                restored += 1;
            }
        }

        info!("从持久化恢复重试队列: restored={}", restored);
        Ok(restored)
    }

    /// 清空队列
    pub async fn clear(&self) {
        let removed = {
            let mut entries = self.entries.lock();
            let removed = entries.len();
            entries.clear();
            removed
        };
        info!("清空重试队列: removed={}", removed);

        if let Some(store) = &self.store {
            let _persist = self.persist_lock.lock().await;
            if let Err(e) = store.clear().await {
                self.counters
                    .persistence_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!("清除持久化队列失败: {}", e);
            }
        }
    }

    /// 当前长度
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// 所有条目的可序列化快照，按入队顺序
    pub fn records(&self) -> Vec<QueuedRecord> {
        self.entries
            .lock()
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> QueueStats {
        QueueStats {
            size: self.size(),
            max_size: self.max_size,
            enqueued_total: self.counters.enqueued.load(Ordering::Relaxed),
            evicted_total: self.counters.evicted.load(Ordering::Relaxed),
            replayed_total: self.counters.replayed.load(Ordering::Relaxed),
            replay_failures_total: self.counters.replay_failures.load(Ordering::Relaxed),
            persistence_errors: self.counters.persistence_errors.load(Ordering::Relaxed),
        }
    }

    fn contains(&self, id: Uuid) -> bool {
        self.entries.lock().iter().any(|entry| entry.id() == id)
    }

    /// 保存当前快照，失败只记录日志
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let _persist = self.persist_lock.lock().await;
        let records = self.records();
        if let Err(e) = store.save(&records).await {
            self.counters
                .persistence_errors
                .fetch_add(1, Ordering::Relaxed);
            warn!("保存重试队列失败: {}", e);
        }
    }
}
