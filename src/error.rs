//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 错误类型定义
//!
//! 使用thiserror定义所有错误类型。

use thiserror::Error;

/// Resilio 错误类型
#[derive(Error, Debug)]
pub enum ResilioError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(#[from] StorageError),

    /// 等待令牌期间被取消
    #[error("等待令牌被取消")]
    RateLimitCancelled,

    /// 等待令牌超时
    #[error("等待令牌超时: {0:?}")]
    RateLimitTimeout(std::time::Duration),

    /// IO错误
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// YAML解析错误
    #[error("YAML解析错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML解析错误
    #[error("TOML解析错误: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// 存储错误
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// 连接错误
    #[error("连接错误: {0}")]
    ConnectionError(String),

    /// 查询错误
    #[error("查询错误: {0}")]
    QueryError(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(String),
}

/// 受保护调用的错误
///
/// `OperationFailed` 原样携带操作自身的错误，调用方总能拿回原始失败。
#[derive(Error, Debug)]
pub enum InvokeError<E> {
    /// 熔断器打开，操作未执行
    #[error("熔断器打开，请求被拒绝")]
    CircuitOpen,

    /// 等待令牌期间被取消，操作未执行
    #[error("等待令牌被取消")]
    RateLimitCancelled,

    /// 操作本身失败
    #[error("操作失败: {0}")]
    OperationFailed(#[source] E),
}

impl<E> InvokeError<E> {
    /// 操作是否被执行过
    pub fn was_attempted(&self) -> bool {
        matches!(self, InvokeError::OperationFailed(_))
    }

    /// 取出操作自身的错误
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            InvokeError::OperationFailed(e) => Some(e),
            _ => None,
        }
    }

    /// 获取操作自身错误的引用
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            InvokeError::OperationFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CircuitState {
    /// 关闭状态（正常）
    Closed,
    /// 打开状态（熔断）
    Open,
    /// 半开状态（探测）
    HalfOpen,
}

impl CircuitState {
    /// 用于指标导出的数值编码
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// 熔断器统计信息
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircuitBreakerStats {
    /// 当前状态
    pub state: CircuitState,
    /// 失败次数
    pub failure_count: u64,
    /// 成功次数（半开状态）
    pub success_count: u64,
    /// 总调用次数
    pub total_calls: u64,
    /// 被拒绝的调用次数
    pub rejected_calls: u64,
    /// 最后失败时间
    pub last_failure_time: Option<chrono::DateTime<chrono::Utc>>,
    /// 最后状态变更时间
    pub last_state_change: Option<chrono::DateTime<chrono::Utc>>,
}

/// 令牌桶统计信息
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LimiterStats {
    /// 桶容量
    pub capacity: u64,
    /// 当前可用令牌（含小数部分）
    pub available_tokens: f64,
    /// 排队中的等待者数量
    pub waiting: usize,
    /// 已发放的令牌总数
    pub granted_total: u64,
    /// 经过排队后发放的令牌数
    pub queued_grants: u64,
    /// 被取消的等待数
    pub cancelled_waits: u64,
}

/// 重试队列统计信息
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    /// 当前队列长度
    pub size: usize,
    /// 最大容量
    pub max_size: usize,
    /// 入队总数
    pub enqueued_total: u64,
    /// 因容量淘汰的数量
    pub evicted_total: u64,
    /// 重放成功数
    pub replayed_total: u64,
    /// 重放失败次数
    pub replay_failures_total: u64,
    /// 持久化钩子失败次数
    pub persistence_errors: u64,
}
