//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 配置模块
//!
//! 定义限流器、熔断器和重试队列的配置结构，支持 YAML / TOML / JSON 加载。

use crate::constants::{
    DEFAULT_BUCKET_CAPACITY, DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
    DEFAULT_CIRCUIT_BREAKER_RESET_TIMEOUT_SECS, DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
    DEFAULT_DRAIN_INTERVAL_SECS, DEFAULT_REFILL_RATE, DEFAULT_RETRY_QUEUE_MAX_SIZE,
};
use crate::error::ResilioError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 弹性层总配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry_queue: RetryQueueConfig,
}

impl ResilienceConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        self.limiter
            .validate()
            .map_err(|e| format!("limiter: {}", e))?;
        self.circuit_breaker
            .validate()
            .map_err(|e| format!("circuit_breaker: {}", e))?;
        self.retry_queue
            .validate()
            .map_err(|e| format!("retry_queue: {}", e))?;
        Ok(())
    }

    /// 从 YAML 字符串加载并校验
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ResilioError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validated()
    }

    /// 从 TOML 字符串加载并校验
    pub fn from_toml_str(toml: &str) -> Result<Self, ResilioError> {
        let config: Self = toml::from_str(toml)?;
        config.validated()
    }

    /// 从 JSON 字符串加载并校验
    pub fn from_json_str(json: &str) -> Result<Self, ResilioError> {
        let config: Self = serde_json::from_str(json)?;
        config.validated()
    }

    /// 从文件加载，按扩展名选择格式
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ResilioError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(ResilioError::ConfigError(format!(
                "不支持的配置文件格式: {:?}",
                other
            ))),
        }
    }

    fn validated(self) -> Result<Self, ResilioError> {
        self.validate().map_err(ResilioError::ConfigError)?;
        Ok(self)
    }
}

/// 令牌桶配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// 突发容量
    pub capacity: u64,
    /// 令牌补充速率（令牌/秒）
    pub refill_rate: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUCKET_CAPACITY,
            refill_rate: DEFAULT_REFILL_RATE,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// 校验令牌桶配置
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("令牌桶容量不能为0".to_string());
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(format!("填充速率必须为正数: {}", self.refill_rate));
        }
        Ok(())
    }
}

/// 熔断器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// 失败阈值（达到此值时熔断）
    pub failure_threshold: u64,
    /// 成功阈值（半开状态下达到此值时恢复）
    pub success_threshold: u64,
    /// 打开状态持续多久后允许探测
    #[serde(with = "duration_str")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_BREAKER_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_CIRCUIT_BREAKER_SUCCESS_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_CIRCUIT_BREAKER_RESET_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// 创建新的熔断器配置
    pub fn new(failure_threshold: u64, success_threshold: u64, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            reset_timeout,
        }
    }

    /// 校验熔断器配置
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("失败阈值不能为0".to_string());
        }
        if self.success_threshold == 0 {
            return Err("成功阈值不能为0".to_string());
        }
        if self.reset_timeout.is_zero() {
            return Err("重置超时不能为0".to_string());
        }
        Ok(())
    }
}

/// 重试队列配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryQueueConfig {
    /// 队列最大长度，超出时淘汰最旧的条目
    pub max_size: usize,
    /// 后台排空任务的间隔
    #[serde(with = "duration_str")]
    pub drain_interval: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_RETRY_QUEUE_MAX_SIZE,
            drain_interval: Duration::from_secs(DEFAULT_DRAIN_INTERVAL_SECS),
        }
    }
}

impl RetryQueueConfig {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    /// 校验重试队列配置
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("队列容量不能为0".to_string());
        }
        if self.drain_interval.is_zero() {
            return Err("排空间隔不能为0".to_string());
        }
        Ok(())
    }
}

/// 解析时长字符串
///
/// 支持 `ms`、`s`、`m`、`h`、`d` 后缀，纯数字按秒处理。
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("时长不能为空".to_string());
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("无效的时长数值: '{}'", value))?;

    let seconds_per_unit = match unit.trim().to_lowercase().as_str() {
        "ms" => return Ok(Duration::from_millis(amount)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        other => {
            return Err(format!(
                "无效的时长单位: '{}', 有效值: ms, s, m, h, d",
                other
            ))
        }
    };
    let seconds = amount
        .checked_mul(seconds_per_unit)
        .ok_or_else(|| format!("时长溢出: '{}'", value))?;
    Ok(Duration::from_secs(seconds))
}

/// 将时长格式化为可被 [`parse_duration`] 解析的字符串
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() != 0 || duration.as_secs() == 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}s", duration.as_secs())
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        super::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}
