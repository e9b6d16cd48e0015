//! Copyright (c) 2026, Kirky.X
//!
//! MIT License
//!
//! 全局调用器管理器
//!
//! 按客户端名称共享 [`ProtectedInvoker`]，同一远端服务的所有调用走同一组限流器、熔断器和重试队列。

use crate::config::ResilienceConfig;
use crate::error::ResilioError;
use crate::invoker::ProtectedInvoker;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// 调用器管理器
pub struct InvokerManager {
    invokers: DashMap<String, Arc<ProtectedInvoker>>,
}

impl InvokerManager {
    /// 创建新的管理器
    pub fn new() -> Self {
        Self {
            invokers: DashMap::new(),
        }
    }

    /// 获取或创建调用器
    ///
    /// 已存在时忽略 `config`，返回已有实例。
    pub fn get_or_create(
        &self,
        name: &str,
        config: &ResilienceConfig,
    ) -> Result<Arc<ProtectedInvoker>, ResilioError> {
        if let Some(invoker) = self.invokers.get(name) {
            return Ok(Arc::clone(invoker.value()));
        }

        match self.invokers.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let invoker = Arc::new(ProtectedInvoker::from_config(config)?);
                entry.insert(Arc::clone(&invoker));
                info!("注册受保护调用器: name={}", name);
                Ok(invoker)
            }
        }
    }

    /// 获取已注册的调用器
    pub fn get(&self, name: &str) -> Option<Arc<ProtectedInvoker>> {
        self.invokers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// 移除并关闭调用器
    pub fn remove(&self, name: &str) -> Option<Arc<ProtectedInvoker>> {
        let (_, invoker) = self.invokers.remove(name)?;
        invoker.shutdown();
        info!("移除受保护调用器: name={}", name);
        Some(invoker)
    }

    /// 已注册的名称
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.invokers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// 关闭并移除所有调用器
    pub fn clear(&self) {
        for entry in self.invokers.iter() {
            entry.value().shutdown();
        }
        self.invokers.clear();
    }
}

impl Default for InvokerManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    /// 全局调用器管理器实例
    pub static ref GLOBAL_INVOKER_MANAGER: InvokerManager = InvokerManager::new();
}
