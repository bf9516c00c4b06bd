//! 临时键值存储模块
//!
//! 验证码、登录会话、权限缓存都存放在带 TTL 的键值存储中。
//! `KvStore` 是存储契约，`MemoryKvStore` 是进程内实现：
//! - 每个键独立过期，过期键视为不存在
//! - `get_del` 为原子的读取并删除，用于一次性令牌
//! - 后台任务定期清理过期键

use crate::auth::error::AuthError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 清理任务间隔（秒）
pub const KV_CLEANUP_INTERVAL_SECS: u64 = 60;

/// 带 TTL 的键值存储
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 写入并设置过期时间
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), AuthError>;

    /// 读取
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError>;

    /// 原子读取并删除
    async fn get_del(&self, key: &str) -> Result<Option<String>, AuthError>;

    /// 批量删除，返回实际删除的数量
    async fn del(&self, keys: &[String]) -> Result<usize, AuthError>;

    /// 按前缀列出未过期的键
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, AuthError>;
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Instant,
}

impl KvEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 进程内键值存储
pub struct MemoryKvStore {
    entries: DashMap<String, KvEntry>,
    /// 清理任务取消令牌
    cleanup_cancel_token: RwLock<Option<CancellationToken>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            cleanup_cancel_token: RwLock::new(None),
        }
    }

    /// 当前条目数（含尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 清理过期条目，返回清理数量
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// 启动定时清理任务
    pub async fn start_cleanup_task(self: &Arc<Self>) {
        let mut guard = self.cleanup_cancel_token.write().await;
        if let Some(token) = guard.take() {
            token.cancel();
        }

        let cancel_token = CancellationToken::new();
        *guard = Some(cancel_token.clone());
        drop(guard);

        let store = Arc::clone(self);
        tokio::spawn(async move {
            debug!("MemoryKvStore cleanup task started");
            let interval = Duration::from_secs(KV_CLEANUP_INTERVAL_SECS);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("MemoryKvStore cleanup task cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let removed = store.cleanup_expired();
                        if removed > 0 {
                            debug!("MemoryKvStore cleanup: removed {} expired keys", removed);
                        }
                    }
                }
            }
        });
    }

    /// 停止定时清理任务
    pub async fn stop_cleanup_task(&self) {
        let mut guard = self.cleanup_cancel_token.write().await;
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), AuthError> {
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let now = Instant::now();
        let value = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(value)
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, entry)| !entry.is_expired(Instant::now()))
            .map(|(_, entry)| entry.value))
    }

    async fn del(&self, keys: &[String]) -> Result<usize, AuthError> {
        Ok(keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, AuthError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }
}
