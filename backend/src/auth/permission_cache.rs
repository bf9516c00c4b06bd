//! 权限缓存模块
//!
//! 以 `{prefix}user:perms:{user_id}` 缓存用户的角色名与权限码。
//! - 读穿透：未命中或反序列化失败时回源，并异步写回
//! - 写回有独立超时，不阻塞读者，失败只记日志
//! - 缓存读错误按未命中处理
//! - 支持按用户、按角色成员、全局三种失效方式

use crate::auth::error::AuthError;
use crate::auth::model::{RoleId, User, UserId};
use crate::auth::repository::UserRepository;
use crate::auth::store::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// 用户的有效角色与权限
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermissions {
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl UserPermissions {
    pub fn from_user(user: &User) -> Self {
        Self {
            roles: user.role_names(),
            permissions: user.permission_codes(),
        }
    }
}

/// 权限缓存
pub struct PermissionCache {
    kv: Arc<dyn KvStore>,
    users: Arc<dyn UserRepository>,
    key_prefix: String,
    ttl: Duration,
    write_timeout: Duration,
    writes: TaskTracker,
}

impl PermissionCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        users: Arc<dyn UserRepository>,
        key_prefix: impl Into<String>,
        ttl: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            kv,
            users,
            key_prefix: key_prefix.into(),
            ttl,
            write_timeout,
            writes: TaskTracker::new(),
        }
    }

    fn key_space(&self) -> String {
        format!("{}user:perms:", self.key_prefix)
    }

    pub fn cache_key(&self, user_id: UserId) -> String {
        format!("{}{}", self.key_space(), user_id)
    }

    /// 读取用户的角色与权限
    pub async fn get_user_permissions(&self, user_id: UserId) -> Result<UserPermissions, AuthError> {
        let key = self.cache_key(user_id);

        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<UserPermissions>(&raw) {
                Ok(cached) => {
                    debug!("permission cache hit for user {}", user_id);
                    return Ok(cached);
                }
                Err(e) => {
                    warn!("corrupt permission cache entry for user {}: {}", user_id, e);
                    if let Err(e) = self.kv.del(&[key.clone()]).await {
                        warn!("failed to drop corrupt cache entry {}: {}", key, e);
                    }
                }
            },
            Ok(None) => {}
            Err(e) => warn!("permission cache read failed, falling back to source: {}", e),
        }

        let user = self
            .users
            .find_user_with_roles(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        let permissions = UserPermissions::from_user(&user);
        self.spawn_write_back(key, &permissions);
        Ok(permissions)
    }

    fn spawn_write_back(&self, key: String, permissions: &UserPermissions) {
        let payload = match serde_json::to_string(permissions) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode permission cache entry: {}", e);
                return;
            }
        };
        let kv = Arc::clone(&self.kv);
        let ttl = self.ttl;
        let timeout = self.write_timeout;
        self.writes.spawn(async move {
            match tokio::time::timeout(timeout, kv.set_ex(&key, payload, ttl)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("permission cache write failed for {}: {}", key, e),
                Err(_) => warn!("permission cache write timed out for {}", key),
            }
        });
    }

    /// 等待已发起的写回完成
    pub async fn flush_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    pub async fn invalidate_user(&self, user_id: UserId) -> Result<(), AuthError> {
        self.kv.del(&[self.cache_key(user_id)]).await?;
        debug!("permission cache invalidated for user {}", user_id);
        Ok(())
    }

    /// 失效持有指定角色的全部用户，返回涉及的用户数
    pub async fn invalidate_users_with_role(&self, role_id: RoleId) -> Result<usize, AuthError> {
        let user_ids = self.users.user_ids_with_role(role_id).await?;
        if user_ids.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = user_ids.iter().map(|id| self.cache_key(*id)).collect();
        self.kv.del(&keys).await?;
        debug!(
            "permission cache invalidated for {} users of role {}",
            user_ids.len(),
            role_id
        );
        Ok(user_ids.len())
    }

    /// 失效全部用户的缓存，返回删除的键数
    pub async fn invalidate_all_users(&self) -> Result<usize, AuthError> {
        let keys = self.kv.scan_prefix(&self.key_space()).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.kv.del(&keys).await
    }
}
