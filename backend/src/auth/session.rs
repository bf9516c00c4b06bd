//! 登录会话模块
//!
//! 密码校验通过但尚未完成双因素认证时签发的一次性会话令牌。

use crate::auth::error::AuthError;
use crate::auth::model::UserId;
use crate::auth::store::KvStore;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// 会话令牌随机字节数（256 位）
const SESSION_TOKEN_BYTES: usize = 32;

/// 待完成双因素认证的登录会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginSession {
    pub user_id: UserId,
    /// 登录时使用的用户名或邮箱
    pub login_identifier: String,
    pub created_at: DateTime<Utc>,
}

/// 登录会话存储
#[derive(Clone)]
pub struct LoginSessionStore {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
    ttl: Duration,
}

impl LoginSessionStore {
    pub fn new(kv: Arc<dyn KvStore>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    fn key(&self, token: &str) -> String {
        format!("{}login_session:{}", self.key_prefix, token)
    }

    fn generate_token() -> String {
        let mut bytes = [0u8; SESSION_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// 创建会话，返回令牌
    pub async fn create(&self, user_id: UserId, identifier: &str) -> Result<String, AuthError> {
        let token = Self::generate_token();
        let session = LoginSession {
            user_id,
            login_identifier: identifier.to_string(),
            created_at: Utc::now(),
        };
        self.kv
            .set_ex(&self.key(&token), serde_json::to_string(&session)?, self.ttl)
            .await?;
        Ok(token)
    }

    /// 校验并消耗会话
    ///
    /// 不存在、已过期或已使用时返回 `SessionExpired`。
    pub async fn consume(&self, token: &str) -> Result<LoginSession, AuthError> {
        if token.is_empty() {
            return Err(AuthError::SessionExpired);
        }
        let raw = self
            .kv
            .get_del(&self.key(token))
            .await?
            .ok_or(AuthError::SessionExpired)?;
        serde_json::from_str(&raw).map_err(|e| {
            warn!("login session payload corrupted: {}", e);
            AuthError::SessionExpired
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryKvStore;

    fn store(ttl: Duration) -> LoginSessionStore {
        LoginSessionStore::new(Arc::new(MemoryKvStore::new()), "t:", ttl)
    }

    #[tokio::test]
    async fn test_one_shot() {
        let store = store(Duration::from_secs(300));
        let token = store.create(7, "carol").await.unwrap();
        assert_eq!(token.len(), SESSION_TOKEN_BYTES * 2);

        let session = store.consume(&token).await.unwrap();
        assert_eq!(session.user_id, 7);
        assert_eq!(session.login_identifier, "carol");

        assert!(matches!(
            store.consume(&token).await,
            Err(AuthError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_expired_and_unknown() {
        let store = store(Duration::from_millis(5));
        let token = store.create(1, "u").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(store.consume(&token).await, Err(AuthError::SessionExpired)));
        assert!(matches!(store.consume("bogus").await, Err(AuthError::SessionExpired)));
        assert!(matches!(store.consume("").await, Err(AuthError::SessionExpired)));
    }

    #[tokio::test]
    async fn test_tokens_unique() {
        let store = store(Duration::from_secs(300));
        let a = store.create(1, "u").await.unwrap();
        let b = store.create(1, "u").await.unwrap();
        assert_ne!(a, b);
    }
}
