//! 验证码模块
//!
//! `CaptchaStore` 负责一次性验证码的存取，`CaptchaService` 负责生成与渲染。
//! 验证时无论结果如何都会消耗该验证码。

use crate::auth::captcha_image;
use crate::auth::error::AuthError;
use crate::auth::store::KvStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// 一次性验证码存储
#[derive(Clone)]
pub struct CaptchaStore {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
}

impl CaptchaStore {
    pub fn new(kv: Arc<dyn KvStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}captcha:{}", self.key_prefix, id)
    }

    pub async fn create(&self, id: &str, code: &str, ttl: Duration) -> Result<(), AuthError> {
        self.kv.set_ex(&self.key(id), code.to_string(), ttl).await
    }

    /// 校验并消耗验证码
    ///
    /// id 不存在或已过期时返回 `Ok(false)`；比较时去除首尾空白并忽略大小写。
    pub async fn verify(&self, id: &str, code: &str) -> Result<bool, AuthError> {
        let stored = match self.kv.get_del(&self.key(id)).await? {
            Some(stored) => stored,
            None => {
                debug!("captcha {} not found or expired", id);
                return Ok(false);
            }
        };
        Ok(stored.trim().eq_ignore_ascii_case(code.trim()))
    }

    pub async fn delete(&self, id: &str) -> Result<(), AuthError> {
        self.kv.del(&[self.key(id)]).await.map(|_| ())
    }
}

/// 验证码下发结果
#[derive(Debug, Clone, Serialize)]
pub struct CaptchaChallenge {
    pub id: String,
    /// `data:image/png;base64,…`
    pub image: String,
    /// 过期时间（Unix 秒）
    pub expire_at: i64,
    /// 仅开发模式返回
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// 验证码服务
pub struct CaptchaService {
    store: CaptchaStore,
    ttl: Duration,
    length: usize,
    dev_secret: Option<String>,
}

impl CaptchaService {
    pub fn new(
        store: CaptchaStore,
        ttl: Duration,
        length: usize,
        dev_secret: Option<String>,
    ) -> Self {
        Self {
            store,
            ttl,
            length: length.max(1),
            dev_secret: dev_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn store(&self) -> &CaptchaStore {
        &self.store
    }

    /// 请求是否满足开发模式（`code` 非空且 `secret` 与配置一致）
    pub fn is_dev_request(&self, code_flag: Option<&str>, secret: Option<&str>) -> bool {
        match (&self.dev_secret, code_flag, secret) {
            (Some(expected), Some(flag), Some(given)) => !flag.is_empty() && given == expected,
            _ => false,
        }
    }

    fn generate_code(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }

    /// 生成并保存新的验证码
    pub async fn issue(&self, reveal_code: bool) -> Result<CaptchaChallenge, AuthError> {
        let id = Uuid::new_v4().to_string();
        let code = self.generate_code();

        let render_code = code.clone();
        let png = tokio::task::spawn_blocking(move || captcha_image::render_png(&render_code))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))??;

        self.store.create(&id, &code, self.ttl).await?;

        Ok(CaptchaChallenge {
            id,
            image: format!("data:image/png;base64,{}", STANDARD.encode(png)),
            expire_at: Utc::now().timestamp() + self.ttl.as_secs() as i64,
            code: reveal_code.then_some(code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryKvStore;

    fn store() -> CaptchaStore {
        CaptchaStore::new(Arc::new(MemoryKvStore::new()), "t:")
    }

    #[tokio::test]
    async fn test_verify_consumes() {
        let store = store();
        store.create("c1", "1234", Duration::from_secs(60)).await.unwrap();
        assert!(store.verify("c1", "1234").await.unwrap());
        assert!(!store.verify("c1", "1234").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_code_also_consumes() {
        let store = store();
        store.create("c2", "5678", Duration::from_secs(60)).await.unwrap();
        assert!(!store.verify("c2", "0000").await.unwrap());
        assert!(!store.verify("c2", "5678").await.unwrap());
    }

    #[tokio::test]
    async fn test_trim_and_case_insensitive() {
        let store = store();
        store.create("c3", "AbC9", Duration::from_secs(60)).await.unwrap();
        assert!(store.verify("c3", "  abc9 ").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_and_expired() {
        let store = store();
        assert!(!store.verify("nope", "1234").await.unwrap());

        store.create("c4", "1234", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.verify("c4", "1234").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        store.create("c5", "1234", Duration::from_secs(60)).await.unwrap();
        store.delete("c5").await.unwrap();
        assert!(!store.verify("c5", "1234").await.unwrap());
    }

    #[tokio::test]
    async fn test_issue() {
        let service = CaptchaService::new(store(), Duration::from_secs(300), 4, Some("dev".into()));
        let challenge = service.issue(true).await.unwrap();
        assert!(challenge.image.starts_with("data:image/png;base64,"));
        assert!(challenge.expire_at > Utc::now().timestamp());
        let code = challenge.code.clone().unwrap();
        assert_eq!(code.len(), 4);
        assert!(service.store().verify(&challenge.id, &code).await.unwrap());

        let hidden = service.issue(false).await.unwrap();
        assert!(hidden.code.is_none());
        let json = serde_json::to_value(&hidden).unwrap();
        assert!(json.get("code").is_none());
    }

    #[test]
    fn test_dev_request() {
        let service = CaptchaService::new(store(), Duration::from_secs(300), 4, Some("dev".into()));
        assert!(service.is_dev_request(Some("1"), Some("dev")));
        assert!(!service.is_dev_request(Some("1"), Some("wrong")));
        assert!(!service.is_dev_request(None, Some("dev")));
        assert!(!service.is_dev_request(Some(""), Some("dev")));

        let prod = CaptchaService::new(store(), Duration::from_secs(300), 4, None);
        assert!(!prod.is_dev_request(Some("1"), Some("")));
    }
}
