//! 认证状态管理模块
//!
//! 组装认证系统的全部服务，并管理后台任务的生命周期：
//! - 临时键过期清理
//! - 过期个人访问令牌清理
//! - 事件总线的排空

use crate::auth::account::AccountService;
use crate::auth::captcha::{CaptchaService, CaptchaStore};
use crate::auth::error::AuthError;
use crate::auth::event::EventBus;
use crate::auth::event_handlers::{AuditLogHandler, CacheInvalidationHandler};
use crate::auth::jwt::JwtCodec;
use crate::auth::login::LoginOrchestrator;
use crate::auth::memory::MemoryDatabase;
use crate::auth::middleware::Authenticator;
use crate::auth::password::PasswordManager;
use crate::auth::pat::PatService;
use crate::auth::permission_cache::PermissionCache;
use crate::auth::session::LoginSessionStore;
use crate::auth::store::MemoryKvStore;
use crate::auth::token::TokenService;
use crate::auth::totp::TotpEngine;
use crate::auth::two_factor::TotpService;
use crate::config::AppConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// 认证状态
///
/// 包含认证系统所需的所有运行时状态和服务。
pub struct AuthState {
    pub config: AppConfig,
    /// 临时键存储（验证码、登录会话、权限缓存）
    pub kv: Arc<MemoryKvStore>,
    /// 持久数据
    pub db: Arc<MemoryDatabase>,
    pub passwords: Arc<PasswordManager>,
    pub captcha: Arc<CaptchaService>,
    pub permission_cache: Arc<PermissionCache>,
    pub events: Arc<EventBus>,
    pub tokens: Arc<TokenService>,
    pub totp: Arc<TotpService>,
    pub pats: Arc<PatService>,
    pub login: Arc<LoginOrchestrator>,
    pub accounts: Arc<AccountService>,
    pub authenticator: Arc<Authenticator>,
}

impl AuthState {
    /// 使用进程内存储创建认证状态
    ///
    /// 未配置 JWT 密钥时随机生成，重启后已签发的令牌全部失效。
    pub fn in_memory(config: AppConfig) -> Result<Arc<Self>, AuthError> {
        config.validate()?;

        let secret = match &config.jwt.secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("未配置 JWT 密钥，使用随机密钥，重启后令牌失效");
                JwtCodec::generate_secret()
            }
        };
        let codec = Arc::new(JwtCodec::new(
            secret.as_bytes(),
            config.access_token_ttl(),
            config.refresh_token_ttl(),
        ));

        let kv = Arc::new(MemoryKvStore::new());
        let db = Arc::new(MemoryDatabase::new());
        let prefix = config.cache.key_prefix.clone();

        let passwords = Arc::new(PasswordManager::new(
            config.password.bcrypt_cost,
            config.password.policy.clone(),
        ));
        let captcha_store = CaptchaStore::new(kv.clone(), prefix.clone());
        let captcha = Arc::new(CaptchaService::new(
            captcha_store.clone(),
            config.captcha_ttl(),
            config.captcha.length,
            config.captcha.dev_secret.clone(),
        ));
        let sessions = LoginSessionStore::new(kv.clone(), prefix.clone(), config.login_session_ttl());
        let permission_cache = Arc::new(PermissionCache::new(
            kv.clone(),
            db.clone(),
            prefix,
            config.permission_cache_ttl(),
            config.cache_write_timeout(),
        ));

        let events = Arc::new(EventBus::new(config.event_handler_timeout()));
        Arc::new(CacheInvalidationHandler::new(permission_cache.clone())).register(&events);
        Arc::new(AuditLogHandler::new(db.clone())).register(&events);

        let tokens = Arc::new(TokenService::new(codec.clone(), db.clone()));
        let totp = Arc::new(TotpService::new(
            db.clone(),
            db.clone(),
            TotpEngine::new(config.totp.issuer.clone(), config.totp.skew),
        ));
        let pats = Arc::new(PatService::new(
            db.clone(),
            db.clone(),
            config.pat_last_used_timeout(),
        ));
        let login = Arc::new(LoginOrchestrator::new(
            captcha_store,
            db.clone(),
            sessions,
            totp.clone(),
            tokens.clone(),
            events.clone(),
        ));
        let accounts = Arc::new(AccountService::new(
            db.clone(),
            db.clone(),
            passwords.clone(),
            tokens.clone(),
            pats.clone(),
            permission_cache.clone(),
            events.clone(),
        ));
        let authenticator = Arc::new(Authenticator::new(
            codec,
            pats.clone(),
            db.clone(),
            permission_cache.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            kv,
            db,
            passwords,
            captcha,
            permission_cache,
            events,
            tokens,
            totp,
            pats,
            login,
            accounts,
            authenticator,
        }))
    }

    /// 启动后台清理任务
    pub async fn start_background_tasks(&self) {
        info!("Starting auth background tasks");
        self.kv.start_cleanup_task().await;
        self.pats
            .start_cleanup_task(self.config.pat_cleanup_interval())
            .await;
    }

    /// 停止后台任务并等待未完成的事件处理与缓存写回
    pub async fn shutdown(&self) {
        info!("Stopping auth background tasks");
        self.kv.stop_cleanup_task().await;
        self.pats.stop_cleanup_task().await;
        self.pats.flush().await;
        self.permission_cache.flush_writes().await;
        self.events.shutdown().await;
    }
}

/// 单元测试用配置：固定密钥、最低 bcrypt 成本
#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.jwt.secret = Some("unit-test-secret".to_string());
    config.password.bcrypt_cost = crate::auth::password::MIN_BCRYPT_COST;
    // 生成与校验之间可能跨过 30 秒边界
    config.totp.skew = 1;
    config
}
