//! 应用配置
//!
//! 从 TOML 文件加载，所有字段都有默认值，缺省文件时使用 `AppConfig::default()`。

use crate::auth::error::AuthError;
use crate::auth::password::{
    PasswordPolicy, DEFAULT_BCRYPT_COST, MAX_BCRYPT_COST, MIN_BCRYPT_COST,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// 登录会话 TTL 上限（秒）
pub const MAX_LOGIN_SESSION_TTL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub cache: CacheConfig,
    pub captcha: CaptchaConfig,
    pub login: LoginConfig,
    pub totp: TotpSettings,
    pub password: PasswordConfig,
    pub pat: PatConfig,
    pub events: EventConfig,
    pub seed: SeedConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// 是否信任 X-Forwarded-For / X-Real-IP，仅在可信反向代理之后开启
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            trust_proxy_headers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// HMAC 签名密钥，为空时启动阶段随机生成
    pub secret: Option<String>,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: None,
            access_token_ttl_secs: 15 * 60,
            refresh_token_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 所有临时键的公共前缀
    pub key_prefix: String,
    pub permission_ttl_secs: u64,
    pub write_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "console:".to_string(),
            permission_ttl_secs: 5 * 60,
            write_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    pub ttl_secs: u64,
    pub length: usize,
    /// 开发模式密钥，配置后 `?code=1&secret=<dev_secret>` 会在响应中返回验证码
    pub dev_secret: Option<String>,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5 * 60,
            length: 4,
            dev_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub session_ttl_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: MAX_LOGIN_SESSION_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TotpSettings {
    pub issuer: String,
    /// 允许的时间步偏移，0 表示只接受当前时间步
    pub skew: u8,
}

impl Default for TotpSettings {
    fn default() -> Self {
        Self {
            issuer: "Console Admin".to_string(),
            skew: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    pub bcrypt_cost: u32,
    #[serde(flatten)]
    pub policy: PasswordPolicy,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            policy: PasswordPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatConfig {
    pub cleanup_interval_secs: u64,
    pub last_used_timeout_ms: u64,
}

impl Default for PatConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60 * 60,
            last_used_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub handler_timeout_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 5000,
        }
    }
}

/// 初始管理员账户（三项都配置时才创建）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub admin_username: Option<String>,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// 解析 TOML 文本
    pub fn from_toml_str(content: &str) -> Result<Self, AuthError> {
        let config: AppConfig =
            toml::from_str(content).map_err(|e| AuthError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config.normalized())
    }

    /// 从文件加载，文件不存在时使用默认配置
    pub async fn load(path: &Path) -> Result<Self, AuthError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            warn!("配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AuthError::Config(format!("读取配置文件失败: {}", e)))?;
        Self::from_toml_str(&content)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.jwt.access_token_ttl_secs == 0 || self.jwt.refresh_token_ttl_secs == 0 {
            return Err(AuthError::Config("令牌有效期必须大于 0".to_string()));
        }
        if self.captcha.length == 0 {
            return Err(AuthError::Config("验证码长度必须大于 0".to_string()));
        }
        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&self.password.bcrypt_cost) {
            return Err(AuthError::Config(format!(
                "bcrypt cost 必须在 {}..={} 之间",
                MIN_BCRYPT_COST, MAX_BCRYPT_COST
            )));
        }
        if self.cache.write_timeout_ms == 0 {
            return Err(AuthError::Config("缓存写入超时必须大于 0".to_string()));
        }
        if self.pat.cleanup_interval_secs == 0 {
            return Err(AuthError::Config("PAT 清理间隔必须大于 0".to_string()));
        }
        if let Some(secret) = &self.jwt.secret {
            if secret.trim().is_empty() {
                return Err(AuthError::Config("JWT 密钥不能为空字符串".to_string()));
            }
        }
        Ok(())
    }

    fn normalized(mut self) -> Self {
        if self.login.session_ttl_secs == 0
            || self.login.session_ttl_secs > MAX_LOGIN_SESSION_TTL_SECS
        {
            self.login.session_ttl_secs = MAX_LOGIN_SESSION_TTL_SECS;
        }
        self
    }

    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.jwt.access_token_ttl_secs)
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.jwt.refresh_token_ttl_secs)
    }

    pub fn captcha_ttl(&self) -> Duration {
        Duration::from_secs(self.captcha.ttl_secs)
    }

    pub fn login_session_ttl(&self) -> Duration {
        Duration::from_secs(self.login.session_ttl_secs.min(MAX_LOGIN_SESSION_TTL_SECS))
    }

    pub fn permission_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.permission_ttl_secs)
    }

    pub fn cache_write_timeout(&self) -> Duration {
        Duration::from_millis(self.cache.write_timeout_ms)
    }

    pub fn pat_last_used_timeout(&self) -> Duration {
        Duration::from_millis(self.pat.last_used_timeout_ms)
    }

    pub fn pat_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.pat.cleanup_interval_secs)
    }

    pub fn event_handler_timeout(&self) -> Duration {
        Duration::from_millis(self.events.handler_timeout_ms)
    }
}
