//! 登录编排模块
//!
//! 两阶段登录：
//! 1. 验证码 → 查找用户 → 状态检查 → 密码校验
//! 2. 若启用了 TOTP，凭一次性会话令牌提交 TOTP 码或恢复码
//!
//! 验证码在密码校验之前消耗，TOTP 密钥只在密码通过后读取。

use crate::auth::captcha::CaptchaStore;
use crate::auth::error::AuthError;
use crate::auth::event::{ClientInfo, DomainEvent, EventBus};
use crate::auth::model::User;
use crate::auth::password::PasswordManager;
use crate::auth::repository::UserRepository;
use crate::auth::session::LoginSessionStore;
use crate::auth::token::{ensure_can_login, TokenService};
use crate::auth::two_factor::TotpService;
use crate::auth::types::TokenPair;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 失败原因（写入 `login.failed` 事件）
const REASON_CAPTCHA: &str = "captcha";
const REASON_USER_NOT_FOUND: &str = "user_not_found";
const REASON_PASSWORD: &str = "password";
const REASON_BANNED: &str = "banned";
const REASON_INACTIVE: &str = "inactive";
const REASON_TWO_FACTOR: &str = "2fa";

/// 第一阶段请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    /// 用户名或邮箱
    pub account: String,
    pub password: String,
    pub captcha_id: String,
    pub captcha: String,
}

/// 第二阶段请求
#[derive(Debug, Clone, Deserialize)]
pub struct TwoFactorLoginRequest {
    pub session_token: String,
    /// 6 位 TOTP 码或 `####-####` 恢复码
    pub two_factor_code: String,
}

/// 第一阶段结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LoginOutcome {
    Issued(TokenPair),
    Requires2fa {
        requires_2fa: bool,
        session_token: String,
    },
}

impl LoginOutcome {
    fn awaiting_2fa(session_token: String) -> Self {
        LoginOutcome::Requires2fa {
            requires_2fa: true,
            session_token,
        }
    }

    pub fn requires_2fa(&self) -> bool {
        matches!(self, LoginOutcome::Requires2fa { .. })
    }
}

/// 登录编排器
pub struct LoginOrchestrator {
    captcha: CaptchaStore,
    users: Arc<dyn UserRepository>,
    sessions: LoginSessionStore,
    totp: Arc<TotpService>,
    tokens: Arc<TokenService>,
    events: Arc<EventBus>,
}

impl LoginOrchestrator {
    pub fn new(
        captcha: CaptchaStore,
        users: Arc<dyn UserRepository>,
        sessions: LoginSessionStore,
        totp: Arc<TotpService>,
        tokens: Arc<TokenService>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            captcha,
            users,
            sessions,
            totp,
            tokens,
            events,
        }
    }

    fn login_failed(&self, identifier: &str, reason: &str, client: &ClientInfo) {
        self.events.publish(DomainEvent::LoginFailed {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
            client: client.clone(),
        });
    }

    fn login_succeeded(&self, user: &User, client: &ClientInfo) {
        self.events.publish(DomainEvent::LoginSucceeded {
            user_id: user.id,
            username: user.username.clone(),
            client: client.clone(),
        });
    }

    /// 状态检查，失败时同时记录事件
    fn gate(&self, user: &User, identifier: &str, client: &ClientInfo) -> Result<(), AuthError> {
        ensure_can_login(user).map_err(|e| {
            let reason = match e {
                AuthError::UserBanned => REASON_BANNED,
                _ => REASON_INACTIVE,
            };
            warn!("login rejected for user {} ({})", user.id, reason);
            self.login_failed(identifier, reason, client);
            e
        })
    }

    async fn find_account(&self, account: &str) -> Result<Option<User>, AuthError> {
        if let Some(user) = self.users.find_user_by_username(account).await? {
            return Ok(Some(user));
        }
        self.users.find_user_by_email(account).await
    }

    /// 第一阶段：验证码与密码
    pub async fn login(
        &self,
        request: &LoginRequest,
        client: &ClientInfo,
    ) -> Result<LoginOutcome, AuthError> {
        let account = request.account.trim();
        if account.is_empty()
            || request.password.is_empty()
            || request.captcha_id.trim().is_empty()
            || request.captcha.trim().is_empty()
        {
            return Err(AuthError::InvalidRequest(
                "账号、密码和验证码不能为空".to_string(),
            ));
        }

        if !self
            .captcha
            .verify(request.captcha_id.trim(), &request.captcha)
            .await?
        {
            debug!("captcha mismatch for account {}", account);
            self.login_failed(account, REASON_CAPTCHA, client);
            return Err(AuthError::InvalidCaptcha);
        }

        let user = match self.find_account(account).await? {
            Some(user) => user,
            None => {
                self.login_failed(account, REASON_USER_NOT_FOUND, client);
                return Err(AuthError::InvalidCredentials);
            }
        };

        self.gate(&user, account, client)?;

        if !PasswordManager::verify_password_async(&request.password, &user.password_hash).await? {
            self.login_failed(account, REASON_PASSWORD, client);
            return Err(AuthError::InvalidCredentials);
        }

        if self.totp.is_enabled(user.id).await? {
            let session_token = self.sessions.create(user.id, account).await?;
            debug!("user {} passed password check, awaiting 2FA", user.id);
            return Ok(LoginOutcome::awaiting_2fa(session_token));
        }

        let pair = self.tokens.issue_token_pair(&user)?;
        info!("user {} logged in from {}", user.id, client.ip_address);
        self.login_succeeded(&user, client);
        Ok(LoginOutcome::Issued(pair))
    }

    /// 第二阶段：会话令牌 + TOTP 码或恢复码
    ///
    /// 会话令牌在第一次调用时即被消耗，校验失败也不能重试。
    pub async fn login_2fa(
        &self,
        session_token: &str,
        code: &str,
        client: &ClientInfo,
    ) -> Result<TokenPair, AuthError> {
        let session = self.sessions.consume(session_token.trim()).await?;
        let identifier = session.login_identifier.as_str();

        let user = match self.users.find_user_with_roles(session.user_id).await? {
            Some(user) => user,
            None => {
                self.login_failed(identifier, REASON_USER_NOT_FOUND, client);
                return Err(AuthError::InvalidCredentials);
            }
        };
        self.gate(&user, identifier, client)?;

        let verified = match self.totp.verify(user.id, code).await {
            Ok(verified) => verified,
            Err(AuthError::TotpNotEnabled) => false,
            Err(e) => return Err(e),
        };
        if !verified {
            self.login_failed(identifier, REASON_TWO_FACTOR, client);
            return Err(AuthError::Invalid2FACode);
        }

        let pair = self.tokens.issue_token_pair(&user)?;
        info!("user {} completed 2FA login from {}", user.id, client.ip_address);
        self.login_succeeded(&user, client);
        Ok(pair)
    }
}
