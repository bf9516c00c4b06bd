//! 双因素认证服务
//!
//! 状态流转：未配置 → 已生成密钥（未启用）→ 已启用 → 关闭后删除。
//! 只有已启用的配置会在登录时要求第二步验证。

use crate::auth::error::AuthError;
use crate::auth::model::{TotpConfig, UserId};
use crate::auth::recovery::RecoveryCodeManager;
use crate::auth::repository::{TotpRepository, UserRepository};
use crate::auth::totp::TotpEngine;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// 设置结果
#[derive(Debug, Clone, Serialize)]
pub struct TotpSetup {
    pub secret: String,
    pub otpauth_uri: String,
    /// 二维码 PNG（裸 Base64）
    pub qr_png_base64: String,
}

/// 双因素状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TotpStatus {
    pub enabled: bool,
    pub recovery_codes_remaining: usize,
}

/// 双因素认证服务
pub struct TotpService {
    repo: Arc<dyn TotpRepository>,
    users: Arc<dyn UserRepository>,
    engine: TotpEngine,
}

impl TotpService {
    pub fn new(
        repo: Arc<dyn TotpRepository>,
        users: Arc<dyn UserRepository>,
        engine: TotpEngine,
    ) -> Self {
        Self {
            repo,
            users,
            engine,
        }
    }

    pub fn engine(&self) -> &TotpEngine {
        &self.engine
    }

    /// 生成新密钥并保存为未启用状态
    pub async fn setup(&self, user_id: UserId) -> Result<TotpSetup, AuthError> {
        let user = self
            .users
            .find_user_with_roles(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        if let Some(existing) = self.repo.find_totp(user_id).await? {
            if existing.is_enabled() {
                return Err(AuthError::TotpAlreadyEnabled);
            }
        }

        let secret = TotpEngine::generate_secret();
        let otpauth_uri = self.engine.otpauth_uri(&secret, &user.username)?;

        let engine = self.engine.clone();
        let qr_secret = secret.clone();
        let account = user.username.clone();
        let qr_png_base64 =
            tokio::task::spawn_blocking(move || engine.qr_png_base64(&qr_secret, &account))
                .await
                .map_err(|e| AuthError::Internal(e.to_string()))??;

        self.repo
            .save_totp(TotpConfig::new(user_id, secret.clone()))
            .await?;
        info!("TOTP secret generated for user {}", user_id);

        Ok(TotpSetup {
            secret,
            otpauth_uri,
            qr_png_base64,
        })
    }

    /// 校验验证码并启用，返回一次性展示的恢复码
    pub async fn verify_and_enable(
        &self,
        user_id: UserId,
        code: &str,
    ) -> Result<Vec<String>, AuthError> {
        let mut config = self
            .repo
            .find_totp(user_id)
            .await?
            .filter(|c| c.has_secret())
            .ok_or(AuthError::TotpNotSetup)?;
        if config.is_enabled() {
            return Err(AuthError::TotpAlreadyEnabled);
        }

        if !self.engine.verify_code(&config.secret, code)? {
            return Err(AuthError::Invalid2FACode);
        }

        let codes = RecoveryCodeManager::generate_codes();
        config.enabled = true;
        config.recovery_codes = codes.clone();
        config.setup_completed_at = Some(Utc::now());
        self.repo.save_totp(config).await?;
        info!("TOTP enabled for user {}", user_id);
        Ok(codes)
    }

    /// 校验 TOTP 码或恢复码
    ///
    /// 未启用时返回 `TotpNotEnabled`；恢复码命中后立即失效。
    pub async fn verify(&self, user_id: UserId, code: &str) -> Result<bool, AuthError> {
        let config = self
            .repo
            .find_totp(user_id)
            .await?
            .filter(|c| c.is_enabled())
            .ok_or(AuthError::TotpNotEnabled)?;

        if self.engine.verify_code(&config.secret, code)? {
            if let Err(e) = self.repo.touch_totp(user_id, Utc::now()).await {
                warn!("failed to record TOTP usage for user {}: {}", user_id, e);
            }
            return Ok(true);
        }

        let candidate = RecoveryCodeManager::normalize(code);
        if !RecoveryCodeManager::is_valid_format(candidate) {
            return Ok(false);
        }
        let consumed = self.repo.consume_recovery_code(user_id, candidate).await?;
        if consumed {
            info!("recovery code consumed for user {}", user_id);
        }
        Ok(consumed)
    }

    pub async fn disable(&self, user_id: UserId) -> Result<(), AuthError> {
        self.repo.delete_totp(user_id).await?;
        info!("TOTP disabled for user {}", user_id);
        Ok(())
    }

    pub async fn is_enabled(&self, user_id: UserId) -> Result<bool, AuthError> {
        Ok(self
            .repo
            .find_totp(user_id)
            .await?
            .map(|c| c.is_enabled())
            .unwrap_or(false))
    }

    pub async fn status(&self, user_id: UserId) -> Result<TotpStatus, AuthError> {
        let config = self.repo.find_totp(user_id).await?;
        Ok(TotpStatus {
            enabled: config.as_ref().map(|c| c.is_enabled()).unwrap_or(false),
            recovery_codes_remaining: config
                .as_ref()
                .map(|c| c.recovery_codes_remaining())
                .unwrap_or(0),
        })
    }
}
