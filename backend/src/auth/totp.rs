//! TOTP 引擎
//!
//! 密钥生成、otpauth URI、二维码 PNG 与验证码校验，遵循 RFC 6238：
//! 30 秒步长、6 位数字、SHA-1。

use crate::auth::error::AuthError;
use totp_rs::{Algorithm, Secret, TOTP};

/// TOTP 时间步长（秒）
pub const TOTP_STEP: u64 = 30;

/// TOTP 码位数
pub const TOTP_DIGITS: usize = 6;

/// 默认发行者名称
pub const DEFAULT_ISSUER: &str = "Console Admin";

/// 账户名占位（仅校验时使用，不出现在 URI 中）
const VERIFY_ACCOUNT: &str = "user";

/// TOTP 引擎
#[derive(Debug, Clone)]
pub struct TotpEngine {
    issuer: String,
    /// 允许的时间步偏移
    skew: u8,
}

impl Default for TotpEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ISSUER, 0)
    }
}

impl TotpEngine {
    pub fn new(issuer: impl Into<String>, skew: u8) -> Self {
        Self {
            issuer: issuer.into(),
            skew,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// 生成 160 位 Base32 密钥
    pub fn generate_secret() -> String {
        Secret::generate_secret().to_encoded().to_string()
    }

    /// 检查密钥是否为合法 Base32
    pub fn is_valid_secret(secret: &str) -> bool {
        Secret::Encoded(secret.to_string()).to_bytes().is_ok()
    }

    fn build(&self, secret: &str, account: &str) -> Result<TOTP, AuthError> {
        let secret_bytes = Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|e| AuthError::Totp(format!("无效的密钥格式: {:?}", e)))?;

        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            self.skew,
            TOTP_STEP,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| AuthError::Totp(format!("创建 TOTP 失败: {}", e)))
    }

    /// `otpauth://totp/{issuer}:{account}?secret=…&issuer=…`
    pub fn otpauth_uri(&self, secret: &str, account: &str) -> Result<String, AuthError> {
        Ok(self.build(secret, account)?.get_url())
    }

    /// 二维码 PNG（裸 Base64，不含 data URL 前缀）
    pub fn qr_png_base64(&self, secret: &str, account: &str) -> Result<String, AuthError> {
        self.build(secret, account)?
            .get_qr_base64()
            .map_err(|e| AuthError::Totp(format!("生成 QR 码失败: {}", e)))
    }

    /// 校验当前时间的验证码
    pub fn verify_code(&self, secret: &str, code: &str) -> Result<bool, AuthError> {
        let totp = self.build(secret, VERIFY_ACCOUNT)?;
        totp.check_current(code.trim())
            .map_err(|e| AuthError::Totp(format!("系统时间错误: {}", e)))
    }

    /// 校验指定 Unix 时间的验证码
    pub fn verify_code_at(&self, secret: &str, code: &str, time: u64) -> Result<bool, AuthError> {
        Ok(self.build(secret, VERIFY_ACCOUNT)?.check(code.trim(), time))
    }

    /// 当前验证码
    pub fn current_code(&self, secret: &str) -> Result<String, AuthError> {
        self.build(secret, VERIFY_ACCOUNT)?
            .generate_current()
            .map_err(|e| AuthError::Totp(format!("生成验证码失败: {}", e)))
    }

    /// 指定 Unix 时间的验证码
    pub fn code_at(&self, secret: &str, time: u64) -> Result<String, AuthError> {
        Ok(self.build(secret, VERIFY_ACCOUNT)?.generate(time))
    }
}
