//! 密码管理模块
//!
//! 使用 bcrypt 哈希与校验密码，并按声明式策略检查密码强度。
//! bcrypt 为 CPU 密集操作，异步路径通过 `spawn_blocking` 执行。

use crate::auth::error::AuthError;
use serde::{Deserialize, Serialize};

/// 默认 bcrypt cost
pub const DEFAULT_BCRYPT_COST: u32 = 10;

/// bcrypt 允许的 cost 范围
pub const MIN_BCRYPT_COST: u32 = 4;
pub const MAX_BCRYPT_COST: u32 = 31;

/// 默认最小密码长度
pub const DEFAULT_MIN_PASSWORD_LENGTH: usize = 6;

/// 密码策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_upper: bool,
    pub require_lower: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_PASSWORD_LENGTH,
            require_upper: false,
            require_lower: false,
            require_digit: false,
            require_special: false,
        }
    }
}

impl PasswordPolicy {
    /// 校验密码是否满足策略
    ///
    /// # Returns
    /// * `Ok(())` - 密码符合要求
    /// * `Err(AuthError::WeakPassword)` - 第一个不满足的规则
    pub fn validate(&self, password: &str) -> Result<(), AuthError> {
        if password.chars().count() < self.min_length {
            return Err(AuthError::WeakPassword(format!(
                "密码长度至少需要 {} 个字符",
                self.min_length
            )));
        }
        if self.require_upper && !password.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(AuthError::WeakPassword("密码需要包含大写字母".to_string()));
        }
        if self.require_lower && !password.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(AuthError::WeakPassword("密码需要包含小写字母".to_string()));
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(AuthError::WeakPassword("密码需要包含数字".to_string()));
        }
        if self.require_special && !password.chars().any(|c| !c.is_alphanumeric()) {
            return Err(AuthError::WeakPassword("密码需要包含特殊字符".to_string()));
        }
        Ok(())
    }
}

/// 密码管理器
#[derive(Debug, Clone)]
pub struct PasswordManager {
    cost: u32,
    policy: PasswordPolicy,
}

impl Default for PasswordManager {
    fn default() -> Self {
        Self::new(DEFAULT_BCRYPT_COST, PasswordPolicy::default())
    }
}

impl PasswordManager {
    pub fn new(cost: u32, policy: PasswordPolicy) -> Self {
        Self {
            cost: cost.clamp(MIN_BCRYPT_COST, MAX_BCRYPT_COST),
            policy,
        }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// 使用 bcrypt 哈希密码
    ///
    /// # Arguments
    /// * `password` - 明文密码
    ///
    /// # Returns
    /// * `Ok(String)` - `$2b$` 格式的哈希
    /// * `Err(AuthError::Hash)` - 哈希失败
    pub fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        Ok(bcrypt::hash(password, self.cost)?)
    }

    /// 验证密码是否与哈希匹配（常量时间比较由 bcrypt 完成）
    ///
    /// # Returns
    /// * `Ok(true)` - 密码匹配
    /// * `Ok(false)` - 密码不匹配
    /// * `Err(AuthError::Hash)` - 哈希格式错误
    pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
        Ok(bcrypt::verify(password, hash)?)
    }

    /// 在阻塞线程池中校验并哈希
    pub async fn validate_and_hash_async(&self, password: &str) -> Result<String, AuthError> {
        self.policy.validate(password)?;
        let cost = self.cost;
        let password = password.to_string();
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(AuthError::from)
    }

    /// 在阻塞线程池中校验密码
    pub async fn verify_password_async(password: &str, hash: &str) -> Result<bool, AuthError> {
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(AuthError::from)
    }
}
