//! 认证错误处理模块
//!
//! 提供统一的错误类型定义，以及到 HTTP 响应的映射。
//! 响应体统一为 `{ "error": "<message>" }`。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// 认证与授权错误
#[derive(Debug, Error)]
pub enum AuthError {
    /// 请求参数错误
    #[error("请求参数错误: {0}")]
    InvalidRequest(String),

    /// 验证码错误或已过期
    #[error("验证码错误或已过期")]
    InvalidCaptcha,

    /// 密码不符合策略
    #[error("密码强度不足: {0}")]
    WeakPassword(String),

    /// 用户名或密码错误（不区分是哪一项）
    #[error("用户名或密码错误")]
    InvalidCredentials,

    /// 令牌无效
    #[error("令牌无效或已过期")]
    InvalidToken,

    /// 访问令牌已禁用或已过期
    #[error("访问令牌已禁用或已过期")]
    TokenInactiveOrExpired,

    /// 登录会话已过期
    #[error("登录会话已过期，请重新登录")]
    SessionExpired,

    /// 双因素验证码错误
    #[error("双因素验证码错误")]
    Invalid2FACode,

    /// 客户端 IP 不在白名单内
    #[error("当前 IP 不允许使用该令牌")]
    IpNotAllowed,

    /// 未认证
    #[error("未认证: {0}")]
    Unauthorized(String),

    /// 用户已被封禁
    #[error("用户已被封禁")]
    UserBanned,

    /// 用户未激活
    #[error("用户未激活")]
    UserInactive,

    /// 无权访问
    #[error("无权访问: {0}")]
    Forbidden(String),

    /// 申请的权限超出用户自身权限
    #[error("无法授予未拥有的权限: {0}")]
    PermissionNotGranted(String),

    /// 用户不存在
    #[error("用户不存在")]
    UserNotFound,

    /// 资源不存在
    #[error("{0} 不存在")]
    NotFound(String),

    /// 尚未设置双因素认证
    #[error("请先设置双因素认证")]
    TotpNotSetup,

    /// 双因素认证未启用
    #[error("双因素认证未启用")]
    TotpNotEnabled,

    /// 双因素认证已启用
    #[error("双因素认证已启用，请先关闭")]
    TotpAlreadyEnabled,

    /// 资源冲突（如用户名已存在）
    #[error("{0}")]
    Conflict(String),

    /// 哈希错误
    #[error("哈希错误: {0}")]
    Hash(String),

    /// TOTP 错误
    #[error("TOTP 错误: {0}")]
    Totp(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    Storage(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误响应结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl AuthError {
    /// 转换为 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidRequest(_)
            | AuthError::InvalidCaptcha
            | AuthError::WeakPassword(_)
            | AuthError::TotpNotSetup
            | AuthError::TotpNotEnabled
            | AuthError::TotpAlreadyEnabled => 400,
            AuthError::InvalidCredentials
            | AuthError::InvalidToken
            | AuthError::TokenInactiveOrExpired
            | AuthError::SessionExpired
            | AuthError::Invalid2FACode
            | AuthError::IpNotAllowed
            | AuthError::Unauthorized(_) => 401,
            AuthError::UserBanned
            | AuthError::UserInactive
            | AuthError::Forbidden(_)
            | AuthError::PermissionNotGranted(_) => 403,
            AuthError::UserNotFound | AuthError::NotFound(_) => 404,
            AuthError::Conflict(_) => 409,
            AuthError::Hash(_)
            | AuthError::Totp(_)
            | AuthError::Config(_)
            | AuthError::Storage(_)
            | AuthError::Internal(_) => 500,
        }
    }

    /// 转换为错误标识（用于日志与审计）
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::InvalidCaptcha => "invalid_captcha",
            AuthError::WeakPassword(_) => "weak_password",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::InvalidToken => "invalid_token",
            AuthError::TokenInactiveOrExpired => "token_inactive_or_expired",
            AuthError::SessionExpired => "session_expired",
            AuthError::Invalid2FACode => "invalid_2fa_code",
            AuthError::IpNotAllowed => "ip_not_allowed",
            AuthError::Unauthorized(_) => "unauthorized",
            AuthError::UserBanned => "user_banned",
            AuthError::UserInactive => "user_inactive",
            AuthError::Forbidden(_) => "forbidden",
            AuthError::PermissionNotGranted(_) => "permission_not_granted",
            AuthError::UserNotFound => "user_not_found",
            AuthError::NotFound(_) => "not_found",
            AuthError::TotpNotSetup => "totp_not_setup",
            AuthError::TotpNotEnabled => "totp_not_enabled",
            AuthError::TotpAlreadyEnabled => "totp_already_enabled",
            AuthError::Conflict(_) => "conflict",
            AuthError::Hash(_) => "hash_error",
            AuthError::Totp(_) => "totp_error",
            AuthError::Config(_) => "config_error",
            AuthError::Storage(_) => "storage_error",
            AuthError::Internal(_) => "internal_error",
        }
    }

    /// 是否为服务端错误
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// 转换为错误响应
    ///
    /// 服务端错误只返回通用消息，细节写入日志。
    pub fn to_response(&self) -> ErrorResponse {
        let message = if self.is_server_error() {
            "服务器内部错误".to_string()
        } else {
            self.to_string()
        };
        ErrorResponse { error: message }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if self.is_server_error() {
            error!("request failed: {} ({})", self, self.error_code());
        }
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_response())).into_response()
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Storage(err.to_string())
    }
}

impl From<bcrypt::BcryptError> for AuthError {
    fn from(err: bcrypt::BcryptError) -> Self {
        AuthError::Hash(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(AuthError::InvalidCaptcha.status_code(), 400);
        assert_eq!(
            AuthError::WeakPassword("too short".to_string()).status_code(),
            400
        );
        assert_eq!(AuthError::InvalidCredentials.status_code(), 401);
        assert_eq!(AuthError::IpNotAllowed.status_code(), 401);
        assert_eq!(AuthError::SessionExpired.status_code(), 401);
        assert_eq!(AuthError::UserBanned.status_code(), 403);
        assert_eq!(
            AuthError::PermissionNotGranted("admin:users:delete".to_string()).status_code(),
            403
        );
        assert_eq!(AuthError::UserNotFound.status_code(), 404);
        assert_eq!(AuthError::Storage("down".to_string()).status_code(), 500);
    }

    #[test]
    fn test_error_response_hides_internal_details() {
        let response = AuthError::Storage("connection refused".to_string()).to_response();
        assert!(!response.error.contains("connection refused"));

        let response = AuthError::InvalidCredentials.to_response();
        assert_eq!(response.error, "用户名或密码错误");
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(AuthError::Invalid2FACode.to_response()).unwrap();
        assert!(body.get("error").is_some());
        assert_eq!(body.as_object().unwrap().len(), 1);
    }
}
