//! 管理后台认证服务
//!
//! 提供登录（含验证码与 TOTP 双因素）、JWT 令牌、个人访问令牌与 RBAC 权限判定。

pub mod auth;
pub mod config;
