//! RBAC 权限判定
//!
//! 权限码为 `domain:resource:action`，授予方的任一段可为 `*`。
//! 任一方不是三段时只做精确匹配。
//!
//! 除纯函数判定外，还提供可挂在路由上的 axum 中间件：
//! 缺少身份返回 401，权限不足返回 403，路径参数非法返回 400。

use crate::auth::error::AuthError;
use crate::auth::model::UserId;
use crate::auth::types::Identity;
use axum::{
    body::Body,
    extract::{Path, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;

/// 通配符
pub const WILDCARD: &str = "*";

/// 管理员角色名
pub const ADMIN_ROLE: &str = "admin";

/// 默认资源路径参数名
pub const DEFAULT_OWNER_PARAM: &str = "id";

/// 判断单个授予权限是否覆盖所需权限
pub fn match_permission(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }
    let granted_parts: Vec<&str> = granted.split(':').collect();
    let required_parts: Vec<&str> = required.split(':').collect();
    if granted_parts.len() != 3 || required_parts.len() != 3 {
        return false;
    }
    granted_parts
        .iter()
        .zip(required_parts.iter())
        .all(|(g, r)| *g == WILDCARD || g == r)
}

pub fn has_permission<S: AsRef<str>>(granted: &[S], required: &str) -> bool {
    granted.iter().any(|g| match_permission(g.as_ref(), required))
}

pub fn has_any_permission<S: AsRef<str>>(granted: &[S], required: &[&str]) -> bool {
    required.iter().any(|r| has_permission(granted, r))
}

/// 基于请求身份的判定
impl Identity {
    pub fn require_permission(&self, required: &str) -> Result<(), AuthError> {
        if has_permission(&self.permissions, required) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!("缺少权限 {}", required)))
        }
    }

    pub fn require_any_permission(&self, required: &[&str]) -> Result<(), AuthError> {
        if has_any_permission(&self.permissions, required) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!(
                "需要以下任一权限: {}",
                required.join(", ")
            )))
        }
    }

    pub fn require_role(&self, role: &str) -> Result<(), AuthError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!("需要角色 {}", role)))
        }
    }

    pub fn require_any_role(&self, roles: &[&str]) -> Result<(), AuthError> {
        if roles.iter().any(|r| self.has_role(r)) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(format!(
                "需要以下任一角色: {}",
                roles.join(", ")
            )))
        }
    }

    pub fn require_ownership(&self, owner_id: UserId) -> Result<(), AuthError> {
        if self.user_id == owner_id {
            Ok(())
        } else {
            Err(AuthError::Forbidden("只能访问自己的资源".to_string()))
        }
    }

    /// 要求交互式登录（JWT），个人访问令牌不可用于账户安全操作
    pub fn require_interactive(&self) -> Result<(), AuthError> {
        if self.is_pat() {
            Err(AuthError::Forbidden("该操作不允许使用个人访问令牌".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn require_admin_or_ownership(&self, owner_id: UserId) -> Result<(), AuthError> {
        if self.has_role(ADMIN_ROLE) {
            return Ok(());
        }
        self.require_ownership(owner_id)
    }
}

// ============================================================================
// Route guards
// ============================================================================

/// 路由守卫需求
#[derive(Debug, Clone)]
pub enum Requirement {
    Permission(&'static str),
    AnyPermission(&'static [&'static str]),
    Role(&'static str),
    AnyRole(&'static [&'static str]),
    /// 路径参数与调用者 ID 一致
    Ownership(&'static str),
    /// 管理员或路径参数与调用者 ID 一致
    AdminOrOwnership(&'static str),
    /// 仅限 JWT 会话
    Interactive,
}

impl Requirement {
    pub fn ownership() -> Self {
        Requirement::Ownership(DEFAULT_OWNER_PARAM)
    }

    pub fn admin_or_ownership() -> Self {
        Requirement::AdminOrOwnership(DEFAULT_OWNER_PARAM)
    }

    /// 判定身份是否满足需求
    pub fn check(
        &self,
        identity: &Identity,
        params: &HashMap<String, String>,
    ) -> Result<(), AuthError> {
        match self {
            Requirement::Permission(code) => identity.require_permission(code),
            Requirement::AnyPermission(codes) => identity.require_any_permission(codes),
            Requirement::Role(role) => identity.require_role(role),
            Requirement::AnyRole(roles) => identity.require_any_role(roles),
            Requirement::Ownership(param) => {
                identity.require_ownership(parse_owner_param(params, param)?)
            }
            Requirement::AdminOrOwnership(param) => {
                if identity.has_role(ADMIN_ROLE) {
                    return Ok(());
                }
                identity.require_ownership(parse_owner_param(params, param)?)
            }
            Requirement::Interactive => identity.require_interactive(),
        }
    }
}

fn parse_owner_param(params: &HashMap<String, String>, name: &str) -> Result<UserId, AuthError> {
    params
        .get(name)
        .and_then(|raw| raw.parse::<UserId>().ok())
        .ok_or_else(|| AuthError::InvalidRequest(format!("无效的路径参数 {}", name)))
}

/// RBAC 路由守卫中间件
///
/// 使用 `axum::middleware::from_fn_with_state(Requirement::Permission("..."), rbac::guard)`
/// 通过 `route_layer` 挂载。
pub async fn guard(
    State(requirement): State<Requirement>,
    params: Option<Path<HashMap<String, String>>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let params = params.map(|Path(p)| p).unwrap_or_default();
    let identity = match request.extensions().get::<Identity>() {
        Some(identity) => identity,
        None => return AuthError::Unauthorized("缺少认证信息".to_string()).into_response(),
    };
    if let Err(e) = requirement.check(identity, &params) {
        return e.into_response();
    }
    next.run(request).await
}
