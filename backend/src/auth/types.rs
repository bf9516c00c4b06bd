//! 认证相关的共享类型

use crate::auth::model::{PatId, UserId};
use serde::{Deserialize, Serialize};

/// 令牌对
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// 固定为 `Bearer`
    pub token_type: String,
    /// Access Token 有效期（秒）
    pub expires_in: u64,
}

/// 认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "auth_type")]
pub enum AuthMethod {
    Jwt,
    Pat { pat_id: PatId },
}

/// 请求身份
///
/// 认证中间件写入请求扩展，处理器通过提取器获取。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    #[serde(flatten)]
    pub method: AuthMethod,
}

impl Identity {
    pub fn is_pat(&self) -> bool {
        matches!(self.method, AuthMethod::Pat { .. })
    }

    pub fn pat_id(&self) -> Option<PatId> {
        match self.method {
            AuthMethod::Pat { pat_id } => Some(pat_id),
            AuthMethod::Jwt => None,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
