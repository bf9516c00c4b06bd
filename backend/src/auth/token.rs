//! Token 服务模块
//!
//! 签发 Access/Refresh 令牌对，以及用 Refresh Token 换取新令牌对。
//! 刷新时重新加载用户并检查状态，被封禁或停用的用户无法续期。

use crate::auth::error::AuthError;
use crate::auth::jwt::JwtCodec;
use crate::auth::model::{User, UserStatus};
use crate::auth::repository::UserRepository;
use crate::auth::types::TokenPair;
use std::sync::Arc;
use tracing::debug;

/// 令牌类型
pub const TOKEN_TYPE_BEARER: &str = "Bearer";

/// 检查用户状态是否允许获得令牌
pub fn ensure_can_login(user: &User) -> Result<(), AuthError> {
    match user.status {
        UserStatus::Banned => Err(AuthError::UserBanned),
        UserStatus::Inactive => Err(AuthError::UserInactive),
        UserStatus::Active => Ok(()),
    }
}

/// Token 服务
pub struct TokenService {
    codec: Arc<JwtCodec>,
    users: Arc<dyn UserRepository>,
}

impl TokenService {
    pub fn new(codec: Arc<JwtCodec>, users: Arc<dyn UserRepository>) -> Self {
        Self { codec, users }
    }

    pub fn codec(&self) -> &JwtCodec {
        &self.codec
    }

    /// 签发令牌对
    pub fn issue_token_pair(&self, user: &User) -> Result<TokenPair, AuthError> {
        ensure_can_login(user)?;
        let access = self.codec.sign_access(user)?;
        let refresh_token = self.codec.sign_refresh(user.id)?;
        debug!("issued token pair for user {}", user.id);
        Ok(TokenPair {
            access_token: access.token,
            refresh_token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            expires_in: self.codec.access_ttl().as_secs(),
        })
    }

    /// 刷新令牌对
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.codec.verify_refresh(refresh_token)?;
        let user = self
            .users
            .find_user_with_roles(claims.user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        ensure_can_login(&user)?;
        self.issue_token_pair(&user)
    }
}
