//! JWT 编解码模块
//!
//! 两种令牌共用同一个 HMAC 密钥：
//! - Access Token: `{user_id, username, email, iat, nbf, exp}`，默认 15 分钟
//! - Refresh Token: `{user_id, iat, nbf, exp}`，默认 7 天
//!
//! 校验拒绝签名错误、非 HMAC 算法、格式错误、已过期及尚未生效的令牌。

use crate::auth::error::AuthError;
use crate::auth::model::{User, UserId};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Access Token 载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: UserId,
    pub username: String,
    pub email: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Refresh Token 载荷
///
/// 拒绝多余字段，Access Token 因此无法被当作 Refresh Token 使用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshClaims {
    pub user_id: UserId,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// 已签发的 Access Token
#[derive(Debug, Clone)]
pub struct SignedAccessToken {
    pub token: String,
    pub expires_at: i64,
}

/// JWT 编解码器
pub struct JwtCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtCodec {
    pub fn new(secret: &[u8], access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_ttl,
            refresh_ttl,
        }
    }

    /// 生成随机签名密钥（十六进制，256 位）
    pub fn generate_secret() -> String {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        hex::encode(bytes)
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// 签发 Access Token
    pub fn sign_access(&self, user: &User) -> Result<SignedAccessToken, AuthError> {
        let now = Utc::now().timestamp();
        let exp = now + self.access_ttl.as_secs() as i64;
        let claims = AccessClaims {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            iat: now,
            nbf: now,
            exp,
        };
        Ok(SignedAccessToken {
            token: self.encode(&claims)?,
            expires_at: exp,
        })
    }

    /// 签发 Refresh Token
    pub fn sign_refresh(&self, user_id: UserId) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = RefreshClaims {
            user_id,
            iat: now,
            nbf: now,
            exp: now + self.refresh_ttl.as_secs() as i64,
        };
        self.encode(&claims)
    }

    /// 验证 Access Token
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.decode(token)
    }

    /// 验证 Refresh Token
    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        self.decode(token)
    }

    fn encode<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("JWT 签名失败: {}", e)))
    }

    fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, AuthError> {
        decode::<T>(token, &self.decoding_key, &Self::validation())
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("JWT verification failed: {}", e);
                AuthError::InvalidToken
            })
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf"]);
        validation
    }
}
