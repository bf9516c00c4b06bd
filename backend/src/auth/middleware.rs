//! 认证中间件模块
//!
//! 从 `Authorization: Bearer <token>` 识别调用者：
//! - `pat_` 前缀按个人访问令牌校验
//! - 其余按 Access JWT 校验，角色与权限经权限缓存解析
//!
//! 通过后将 [`Identity`] 写入请求扩展，处理器用提取器获取。
//! 任何校验失败都返回 401。

use crate::auth::error::AuthError;
use crate::auth::event::{ClientInfo, DomainEvent};
use crate::auth::jwt::JwtCodec;
use crate::auth::pat::{PatService, PAT_PREFIX};
use crate::auth::permission_cache::PermissionCache;
use crate::auth::rbac::has_permission;
use crate::auth::repository::UserRepository;
use crate::auth::state::AuthState;
use crate::auth::types::{AuthMethod, Identity};
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Authorization Header 前缀
const BEARER_PREFIX: &str = "Bearer ";

/// Bearer 凭证分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerCredential<'a> {
    Pat(&'a str),
    Jwt(&'a str),
}

impl<'a> BearerCredential<'a> {
    pub fn classify(token: &'a str) -> Self {
        if token.starts_with(PAT_PREFIX) {
            BearerCredential::Pat(token)
        } else {
            BearerCredential::Jwt(token)
        }
    }
}

/// 从 Authorization Header 提取 Bearer 令牌
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix(BEARER_PREFIX)?.trim();
    (!token.is_empty()).then_some(token)
}

/// 从请求中提取客户端 IP
///
/// `trust_proxy` 为真时依次尝试 X-Forwarded-For（第一跳）、X-Real-IP，
/// 否则只使用连接地址，代理头一律忽略。
pub fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy: bool,
) -> Option<String> {
    if !trust_proxy {
        return peer.map(|addr| addr.ip().to_string());
    }

    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip) = value.split(',').next().map(str::trim) {
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            let ip = value.trim();
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
}

/// 从请求中提取来源信息（审计用）
pub fn client_info(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> ClientInfo {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    ClientInfo::new(
        extract_client_ip(headers, peer, trust_proxy).unwrap_or_else(|| "unknown".to_string()),
        user_agent,
    )
}

fn peer_addr<B>(request: &Request<B>) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// 调用者认证
pub struct Authenticator {
    codec: Arc<JwtCodec>,
    pats: Arc<PatService>,
    users: Arc<dyn UserRepository>,
    cache: Arc<PermissionCache>,
}

impl Authenticator {
    pub fn new(
        codec: Arc<JwtCodec>,
        pats: Arc<PatService>,
        users: Arc<dyn UserRepository>,
        cache: Arc<PermissionCache>,
    ) -> Self {
        Self {
            codec,
            pats,
            users,
            cache,
        }
    }

    /// 校验 Bearer 令牌并构造身份
    ///
    /// 服务端错误原样返回，其余错误统一为 `Unauthorized`。
    pub async fn authenticate(
        &self,
        token: &str,
        client_ip: Option<&str>,
    ) -> Result<Identity, AuthError> {
        let result = match BearerCredential::classify(token) {
            BearerCredential::Pat(token) => self.authenticate_pat(token, client_ip).await,
            BearerCredential::Jwt(token) => self.authenticate_jwt(token).await,
        };
        result.map_err(|e| {
            if e.is_server_error() {
                e
            } else {
                AuthError::Unauthorized(e.to_string())
            }
        })
    }

    async fn authenticate_pat(
        &self,
        token: &str,
        client_ip: Option<&str>,
    ) -> Result<Identity, AuthError> {
        let pat = self.pats.validate(token, client_ip).await?;
        let user = self
            .users
            .find_user_with_roles(pat.user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if !user.can_login() {
            return Err(AuthError::InvalidToken);
        }

        // 令牌权限与用户当前权限取交集
        let current = user.permission_codes();
        let permissions = pat
            .permissions
            .into_iter()
            .filter(|code| has_permission(current.as_slice(), code))
            .collect();

        Ok(Identity {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.role_names(),
            permissions,
            method: AuthMethod::Pat { pat_id: pat.id },
        })
    }

    async fn authenticate_jwt(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.codec.verify_access(token)?;
        let resolved = self.cache.get_user_permissions(claims.user_id).await?;
        Ok(Identity {
            user_id: claims.user_id,
            username: claims.username,
            email: claims.email,
            roles: resolved.roles,
            permissions: resolved.permissions,
            method: AuthMethod::Jwt,
        })
    }
}

/// 认证中间件
pub async fn authenticate(
    State(state): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = match extract_bearer(request.headers()) {
        Some(token) => token.to_string(),
        None => {
            debug!("missing bearer token for {} {}", request.method(), request.uri().path());
            return AuthError::Unauthorized("未提供认证令牌".to_string()).into_response();
        }
    };
    let client_ip = extract_client_ip(
        request.headers(),
        peer_addr(&request),
        state.config.server.trust_proxy_headers,
    );

    match state
        .authenticator
        .authenticate(&token, client_ip.as_deref())
        .await
    {
        Ok(identity) => {
            debug!(
                "authenticated user {} via {:?} for {} {}",
                identity.user_id,
                identity.method,
                request.method(),
                request.uri().path()
            );
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(e) => {
            debug!("authentication failed for {}: {}", request.uri().path(), e);
            e.into_response()
        }
    }
}

/// 命令审计中间件
///
/// 对已认证的非 GET 请求发布 `command.executed`，需挂在认证中间件内层。
pub async fn record_command(
    State(state): State<Arc<AuthState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
        return next.run(request).await;
    }
    let Some(identity) = request.extensions().get::<Identity>().cloned() else {
        return next.run(request).await;
    };
    let path = request.uri().path().to_string();
    let client = client_info(
        request.headers(),
        peer_addr(&request),
        state.config.server.trust_proxy_headers,
    );

    let response = next.run(request).await;
    let status = response.status();

    let resource_id = path
        .rsplit('/')
        .find(|segment| segment.parse::<u64>().is_ok())
        .unwrap_or_default()
        .to_string();
    state.events.publish(DomainEvent::CommandExecuted {
        user_id: identity.user_id,
        username: identity.username,
        action: method.as_str().to_ascii_lowercase(),
        resource: path,
        resource_id,
        details: format!("status={}", status.as_u16()),
        success: !status.is_client_error() && !status.is_server_error(),
        client,
    });
    response
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or_else(|| AuthError::Unauthorized("未认证".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::account::NewUser;
    use crate::auth::model::UserStatus;
    use crate::auth::pat::CreatePatRequest;
    use crate::auth::seed;
    use crate::auth::state::{test_config, AuthState};
    use axum::http::HeaderValue;

    #[test]
    fn test_classify() {
        assert_eq!(
            BearerCredential::classify("pat_abcd_xyz"),
            BearerCredential::Pat("pat_abcd_xyz")
        );
        assert_eq!(
            BearerCredential::classify("eyJhbGciOi"),
            BearerCredential::Jwt("eyJhbGciOi")
        );
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert!(extract_bearer(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer(&headers), Some("abc.def"));
    }

    #[test]
    fn test_extract_client_ip_order() {
        let peer: SocketAddr = "192.168.1.9:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(
            extract_client_ip(&headers, Some(peer), true).as_deref(),
            Some("192.168.1.9")
        );
        assert_eq!(extract_client_ip(&headers, None, true), None);

        headers.insert("x-real-ip", HeaderValue::from_static(" 10.0.0.2 "));
        assert_eq!(
            extract_client_ip(&headers, Some(peer), true).as_deref(),
            Some("10.0.0.2")
        );

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 172.16.0.1"));
        assert_eq!(
            extract_client_ip(&headers, Some(peer), true).as_deref(),
            Some("10.0.0.1")
        );
    }

    #[test]
    fn test_proxy_headers_ignored_when_untrusted() {
        let peer: SocketAddr = "198.51.100.7:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.10"));
        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.11"));
        assert_eq!(
            extract_client_ip(&headers, Some(peer), false).as_deref(),
            Some("198.51.100.7")
        );
        assert_eq!(extract_client_ip(&headers, None, false), None);
        assert_eq!(client_info(&headers, None, false).ip_address, "unknown");
    }

    async fn state_with_user() -> (Arc<AuthState>, crate::auth::model::User) {
        let state = AuthState::in_memory(test_config()).unwrap();
        seed::seed_defaults(&state).await.unwrap();
        let user = state
            .accounts
            .create_user(NewUser {
                username: "nina".into(),
                email: "n@ex.com".into(),
                password: "Password123!".into(),
                status: UserStatus::Active,
                role_names: vec!["user".into()],
            })
            .await
            .unwrap();
        (state, user)
    }

    #[tokio::test]
    async fn test_jwt_identity_resolves_permissions() {
        let (state, user) = state_with_user().await;
        let pair = state.tokens.issue_token_pair(&user).unwrap();
        let identity = state
            .authenticator
            .authenticate(&pair.access_token, None)
            .await
            .unwrap();
        assert_eq!(identity.method, AuthMethod::Jwt);
        assert_eq!(identity.roles, vec!["user".to_string()]);
        assert!(identity.permissions.contains(&"user:profile:read".to_string()));

        assert!(matches!(
            state.authenticator.authenticate(&pair.refresh_token, None).await,
            Err(AuthError::Unauthorized(_))
        ));
        assert!(matches!(
            state.authenticator.authenticate("not-a-jwt", None).await,
            Err(AuthError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_pat_identity_intersects_current_permissions() {
        let (state, user) = state_with_user().await;
        let created = state
            .pats
            .create(
                user.id,
                CreatePatRequest {
                    name: "ci".into(),
                    permissions: vec!["user:profile:read".into(), "user:tokens:read".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let identity = state
            .authenticator
            .authenticate(&created.token, Some("1.2.3.4"))
            .await
            .unwrap();
        assert!(identity.is_pat());
        assert_eq!(identity.pat_id(), Some(created.id));
        assert_eq!(identity.permissions.len(), 2);

        // 用户失去全部角色后，令牌不再携带任何权限
        state.accounts.assign_roles(user.id, &[]).await.unwrap();
        let identity = state
            .authenticator
            .authenticate(&created.token, None)
            .await
            .unwrap();
        assert!(identity.permissions.is_empty());

        state.accounts.set_status(user.id, UserStatus::Banned).await.unwrap();
        assert!(matches!(
            state.authenticator.authenticate(&created.token, None).await,
            Err(AuthError::Unauthorized(_))
        ));
    }
}
