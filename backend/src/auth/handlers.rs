//! 认证 API 处理器模块
//!
//! 公开端点：
//! - 验证码 (GET /api/auth/captcha)
//! - 注册 (POST /api/auth/register)
//! - 登录 (POST /api/auth/login, POST /api/auth/login/2fa)
//! - 令牌刷新 (POST /api/auth/refresh)
//!
//! 需认证端点：
//! - 当前用户、修改密码、TOTP 管理
//! - 个人访问令牌管理
//! - 用户与角色管理（按权限码守卫）

use crate::auth::captcha::CaptchaChallenge;
use crate::auth::error::AuthError;
use crate::auth::login::{LoginOutcome, LoginRequest, TwoFactorLoginRequest};
use crate::auth::middleware::{authenticate, client_info, record_command};
use crate::auth::model::{PatId, PermissionId, RoleId, User, UserId, UserStatus};
use crate::auth::pat::{CreatePatRequest, CreatedPat, PatSummary};
use crate::auth::rbac::{self, Requirement};
use crate::auth::state::AuthState;
use crate::auth::types::{Identity, TokenPair};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post, put, MethodRouter},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

type AppState = Arc<AuthState>;

// ============================================================================
// Request/Response Types
// ============================================================================

/// 验证码查询参数（开发模式）
#[derive(Debug, Default, Deserialize)]
pub struct CaptchaQuery {
    pub code: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user: User,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// TOTP 验证码请求
#[derive(Debug, Deserialize)]
pub struct TotpCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct TotpSetupResponse {
    pub secret: String,
    /// otpauth:// URI
    pub qrcode_url: String,
    /// `data:image/png;base64,…`
    pub qrcode_img: String,
}

#[derive(Debug, Serialize)]
pub struct RecoveryCodesResponse {
    pub recovery_codes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TotpStatusResponse {
    pub enabled: bool,
    pub recovery_codes_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct AssignRolesRequest {
    pub role_ids: Vec<RoleId>,
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: UserStatus,
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionsRequest {
    pub permission_ids: Vec<PermissionId>,
}

/// 通用消息响应
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: &str) -> Json<Self> {
        Json(Self {
            message: message.to_string(),
        })
    }
}

// ============================================================================
// Public endpoints
// ============================================================================

/// GET /api/auth/captcha
pub async fn captcha(
    State(state): State<AppState>,
    Query(query): Query<CaptchaQuery>,
) -> Result<Json<CaptchaChallenge>, AuthError> {
    let reveal = state
        .captcha
        .is_dev_request(query.code.as_deref(), query.secret.as_deref());
    Ok(Json(state.captcha.issue(reveal).await?))
}

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    let (user, tokens) = state
        .accounts
        .register(&req.username, &req.email, &req.password)
        .await?;
    info!("user {} registered", user.username);
    Ok((StatusCode::CREATED, Json(RegisterResponse { user, tokens })))
}

/// POST /api/auth/login
///
/// 未启用 TOTP 时直接返回令牌对；否则返回 `{requires_2fa, session_token}`。
pub async fn login(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginOutcome>, AuthError> {
    let client = client_info(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.config.server.trust_proxy_headers,
    );
    debug!("Login attempt from IP: {}", client.ip_address);
    Ok(Json(state.login.login(&req, &client).await?))
}

/// POST /api/auth/login/2fa
pub async fn login_2fa(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<TwoFactorLoginRequest>,
) -> Result<Json<TokenPair>, AuthError> {
    let client = client_info(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        state.config.server.trust_proxy_headers,
    );
    Ok(Json(
        state
            .login
            .login_2fa(&req.session_token, &req.two_factor_code, &client)
            .await?,
    ))
}

/// POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AuthError> {
    Ok(Json(state.tokens.refresh(&req.refresh_token).await?))
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================================
// Current user
// ============================================================================

/// GET /api/auth/me
pub async fn me(identity: Identity) -> Json<Identity> {
    Json(identity)
}

/// PUT /api/auth/password
pub async fn change_password(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    state
        .accounts
        .change_password(identity.user_id, &req.old_password, &req.new_password)
        .await?;
    Ok(MessageResponse::new("密码已修改"))
}

// ============================================================================
// TOTP
// ============================================================================

/// POST /api/auth/2fa/setup
pub async fn totp_setup(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<TotpSetupResponse>, AuthError> {
    let setup = state.totp.setup(identity.user_id).await?;
    Ok(Json(TotpSetupResponse {
        secret: setup.secret,
        qrcode_url: setup.otpauth_uri,
        qrcode_img: format!("data:image/png;base64,{}", setup.qr_png_base64),
    }))
}

/// POST /api/auth/2fa/verify
pub async fn totp_verify(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<TotpCodeRequest>,
) -> Result<Json<RecoveryCodesResponse>, AuthError> {
    let recovery_codes = state
        .totp
        .verify_and_enable(identity.user_id, &req.code)
        .await?;
    Ok(Json(RecoveryCodesResponse { recovery_codes }))
}

/// POST /api/auth/2fa/disable
///
/// 需要提供当前 TOTP 码或恢复码。
pub async fn totp_disable(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<TotpCodeRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    if !state.totp.verify(identity.user_id, &req.code).await? {
        return Err(AuthError::Invalid2FACode);
    }
    state.totp.disable(identity.user_id).await?;
    Ok(MessageResponse::new("双因素认证已关闭"))
}

/// GET /api/auth/2fa/status
pub async fn totp_status(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<TotpStatusResponse>, AuthError> {
    let status = state.totp.status(identity.user_id).await?;
    Ok(Json(TotpStatusResponse {
        enabled: status.enabled,
        recovery_codes_count: status.recovery_codes_remaining,
    }))
}

// ============================================================================
// Personal access tokens
// ============================================================================

/// GET /api/user/tokens
pub async fn list_tokens(
    State(state): State<AppState>,
    identity: Identity,
) -> Result<Json<Vec<PatSummary>>, AuthError> {
    Ok(Json(state.pats.list(identity.user_id).await?))
}

/// POST /api/user/tokens
///
/// 通过 PAT 调用时，新令牌的权限以调用方令牌的权限为上限。
pub async fn create_token(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<CreatePatRequest>,
) -> Result<(StatusCode, Json<CreatedPat>), AuthError> {
    let created = if identity.is_pat() {
        state
            .pats
            .create_scoped(identity.user_id, req, &identity.permissions)
            .await?
    } else {
        state.pats.create(identity.user_id, req).await?
    };
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /api/user/tokens/:id/disable
pub async fn disable_token(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<PatId>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.pats.disable(identity.user_id, id).await?;
    Ok(MessageResponse::new("令牌已禁用"))
}

/// POST /api/user/tokens/:id/enable
pub async fn enable_token(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<PatId>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.pats.enable(identity.user_id, id).await?;
    Ok(MessageResponse::new("令牌已启用"))
}

/// DELETE /api/user/tokens/:id
pub async fn delete_token(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<PatId>,
) -> Result<StatusCode, AuthError> {
    state.pats.delete(identity.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Administration
// ============================================================================

/// GET /api/users/:id（管理员或本人）
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> Result<Json<User>, AuthError> {
    Ok(Json(state.accounts.get_user(id).await?))
}

/// PUT /api/admin/users/:id/roles
pub async fn assign_user_roles(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(req): Json<AssignRolesRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.accounts.assign_roles(id, &req.role_ids).await?;
    Ok(MessageResponse::new("角色已更新"))
}

/// PUT /api/admin/users/:id/status
pub async fn set_user_status(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(req): Json<SetStatusRequest>,
) -> Result<Json<User>, AuthError> {
    Ok(Json(state.accounts.set_status(id, req.status).await?))
}

/// DELETE /api/admin/users/:id
pub async fn delete_user(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<UserId>,
) -> Result<StatusCode, AuthError> {
    if identity.user_id == id {
        return Err(AuthError::InvalidRequest("不能删除自己".to_string()));
    }
    state.accounts.delete_user(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/admin/roles/:id/permissions
pub async fn set_role_permissions(
    State(state): State<AppState>,
    Path(id): Path<RoleId>,
    Json(req): Json<SetPermissionsRequest>,
) -> Result<Json<MessageResponse>, AuthError> {
    state
        .accounts
        .set_role_permissions(id, &req.permission_ids)
        .await?;
    Ok(MessageResponse::new("角色权限已更新"))
}

/// DELETE /api/admin/roles/:id
pub async fn delete_role(
    State(state): State<AppState>,
    Path(id): Path<RoleId>,
) -> Result<StatusCode, AuthError> {
    state.accounts.delete_role(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Router
// ============================================================================

fn guarded(route: MethodRouter<AppState>, requirement: Requirement) -> MethodRouter<AppState> {
    route.route_layer(middleware::from_fn_with_state(requirement, rbac::guard))
}

/// 构建完整路由
pub fn router(state: AppState) -> Router {
    use Requirement::Permission;

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/auth/captcha", get(captcha))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/login/2fa", post(login_2fa))
        .route("/api/auth/refresh", post(refresh));

    let protected = Router::new()
        .route("/api/auth/me", get(me))
        .route(
            "/api/auth/password",
            guarded(put(change_password), Requirement::Interactive),
        )
        .route(
            "/api/auth/2fa/setup",
            guarded(post(totp_setup), Requirement::Interactive),
        )
        .route(
            "/api/auth/2fa/verify",
            guarded(post(totp_verify), Requirement::Interactive),
        )
        .route(
            "/api/auth/2fa/disable",
            guarded(post(totp_disable), Requirement::Interactive),
        )
        .route("/api/auth/2fa/status", get(totp_status))
        .route(
            "/api/user/tokens",
            guarded(get(list_tokens), Permission("user:tokens:read")),
        )
        .route(
            "/api/user/tokens",
            guarded(post(create_token), Permission("user:tokens:create")),
        )
        .route(
            "/api/user/tokens/:id",
            guarded(delete(delete_token), Permission("user:tokens:delete")),
        )
        .route(
            "/api/user/tokens/:id/disable",
            guarded(post(disable_token), Permission("user:tokens:disable")),
        )
        .route(
            "/api/user/tokens/:id/enable",
            guarded(post(enable_token), Permission("user:tokens:enable")),
        )
        .route(
            "/api/users/:id",
            guarded(get(get_user), Requirement::admin_or_ownership()),
        )
        .route(
            "/api/admin/users/:id",
            guarded(delete(delete_user), Permission("admin:users:delete")),
        )
        .route(
            "/api/admin/users/:id/roles",
            guarded(put(assign_user_roles), Permission("admin:users:update")),
        )
        .route(
            "/api/admin/users/:id/status",
            guarded(put(set_user_status), Permission("admin:users:update")),
        )
        .route(
            "/api/admin/roles/:id",
            guarded(delete(delete_role), Permission("admin:roles:delete")),
        )
        .route(
            "/api/admin/roles/:id/permissions",
            guarded(put(set_role_permissions), Permission("admin:roles:update")),
        )
        .layer(middleware::from_fn_with_state(state.clone(), record_command))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new().merge(public).merge(protected).with_state(state)
}
