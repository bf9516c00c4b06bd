//! HTTP 接口测试

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use console_auth::auth::password::MIN_BCRYPT_COST;
use console_auth::auth::{router, seed, AuthState};
use console_auth::config::AppConfig;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

// ============================================================================
// Test Helpers
// ============================================================================

/// 测试请求的连接地址
const PEER_IP: &str = "192.0.2.10";

async fn app() -> (Router, Arc<AuthState>) {
    app_with(false).await
}

async fn app_with(trust_proxy_headers: bool) -> (Router, Arc<AuthState>) {
    let mut config = AppConfig::default();
    config.server.trust_proxy_headers = trust_proxy_headers;
    config.jwt.secret = Some("http-test-secret".to_string());
    config.password.bcrypt_cost = MIN_BCRYPT_COST;
    config.captcha.dev_secret = Some("dev".to_string());
    config.totp.skew = 1;
    config.seed.admin_username = Some("root".to_string());
    config.seed.admin_email = Some("root@ex.com".to_string());
    config.seed.admin_password = Some("RootPassword1!".to_string());
    let state = AuthState::in_memory(config).unwrap();
    seed::seed_defaults(&state).await.unwrap();
    (router(state.clone()), state)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    send_with_headers(app, method, uri, token, body, &[]).await
}

async fn send_with_headers(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let peer: SocketAddr = format!("{}:40000", PEER_IP).parse().unwrap();
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(peer));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn login(app: &Router, account: &str, password: &str) -> Value {
    let (status, captcha) = send(
        app,
        Method::GET,
        "/api/auth/captcha?code=1&secret=dev",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(
        app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({
            "account": account,
            "password": password,
            "captcha_id": captcha["id"],
            "captcha": captcha["code"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body
}

async fn register(app: &Router, username: &str) -> (u64, String) {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/auth/register",
        None,
        Some(json!({
            "username": username,
            "email": format!("{}@ex.com", username),
            "password": "Password123!",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
    assert!(body["user"].get("password_hash").is_none());
    (
        body["user"]["id"].as_u64().unwrap(),
        body["access_token"].as_str().unwrap().to_string(),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn health_is_public() {
    let (app, _) = app().await;
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn captcha_reveals_code_only_in_dev_mode() {
    let (app, _) = app().await;
    let (_, dev) = send(&app, Method::GET, "/api/auth/captcha?code=1&secret=dev", None, None).await;
    assert_eq!(dev["code"].as_str().unwrap().len(), 4);
    assert!(dev["image"].as_str().unwrap().starts_with("data:image/png;base64,"));
    assert!(dev["expire_at"].as_i64().is_some());

    let (_, normal) = send(&app, Method::GET, "/api/auth/captcha", None, None).await;
    assert!(normal.get("code").is_none());
    let (_, wrong) = send(&app, Method::GET, "/api/auth/captcha?code=1&secret=x", None, None).await;
    assert!(wrong.get("code").is_none());
}

#[tokio::test]
async fn login_returns_token_pair() {
    let (app, _) = app().await;
    register(&app, "alice").await;
    let body = login(&app, "alice", "Password123!").await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 900);
    assert!(body.get("requires_2fa").is_none());

    let (status, refreshed) = send(
        &app,
        Method::POST,
        "/api/auth/refresh",
        None,
        Some(json!({ "refresh_token": body["refresh_token"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(refreshed["access_token"].is_string());
}

#[tokio::test]
async fn bad_credentials_map_to_401() {
    let (app, _) = app().await;
    let (_, captcha) = send(&app, Method::GET, "/api/auth/captcha?code=1&secret=dev", None, None).await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({
            "account": "ghost",
            "password": "whatever",
            "captcha_id": captcha["id"],
            "captcha": captcha["code"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn protected_routes_require_bearer() {
    let (app, _) = app().await;
    let (status, _) = send(&app, Method::GET, "/api/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, Method::GET, "/api/auth/me", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, token) = register(&app, "bob").await;
    let (status, me) = send(&app, Method::GET, "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "bob");
    assert_eq!(me["auth_type"], "jwt");
    assert!(me["permissions"]
        .as_array()
        .unwrap()
        .contains(&json!("user:tokens:create")));
}

#[tokio::test]
async fn rbac_guards_admin_routes_and_ownership() {
    let (app, _) = app().await;
    let (bob_id, bob) = register(&app, "bob").await;
    let (carol_id, _) = register(&app, "carol").await;

    let (status, _) = send(
        &app,
        Method::PUT,
        &format!("/api/admin/users/{}/status", carol_id),
        Some(&bob),
        Some(json!({ "status": "banned" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, Method::GET, &format!("/api/users/{}", bob_id), Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, &format!("/api/users/{}", carol_id), Some(&bob), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let root = login(&app, "root", "RootPassword1!").await;
    let root = root["access_token"].as_str().unwrap();
    let (status, _) = send(&app, Method::GET, &format!("/api/users/{}", carol_id), Some(root), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, user) = send(
        &app,
        Method::PUT,
        &format!("/api/admin/users/{}/status", carol_id),
        Some(root),
        Some(json!({ "status": "banned" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["status"], "banned");
}

#[tokio::test]
async fn pat_lifecycle_over_http() {
    let (app, state) = app().await;
    let (_, jwt) = register(&app, "dave").await;

    let (status, created) = send(
        &app,
        Method::POST,
        "/api/user/tokens",
        Some(&jwt),
        Some(json!({
            "name": "ci",
            "permissions": ["user:tokens:read", "user:profile:read"],
            "expires_in": 30,
            "ip_whitelist": [PEER_IP],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", created);
    let pat = created["token"].as_str().unwrap().to_string();
    assert!(pat.starts_with("pat_"));
    assert!(created["expires_at"].is_string());
    assert_eq!(created["token_prefix"].as_str().unwrap().len(), 8);

    let (status, list) = send(&app, Method::GET, "/api/user/tokens", Some(&pat), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert!(list[0].get("token").is_none());
    assert!(list[0].get("token_hash").is_none());

    let (_, me) = send(&app, Method::GET, "/api/auth/me", Some(&pat), None).await;
    assert_eq!(me["auth_type"], "pat");
    assert_eq!(me["pat_id"], created["id"]);

    // 令牌未授予 user:tokens:create
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/user/tokens",
        Some(&pat),
        Some(json!({ "name": "nested" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let id = created["id"].as_u64().unwrap();
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/api/user/tokens/{}/disable", id),
        Some(&jwt),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, "/api/user/tokens", Some(&pat), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/api/user/tokens/{}", id),
        Some(&jwt),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    state.events.flush().await;
    let logs = state.db.audit_logs().await;
    assert!(logs
        .iter()
        .any(|l| l.action == "delete" && l.resource_id == id.to_string()));
}

#[tokio::test]
async fn two_factor_over_http() {
    let (app, state) = app().await;
    let (_, jwt) = register(&app, "erin").await;

    let (status, setup) = send(&app, Method::POST, "/api/auth/2fa/setup", Some(&jwt), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(setup["qrcode_url"].as_str().unwrap().starts_with("otpauth://totp/"));
    assert!(setup["qrcode_img"].as_str().unwrap().starts_with("data:image/png;base64,"));
    let secret = setup["secret"].as_str().unwrap();

    let code = state.totp.engine().current_code(secret).unwrap();
    let (status, enabled) = send(
        &app,
        Method::POST,
        "/api/auth/2fa/verify",
        Some(&jwt),
        Some(json!({ "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let recovery = enabled["recovery_codes"].as_array().unwrap().clone();
    assert_eq!(recovery.len(), 8);

    let challenge = login(&app, "erin", "Password123!").await;
    assert_eq!(challenge["requires_2fa"], true);
    assert!(challenge.get("access_token").is_none());

    let (status, pair) = send(
        &app,
        Method::POST,
        "/api/auth/login/2fa",
        None,
        Some(json!({
            "session_token": challenge["session_token"],
            "two_factor_code": recovery[0],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pair["token_type"], "Bearer");

    let (_, status_body) = send(&app, Method::GET, "/api/auth/2fa/status", Some(&jwt), None).await;
    assert_eq!(status_body["enabled"], true);
    assert_eq!(status_body["recovery_codes_count"], 7);
}

async fn create_pat(app: &Router, jwt: &str, body: Value) -> Value {
    let (status, created) = send(app, Method::POST, "/api/user/tokens", Some(jwt), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", created);
    created
}

#[tokio::test]
async fn pat_cannot_mint_wider_pat() {
    let (app, _) = app().await;
    let (_, jwt) = register(&app, "frank").await;
    let narrow = create_pat(
        &app,
        &jwt,
        json!({ "name": "minter", "permissions": ["user:tokens:create"] }),
    )
    .await;
    let narrow = narrow["token"].as_str().unwrap();

    // 未指定权限时只继承调用方令牌的权限
    let (status, child) = send(
        &app,
        Method::POST,
        "/api/user/tokens",
        Some(narrow),
        Some(json!({ "name": "wide" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", child);
    assert_eq!(child["permissions"], json!(["user:tokens:create"]));

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/user/tokens",
        Some(narrow),
        Some(json!({ "name": "explicit", "permissions": ["user:profile:read"] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // JWT 会话不受此限制
    let full = create_pat(&app, &jwt, json!({ "name": "full" })).await;
    assert!(full["permissions"].as_array().unwrap().len() > 1);
}

#[tokio::test]
async fn account_security_routes_reject_pat() {
    let (app, state) = app().await;
    let (grace_id, jwt) = register(&app, "grace").await;
    let created = create_pat(
        &app,
        &jwt,
        json!({ "name": "reader", "permissions": ["user:profile:read", "user:password:update"] }),
    )
    .await;
    let pat = created["token"].as_str().unwrap();

    for uri in ["/api/auth/2fa/setup", "/api/auth/2fa/verify", "/api/auth/2fa/disable"] {
        let (status, _) = send(
            &app,
            Method::POST,
            uri,
            Some(pat),
            Some(json!({ "code": "123456" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
    }
    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/auth/password",
        Some(pat),
        Some(json!({ "old_password": "Password123!", "new_password": "Password456!" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert!(!state.totp.is_enabled(grace_id).await.unwrap());

    let (status, body) = send(&app, Method::GET, "/api/auth/2fa/status", Some(pat), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);

    let (status, _) = send(&app, Method::POST, "/api/auth/2fa/setup", Some(&jwt), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn forwarded_headers_ignored_unless_trusted() {
    let whitelisted = "198.51.100.20";
    let spoofed = [("x-forwarded-for", whitelisted), ("x-real-ip", whitelisted)];

    let (app, _) = app().await;
    let (_, jwt) = register(&app, "heidi").await;
    let created = create_pat(
        &app,
        &jwt,
        json!({ "name": "office", "permissions": ["user:profile:read"], "ip_whitelist": [whitelisted] }),
    )
    .await;
    let pat = created["token"].as_str().unwrap();
    let (status, _) =
        send_with_headers(&app, Method::GET, "/api/auth/me", Some(pat), None, &spoofed).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (app, _) = app_with(true).await;
    let (_, jwt) = register(&app, "heidi").await;
    let created = create_pat(
        &app,
        &jwt,
        json!({ "name": "office", "permissions": ["user:profile:read"], "ip_whitelist": [whitelisted] }),
    )
    .await;
    let pat = created["token"].as_str().unwrap();
    let (status, _) =
        send_with_headers(&app, Method::GET, "/api/auth/me", Some(pat), None, &spoofed).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, "/api/auth/me", Some(pat), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
