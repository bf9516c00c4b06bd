//! 个人访问令牌（PAT）模块
//!
//! 明文格式 `pat_<prefix>_<secret>`，只在创建时返回一次。
//! 存储只保留明文的 sha256 十六进制、前缀与元数据。
//!
//! ## 校验顺序
//! 1. 格式
//! 2. 哈希查找
//! 3. 状态与过期时间
//! 4. IP 白名单
//! 5. 异步更新最后使用时间（失败不影响结果）

use crate::auth::error::AuthError;
use crate::auth::model::{PatId, PatStatus, PersonalAccessToken, UserId};
use crate::auth::rbac::has_permission;
use crate::auth::repository::{PatRepository, UserRepository};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// 明文前缀
pub const PAT_PREFIX: &str = "pat_";

/// 生成时的显示前缀长度
const DISPLAY_PREFIX_LENGTH: usize = 8;

/// 生成时的随机部分长度（base62，约 190 位熵）
const SECRET_LENGTH: usize = 32;

/// 校验时接受的长度范围
const MIN_DISPLAY_PREFIX_LENGTH: usize = 4;
const MAX_DISPLAY_PREFIX_LENGTH: usize = 16;
const MIN_SECRET_LENGTH: usize = 22;
const MAX_SECRET_LENGTH: usize = 64;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// 新生成的令牌
#[derive(Debug, Clone)]
pub struct GeneratedToken {
    pub plaintext: String,
    pub prefix: String,
    pub hash: String,
}

fn random_base62<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(BASE62[rng.gen_range(0..BASE62.len())]))
        .collect()
}

/// 生成新令牌
pub fn generate_token() -> GeneratedToken {
    let mut rng = rand::thread_rng();
    let prefix = random_base62(&mut rng, DISPLAY_PREFIX_LENGTH);
    let secret = random_base62(&mut rng, SECRET_LENGTH);
    let plaintext = format!("{}{}_{}", PAT_PREFIX, prefix, secret);
    let hash = hash_token(&plaintext);
    GeneratedToken {
        plaintext,
        prefix,
        hash,
    }
}

/// sha256 十六进制
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// 语法校验
pub fn is_valid_format(token: &str) -> bool {
    let Some(rest) = token.strip_prefix(PAT_PREFIX) else {
        return false;
    };
    let Some((prefix, secret)) = rest.split_once('_') else {
        return false;
    };
    let alnum = |s: &str| s.bytes().all(|b| b.is_ascii_alphanumeric());
    (MIN_DISPLAY_PREFIX_LENGTH..=MAX_DISPLAY_PREFIX_LENGTH).contains(&prefix.len())
        && (MIN_SECRET_LENGTH..=MAX_SECRET_LENGTH).contains(&secret.len())
        && alnum(prefix)
        && alnum(secret)
}

/// 创建请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePatRequest {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// 有效天数，缺省或 0 表示永不过期
    #[serde(default, rename = "expires_in")]
    pub expires_in_days: Option<u32>,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// 创建结果，`token` 为唯一一次可见的明文
#[derive(Debug, Clone, Serialize)]
pub struct CreatedPat {
    pub token: String,
    pub id: PatId,
    pub name: String,
    pub token_prefix: String,
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 列表项（不含哈希）
#[derive(Debug, Clone, Serialize)]
pub struct PatSummary {
    pub id: PatId,
    pub name: String,
    pub token_prefix: String,
    pub permissions: Vec<String>,
    pub status: PatStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub ip_whitelist: Vec<String>,
    pub description: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<PersonalAccessToken> for PatSummary {
    fn from(pat: PersonalAccessToken) -> Self {
        Self {
            id: pat.id,
            name: pat.name,
            token_prefix: pat.token_prefix,
            permissions: pat.permissions,
            status: pat.status,
            expires_at: pat.expires_at,
            ip_whitelist: pat.ip_whitelist,
            description: pat.description,
            last_used_at: pat.last_used_at,
            created_at: pat.created_at,
        }
    }
}

/// PAT 服务
pub struct PatService {
    repo: Arc<dyn PatRepository>,
    users: Arc<dyn UserRepository>,
    last_used_timeout: Duration,
    touches: TaskTracker,
    cleanup_cancel_token: RwLock<Option<CancellationToken>>,
}

impl PatService {
    pub fn new(
        repo: Arc<dyn PatRepository>,
        users: Arc<dyn UserRepository>,
        last_used_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            users,
            last_used_timeout,
            touches: TaskTracker::new(),
            cleanup_cancel_token: RwLock::new(None),
        }
    }

    /// 创建令牌
    ///
    /// 申请的权限必须逐项（精确字符串）属于用户当前的有效权限；
    /// 未指定权限时继承用户全部有效权限。
    pub async fn create(
        &self,
        user_id: UserId,
        request: CreatePatRequest,
    ) -> Result<CreatedPat, AuthError> {
        self.create_within(user_id, request, None).await
    }

    /// 以调用方的令牌权限为上限创建令牌
    ///
    /// 调用方本身通过 PAT 认证时使用，新令牌的权限不会超出 `scope`。
    pub async fn create_scoped(
        &self,
        user_id: UserId,
        request: CreatePatRequest,
        scope: &[String],
    ) -> Result<CreatedPat, AuthError> {
        self.create_within(user_id, request, Some(scope)).await
    }

    async fn create_within(
        &self,
        user_id: UserId,
        request: CreatePatRequest,
        scope: Option<&[String]>,
    ) -> Result<CreatedPat, AuthError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(AuthError::InvalidRequest("令牌名称不能为空".to_string()));
        }

        let user = self
            .users
            .find_user_with_roles(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        let mut owned = user.permission_codes();
        if let Some(scope) = scope {
            owned.retain(|code| has_permission(scope, code));
        }
        if owned.is_empty() {
            return Err(AuthError::PermissionNotGranted("用户没有任何权限".to_string()));
        }

        let permissions = if request.permissions.is_empty() {
            owned.clone()
        } else {
            let owned: HashSet<&str> = owned.iter().map(String::as_str).collect();
            let mut seen = HashSet::new();
            let mut granted = Vec::with_capacity(request.permissions.len());
            for code in &request.permissions {
                if !owned.contains(code.as_str()) {
                    return Err(AuthError::PermissionNotGranted(code.clone()));
                }
                if seen.insert(code.as_str()) {
                    granted.push(code.clone());
                }
            }
            granted
        };

        let now = Utc::now();
        let expires_at = request
            .expires_in_days
            .filter(|days| *days > 0)
            .map(|days| now + ChronoDuration::days(i64::from(days)));

        let generated = generate_token();
        let pat = self
            .repo
            .create_pat(PersonalAccessToken {
                id: 0,
                user_id,
                name: name.to_string(),
                token_hash: generated.hash,
                token_prefix: generated.prefix,
                permissions,
                expires_at,
                status: PatStatus::Active,
                ip_whitelist: request.ip_whitelist,
                description: request.description,
                last_used_at: None,
                created_at: now,
            })
            .await?;
        info!("PAT {} created for user {}", pat.id, user_id);

        Ok(CreatedPat {
            token: generated.plaintext,
            id: pat.id,
            name: pat.name,
            token_prefix: pat.token_prefix,
            permissions: pat.permissions,
            expires_at: pat.expires_at,
            created_at: pat.created_at,
        })
    }

    /// 校验明文令牌
    pub async fn validate(
        &self,
        plaintext: &str,
        client_ip: Option<&str>,
    ) -> Result<PersonalAccessToken, AuthError> {
        if !is_valid_format(plaintext) {
            return Err(AuthError::InvalidToken);
        }
        let pat = self
            .repo
            .find_pat_by_hash(&hash_token(plaintext))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let now = Utc::now();
        if !pat.is_usable_at(now) {
            debug!("PAT {} is disabled or expired", pat.id);
            return Err(AuthError::TokenInactiveOrExpired);
        }
        if !pat.allows_ip(client_ip) {
            warn!(
                "PAT {} rejected for client ip {}",
                pat.id,
                client_ip.unwrap_or("unknown")
            );
            return Err(AuthError::IpNotAllowed);
        }

        self.spawn_touch(pat.id, now);
        Ok(pat)
    }

    fn spawn_touch(&self, id: PatId, at: DateTime<Utc>) {
        let repo = Arc::clone(&self.repo);
        let timeout = self.last_used_timeout;
        self.touches.spawn(async move {
            match tokio::time::timeout(timeout, repo.touch_pat(id, at)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("failed to update last_used_at of PAT {}: {}", id, e),
                Err(_) => warn!("updating last_used_at of PAT {} timed out", id),
            }
        });
    }

    /// 等待已发起的最后使用时间更新
    pub async fn flush(&self) {
        self.touches.close();
        self.touches.wait().await;
        self.touches.reopen();
    }

    async fn owned(&self, owner: UserId, id: PatId) -> Result<PersonalAccessToken, AuthError> {
        let pat = self
            .repo
            .find_pat(id)
            .await?
            .ok_or_else(|| AuthError::NotFound("访问令牌".to_string()))?;
        if pat.user_id != owner {
            return Err(AuthError::Forbidden("无权操作该令牌".to_string()));
        }
        Ok(pat)
    }

    pub async fn disable(&self, owner: UserId, id: PatId) -> Result<(), AuthError> {
        let pat = self.owned(owner, id).await?;
        if pat.status == PatStatus::Disabled {
            return Ok(());
        }
        self.repo.update_pat_status(id, PatStatus::Disabled).await?;
        info!("PAT {} disabled by user {}", id, owner);
        Ok(())
    }

    /// 启用令牌，已过期的令牌不能启用
    pub async fn enable(&self, owner: UserId, id: PatId) -> Result<(), AuthError> {
        let pat = self.owned(owner, id).await?;
        if pat.is_expired_at(Utc::now()) {
            return Err(AuthError::InvalidRequest("令牌已过期，无法启用".to_string()));
        }
        if pat.status == PatStatus::Active {
            return Ok(());
        }
        self.repo.update_pat_status(id, PatStatus::Active).await?;
        info!("PAT {} enabled by user {}", id, owner);
        Ok(())
    }

    pub async fn delete(&self, owner: UserId, id: PatId) -> Result<(), AuthError> {
        self.owned(owner, id).await?;
        self.repo.delete_pat(id).await?;
        info!("PAT {} deleted by user {}", id, owner);
        Ok(())
    }

    pub async fn list(&self, owner: UserId) -> Result<Vec<PatSummary>, AuthError> {
        Ok(self
            .repo
            .list_pats(owner)
            .await?
            .into_iter()
            .map(PatSummary::from)
            .collect())
    }

    /// 删除用户的全部令牌（如修改密码后）
    pub async fn revoke_all_for_user(&self, user_id: UserId) -> Result<usize, AuthError> {
        let removed = self.repo.delete_user_pats(user_id).await?;
        if removed > 0 {
            info!("revoked {} PATs of user {}", removed, user_id);
        }
        Ok(removed)
    }

    /// 删除已过期的令牌
    pub async fn cleanup_expired(&self) -> Result<usize, AuthError> {
        self.repo.delete_expired_pats(Utc::now()).await
    }

    /// 启动定时清理任务
    pub async fn start_cleanup_task(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.cleanup_cancel_token.write().await;
        if let Some(token) = guard.take() {
            token.cancel();
        }
        let cancel_token = CancellationToken::new();
        *guard = Some(cancel_token.clone());
        drop(guard);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            debug!("PAT cleanup task started");
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("PAT cleanup task cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match service.cleanup_expired().await {
                            Ok(0) => {}
                            Ok(n) => info!("PAT cleanup: removed {} expired tokens", n),
                            Err(e) => warn!("PAT cleanup failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// 停止定时清理任务
    pub async fn stop_cleanup_task(&self) {
        let mut guard = self.cleanup_cancel_token.write().await;
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryDatabase;
    use crate::auth::model::{Permission, Role, User};
    use crate::auth::repository::RoleRepository;

    async fn fixture() -> (PatService, Arc<MemoryDatabase>, UserId) {
        let db = Arc::new(MemoryDatabase::new());
        let mut perms = Vec::new();
        for (d, r, a) in [("admin", "users", "read"), ("user", "profile", "read")] {
            perms.push(db.upsert_permission(Permission::new(d, r, a)).await.unwrap());
        }
        let mut role = Role::new("dave_role", "Dave");
        role.permissions = perms;
        let role = db.create_role(role).await.unwrap();
        let mut user = User::new("dave", "d@ex.com", "h");
        user.roles = vec![role];
        let user = db.create_user(user).await.unwrap();
        (
            PatService::new(db.clone(), db.clone(), Duration::from_secs(2)),
            db,
            user.id,
        )
    }

    fn request(perms: &[&str]) -> CreatePatRequest {
        CreatePatRequest {
            name: "ci".into(),
            permissions: perms.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert!(token.plaintext.starts_with("pat_"));
        assert!(is_valid_format(&token.plaintext));
        assert_eq!(token.hash, hash_token(&token.plaintext));
        assert_eq!(token.hash.len(), 64);
        assert!(token.plaintext.contains(&token.prefix));

        assert!(!is_valid_format("pat_abc_1234567890123456789012"));
        assert!(!is_valid_format("pat_abcd_short"));
        assert!(!is_valid_format("pat_abcd1234"));
        assert!(!is_valid_format("tok_abcd1234_12345678901234567890123456"));
        assert!(!is_valid_format("pat_ab-d1234_12345678901234567890123456"));
        assert!(is_valid_format("pat_abcd_1234567890123456789012"));
    }

    #[tokio::test]
    async fn test_create_enforces_subset() {
        let (service, _, user_id) = fixture().await;
        assert!(matches!(
            service.create(user_id, request(&["admin:users:delete"])).await,
            Err(AuthError::PermissionNotGranted(code)) if code == "admin:users:delete"
        ));
        // 通配符不会被展开
        assert!(service.create(user_id, request(&["admin:*:*"])).await.is_err());

        let created = service
            .create(user_id, request(&["admin:users:read"]))
            .await
            .unwrap();
        assert_eq!(created.permissions, vec!["admin:users:read".to_string()]);
        assert!(created.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_create_defaults_to_all_permissions() {
        let (service, _, user_id) = fixture().await;
        let mut req = request(&[]);
        req.expires_in_days = Some(30);
        let created = service.create(user_id, req).await.unwrap();
        assert_eq!(created.permissions.len(), 2);
        let days = (created.expires_at.unwrap() - created.created_at).num_days();
        assert_eq!(days, 30);
    }

    #[tokio::test]
    async fn test_scoped_create_stays_within_caller_scope() {
        let (service, _, user_id) = fixture().await;
        let scope = vec!["user:profile:read".to_string()];

        let created = service
            .create_scoped(user_id, request(&[]), &scope)
            .await
            .unwrap();
        assert_eq!(created.permissions, scope);

        assert!(matches!(
            service
                .create_scoped(user_id, request(&["admin:users:read"]), &scope)
                .await,
            Err(AuthError::PermissionNotGranted(code)) if code == "admin:users:read"
        ));

        let wildcard = vec!["admin:*:*".to_string()];
        let created = service
            .create_scoped(user_id, request(&[]), &wildcard)
            .await
            .unwrap();
        assert_eq!(created.permissions, vec!["admin:users:read".to_string()]);

        assert!(matches!(
            service.create_scoped(user_id, request(&[]), &[]).await,
            Err(AuthError::PermissionNotGranted(_))
        ));
    }

    #[tokio::test]
    async fn test_create_requires_name_and_permissions() {
        let (service, db, _) = fixture().await;
        let bare = db.create_user(User::new("bare", "b@ex.com", "h")).await.unwrap();
        assert!(matches!(
            service.create(bare.id, request(&[])).await,
            Err(AuthError::PermissionNotGranted(_))
        ));
        let mut req = request(&[]);
        req.name = "   ".into();
        assert!(matches!(
            service.create(bare.id, req).await,
            Err(AuthError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_paths() {
        let (service, db, user_id) = fixture().await;
        let mut req = request(&["user:profile:read"]);
        req.ip_whitelist = vec!["10.0.0.1".into()];
        let created = service.create(user_id, req).await.unwrap();

        assert!(matches!(
            service.validate(&created.token, Some("10.0.0.2")).await,
            Err(AuthError::IpNotAllowed)
        ));
        let pat = service.validate(&created.token, Some("10.0.0.1")).await.unwrap();
        assert_eq!(pat.token_hash, hash_token(&created.token));

        service.flush().await;
        assert!(db.find_pat(pat.id).await.unwrap().unwrap().last_used_at.is_some());

        assert!(matches!(
            service.validate("pat_abcd_1234567890123456789012", None).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            service.validate("garbage", None).await,
            Err(AuthError::InvalidToken)
        ));

        service.disable(user_id, pat.id).await.unwrap();
        assert!(matches!(
            service.validate(&created.token, Some("10.0.0.1")).await,
            Err(AuthError::TokenInactiveOrExpired)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected_and_cannot_be_enabled() {
        let (service, db, user_id) = fixture().await;
        let created = service.create(user_id, request(&[])).await.unwrap();
        let generated = generate_token();
        let expired = db
            .create_pat(PersonalAccessToken {
                id: 0,
                user_id,
                name: "old".into(),
                token_hash: generated.hash.clone(),
                token_prefix: generated.prefix.clone(),
                permissions: vec![],
                expires_at: Some(Utc::now() - ChronoDuration::days(1)),
                status: PatStatus::Disabled,
                ip_whitelist: vec![],
                description: String::new(),
                last_used_at: None,
                created_at: Utc::now() - ChronoDuration::days(10),
            })
            .await
            .unwrap();

        assert!(matches!(
            service.validate(&generated.plaintext, None).await,
            Err(AuthError::TokenInactiveOrExpired)
        ));
        assert!(matches!(
            service.enable(user_id, expired.id).await,
            Err(AuthError::InvalidRequest(_))
        ));

        assert_eq!(service.cleanup_expired().await.unwrap(), 1);
        assert_eq!(service.list(user_id).await.unwrap().len(), 1);
        assert_eq!(service.list(user_id).await.unwrap()[0].id, created.id);
    }

    #[tokio::test]
    async fn test_ownership_and_lifecycle() {
        let (service, db, user_id) = fixture().await;
        let other = db.create_user(User::new("x", "x@ex.com", "h")).await.unwrap();
        let created = service.create(user_id, request(&[])).await.unwrap();

        assert!(matches!(
            service.disable(other.id, created.id).await,
            Err(AuthError::Forbidden(_))
        ));
        assert!(matches!(
            service.delete(other.id, created.id).await,
            Err(AuthError::Forbidden(_))
        ));

        service.disable(user_id, created.id).await.unwrap();
        service.disable(user_id, created.id).await.unwrap();
        service.enable(user_id, created.id).await.unwrap();
        assert!(service.validate(&created.token, None).await.is_ok());

        let listed = service.list(user_id).await.unwrap();
        let json = serde_json::to_value(&listed).unwrap();
        assert!(json[0].get("token_hash").is_none());
        assert!(json[0].get("token").is_none());

        service.delete(user_id, created.id).await.unwrap();
        assert!(matches!(
            service.delete(user_id, created.id).await,
            Err(AuthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_revoke_all_for_user() {
        let (service, _, user_id) = fixture().await;
        let a = service.create(user_id, request(&[])).await.unwrap();
        service.create(user_id, request(&[])).await.unwrap();
        assert_ne!(a.token, service.create(user_id, request(&[])).await.unwrap().token);
        assert_eq!(service.revoke_all_for_user(user_id).await.unwrap(), 3);
        assert!(matches!(
            service.validate(&a.token, None).await,
            Err(AuthError::InvalidToken)
        ));
    }
}
