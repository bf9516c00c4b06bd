//! 领域模型
//!
//! 用户、角色、权限、TOTP 配置、个人访问令牌与审计日志。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type UserId = u64;
pub type RoleId = u64;
pub type PermissionId = u64;
pub type PatId = u64;

/// 用户状态，只有 `Active` 允许登录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    Inactive,
    Banned,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Banned => "banned",
        }
    }
}

/// 权限，`code = domain:resource:action`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub domain: String,
    pub resource: String,
    pub action: String,
    pub code: String,
    #[serde(default)]
    pub description: String,
}

impl Permission {
    pub fn new(
        domain: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        let domain = domain.into();
        let resource = resource.into();
        let action = action.into();
        let code = format!("{}:{}:{}", domain, resource, action);
        Self {
            id: 0,
            domain,
            resource,
            action,
            code,
            description: String::new(),
        }
    }
}

/// 角色
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// 系统角色不可删除
    pub is_system: bool,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            display_name: display_name.into(),
            description: String::new(),
            is_system: false,
            permissions: Vec::new(),
        }
    }
}

/// 用户
///
/// 通过仓储的 `*_with_roles` 方法加载时 `roles` 含完整权限。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub status: UserStatus,
    #[serde(default)]
    pub roles: Vec<Role>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            username: username.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            status: UserStatus::Active,
            roles: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn can_login(&self) -> bool {
        self.status == UserStatus::Active && self.deleted_at.is_none()
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|r| r.name == name)
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }

    /// 有效权限码：所有角色权限的并集，按权限 ID 去重，保持首次出现的顺序
    pub fn permission_codes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.roles
            .iter()
            .flat_map(|r| r.permissions.iter())
            .filter(|p| seen.insert(p.id))
            .map(|p| p.code.clone())
            .collect()
    }
}

/// TOTP 配置（每用户一条）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpConfig {
    pub user_id: UserId,
    pub enabled: bool,
    /// Base32 密钥
    pub secret: String,
    /// 明文恢复码，格式 `####-####`
    #[serde(default)]
    pub recovery_codes: Vec<String>,
    pub setup_completed_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl TotpConfig {
    pub fn new(user_id: UserId, secret: String) -> Self {
        Self {
            user_id,
            enabled: false,
            secret,
            recovery_codes: Vec::new(),
            setup_completed_at: None,
            last_used_at: None,
        }
    }

    pub fn has_secret(&self) -> bool {
        !self.secret.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.has_secret()
    }

    /// 未启用时恢复码不可用
    pub fn recovery_codes_remaining(&self) -> usize {
        if self.is_enabled() {
            self.recovery_codes.len()
        } else {
            0
        }
    }

    /// 移除匹配的恢复码，返回是否命中
    pub fn take_recovery_code(&mut self, code: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.recovery_codes.iter().position(|c| c == code) {
            Some(idx) => {
                self.recovery_codes.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// 个人访问令牌状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatStatus {
    Active,
    Disabled,
}

/// 个人访问令牌（只保存哈希）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalAccessToken {
    pub id: PatId,
    pub user_id: UserId,
    pub name: String,
    /// 明文的 sha256 十六进制
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub token_prefix: String,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: PatStatus,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PersonalAccessToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp < now).unwrap_or(false)
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PatStatus::Active && !self.is_expired_at(now)
    }

    /// 白名单为空时不限制
    pub fn allows_ip(&self, client_ip: Option<&str>) -> bool {
        if self.ip_whitelist.is_empty() {
            return true;
        }
        match client_ip {
            Some(ip) => self.ip_whitelist.iter().any(|allowed| allowed == ip),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// 审计日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub user_id: Option<UserId>,
    pub username: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub details: String,
    pub status: AuditStatus,
}

impl AuditLog {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            user_id: None,
            username: String::new(),
            action: action.into(),
            resource: resource.into(),
            resource_id: String::new(),
            ip_address: String::new(),
            user_agent: String::new(),
            details: String::new(),
            status: AuditStatus::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn role_with(id: RoleId, name: &str, perms: &[(PermissionId, &str, &str, &str)]) -> Role {
        let mut role = Role::new(name, name);
        role.id = id;
        role.permissions = perms
            .iter()
            .map(|(pid, d, r, a)| {
                let mut p = Permission::new(*d, *r, *a);
                p.id = *pid;
                p
            })
            .collect();
        role
    }

    #[test]
    fn test_permission_codes_dedup_by_id() {
        let mut user = User::new("dave", "d@ex.com", "hash");
        user.roles = vec![
            role_with(1, "a", &[(1, "admin", "users", "read"), (2, "user", "profile", "read")]),
            role_with(2, "b", &[(2, "user", "profile", "read")]),
        ];
        assert_eq!(
            user.permission_codes(),
            vec!["admin:users:read".to_string(), "user:profile:read".to_string()]
        );
        assert_eq!(user.role_names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_only_active_can_login() {
        let mut user = User::new("u", "u@ex.com", "hash");
        assert!(user.can_login());
        user.status = UserStatus::Banned;
        assert!(!user.can_login());
        user.status = UserStatus::Inactive;
        assert!(!user.can_login());
    }

    #[test]
    fn test_disabled_totp_has_no_recovery_codes() {
        let mut cfg = TotpConfig::new(1, "SECRET".to_string());
        cfg.recovery_codes = vec!["1234-5678".to_string()];
        assert_eq!(cfg.recovery_codes_remaining(), 0);
        assert!(!cfg.take_recovery_code("1234-5678"));

        cfg.enabled = true;
        assert_eq!(cfg.recovery_codes_remaining(), 1);
        assert!(cfg.take_recovery_code("1234-5678"));
        assert!(!cfg.take_recovery_code("1234-5678"));
    }

    #[test]
    fn test_pat_usability() {
        let now = Utc::now();
        let mut pat = PersonalAccessToken {
            id: 1,
            user_id: 1,
            name: "ci".to_string(),
            token_hash: "h".to_string(),
            token_prefix: "abcd1234".to_string(),
            permissions: vec![],
            expires_at: Some(now + Duration::days(1)),
            status: PatStatus::Active,
            ip_whitelist: vec![],
            description: String::new(),
            last_used_at: None,
            created_at: now,
        };
        assert!(pat.is_usable_at(now));
        assert!(!pat.is_usable_at(now + Duration::days(2)));
        pat.status = PatStatus::Disabled;
        assert!(!pat.is_usable_at(now));

        assert!(pat.allows_ip(None));
        pat.ip_whitelist = vec!["10.0.0.1".to_string()];
        assert!(pat.allows_ip(Some("10.0.0.1")));
        assert!(!pat.allows_ip(Some("10.0.0.2")));
        assert!(!pat.allows_ip(None));
    }
}
