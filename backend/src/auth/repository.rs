//! 仓储契约
//!
//! 关系型数据（用户、角色、权限、TOTP、访问令牌、审计日志）的读写接口。
//! 进程内实现见 [`crate::auth::memory::MemoryDatabase`]。

use crate::auth::error::AuthError;
use crate::auth::model::{
    AuditLog, PatId, PatStatus, Permission, PermissionId, PersonalAccessToken, Role, RoleId,
    TotpConfig, User, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// 创建用户并分配 ID，用户名或邮箱重复时返回 `Conflict`
    async fn create_user(&self, user: User) -> Result<User, AuthError>;

    /// 按 ID 加载用户（含角色与权限），已软删除的用户视为不存在
    async fn find_user_with_roles(&self, id: UserId) -> Result<Option<User>, AuthError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AuthError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AuthError>;

    /// 更新基础字段（邮箱、密码哈希、状态）
    async fn update_user(&self, user: &User) -> Result<(), AuthError>;

    /// 覆盖用户的角色集合
    async fn assign_roles(&self, user_id: UserId, role_ids: &[RoleId]) -> Result<(), AuthError>;

    async fn soft_delete_user(&self, user_id: UserId) -> Result<(), AuthError>;

    /// 持有指定角色的全部用户 ID
    async fn user_ids_with_role(&self, role_id: RoleId) -> Result<Vec<UserId>, AuthError>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// 创建角色，`role.permissions` 中的权限 ID 会被关联
    async fn create_role(&self, role: Role) -> Result<Role, AuthError>;

    async fn find_role(&self, id: RoleId) -> Result<Option<Role>, AuthError>;

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, AuthError>;

    async fn list_roles(&self) -> Result<Vec<Role>, AuthError>;

    /// 覆盖角色的权限集合
    async fn set_role_permissions(
        &self,
        role_id: RoleId,
        permission_ids: &[PermissionId],
    ) -> Result<(), AuthError>;

    /// 删除角色及其关联
    async fn delete_role(&self, role_id: RoleId) -> Result<(), AuthError>;

    /// 创建权限，权限码已存在时返回已有记录
    async fn upsert_permission(&self, permission: Permission) -> Result<Permission, AuthError>;

    async fn list_permissions(&self) -> Result<Vec<Permission>, AuthError>;
}

#[async_trait]
pub trait TotpRepository: Send + Sync {
    async fn find_totp(&self, user_id: UserId) -> Result<Option<TotpConfig>, AuthError>;

    /// 创建或覆盖
    async fn save_totp(&self, config: TotpConfig) -> Result<(), AuthError>;

    async fn delete_totp(&self, user_id: UserId) -> Result<(), AuthError>;

    /// 原子地消耗一个恢复码，命中返回 true
    async fn consume_recovery_code(&self, user_id: UserId, code: &str) -> Result<bool, AuthError>;

    async fn touch_totp(&self, user_id: UserId, at: DateTime<Utc>) -> Result<(), AuthError>;
}

#[async_trait]
pub trait PatRepository: Send + Sync {
    async fn create_pat(&self, pat: PersonalAccessToken) -> Result<PersonalAccessToken, AuthError>;

    async fn find_pat(&self, id: PatId) -> Result<Option<PersonalAccessToken>, AuthError>;

    async fn find_pat_by_hash(&self, hash: &str)
        -> Result<Option<PersonalAccessToken>, AuthError>;

    async fn list_pats(&self, user_id: UserId) -> Result<Vec<PersonalAccessToken>, AuthError>;

    async fn update_pat_status(&self, id: PatId, status: PatStatus) -> Result<(), AuthError>;

    async fn touch_pat(&self, id: PatId, at: DateTime<Utc>) -> Result<(), AuthError>;

    async fn delete_pat(&self, id: PatId) -> Result<(), AuthError>;

    /// 删除用户全部令牌，返回删除数量
    async fn delete_user_pats(&self, user_id: UserId) -> Result<usize, AuthError>;

    /// 删除已过期令牌，返回删除数量
    async fn delete_expired_pats(&self, now: DateTime<Utc>) -> Result<usize, AuthError>;
}

#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn create_audit_log(&self, log: AuditLog) -> Result<AuditLog, AuthError>;
}
