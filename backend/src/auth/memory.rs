//! 进程内数据库
//!
//! 以一把 `RwLock` 保护全部表，每个仓储方法都是一次完整的读或写事务，
//! 恢复码消耗等读改写操作因此天然原子。

use crate::auth::error::AuthError;
use crate::auth::model::{
    AuditLog, PatId, PatStatus, Permission, PermissionId, PersonalAccessToken, Role, RoleId,
    TotpConfig, User, UserId,
};
use crate::auth::repository::{
    AuditLogRepository, PatRepository, RoleRepository, TotpRepository, UserRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    roles: BTreeMap<RoleId, Role>,
    permissions: BTreeMap<PermissionId, Permission>,
    user_roles: HashMap<UserId, Vec<RoleId>>,
    role_permissions: HashMap<RoleId, Vec<PermissionId>>,
    totp: HashMap<UserId, TotpConfig>,
    pats: BTreeMap<PatId, PersonalAccessToken>,
    audit_logs: Vec<AuditLog>,
    next_user_id: u64,
    next_role_id: u64,
    next_permission_id: u64,
    next_pat_id: u64,
    next_audit_id: u64,
}

fn next_id(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

impl Tables {
    fn hydrate_role(&self, role: &Role) -> Role {
        let mut role = role.clone();
        role.permissions = self
            .role_permissions
            .get(&role.id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.permissions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        role
    }

    fn hydrate_user(&self, user: &User) -> User {
        let mut user = user.clone();
        user.roles = self
            .user_roles
            .get(&user.id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.roles.get(id))
                    .map(|role| self.hydrate_role(role))
                    .collect()
            })
            .unwrap_or_default();
        user
    }

    fn live_user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id).filter(|u| u.deleted_at.is_none())
    }

    fn find_live_user<P>(&self, predicate: P) -> Option<User>
    where
        P: Fn(&User) -> bool,
    {
        self.users
            .values()
            .find(|u| u.deleted_at.is_none() && predicate(u))
            .map(|u| self.hydrate_user(u))
    }
}

/// 进程内数据库，实现全部仓储契约
#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// 审计日志快照（按写入顺序）
    pub async fn audit_logs(&self) -> Vec<AuditLog> {
        self.tables.read().await.audit_logs.clone()
    }
}

#[async_trait]
impl UserRepository for MemoryDatabase {
    async fn create_user(&self, mut user: User) -> Result<User, AuthError> {
        let mut tables = self.tables.write().await;
        let taken = tables.users.values().any(|u| {
            u.deleted_at.is_none() && (u.username == user.username || u.email == user.email)
        });
        if taken {
            return Err(AuthError::Conflict("用户名或邮箱已存在".to_string()));
        }

        user.id = next_id(&mut tables.next_user_id);
        let role_ids: Vec<RoleId> = user.roles.iter().map(|r| r.id).collect();
        user.roles.clear();
        tables.user_roles.insert(user.id, role_ids);
        tables.users.insert(user.id, user.clone());
        Ok(tables.hydrate_user(&user))
    }

    async fn find_user_with_roles(&self, id: UserId) -> Result<Option<User>, AuthError> {
        let tables = self.tables.read().await;
        Ok(tables.live_user(id).map(|u| tables.hydrate_user(u)))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, AuthError> {
        let tables = self.tables.read().await;
        Ok(tables.find_live_user(|u| u.username == username))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let tables = self.tables.read().await;
        Ok(tables.find_live_user(|u| u.email.eq_ignore_ascii_case(email)))
    }

    async fn update_user(&self, user: &User) -> Result<(), AuthError> {
        let mut tables = self.tables.write().await;
        let row = tables
            .users
            .get_mut(&user.id)
            .filter(|u| u.deleted_at.is_none())
            .ok_or(AuthError::UserNotFound)?;
        row.email = user.email.clone();
        row.password_hash = user.password_hash.clone();
        row.status = user.status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn assign_roles(&self, user_id: UserId, role_ids: &[RoleId]) -> Result<(), AuthError> {
        let mut tables = self.tables.write().await;
        if tables.live_user(user_id).is_none() {
            return Err(AuthError::UserNotFound);
        }
        if let Some(missing) = role_ids.iter().find(|id| !tables.roles.contains_key(*id)) {
            return Err(AuthError::NotFound(format!("角色 {}", missing)));
        }
        let mut ids = role_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        tables.user_roles.insert(user_id, ids);
        Ok(())
    }

    async fn soft_delete_user(&self, user_id: UserId) -> Result<(), AuthError> {
        let mut tables = self.tables.write().await;
        let row = tables
            .users
            .get_mut(&user_id)
            .filter(|u| u.deleted_at.is_none())
            .ok_or(AuthError::UserNotFound)?;
        let now = Utc::now();
        row.deleted_at = Some(now);
        row.updated_at = now;
        Ok(())
    }

    async fn user_ids_with_role(&self, role_id: RoleId) -> Result<Vec<UserId>, AuthError> {
        let tables = self.tables.read().await;
        let mut ids: Vec<UserId> = tables
            .user_roles
            .iter()
            .filter(|(_, roles)| roles.contains(&role_id))
            .map(|(user_id, _)| *user_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[async_trait]
impl RoleRepository for MemoryDatabase {
    async fn create_role(&self, mut role: Role) -> Result<Role, AuthError> {
        let mut tables = self.tables.write().await;
        if tables.roles.values().any(|r| r.name == role.name) {
            return Err(AuthError::Conflict(format!("角色 {} 已存在", role.name)));
        }
        role.id = next_id(&mut tables.next_role_id);
        let permission_ids: Vec<PermissionId> = role.permissions.iter().map(|p| p.id).collect();
        role.permissions.clear();
        tables.role_permissions.insert(role.id, permission_ids);
        tables.roles.insert(role.id, role.clone());
        Ok(tables.hydrate_role(&role))
    }

    async fn find_role(&self, id: RoleId) -> Result<Option<Role>, AuthError> {
        let tables = self.tables.read().await;
        Ok(tables.roles.get(&id).map(|r| tables.hydrate_role(r)))
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>, AuthError> {
        let tables = self.tables.read().await;
        Ok(tables
            .roles
            .values()
            .find(|r| r.name == name)
            .map(|r| tables.hydrate_role(r)))
    }

    async fn list_roles(&self) -> Result<Vec<Role>, AuthError> {
        let tables = self.tables.read().await;
        Ok(tables.roles.values().map(|r| tables.hydrate_role(r)).collect())
    }

    async fn set_role_permissions(
        &self,
        role_id: RoleId,
        permission_ids: &[PermissionId],
    ) -> Result<(), AuthError> {
        let mut tables = self.tables.write().await;
        if !tables.roles.contains_key(&role_id) {
            return Err(AuthError::NotFound(format!("角色 {}", role_id)));
        }
        if let Some(missing) = permission_ids
            .iter()
            .find(|id| !tables.permissions.contains_key(*id))
        {
            return Err(AuthError::NotFound(format!("权限 {}", missing)));
        }
        let mut ids = permission_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        tables.role_permissions.insert(role_id, ids);
        Ok(())
    }

    async fn delete_role(&self, role_id: RoleId) -> Result<(), AuthError> {
        let mut tables = self.tables.write().await;
        if tables.roles.remove(&role_id).is_none() {
            return Err(AuthError::NotFound(format!("角色 {}", role_id)));
        }
        tables.role_permissions.remove(&role_id);
        for roles in tables.user_roles.values_mut() {
            roles.retain(|id| *id != role_id);
        }
        Ok(())
    }

    async fn upsert_permission(&self, mut permission: Permission) -> Result<Permission, AuthError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .permissions
            .values()
            .find(|p| p.code == permission.code)
        {
            return Ok(existing.clone());
        }
        permission.id = next_id(&mut tables.next_permission_id);
        tables.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>, AuthError> {
        Ok(self.tables.read().await.permissions.values().cloned().collect())
    }
}

#[async_trait]
impl TotpRepository for MemoryDatabase {
    async fn find_totp(&self, user_id: UserId) -> Result<Option<TotpConfig>, AuthError> {
        Ok(self.tables.read().await.totp.get(&user_id).cloned())
    }

    async fn save_totp(&self, config: TotpConfig) -> Result<(), AuthError> {
        self.tables.write().await.totp.insert(config.user_id, config);
        Ok(())
    }

    async fn delete_totp(&self, user_id: UserId) -> Result<(), AuthError> {
        self.tables.write().await.totp.remove(&user_id);
        Ok(())
    }

    async fn consume_recovery_code(&self, user_id: UserId, code: &str) -> Result<bool, AuthError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .totp
            .get_mut(&user_id)
            .map(|cfg| cfg.take_recovery_code(code))
            .unwrap_or(false))
    }

    async fn touch_totp(&self, user_id: UserId, at: DateTime<Utc>) -> Result<(), AuthError> {
        if let Some(cfg) = self.tables.write().await.totp.get_mut(&user_id) {
            cfg.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl PatRepository for MemoryDatabase {
    async fn create_pat(
        &self,
        mut pat: PersonalAccessToken,
    ) -> Result<PersonalAccessToken, AuthError> {
        let mut tables = self.tables.write().await;
        if tables.pats.values().any(|p| p.token_hash == pat.token_hash) {
            return Err(AuthError::Conflict("令牌已存在".to_string()));
        }
        pat.id = next_id(&mut tables.next_pat_id);
        tables.pats.insert(pat.id, pat.clone());
        Ok(pat)
    }

    async fn find_pat(&self, id: PatId) -> Result<Option<PersonalAccessToken>, AuthError> {
        Ok(self.tables.read().await.pats.get(&id).cloned())
    }

    async fn find_pat_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<PersonalAccessToken>, AuthError> {
        Ok(self
            .tables
            .read()
            .await
            .pats
            .values()
            .find(|p| p.token_hash == hash)
            .cloned())
    }

    async fn list_pats(&self, user_id: UserId) -> Result<Vec<PersonalAccessToken>, AuthError> {
        Ok(self
            .tables
            .read()
            .await
            .pats
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_pat_status(&self, id: PatId, status: PatStatus) -> Result<(), AuthError> {
        let mut tables = self.tables.write().await;
        let pat = tables
            .pats
            .get_mut(&id)
            .ok_or_else(|| AuthError::NotFound("访问令牌".to_string()))?;
        pat.status = status;
        Ok(())
    }

    async fn touch_pat(&self, id: PatId, at: DateTime<Utc>) -> Result<(), AuthError> {
        if let Some(pat) = self.tables.write().await.pats.get_mut(&id) {
            pat.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn delete_pat(&self, id: PatId) -> Result<(), AuthError> {
        self.tables
            .write()
            .await
            .pats
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AuthError::NotFound("访问令牌".to_string()))
    }

    async fn delete_user_pats(&self, user_id: UserId) -> Result<usize, AuthError> {
        let mut tables = self.tables.write().await;
        let before = tables.pats.len();
        tables.pats.retain(|_, p| p.user_id != user_id);
        Ok(before - tables.pats.len())
    }

    async fn delete_expired_pats(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let mut tables = self.tables.write().await;
        let before = tables.pats.len();
        tables.pats.retain(|_, p| !p.is_expired_at(now));
        Ok(before - tables.pats.len())
    }
}

#[async_trait]
impl AuditLogRepository for MemoryDatabase {
    async fn create_audit_log(&self, mut log: AuditLog) -> Result<AuditLog, AuthError> {
        let mut tables = self.tables.write().await;
        log.id = next_id(&mut tables.next_audit_id);
        tables.audit_logs.push(log.clone());
        Ok(log)
    }
}
