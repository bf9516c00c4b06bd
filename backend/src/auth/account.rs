//! 账号管理模块
//!
//! 用户与角色的写操作。凡是改变用户角色或角色权限的写入都会发布事件，
//! 由事件处理器负责权限缓存失效与审计。

use crate::auth::error::AuthError;
use crate::auth::event::{DomainEvent, EventBus};
use crate::auth::model::{PermissionId, RoleId, User, UserId, UserStatus};
use crate::auth::password::PasswordManager;
use crate::auth::pat::PatService;
use crate::auth::permission_cache::PermissionCache;
use crate::auth::repository::{RoleRepository, UserRepository};
use crate::auth::token::TokenService;
use crate::auth::types::TokenPair;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 注册用户默认获得的角色
pub const DEFAULT_USER_ROLE: &str = "user";

/// 新建用户参数
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub status: UserStatus,
    /// 按名称分配的角色
    #[serde(default)]
    pub role_names: Vec<String>,
}

/// 账号服务
pub struct AccountService {
    users: Arc<dyn UserRepository>,
    roles: Arc<dyn RoleRepository>,
    passwords: Arc<PasswordManager>,
    tokens: Arc<TokenService>,
    pats: Arc<PatService>,
    cache: Arc<PermissionCache>,
    events: Arc<EventBus>,
}

impl AccountService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        roles: Arc<dyn RoleRepository>,
        passwords: Arc<PasswordManager>,
        tokens: Arc<TokenService>,
        pats: Arc<PatService>,
        cache: Arc<PermissionCache>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            users,
            roles,
            passwords,
            tokens,
            pats,
            cache,
            events,
        }
    }

    async fn load_user(&self, user_id: UserId) -> Result<User, AuthError> {
        self.users
            .find_user_with_roles(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<User, AuthError> {
        self.load_user(user_id).await
    }

    /// 创建用户
    pub async fn create_user(&self, new_user: NewUser) -> Result<User, AuthError> {
        let username = new_user.username.trim();
        let email = new_user.email.trim();
        if username.is_empty() || email.is_empty() {
            return Err(AuthError::InvalidRequest("用户名和邮箱不能为空".to_string()));
        }
        if !email.contains('@') {
            return Err(AuthError::InvalidRequest("邮箱格式不正确".to_string()));
        }

        let mut role_ids = Vec::with_capacity(new_user.role_names.len());
        for name in &new_user.role_names {
            let role = self
                .roles
                .find_role_by_name(name)
                .await?
                .ok_or_else(|| AuthError::NotFound(format!("角色 {}", name)))?;
            role_ids.push(role.id);
        }

        let hash = self.passwords.validate_and_hash_async(&new_user.password).await?;
        let mut user = User::new(username, email, hash);
        user.status = new_user.status;
        let user = self.users.create_user(user).await?;
        if !role_ids.is_empty() {
            self.users.assign_roles(user.id, &role_ids).await?;
        }
        info!("user {} ({}) created", user.id, user.username);

        self.events.publish(DomainEvent::UserCreated {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
        });
        self.load_user(user.id).await
    }

    /// 自助注册，成功后直接签发令牌对
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(User, TokenPair), AuthError> {
        let role_names = match self.roles.find_role_by_name(DEFAULT_USER_ROLE).await? {
            Some(_) => vec![DEFAULT_USER_ROLE.to_string()],
            None => {
                warn!("default role '{}' missing, registering without roles", DEFAULT_USER_ROLE);
                Vec::new()
            }
        };
        let user = self
            .create_user(NewUser {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
                status: UserStatus::Active,
                role_names,
            })
            .await?;
        let pair = self.tokens.issue_token_pair(&user)?;
        Ok((user, pair))
    }

    /// 修改密码，同时撤销该用户的全部个人访问令牌
    pub async fn change_password(
        &self,
        user_id: UserId,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let mut user = self.load_user(user_id).await?;
        if !PasswordManager::verify_password_async(old_password, &user.password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }
        user.password_hash = self.passwords.validate_and_hash_async(new_password).await?;
        user.updated_at = Utc::now();
        self.users.update_user(&user).await?;
        let revoked = self.pats.revoke_all_for_user(user_id).await?;
        info!("user {} changed password, {} PATs revoked", user_id, revoked);
        Ok(())
    }

    pub async fn set_status(&self, user_id: UserId, status: UserStatus) -> Result<User, AuthError> {
        let mut user = self.load_user(user_id).await?;
        if user.status == status {
            return Ok(user);
        }
        user.status = status;
        user.updated_at = Utc::now();
        self.users.update_user(&user).await?;
        info!("user {} status set to {}", user_id, status.as_str());
        Ok(user)
    }

    /// 覆盖用户角色
    pub async fn assign_roles(&self, user_id: UserId, role_ids: &[RoleId]) -> Result<(), AuthError> {
        self.load_user(user_id).await?;
        self.users.assign_roles(user_id, role_ids).await?;
        debug!("user {} roles set to {:?}", user_id, role_ids);
        self.events.publish(DomainEvent::UserRoleAssigned {
            user_id,
            role_ids: role_ids.to_vec(),
        });
        Ok(())
    }

    /// 软删除用户并撤销其个人访问令牌
    pub async fn delete_user(&self, user_id: UserId) -> Result<(), AuthError> {
        let user = self.load_user(user_id).await?;
        self.users.soft_delete_user(user_id).await?;
        self.pats.revoke_all_for_user(user_id).await?;
        info!("user {} ({}) deleted", user_id, user.username);
        self.events.publish(DomainEvent::UserDeleted {
            user_id,
            username: user.username,
        });
        Ok(())
    }

    /// 覆盖角色权限
    pub async fn set_role_permissions(
        &self,
        role_id: RoleId,
        permission_ids: &[PermissionId],
    ) -> Result<(), AuthError> {
        self.roles.set_role_permissions(role_id, permission_ids).await?;
        info!("role {} permissions set to {:?}", role_id, permission_ids);
        self.events.publish(DomainEvent::RolePermissionsChanged {
            role_id,
            permission_ids: permission_ids.to_vec(),
        });
        Ok(())
    }

    /// 删除角色，系统角色不可删除
    pub async fn delete_role(&self, role_id: RoleId) -> Result<(), AuthError> {
        let role = self
            .roles
            .find_role(role_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("角色".to_string()))?;
        if role.is_system {
            return Err(AuthError::Forbidden("系统角色不可删除".to_string()));
        }

        // 关联在删除时解除，先记下受影响的用户
        let affected = self.users.user_ids_with_role(role_id).await?;
        self.roles.delete_role(role_id).await?;
        for user_id in &affected {
            if let Err(e) = self.cache.invalidate_user(*user_id).await {
                warn!("failed to invalidate permission cache of user {}: {}", user_id, e);
            }
        }
        info!("role {} ({}) deleted, {} users affected", role_id, role.name, affected.len());
        Ok(())
    }
}
