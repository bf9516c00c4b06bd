//! 初始数据
//!
//! 预置权限码、系统角色 `admin`（全部权限）与 `user`（user 域权限），
//! 以及可选的初始管理员账户。重复执行是幂等的。

use crate::auth::account::{NewUser, DEFAULT_USER_ROLE as USER_ROLE};
use crate::auth::error::AuthError;
use crate::auth::model::{Permission, Role, UserStatus};
use crate::auth::rbac::ADMIN_ROLE;
use crate::auth::repository::{RoleRepository, UserRepository};
use crate::auth::state::AuthState;
use tracing::info;

const CRUD: &[&str] = &["create", "read", "update", "delete"];

/// 预置权限 `(domain, resource, action)`
pub fn default_permissions() -> Vec<(&'static str, &'static str, &'static str)> {
    let mut perms = Vec::new();
    for resource in ["users", "roles", "menus", "settings"] {
        for action in CRUD {
            perms.push(("admin", resource, *action));
        }
    }
    perms.extend([
        ("admin", "permissions", "read"),
        ("admin", "overview", "read"),
        ("admin", "audit_logs", "read"),
        ("user", "profile", "read"),
        ("user", "profile", "update"),
        ("user", "profile", "delete"),
        ("user", "password", "update"),
        ("user", "email", "update"),
    ]);
    for action in ["create", "read", "disable", "enable", "delete"] {
        perms.push(("user", "tokens", action));
    }
    for action in ["read", "write", "delete"] {
        perms.push(("api", "cache", action));
    }
    perms
}

/// 写入预置权限与系统角色，配置了初始管理员时一并创建
pub async fn seed_defaults(state: &AuthState) -> Result<(), AuthError> {
    let mut permissions = Vec::new();
    for (domain, resource, action) in default_permissions() {
        permissions.push(
            state
                .db
                .upsert_permission(Permission::new(domain, resource, action))
                .await?,
        );
    }

    let user_permissions: Vec<Permission> = permissions
        .iter()
        .filter(|p| p.domain == USER_ROLE)
        .cloned()
        .collect();
    ensure_role(state, ADMIN_ROLE, "管理员", permissions).await?;
    ensure_role(state, USER_ROLE, "普通用户", user_permissions).await?;

    let seed = &state.config.seed;
    if let (Some(username), Some(email), Some(password)) = (
        seed.admin_username.as_deref(),
        seed.admin_email.as_deref(),
        seed.admin_password.as_deref(),
    ) {
        if state.db.find_user_by_username(username).await?.is_none() {
            let admin = state
                .accounts
                .create_user(NewUser {
                    username: username.to_string(),
                    email: email.to_string(),
                    password: password.to_string(),
                    status: UserStatus::Active,
                    role_names: vec![ADMIN_ROLE.to_string()],
                })
                .await?;
            info!("bootstrap admin {} created", admin.username);
        }
    }
    Ok(())
}

async fn ensure_role(
    state: &AuthState,
    name: &str,
    display_name: &str,
    permissions: Vec<Permission>,
) -> Result<(), AuthError> {
    if state.db.find_role_by_name(name).await?.is_some() {
        return Ok(());
    }
    let mut role = Role::new(name, display_name);
    role.is_system = true;
    role.permissions = permissions;
    let role = state.db.create_role(role).await?;
    info!("system role {} created with {} permissions", name, role.permissions.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::state::{test_config, AuthState};

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let mut config = test_config();
        config.seed.admin_username = Some("root".into());
        config.seed.admin_email = Some("root@ex.com".into());
        config.seed.admin_password = Some("Password123!".into());
        let state = AuthState::in_memory(config).unwrap();

        seed_defaults(&state).await.unwrap();
        seed_defaults(&state).await.unwrap();

        let roles = state.db.list_roles().await.unwrap();
        assert_eq!(roles.len(), 2);
        assert!(roles.iter().all(|r| r.is_system));
        let perms = state.db.list_permissions().await.unwrap();
        assert_eq!(perms.len(), default_permissions().len());

        let admin = state.db.find_user_by_username("root").await.unwrap().unwrap();
        assert!(admin.has_role(ADMIN_ROLE));
        assert_eq!(admin.permission_codes().len(), perms.len());

        let user_role = state.db.find_role_by_name(USER_ROLE).await.unwrap().unwrap();
        assert!(user_role.permissions.iter().all(|p| p.code.starts_with("user:")));
    }
}
