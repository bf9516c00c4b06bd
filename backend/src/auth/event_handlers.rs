//! 事件订阅者
//!
//! - `CacheInvalidationHandler`: 角色分配、用户删除、角色权限变更后失效权限缓存
//! - `AuditLogHandler`: 将登录与管理类事件写入审计日志
//!
//! 两者都吞掉自身错误，只记录日志。

use crate::auth::error::AuthError;
use crate::auth::event::{
    DomainEvent, Event, EventBus, EventHandler, COMMAND_EXECUTED, LOGIN_FAILED, LOGIN_SUCCEEDED,
    ROLE_PERMISSIONS_CHANGED, USER_CREATED, USER_DELETED, USER_ROLE_ASSIGNED,
};
use crate::auth::model::{AuditLog, AuditStatus};
use crate::auth::permission_cache::PermissionCache;
use crate::auth::repository::AuditLogRepository;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// 权限缓存失效处理器
pub struct CacheInvalidationHandler {
    cache: Arc<PermissionCache>,
}

impl CacheInvalidationHandler {
    pub fn new(cache: Arc<PermissionCache>) -> Self {
        Self { cache }
    }

    /// 订阅相关事件
    pub fn register(self: Arc<Self>, bus: &EventBus) {
        for name in [USER_ROLE_ASSIGNED, USER_DELETED, ROLE_PERMISSIONS_CHANGED] {
            bus.subscribe(name, self.clone());
        }
    }

    async fn invalidate(&self, event: &Event) -> Result<(), AuthError> {
        match &event.payload {
            DomainEvent::UserRoleAssigned { user_id, .. }
            | DomainEvent::UserDeleted { user_id, .. } => {
                self.cache.invalidate_user(*user_id).await
            }
            DomainEvent::RolePermissionsChanged { role_id, .. } => self
                .cache
                .invalidate_users_with_role(*role_id)
                .await
                .map(|count| debug!("role {} change touched {} users", role_id, count)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EventHandler for CacheInvalidationHandler {
    fn name(&self) -> &'static str {
        "cache_invalidation"
    }

    async fn handle(&self, event: &Event) -> Result<(), AuthError> {
        if let Err(e) = self.invalidate(event).await {
            error!(
                "permission cache invalidation failed for {} ({}): {}",
                event.name, event.aggregate_id, e
            );
        }
        Ok(())
    }
}

/// 审计日志处理器
pub struct AuditLogHandler {
    repo: Arc<dyn AuditLogRepository>,
}

impl AuditLogHandler {
    pub fn new(repo: Arc<dyn AuditLogRepository>) -> Self {
        Self { repo }
    }

    /// 订阅相关事件
    pub fn register(self: Arc<Self>, bus: &EventBus) {
        for name in [
            LOGIN_SUCCEEDED,
            LOGIN_FAILED,
            USER_CREATED,
            USER_DELETED,
            USER_ROLE_ASSIGNED,
            ROLE_PERMISSIONS_CHANGED,
            COMMAND_EXECUTED,
        ] {
            bus.subscribe(name, self.clone());
        }
    }

    /// 事件转审计记录
    pub fn to_audit_log(event: &Event) -> AuditLog {
        let mut log = match &event.payload {
            DomainEvent::LoginSucceeded {
                user_id,
                username,
                client,
            } => {
                let mut log = AuditLog::new("login", "session");
                log.user_id = Some(*user_id);
                log.username = username.clone();
                log.ip_address = client.ip_address.clone();
                log.user_agent = client.user_agent.clone();
                log
            }
            DomainEvent::LoginFailed {
                identifier,
                reason,
                client,
            } => {
                let mut log = AuditLog::new("login", "session");
                log.username = identifier.clone();
                log.details = reason.clone();
                log.status = AuditStatus::Failure;
                log.ip_address = client.ip_address.clone();
                log.user_agent = client.user_agent.clone();
                log
            }
            DomainEvent::UserCreated {
                user_id,
                username,
                email,
            } => {
                let mut log = AuditLog::new("create", "user");
                log.user_id = Some(*user_id);
                log.username = username.clone();
                log.resource_id = user_id.to_string();
                log.details = format!("email={}", email);
                log
            }
            DomainEvent::UserDeleted { user_id, username } => {
                let mut log = AuditLog::new("delete", "user");
                log.username = username.clone();
                log.resource_id = user_id.to_string();
                log
            }
            DomainEvent::UserRoleAssigned { user_id, role_ids } => {
                let mut log = AuditLog::new("assign_roles", "user");
                log.resource_id = user_id.to_string();
                log.details = format!("role_ids={:?}", role_ids);
                log
            }
            DomainEvent::RolePermissionsChanged {
                role_id,
                permission_ids,
            } => {
                let mut log = AuditLog::new("set_permissions", "role");
                log.resource_id = role_id.to_string();
                log.details = format!("permission_ids={:?}", permission_ids);
                log
            }
            DomainEvent::CommandExecuted {
                user_id,
                username,
                action,
                resource,
                resource_id,
                details,
                success,
                client,
            } => {
                let mut log = AuditLog::new(action.clone(), resource.clone());
                log.user_id = Some(*user_id);
                log.username = username.clone();
                log.resource_id = resource_id.clone();
                log.details = details.clone();
                log.ip_address = client.ip_address.clone();
                log.user_agent = client.user_agent.clone();
                if !success {
                    log.status = AuditStatus::Failure;
                }
                log
            }
        };
        log.created_at = event.timestamp;
        log
    }
}

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    async fn handle(&self, event: &Event) -> Result<(), AuthError> {
        let log = Self::to_audit_log(event);
        if let Err(e) = self.repo.create_audit_log(log).await {
            error!("failed to write audit log for {}: {}", event.name, e);
        }
        Ok(())
    }
}
