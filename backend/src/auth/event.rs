//! 进程内事件总线
//!
//! 发布即返回，每个订阅者在独立任务中处理事件：
//! - 与发起请求的取消解耦，客户端断开后审计与缓存失效仍会完成
//! - 每次处理有超时上限
//! - 处理错误只记录日志，不影响业务流程
//!
//! 订阅者可按事件名订阅，也可用 `*` 订阅全部事件。

use crate::auth::error::AuthError;
use crate::auth::model::{PermissionId, RoleId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

pub const LOGIN_SUCCEEDED: &str = "login.succeeded";
pub const LOGIN_FAILED: &str = "login.failed";
pub const USER_CREATED: &str = "user.created";
pub const USER_DELETED: &str = "user.deleted";
pub const USER_ROLE_ASSIGNED: &str = "user.role_assigned";
pub const ROLE_PERMISSIONS_CHANGED: &str = "role.permissions_changed";
pub const COMMAND_EXECUTED: &str = "command.executed";

/// 通配订阅
pub const WILDCARD: &str = "*";

/// 请求来源
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
        }
    }
}

/// 领域事件载荷
#[derive(Debug, Clone)]
pub enum DomainEvent {
    LoginSucceeded {
        user_id: UserId,
        username: String,
        client: ClientInfo,
    },
    LoginFailed {
        identifier: String,
        reason: String,
        client: ClientInfo,
    },
    UserCreated {
        user_id: UserId,
        username: String,
        email: String,
    },
    UserDeleted {
        user_id: UserId,
        username: String,
    },
    UserRoleAssigned {
        user_id: UserId,
        role_ids: Vec<RoleId>,
    },
    RolePermissionsChanged {
        role_id: RoleId,
        permission_ids: Vec<PermissionId>,
    },
    CommandExecuted {
        user_id: UserId,
        username: String,
        action: String,
        resource: String,
        resource_id: String,
        details: String,
        success: bool,
        client: ClientInfo,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::LoginSucceeded { .. } => LOGIN_SUCCEEDED,
            DomainEvent::LoginFailed { .. } => LOGIN_FAILED,
            DomainEvent::UserCreated { .. } => USER_CREATED,
            DomainEvent::UserDeleted { .. } => USER_DELETED,
            DomainEvent::UserRoleAssigned { .. } => USER_ROLE_ASSIGNED,
            DomainEvent::RolePermissionsChanged { .. } => ROLE_PERMISSIONS_CHANGED,
            DomainEvent::CommandExecuted { .. } => COMMAND_EXECUTED,
        }
    }

    pub fn aggregate_id(&self) -> String {
        match self {
            DomainEvent::LoginSucceeded { user_id, .. }
            | DomainEvent::UserCreated { user_id, .. }
            | DomainEvent::UserDeleted { user_id, .. }
            | DomainEvent::UserRoleAssigned { user_id, .. }
            | DomainEvent::CommandExecuted { user_id, .. } => user_id.to_string(),
            DomainEvent::LoginFailed { identifier, .. } => identifier.clone(),
            DomainEvent::RolePermissionsChanged { role_id, .. } => role_id.to_string(),
        }
    }
}

/// 事件信封
#[derive(Debug, Clone)]
pub struct Event {
    pub name: &'static str,
    pub aggregate_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: DomainEvent,
}

impl From<DomainEvent> for Event {
    fn from(payload: DomainEvent) -> Self {
        Self {
            name: payload.name(),
            aggregate_id: payload.aggregate_id(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志）
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &Event) -> Result<(), AuthError>;
}

/// 事件总线
pub struct EventBus {
    subscribers: DashMap<String, Vec<Arc<dyn EventHandler>>>,
    tasks: TaskTracker,
    handler_timeout: Duration,
}

impl EventBus {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            subscribers: DashMap::new(),
            tasks: TaskTracker::new(),
            handler_timeout,
        }
    }

    /// 订阅指定事件，`event_name` 为 `*` 时订阅全部
    pub fn subscribe(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        debug!("{} subscribed to {}", handler.name(), event_name);
        self.subscribers
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    fn handlers_for(&self, event_name: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut handlers = Vec::new();
        for name in [event_name, WILDCARD] {
            if let Some(list) = self.subscribers.get(name) {
                handlers.extend(list.iter().cloned());
            }
        }
        handlers
    }

    /// 发布事件，立即返回
    pub fn publish(&self, payload: DomainEvent) {
        let event = Arc::new(Event::from(payload));
        let handlers = self.handlers_for(event.name);
        if handlers.is_empty() {
            debug!("event {} has no subscribers", event.name);
            return;
        }

        for handler in handlers {
            let event = Arc::clone(&event);
            let timeout = self.handler_timeout;
            self.tasks.spawn(async move {
                match tokio::time::timeout(timeout, handler.handle(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(
                        "event handler {} failed on {} ({}): {}",
                        handler.name(),
                        event.name,
                        event.aggregate_id,
                        e
                    ),
                    Err(_) => warn!(
                        "event handler {} timed out on {} after {:?}",
                        handler.name(),
                        event.name,
                        timeout
                    ),
                }
            });
        }
    }

    /// 等待当前所有处理任务结束
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// 停止接收并等待处理任务结束
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
