//! 认证与授权模块
//!
//! 负责识别调用者（登录、令牌、个人访问令牌、TOTP）并判定其权限（RBAC）。
//! 临时状态保存在 [`store::KvStore`]，持久数据通过 [`repository`] 中的仓储接口访问。

pub mod account;
pub mod captcha;
pub mod captcha_image;
pub mod error;
pub mod event;
pub mod event_handlers;
pub mod handlers;
pub mod jwt;
pub mod login;
pub mod memory;
pub mod middleware;
pub mod model;
pub mod password;
pub mod pat;
pub mod permission_cache;
pub mod rbac;
pub mod recovery;
pub mod repository;
pub mod seed;
pub mod session;
pub mod state;
pub mod store;
pub mod token;
pub mod totp;
pub mod two_factor;
pub mod types;

// 导出核心类型
pub use account::{AccountService, NewUser};
pub use captcha::{CaptchaChallenge, CaptchaService, CaptchaStore};
pub use error::{AuthError, ErrorResponse};
pub use event::{ClientInfo, DomainEvent, Event, EventBus, EventHandler};
pub use handlers::router;
pub use jwt::{AccessClaims, JwtCodec, RefreshClaims};
pub use login::{LoginOrchestrator, LoginOutcome, LoginRequest};
pub use memory::MemoryDatabase;
pub use middleware::{authenticate, extract_client_ip, Authenticator, BearerCredential};
pub use model::{
    AuditLog, AuditStatus, PatStatus, Permission, PersonalAccessToken, Role, TotpConfig, User,
    UserStatus,
};
pub use password::{PasswordManager, PasswordPolicy};
pub use pat::{CreatePatRequest, CreatedPat, PatService, PatSummary};
pub use permission_cache::{PermissionCache, UserPermissions};
pub use rbac::{has_permission, match_permission, Requirement};
pub use session::LoginSessionStore;
pub use state::AuthState;
pub use store::{KvStore, MemoryKvStore};
pub use token::TokenService;
pub use totp::TotpEngine;
pub use two_factor::{TotpService, TotpStatus};
pub use types::{AuthMethod, Identity, TokenPair};
