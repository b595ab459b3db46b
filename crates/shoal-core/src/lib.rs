pub mod audit;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod notify;
pub mod search;
pub mod service;
pub mod session;
pub mod storage;
pub mod tools;

pub use audit::audit::{AuditLog, AuditQuery, AuditRecord, AuditResult};
pub use auth::identity::{AgentIdentity, AgentType, Permission};
pub use auth::token::{AuthGrant, TokenService};
pub use bridge::bridge::BroadcastBridge;
pub use config::config::ShoalConfig;
pub use error::{Severity, ShoalError};
pub use memory::memory::{AgentMemoryStore, MemoryEntryMeta};
pub use metrics::metrics::Metrics;
pub use notify::hub::{ChangeCause, ChangeHint, NotificationHub, SessionEvent, Subscription};
pub use search::search::{SearchEngine, SearchHit, SearchScope};
pub use service::Services;
pub use session::message::{MessageRecord, MessageType, SessionRecord, Visibility};
pub use session::session::{SessionCore, SessionView};
pub use session::visibility::is_visible;
pub use storage::store::{Dialect, PoolStats, Store};
pub use tools::registry::ToolRegistry;
pub use tools::tool::{ok_envelope, Tool, ToolDef};
