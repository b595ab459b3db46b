use crate::audit::audit::AuditLog;
use crate::auth::token::TokenService;
use crate::bridge::bridge::BroadcastBridge;
use crate::config::config::ShoalConfig;
use crate::error::ShoalError;
use crate::memory::memory::AgentMemoryStore;
use crate::metrics::metrics::Metrics;
use crate::notify::hub::NotificationHub;
use crate::search::search::SearchEngine;
use crate::session::session::SessionCore;
use crate::storage::store::Store;
use crate::tools::admin::{GetAuditLogTool, GetPerformanceMetricsTool, GetUsageGuidanceTool};
use crate::tools::auth::{AuthenticateTool, RefreshTokenTool, RevokeTokenTool};
use crate::tools::memory::{DeleteMemoryTool, GetMemoryTool, ListMemoryTool, SetMemoryTool};
use crate::tools::registry::ToolRegistry;
use crate::tools::search::{SearchBySenderTool, SearchByTimerangeTool, SearchContextTool};
use crate::tools::session::{
    AddMessageTool, CreateSessionTool, GetMessagesSinceTool, GetMessagesTool, GetSessionTool,
};
use std::sync::Arc;
use std::time::Duration;

/// Everything the server runs on, constructed once at startup and handed
/// to the transport. There is no global state: each component is owned
/// here and shared by `Arc`.
pub struct Services {
    pub config: ShoalConfig,
    pub store: Arc<Store>,
    pub tokens: Arc<TokenService>,
    pub audit: Arc<AuditLog>,
    pub hub: Arc<NotificationHub>,
    pub bridge: Option<Arc<BroadcastBridge>>,
    pub sessions: Arc<SessionCore>,
    pub memory: Arc<AgentMemoryStore>,
    pub search: Arc<SearchEngine>,
    pub metrics: Arc<Metrics>,
}

impl Services {
    pub async fn init(config: ShoalConfig) -> Result<Self, ShoalError> {
        let store = Arc::new(Store::connect(&config.database_url, config.pool_size()).await?);
        let tokens = Arc::new(TokenService::new(
            store.clone(),
            &config.jwt_secret,
            config.jwt_secret_previous.as_deref(),
            Duration::from_secs(config.token_ttl_seconds),
        ));
        let audit = Arc::new(AuditLog::new(store.clone()));
        let hub = Arc::new(NotificationHub::new());
        let bridge = match config.bridge_url() {
            Some(url) => {
                tracing::info!(target_url = %url, "broadcast bridge enabled");
                Some(Arc::new(BroadcastBridge::new(url)?))
            }
            None => None,
        };
        let sessions = Arc::new(SessionCore::new(store.clone(), hub.clone(), bridge.clone()));
        let memory = Arc::new(AgentMemoryStore::new(store.clone()));
        let search = Arc::new(SearchEngine::new(store.clone()));
        let metrics = Arc::new(Metrics::new(config.performance_monitoring));

        Ok(Self {
            config,
            store,
            tokens,
            audit,
            hub,
            bridge,
            sessions,
            memory,
            search,
            metrics,
        })
    }

    /// The full tool surface, wired against this service bundle.
    pub fn registry(&self) -> ToolRegistry {
        let mut registry =
            ToolRegistry::new(self.tokens.clone(), self.audit.clone(), self.metrics.clone());

        registry.register(Arc::new(AuthenticateTool::new(self.tokens.clone())));
        registry.register(Arc::new(RefreshTokenTool::new(self.tokens.clone())));
        registry.register(Arc::new(RevokeTokenTool::new(self.tokens.clone())));

        registry.register(Arc::new(CreateSessionTool::new(self.sessions.clone())));
        registry.register(Arc::new(GetSessionTool::new(self.sessions.clone())));
        registry.register(Arc::new(AddMessageTool::new(self.sessions.clone())));
        registry.register(Arc::new(GetMessagesTool::new(self.sessions.clone())));
        registry.register(Arc::new(GetMessagesSinceTool::new(self.sessions.clone())));

        registry.register(Arc::new(SetMemoryTool::new(self.memory.clone())));
        registry.register(Arc::new(GetMemoryTool::new(self.memory.clone())));
        registry.register(Arc::new(ListMemoryTool::new(self.memory.clone())));
        registry.register(Arc::new(DeleteMemoryTool::new(self.memory.clone())));

        registry.register(Arc::new(SearchContextTool::new(self.search.clone())));
        registry.register(Arc::new(SearchBySenderTool::new(self.search.clone())));
        registry.register(Arc::new(SearchByTimerangeTool::new(self.search.clone())));

        registry.register(Arc::new(GetPerformanceMetricsTool::new(
            self.metrics.clone(),
            self.tokens.clone(),
            self.store.clone(),
            self.hub.clone(),
            self.bridge.clone(),
        )));
        registry.register(Arc::new(GetUsageGuidanceTool));
        registry.register(Arc::new(GetAuditLogTool::new(self.audit.clone())));

        registry
    }
}
