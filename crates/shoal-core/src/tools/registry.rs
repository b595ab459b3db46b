use crate::audit::audit::{AuditLog, AuditResult};
use crate::auth::identity::AgentIdentity;
use crate::auth::token::TokenService;
use crate::error::ShoalError;
use crate::metrics::metrics::Metrics;
use crate::tools::tool::{ok_envelope, Tool, ToolDef};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSIENT_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

/// Named-tool registry plus the dispatch pipeline every call goes
/// through: resolve identity, authorize, strip sender overrides, enforce
/// the deadline, retry transient storage failures, audit, and wrap the
/// outcome in the uniform envelope.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    tokens: Arc<TokenService>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(tokens: Arc<TokenService>, audit: Arc<AuditLog>, metrics: Arc<Metrics>) -> Self {
        Self {
            tools: HashMap::new(),
            tokens,
            audit,
            metrics,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn tool_defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self
            .tools
            .values()
            .map(|t| ToolDef {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one tool call end to end. Always returns an envelope; errors
    /// never escape as `Err`.
    pub async fn dispatch(&self, token: Option<&str>, name: &str, args: Value) -> Value {
        let started = Instant::now();
        let Some(tool) = self.tools.get(name).cloned() else {
            return ShoalError::Validation(format!("unknown tool '{name}'")).envelope();
        };

        let audited_session = args
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut caller: Option<AgentIdentity> = None;
        let mut attempt = 0u32;
        let mut delay = RETRY_BASE_DELAY;
        let outcome = loop {
            let result = self.run_once(&tool, token, &mut caller, args.clone()).await;
            match result {
                Err(ShoalError::DatabaseUnavailable(_)) if attempt < TRANSIENT_RETRIES => {
                    attempt += 1;
                    tracing::debug!(tool = name, attempt, "retrying transient storage failure");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => break other,
            }
        };

        let agent_id = caller
            .as_ref()
            .map(|c| c.agent_id.clone())
            .unwrap_or_else(|| "anonymous".to_string());

        let (audit_result, details, envelope, ok) = match outcome {
            Ok(payload) => (
                AuditResult::Success,
                json!({}),
                ok_envelope(payload),
                true,
            ),
            Err(e) => {
                let audit_result = match &e {
                    ShoalError::AuthRequired
                    | ShoalError::InvalidToken
                    | ShoalError::ExpiredToken
                    | ShoalError::PermissionDenied(_) => AuditResult::Denied,
                    _ => AuditResult::Error,
                };
                (audit_result, json!({ "code": e.code() }), e.envelope(), false)
            }
        };

        if let Err(e) = self
            .audit
            .record(&agent_id, name, audited_session.as_deref(), audit_result, details)
            .await
        {
            tracing::warn!(tool = name, error = %e, "failed to write audit record");
        }
        self.metrics.record(name, started.elapsed(), ok);

        envelope
    }

    async fn run_once(
        &self,
        tool: &Arc<dyn Tool>,
        token: Option<&str>,
        caller: &mut Option<AgentIdentity>,
        mut args: Value,
    ) -> Result<Value, ShoalError> {
        if tool.requires_token() {
            let raw = token.ok_or(ShoalError::AuthRequired)?;
            let identity = self.tokens.resolve(raw).await?;
            let authorized = tool.authorize(&identity);
            *caller = Some(identity);
            if !authorized {
                return Err(ShoalError::PermissionDenied(format!(
                    "tool '{}' is not permitted for this identity",
                    tool.name()
                )));
            }
            // The sender is always the authenticated identity; any
            // override smuggled into the arguments is discarded.
            if let Some(fields) = args.as_object_mut() {
                fields.remove("sender");
                fields.remove("sender_type");
            }
        }

        match tokio::time::timeout(self.call_timeout, tool.call(caller.as_ref(), args)).await {
            Ok(result) => result,
            Err(_) => Err(ShoalError::Timeout(self.call_timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::{AgentType, Permission};
    use crate::storage::store::Store;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo back the caller and arguments"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        fn required_permission(&self) -> Option<Permission> {
            Some(Permission::Write)
        }
        async fn call(
            &self,
            caller: Option<&AgentIdentity>,
            args: Value,
        ) -> Result<Value, ShoalError> {
            Ok(json!({
                "caller": caller.map(|c| c.agent_id.clone()),
                "args": args,
            }))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps past the deadline"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn call(
            &self,
            _caller: Option<&AgentIdentity>,
            _args: Value,
        ) -> Result<Value, ShoalError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    struct FlakyTool {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails transiently before succeeding"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn call(
            &self,
            _caller: Option<&AgentIdentity>,
            _args: Value,
        ) -> Result<Value, ShoalError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            }).is_ok()
            {
                return Err(ShoalError::DatabaseUnavailable("blip".into()));
            }
            Ok(json!({"made_it": true}))
        }
    }

    async fn open_registry() -> (ToolRegistry, Arc<TokenService>, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("shoal_test_{}.db", Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());
        let store = Arc::new(Store::connect(&url, 5).await.expect("open store"));
        let tokens = Arc::new(TokenService::new(
            store.clone(),
            &"k".repeat(64),
            None,
            Duration::from_secs(3600),
        ));
        let audit = Arc::new(AuditLog::new(store));
        let metrics = Arc::new(Metrics::new(true));
        let mut registry = ToolRegistry::new(tokens.clone(), audit, metrics);
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SlowTool));
        registry.register(Arc::new(FlakyTool {
            failures_left: AtomicU32::new(2),
        }));
        (registry, tokens, path)
    }

    async fn writer_token(tokens: &TokenService) -> String {
        tokens
            .authenticate("a1", AgentType::Claude, &["read".into(), "write".into()])
            .await
            .unwrap()
            .token
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let (registry, _tokens, path) = open_registry().await;
        let env = registry.dispatch(None, "nope", json!({})).await;
        assert_eq!(env["success"], false);
        assert_eq!(env["code"], "VALIDATION_ERROR");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn missing_token_is_auth_required() {
        let (registry, _tokens, path) = open_registry().await;
        let env = registry.dispatch(None, "echo", json!({})).await;
        assert_eq!(env["code"], "AUTH_REQUIRED");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn permission_is_enforced() {
        let (registry, tokens, path) = open_registry().await;
        let read_only = tokens
            .authenticate("viewer", AgentType::Claude, &["read".into()])
            .await
            .unwrap()
            .token;
        let env = registry.dispatch(Some(&read_only), "echo", json!({})).await;
        assert_eq!(env["code"], "PERMISSION_DENIED");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn identity_is_injected_and_overrides_are_stripped() {
        let (registry, tokens, path) = open_registry().await;
        let token = writer_token(&tokens).await;
        let env = registry
            .dispatch(
                Some(&token),
                "echo",
                json!({"sender": "mallory", "sender_type": "admin", "payload": 1}),
            )
            .await;
        assert_eq!(env["success"], true);
        assert_eq!(env["caller"], "a1");
        assert!(env["args"].get("sender").is_none());
        assert!(env["args"].get("sender_type").is_none());
        assert_eq!(env["args"]["payload"], 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout() {
        let (registry, tokens, path) = open_registry().await;
        let registry = registry.with_timeout(Duration::from_millis(50));
        let token = writer_token(&tokens).await;
        let env = registry.dispatch(Some(&token), "slow", json!({})).await;
        assert_eq!(env["code"], "TIMEOUT");
        assert_eq!(env["recoverable"], true);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn transient_storage_failures_are_retried() {
        let (registry, tokens, path) = open_registry().await;
        let token = writer_token(&tokens).await;
        let env = registry.dispatch(Some(&token), "flaky", json!({})).await;
        assert_eq!(env["success"], true);
        assert_eq!(env["made_it"], true);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn defs_are_sorted_and_complete() {
        let (registry, _tokens, path) = open_registry().await;
        let defs = registry.tool_defs();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "flaky", "slow"]);
        assert!(defs.iter().all(|d| !d.description.is_empty()));
        let _ = std::fs::remove_file(path);
    }
}
