use std::sync::Arc;
use std::time::Duration;

use ai_agent::{McpTool, McpToolDescription, McpToolResult, McpToolResultT, ParamSpec, ToolSet};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approvals::{ApprovalHandler, ApprovalRequest};
use crate::capabilities::CapabilityRegistry;
use crate::ledger::{InvocationLedger, LedgerEntry};

/// Uniform result of one gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome {
    Success(Value),
    Denied { message: String },
    Error { message: String },
}

impl GatewayOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayOutcome::Success(_) => "success",
            GatewayOutcome::Denied { .. } => "denied",
            GatewayOutcome::Error { .. } => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GatewayOutcome::Success(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, GatewayOutcome::Denied { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, GatewayOutcome::Error { .. })
    }

    /// Wire shape handed back to the model.
    pub fn into_value(self) -> Value {
        match self {
            GatewayOutcome::Success(value) => value,
            GatewayOutcome::Denied { message } => json!({ "denied": true, "message": message }),
            GatewayOutcome::Error { message } => json!({ "error": message }),
        }
    }

    fn message(&self) -> &str {
        match self {
            GatewayOutcome::Success(_) => "",
            GatewayOutcome::Denied { message } | GatewayOutcome::Error { message } => message,
        }
    }
}

/// Single entry point for invoking registry functions. Applies approval
/// gating and a hard time bound, and never lets a handler failure escape.
pub struct ToolGateway {
    registry: Arc<CapabilityRegistry>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    call_timeout: Duration,
    approval_timeout: Duration,
    ledger: Mutex<InvocationLedger>,
}

impl ToolGateway {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            approval: None,
            call_timeout: Duration::from_secs(120),
            approval_timeout: Duration::from_secs(120),
            ledger: Mutex::new(InvocationLedger::new()),
        }
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    pub fn with_timeouts(mut self, call_timeout: Duration, approval_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.approval_timeout = approval_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub async fn invoke(&self, full_name: &str, args: Value) -> GatewayOutcome {
        let outcome = self.dispatch(full_name, args).await;
        match &outcome {
            GatewayOutcome::Success(_) => {
                debug!(target: "gateway", function = %full_name, "call succeeded")
            }
            GatewayOutcome::Denied { .. } => {
                info!(target: "gateway", function = %full_name, "call denied")
            }
            GatewayOutcome::Error { message } => {
                warn!(target: "gateway", function = %full_name, error = %message, "call failed")
            }
        }
        self.ledger
            .lock()
            .await
            .record(full_name, outcome.kind(), outcome.message());
        outcome
    }

    async fn dispatch(&self, full_name: &str, args: Value) -> GatewayOutcome {
        let Some(resolved) = self.registry.lookup(full_name) else {
            return GatewayOutcome::Error {
                message: format!("function `{full_name}` is not available"),
            };
        };

        if let Err(err) = ParamSpec::validate_args(&resolved.params, &args) {
            return GatewayOutcome::Error {
                message: err.to_string(),
            };
        }

        if !resolved.auto_allow {
            if let Some(handler) = &self.approval {
                let request = ApprovalRequest {
                    correlation_id: Uuid::new_v4().to_string(),
                    function_name: full_name.to_string(),
                    arguments: args.clone(),
                };
                let approved =
                    match timeout(self.approval_timeout, handler.request_approval(&request)).await {
                        Ok(Ok(approved)) => approved,
                        Ok(Err(err)) => {
                            warn!(target: "gateway", function = %full_name, error = %err, "approval request failed");
                            false
                        }
                        Err(_) => {
                            warn!(target: "gateway", function = %full_name, "approval timed out");
                            false
                        }
                    };
                if !approved {
                    return GatewayOutcome::Denied {
                        message: format!("the user denied `{full_name}`"),
                    };
                }
            }
        }

        let handler = resolved.handler.clone();
        let credentials = resolved.credentials.clone();
        let task = tokio::spawn(async move { handler.call(args, credentials).await });

        // On timeout the task is left detached; only the caller stops waiting.
        match timeout(self.call_timeout, task).await {
            Ok(Ok(Ok(value))) => GatewayOutcome::Success(value),
            Ok(Ok(Err(err))) => GatewayOutcome::Error {
                message: format!("{err:#}"),
            },
            Ok(Err(join_err)) => GatewayOutcome::Error {
                message: format!("`{full_name}` panicked: {join_err}"),
            },
            Err(_) => GatewayOutcome::Error {
                message: format!(
                    "`{full_name}` timed out after {}",
                    format_bound(self.call_timeout)
                ),
            },
        }
    }

    /// Tool set exposing the named registry functions. Names that do not
    /// resolve right now are skipped.
    pub fn tool_set(self: &Arc<Self>, names: &[String]) -> ToolSet {
        let mut tools = ToolSet::new();
        for name in names {
            if let Some(resolved) = self.registry.lookup(name) {
                tools.insert(Arc::new(GatewayTool {
                    description: resolved.tool_description(),
                    gateway: self.clone(),
                }));
            }
        }
        tools
    }

    pub async fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().await.entries().to_vec()
    }

    pub async fn ledger_root_hash(&self) -> Option<String> {
        self.ledger.lock().await.root_hash()
    }

    pub async fn ledger_intact(&self) -> bool {
        self.ledger.lock().await.is_intact()
    }
}

fn format_bound(bound: Duration) -> String {
    if bound.subsec_millis() == 0 {
        format!("{} seconds", bound.as_secs())
    } else {
        format!("{} ms", bound.as_millis())
    }
}

/// Registry function routed through the gateway.
struct GatewayTool {
    description: McpToolDescription,
    gateway: Arc<ToolGateway>,
}

#[async_trait]
impl McpTool for GatewayTool {
    fn description(&self) -> &McpToolDescription {
        &self.description
    }

    async fn invoke(&self, args: Value) -> McpToolResultT {
        let outcome = self.gateway.invoke(&self.description.name, args).await;
        Ok(McpToolResult::new(outcome.into_value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::{ApprovalBroker, ChannelApprovalHandler};
    use crate::capabilities::{CapabilityHandler, FunctionDef, ProviderCatalog, ProviderManifest};
    use crate::config::{Credentials, InMemoryConfigStore};
    use ai_agent::ParamKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CapabilityHandler for CountingHandler {
        async fn call(&self, args: Value, credentials: Credentials) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "args": args, "token": credentials.get("token") }))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl CapabilityHandler for FailingHandler {
        async fn call(&self, _args: Value, _credentials: Credentials) -> anyhow::Result<Value> {
            anyhow::bail!("quota exceeded")
        }
    }

    struct HangingHandler;

    #[async_trait]
    impl CapabilityHandler for HangingHandler {
        async fn call(&self, _args: Value, _credentials: Credentials) -> anyhow::Result<Value> {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    struct FixedApproval(bool);

    #[async_trait]
    impl ApprovalHandler for FixedApproval {
        async fn request_approval(&self, _request: &ApprovalRequest) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    fn gateway(handler: Arc<dyn CapabilityHandler>, auto_allow: bool) -> ToolGateway {
        let mut function = FunctionDef::new("run", "Run it", handler).with_params(vec![
            ParamSpec::new("count", ParamKind::Integer),
        ]);
        if auto_allow {
            function = function.auto_allow();
        }
        let catalog = Arc::new(ProviderCatalog::new());
        catalog.load(ProviderManifest::new("svc", "Service", "misc").function(function));
        let store = Arc::new(InMemoryConfigStore::new());
        store.set_enabled("svc", true);
        store.set_credential("svc", "token", "secret");
        let registry = Arc::new(CapabilityRegistry::new(catalog, store));
        registry.rebuild();
        ToolGateway::new(registry)
    }

    #[tokio::test]
    async fn success_passes_fresh_credentials() {
        let handler = Arc::new(CountingHandler::default());
        let gateway = gateway(handler.clone(), false);
        let outcome = gateway.invoke("svc__run", json!({ "count": 2 })).await;
        assert_eq!(
            outcome,
            GatewayOutcome::Success(json!({ "args": { "count": 2 }, "token": "secret" }))
        );
        assert_eq!(gateway.ledger_entries().await[0].outcome, "success");
        assert!(gateway.ledger_intact().await);
    }

    #[tokio::test]
    async fn denial_never_invokes_handler() {
        let handler = Arc::new(CountingHandler::default());
        let gateway = gateway(handler.clone(), false).with_approval_handler(Arc::new(FixedApproval(false)));
        let value = gateway.invoke("svc__run", json!({})).await.into_value();
        assert_eq!(value["denied"], json!(true));
        assert!(value["message"].as_str().unwrap().contains("svc__run"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn auto_allowed_functions_skip_approval() {
        let handler = Arc::new(CountingHandler::default());
        let gateway = gateway(handler.clone(), true).with_approval_handler(Arc::new(FixedApproval(false)));
        assert!(gateway.invoke("svc__run", json!({})).await.is_success());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_errors_are_normalized() {
        let gateway = gateway(Arc::new(FailingHandler), false);
        let value = gateway.invoke("svc__run", json!({})).await.into_value();
        assert_eq!(value, json!({ "error": "quota exceeded" }));
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_dispatch() {
        let handler = Arc::new(CountingHandler::default());
        let gateway = gateway(handler.clone(), false);
        let outcome = gateway.invoke("svc__run", json!({ "count": "two" })).await;
        assert!(outcome.is_error());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_function_is_an_error() {
        let gateway = gateway(Arc::new(CountingHandler::default()), false);
        let outcome = gateway.invoke("svc__missing", json!({})).await;
        assert!(matches!(outcome, GatewayOutcome::Error { message } if message.contains("not available")));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_timeout_is_reported_in_millis() {
        let gateway = gateway(Arc::new(HangingHandler), false)
            .with_timeouts(Duration::from_millis(250), Duration::from_secs(120));
        let value = gateway.invoke("svc__run", json!({})).await.into_value();
        assert_eq!(value, json!({ "error": "`svc__run` timed out after 250 ms" }));
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_approval_timeout_clears_pending_prompts() {
        let config = crate::config::OrchestratorConfig::default();
        let broker = ApprovalBroker::new();
        let (approvals, mut prompts) =
            ChannelApprovalHandler::new(broker.clone(), config.channel_approval_timeout());
        let handler = Arc::new(CountingHandler::default());
        let gateway = gateway(handler.clone(), false)
            .with_timeouts(config.gateway_timeout(), config.approval_timeout())
            .with_approval_handler(approvals);

        for _ in 0..3 {
            assert!(gateway.invoke("svc__run", json!({})).await.is_denied());
        }
        let mut correlation_ids = Vec::new();
        while let Ok(prompt) = prompts.try_recv() {
            correlation_ids.push(prompt.correlation_id);
        }

        assert_eq!(correlation_ids.len(), 3);
        assert_eq!(broker.pending_count(), 0);
        assert!(broker.resolve(&correlation_ids[0], true).is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_handler_times_out() {
        let gateway = gateway(Arc::new(HangingHandler), false);
        let outcome = gateway.invoke("svc__run", json!({})).await;
        match outcome {
            GatewayOutcome::Error { message } => {
                assert!(message.contains("svc__run"));
                assert!(message.contains("120 seconds"));
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
    }
}
