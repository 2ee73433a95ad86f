use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::language_model::{
    LanguageModelClient, ModelMessage, ModelRequest, StreamEvent, TokenUsage, ToolCallRequest,
};
use crate::mcp::ToolSet;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub max_steps: usize,
    pub temperature: Option<f32>,
    pub cost_lookup_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.trim().to_string(),
            max_steps: crate::DEFAULT_AGENT_MAX_STEPS,
            temperature: Some(0.4),
            cost_lookup_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    pub result: Option<Value>,
}

/// Callback surface for one turn. Every method defaults to a no-op.
pub trait TurnObserver: Send + Sync {
    fn on_chunk(&self, _text: &str) {}
    fn on_tool_call(&self, _call: &ToolCallRequest) {}
    fn on_tool_result(&self, _call_id: &str, _name: &str, _result: &Value) {}
    fn on_end(&self, _final_text: &str, _usage: &TokenUsage) {}
    fn on_error(&self, _message: &str) {}
}

pub struct NoopObserver;

impl TurnObserver for NoopObserver {}

/// Best-effort pricing lookup consulted after the stream completes.
#[async_trait]
pub trait CostEstimator: Send + Sync {
    async fn estimate(&self, usage: &TokenUsage) -> anyhow::Result<Option<f64>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("no language model is configured")]
    NoModelConfigured,
    #[error("the request was cancelled")]
    Cancelled,
    #[error("{}", empty_response_message(.tools_offered, .tools_called))]
    EmptyResponse {
        tools_offered: bool,
        tools_called: bool,
    },
    #[error("model stream failed: {0}")]
    Model(String),
}

fn empty_response_message(tools_offered: &bool, tools_called: &bool) -> &'static str {
    match (*tools_offered, *tools_called) {
        (false, _) => "the model returned an empty response (no tools were offered)",
        (true, true) => "tools were called but the model produced no text",
        (true, false) => "the model returned an empty response, even after retrying without tools",
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub history: Vec<ModelMessage>,
    pub user_text: String,
    pub tools: ToolSet,
    pub cancel: Option<CancellationToken>,
}

impl TurnRequest {
    pub fn new(history: Vec<ModelMessage>, user_text: impl Into<String>) -> Self {
        Self {
            history,
            user_text: user_text.into(),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub text: String,
    pub usage: TokenUsage,
    pub invocations: Vec<ToolInvocation>,
    pub retried_without_tools: bool,
}

/// Result of driving the model through one bounded tool loop.
#[derive(Debug, Clone, Default)]
pub struct ToolLoopRun {
    pub text: String,
    pub usage: TokenUsage,
    pub invocations: Vec<ToolInvocation>,
    pub steps: usize,
}

impl ToolLoopRun {
    fn record_call(&mut self, call: &ToolCallRequest) {
        self.invocations.push(ToolInvocation {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: None,
        });
    }

    fn record_result(&mut self, call_id: &str, name: &str, result: Value) {
        match self
            .invocations
            .iter_mut()
            .find(|invocation| invocation.call_id == call_id)
        {
            Some(invocation) => invocation.result = Some(result),
            None => self.invocations.push(ToolInvocation {
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments: Value::Null,
                result: Some(result),
            }),
        }
    }

    /// Outputs of every tool that produced a result, in call order.
    pub fn tool_outputs(&self) -> Vec<Value> {
        self.invocations
            .iter()
            .filter_map(|invocation| invocation.result.clone())
            .collect()
    }
}

pub struct AgentOrchestrator {
    model: Arc<dyn LanguageModelClient>,
    config: AgentConfig,
    cost_estimator: Option<Arc<dyn CostEstimator>>,
}

impl AgentOrchestrator {
    pub fn new(model: Arc<dyn LanguageModelClient>, config: AgentConfig) -> Self {
        Self {
            model,
            config,
            cost_estimator: None,
        }
    }

    pub fn with_cost_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.cost_estimator = Some(estimator);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Runs exactly one conversational exchange. When the model yields no
    /// text while tools were offered, the same request is replayed once with
    /// the tools withheld and the usage of both attempts is summed.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        observer: &dyn TurnObserver,
    ) -> Result<TurnOutcome, TurnError> {
        let cancel = request.cancel.clone().unwrap_or_default();
        let tools_offered = !request.tools.is_empty();
        let mut messages = request.history;
        messages.push(ModelMessage::user(request.user_text));
        info!(
            target: "turn",
            tools = request.tools.len(),
            messages = messages.len(),
            "starting turn"
        );

        let first = match self
            .run_tool_loop(
                messages.clone(),
                &request.tools,
                self.config.max_steps,
                &cancel,
                observer,
            )
            .await
        {
            Ok(run) => run,
            Err(err) => return Err(self.fail(err, &cancel, observer)),
        };

        let mut usage = first.usage;
        let mut text = first.text;
        let invocations = first.invocations;
        let mut retried_without_tools = false;

        if text.trim().is_empty() && tools_offered {
            warn!(
                target: "turn",
                tool_calls = invocations.len(),
                "model produced no text with tools offered; retrying without tools"
            );
            let retry = match self
                .run_tool_loop(messages, &ToolSet::new(), 1, &cancel, observer)
                .await
            {
                Ok(run) => run,
                Err(err) => return Err(self.fail(err, &cancel, observer)),
            };
            usage += retry.usage;
            text = retry.text;
            retried_without_tools = true;
        }

        if text.trim().is_empty() {
            let err = TurnError::EmptyResponse {
                tools_offered,
                tools_called: !invocations.is_empty(),
            };
            return Err(self.fail(err, &cancel, observer));
        }

        if let Some(cost) = self.lookup_cost(&usage).await {
            usage.cost = Some(cost);
        }

        observer.on_end(&text, &usage);
        Ok(TurnOutcome {
            text,
            usage,
            invocations,
            retried_without_tools,
        })
    }

    /// Streams the model against `tools` for at most `max_steps` rounds,
    /// executing every tool call the provider did not answer itself and
    /// feeding the results back as tool messages.
    pub async fn run_tool_loop(
        &self,
        messages: Vec<ModelMessage>,
        tools: &ToolSet,
        max_steps: usize,
        cancel: &CancellationToken,
        observer: &dyn TurnObserver,
    ) -> Result<ToolLoopRun, TurnError> {
        let mut conversation = messages;
        let mut run = ToolLoopRun::default();
        let offered = tools.descriptions();
        let max_steps = max_steps.max(1);

        for step in 0..max_steps {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }

            let request = ModelRequest {
                system_prompt: Some(self.config.system_prompt.clone()),
                messages: conversation.clone(),
                tools: offered.clone(),
                temperature: self.config.temperature,
            };
            let mut stream = self
                .model
                .stream(request, cancel.clone())
                .await
                .map_err(|err| TurnError::Model(err.to_string()))?;

            let mut step_text = String::new();
            let mut pending: Vec<ToolCallRequest> = Vec::new();
            let mut answered: HashSet<String> = HashSet::new();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                    event = stream.next() => event,
                };
                let Some(event) = next else { break };

                match event {
                    StreamEvent::TextDelta { text } => {
                        if !text.is_empty() {
                            observer.on_chunk(&text);
                            step_text.push_str(&text);
                        }
                    }
                    StreamEvent::ToolCall {
                        call_id,
                        name,
                        arguments,
                    } => {
                        let call = ToolCallRequest {
                            call_id,
                            name,
                            arguments,
                        };
                        observer.on_tool_call(&call);
                        run.record_call(&call);
                        pending.push(call);
                    }
                    StreamEvent::ToolResult {
                        call_id,
                        name,
                        result,
                    } => {
                        observer.on_tool_result(&call_id, &name, &result);
                        answered.insert(call_id.clone());
                        run.record_result(&call_id, &name, result);
                    }
                    StreamEvent::Finish { reason, usage } => {
                        debug!(target: "turn", step, ?reason, "model stream finished");
                        run.usage += usage;
                    }
                    StreamEvent::Error { message } => return Err(TurnError::Model(message)),
                }
            }

            run.text.push_str(&step_text);
            run.steps = step + 1;

            let unanswered: Vec<ToolCallRequest> = pending
                .into_iter()
                .filter(|call| !answered.contains(&call.call_id))
                .collect();
            if unanswered.is_empty() {
                return Ok(run);
            }

            conversation.push(ModelMessage::assistant_tool_calls(
                step_text,
                unanswered.clone(),
            ));
            for call in unanswered {
                if cancel.is_cancelled() {
                    return Err(TurnError::Cancelled);
                }
                let result = execute_call(tools, &call).await;
                observer.on_tool_result(&call.call_id, &call.name, &result);
                conversation.push(ModelMessage::tool_result(&call.call_id, &result));
                run.record_result(&call.call_id, &call.name, result);
            }
        }

        warn!(target: "turn", max_steps, "tool loop exhausted its step budget");
        Ok(run)
    }

    /// Single reasoning call with no tools offered.
    pub async fn complete_text(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, TokenUsage), TurnError> {
        let run = self
            .run_tool_loop(
                vec![ModelMessage::user(prompt)],
                &ToolSet::new(),
                1,
                cancel,
                &NoopObserver,
            )
            .await?;
        Ok((run.text, run.usage))
    }

    async fn lookup_cost(&self, usage: &TokenUsage) -> Option<f64> {
        let estimator = self.cost_estimator.as_ref()?;
        match timeout(self.config.cost_lookup_timeout, estimator.estimate(usage)).await {
            Ok(Ok(cost)) => cost,
            Ok(Err(err)) => {
                debug!(target: "turn", error = %err, "cost lookup failed");
                None
            }
            Err(_) => {
                debug!(target: "turn", "cost lookup timed out");
                None
            }
        }
    }

    fn fail(
        &self,
        err: TurnError,
        cancel: &CancellationToken,
        observer: &dyn TurnObserver,
    ) -> TurnError {
        let err = if cancel.is_cancelled() {
            TurnError::Cancelled
        } else {
            err
        };
        match &err {
            TurnError::Cancelled => info!(target: "turn", "turn cancelled by caller"),
            other => warn!(target: "turn", error = %other, "turn failed"),
        }
        observer.on_error(&err.to_string());
        err
    }
}

async fn execute_call(tools: &ToolSet, call: &ToolCallRequest) -> Value {
    let Some(tool) = tools.get(&call.name) else {
        return json!({ "error": format!("unknown tool `{}`", call.name) });
    };
    match tool.invoke(call.arguments.clone()).await {
        Ok(result) => result.content,
        Err(err) => json!({ "error": err.to_string() }),
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are a helpful assistant with access to external capabilities.
Rules:
- Answer directly when no capability is needed.
- When a request needs several capabilities, call the plan tool with the user's request verbatim.
- After a tool result arrives, answer with what succeeded and mention anything that failed.
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language_model::{FinishReason, Role};
    use crate::mcp::{McpTool, McpToolDescription, McpToolResult, McpToolResultT};
    use crate::scripted::ScriptedModel;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
        cancel_on_chunk: Option<CancellationToken>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl TurnObserver for RecordingObserver {
        fn on_chunk(&self, text: &str) {
            self.push(format!("chunk:{text}"));
            if let Some(cancel) = &self.cancel_on_chunk {
                cancel.cancel();
            }
        }

        fn on_tool_call(&self, call: &ToolCallRequest) {
            self.push(format!("call:{}", call.name));
        }

        fn on_tool_result(&self, _call_id: &str, name: &str, _result: &Value) {
            self.push(format!("result:{name}"));
        }

        fn on_end(&self, final_text: &str, usage: &TokenUsage) {
            self.push(format!("end:{final_text}:{}", usage.total_tokens));
        }

        fn on_error(&self, message: &str) {
            self.push(format!("error:{message}"));
        }
    }

    struct EchoTool {
        description: McpToolDescription,
    }

    impl EchoTool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                description: McpToolDescription::new("echo", "Echo arguments", json!({})),
            })
        }
    }

    #[async_trait]
    impl McpTool for EchoTool {
        fn description(&self) -> &McpToolDescription {
            &self.description
        }

        async fn invoke(&self, args: Value) -> McpToolResultT {
            Ok(McpToolResult::new(json!({ "echo": args })))
        }
    }

    fn orchestrator(model: Arc<ScriptedModel>) -> AgentOrchestrator {
        AgentOrchestrator::new(model, AgentConfig::default())
    }

    fn tools() -> ToolSet {
        ToolSet::new().with(EchoTool::new())
    }

    #[tokio::test]
    async fn streams_chunks_in_generation_order() {
        let model = Arc::new(ScriptedModel::new(vec![vec![
            StreamEvent::text("Hel"),
            StreamEvent::text("lo"),
            StreamEvent::finish(FinishReason::Stop, TokenUsage::new(3, 2)),
        ]]));
        let observer = RecordingObserver::default();

        let outcome = orchestrator(model)
            .run_turn(TurnRequest::new(Vec::new(), "hi"), &observer)
            .await
            .expect("turn should succeed");

        assert_eq!(outcome.text, "Hello");
        assert_eq!(outcome.usage.total_tokens, 5);
        assert_eq!(
            observer.events(),
            vec!["chunk:Hel", "chunk:lo", "end:Hello:5"]
        );
    }

    #[tokio::test]
    async fn retries_without_tools_and_sums_usage() {
        let model = Arc::new(ScriptedModel::new(vec![
            ScriptedModel::reply("", TokenUsage::new(10, 0)),
            ScriptedModel::reply("fallback answer", TokenUsage::new(8, 4)),
        ]));
        let observer = RecordingObserver::default();

        let outcome = orchestrator(model.clone())
            .run_turn(
                TurnRequest::new(Vec::new(), "what's up").with_tools(tools()),
                &observer,
            )
            .await
            .expect("fallback should produce text");

        assert_eq!(outcome.text, "fallback answer");
        assert!(outcome.retried_without_tools);
        assert_eq!(outcome.usage.input_tokens, 18);
        assert_eq!(outcome.usage.output_tokens, 4);
        assert_eq!(outcome.usage.total_tokens, 22);

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        assert!(requests[1].tools.is_empty());
    }

    #[tokio::test]
    async fn executes_tool_calls_and_feeds_results_back() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![
                StreamEvent::tool_call("c1", "echo", json!({ "value": 42 })),
                StreamEvent::finish(FinishReason::ToolCalls, TokenUsage::new(5, 1)),
            ],
            ScriptedModel::reply("done", TokenUsage::new(6, 1)),
        ]));
        let observer = RecordingObserver::default();

        let outcome = orchestrator(model.clone())
            .run_turn(
                TurnRequest::new(Vec::new(), "echo 42").with_tools(tools()),
                &observer,
            )
            .await
            .unwrap();

        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.invocations.len(), 1);
        assert_eq!(
            outcome.invocations[0].result,
            Some(json!({ "echo": { "value": 42 } }))
        );
        assert_eq!(
            observer.events(),
            vec!["call:echo", "result:echo", "chunk:done", "end:done:13"]
        );

        let second = &model.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
        assert!(last.content.contains("42"));
    }

    #[tokio::test]
    async fn empty_after_tool_calls_reports_distinct_error() {
        let model = Arc::new(ScriptedModel::new(vec![
            vec![
                StreamEvent::tool_call("c1", "echo", json!({})),
                StreamEvent::finish(FinishReason::ToolCalls, TokenUsage::default()),
            ],
            ScriptedModel::reply("", TokenUsage::default()),
            ScriptedModel::reply("", TokenUsage::default()),
        ]));
        let observer = RecordingObserver::default();

        let err = orchestrator(model)
            .run_turn(
                TurnRequest::new(Vec::new(), "do it").with_tools(tools()),
                &observer,
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TurnError::EmptyResponse {
                tools_offered: true,
                tools_called: true
            }
        );
        assert!(err.to_string().contains("tools were called"));
        assert!(observer.events().last().unwrap().starts_with("error:"));
    }

    #[tokio::test]
    async fn empty_without_tools_does_not_retry() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::reply(
            "",
            TokenUsage::default(),
        )]));

        let err = orchestrator(model.clone())
            .run_turn(TurnRequest::new(Vec::new(), "hello"), &NoopObserver)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no tools were offered"));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_reported_distinctly() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        model.push_stalled(vec![StreamEvent::text("partial")]);
        let cancel = CancellationToken::new();
        let observer = RecordingObserver {
            cancel_on_chunk: Some(cancel.clone()),
            ..RecordingObserver::default()
        };

        let err = orchestrator(model)
            .run_turn(
                TurnRequest::new(Vec::new(), "long task").with_cancel(cancel),
                &observer,
            )
            .await
            .unwrap_err();

        assert_eq!(err, TurnError::Cancelled);
        assert_eq!(
            observer.events(),
            vec!["chunk:partial", "error:the request was cancelled"]
        );
    }

    #[tokio::test]
    async fn model_errors_surface_as_turn_failures() {
        let model = Arc::new(ScriptedModel::new(vec![vec![StreamEvent::Error {
            message: "rate limited".into(),
        }]]));

        let err = orchestrator(model)
            .run_turn(TurnRequest::new(Vec::new(), "hi"), &NoopObserver)
            .await
            .unwrap_err();
        assert_eq!(err, TurnError::Model("rate limited".into()));
    }

    struct SlowEstimator;

    #[async_trait]
    impl CostEstimator for SlowEstimator {
        async fn estimate(&self, _usage: &TokenUsage) -> anyhow::Result<Option<f64>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Some(1.0))
        }
    }

    struct FixedEstimator;

    #[async_trait]
    impl CostEstimator for FixedEstimator {
        async fn estimate(&self, usage: &TokenUsage) -> anyhow::Result<Option<f64>> {
            Ok(Some(usage.total_tokens as f64 * 0.001))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cost_lookup_never_blocks_the_answer() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::reply(
            "ok",
            TokenUsage::new(1, 1),
        )]));
        let outcome = orchestrator(model)
            .with_cost_estimator(Arc::new(SlowEstimator))
            .run_turn(TurnRequest::new(Vec::new(), "hi"), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(outcome.text, "ok");
        assert_eq!(outcome.usage.cost, None);
    }

    #[tokio::test]
    async fn cost_is_attached_when_lookup_succeeds() {
        let model = Arc::new(ScriptedModel::new(vec![ScriptedModel::reply(
            "ok",
            TokenUsage::new(600, 400),
        )]));
        let outcome = orchestrator(model)
            .with_cost_estimator(Arc::new(FixedEstimator))
            .run_turn(TurnRequest::new(Vec::new(), "hi"), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(outcome.usage.cost, Some(1.0));
    }
}
