//! Model-facing primitives shared by the orchestration crates.
//! The crate defines the streaming language-model contract, MCP-style tool
//! descriptions with a closed set of parameter kinds, and the turn loop that
//! reconciles a model stream with tool invocations.

pub mod language_model;
pub mod mcp;
pub mod orchestrator;
pub mod params;
pub mod scripted;

pub use language_model::{
    FinishReason, LanguageModelClient, ModelEventStream, ModelMessage, ModelRequest, Role,
    StreamEvent, TokenUsage, ToolCallRequest,
};
pub use mcp::{McpTool, McpToolDescription, McpToolError, McpToolResult, McpToolResultT, ToolSet};
pub use orchestrator::{
    AgentConfig, AgentOrchestrator, CostEstimator, NoopObserver, ToolInvocation, ToolLoopRun,
    TurnError, TurnObserver, TurnOutcome, TurnRequest,
};
pub use params::{param_summary, ParamKind, ParamSpec};
pub use scripted::ScriptedModel;

pub const DEFAULT_AGENT_MAX_STEPS: usize = 8;
