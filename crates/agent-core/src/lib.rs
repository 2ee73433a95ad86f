//! Orchestration core: a rebuildable capability registry, an approval-gated
//! tool gateway, a dependency-wave plan executor and the runtime that offers
//! all of it to the turn loop.

pub mod approvals;
pub mod capabilities;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod ledger;
pub mod plan;
pub mod plan_tool;
pub mod runtime;

pub use approvals::{ApprovalBroker, ApprovalHandler, ApprovalRequest, ChannelApprovalHandler};
pub use capabilities::{
    composite_name, CapabilityHandler, CapabilityRegistry, CapabilityRegistryEntry, FunctionDef,
    ModuleCatalogEntry, ModuleDef, ProviderCatalog, ProviderManifest, ProviderSource,
    ResolvedFunction,
};
pub use channel::ConversationHub;
pub use config::{
    ConfigStore, Credentials, DependencyPolicy, InMemoryConfigStore, OrchestratorConfig,
    ProviderSettings,
};
pub use error::AgentCoreError;
pub use executor::{ExecutorSettings, PlanExecutor};
pub use gateway::{GatewayOutcome, ToolGateway};
pub use ledger::{InvocationLedger, LedgerEntry};
pub use plan::{
    parse_plan, ModelPlanGenerator, PlanGenerator, PlanProgress, PlanResult, PlanStep,
    ProgressStatus, StepKind, StepOutcome, StepStatus,
};
pub use plan_tool::{RunPlanTool, PLAN_TOOL_NAME};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
