use std::sync::Arc;

use ai_agent::{
    AgentOrchestrator, CostEstimator, LanguageModelClient, ModelMessage, ToolSet, TurnError,
    TurnObserver, TurnOutcome, TurnRequest,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::approvals::ApprovalHandler;
use crate::capabilities::CapabilityRegistry;
use crate::config::OrchestratorConfig;
use crate::error::AgentCoreError;
use crate::executor::{ExecutorSettings, PlanExecutor};
use crate::gateway::ToolGateway;
use crate::ledger::LedgerEntry;
use crate::plan::{ModelPlanGenerator, PlanGenerator, PlanProgress, PlanResult, PlanStep};
use crate::plan_tool::RunPlanTool;

/// Wires the registry, gateway, executor and turn loop together.
pub struct AgentRuntime {
    config: OrchestratorConfig,
    registry: Arc<CapabilityRegistry>,
    gateway: Arc<ToolGateway>,
    orchestrator: Option<Arc<AgentOrchestrator>>,
    plan_generator: Option<Arc<dyn PlanGenerator>>,
    progress: Option<mpsc::UnboundedSender<PlanProgress>>,
}

impl AgentRuntime {
    pub fn builder(registry: Arc<CapabilityRegistry>) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(registry)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<ToolGateway> {
        &self.gateway
    }

    /// Rebuilds the registry after provider or configuration changes.
    pub fn refresh(&self) {
        self.registry.rebuild();
    }

    /// Runs one conversational exchange. The model is offered the functions
    /// whose keywords match the message, plus the plan tool whenever at least
    /// one module is live.
    pub async fn run_turn(
        &self,
        history: Vec<ModelMessage>,
        user_text: &str,
        observer: &dyn TurnObserver,
        cancel: Option<CancellationToken>,
    ) -> Result<TurnOutcome, TurnError> {
        let Some(orchestrator) = &self.orchestrator else {
            let err = TurnError::NoModelConfigured;
            observer.on_error(&err.to_string());
            return Err(err);
        };
        let cancel = cancel.unwrap_or_default();
        let tools = self.turn_tools(user_text, &cancel);
        debug!(target: "runtime", tools = ?tools.names(), "tools offered for turn");

        let request = TurnRequest::new(history, user_text)
            .with_tools(tools)
            .with_cancel(cancel);
        orchestrator.run_turn(request, observer).await
    }

    /// Functions from a keyword search over `query`, routed through the
    /// gateway.
    pub fn tool_set(&self, query: &str) -> ToolSet {
        let names: Vec<String> = self
            .registry
            .search(query, None, self.config.search_limit)
            .into_iter()
            .map(|entry| entry.full_name)
            .collect();
        self.gateway.tool_set(&names)
    }

    fn turn_tools(&self, user_text: &str, cancel: &CancellationToken) -> ToolSet {
        let mut tools = self.tool_set(user_text);
        if let Some(plan_tool) = self.plan_tool(cancel) {
            tools.insert(Arc::new(plan_tool));
        }
        tools
    }

    fn plan_tool(&self, cancel: &CancellationToken) -> Option<RunPlanTool> {
        if self.registry.module_catalog().is_empty() {
            return None;
        }
        let generator = self.plan_generator.clone()?;
        let executor = Arc::new(self.executor().ok()?);
        Some(RunPlanTool::new(
            self.registry.catalog_text(),
            generator,
            executor,
            cancel.clone(),
        ))
    }

    fn executor(&self) -> Result<PlanExecutor, AgentCoreError> {
        let orchestrator = self
            .orchestrator
            .clone()
            .ok_or(TurnError::NoModelConfigured)?;
        let mut executor = PlanExecutor::new(orchestrator, self.gateway.clone())
            .with_settings(ExecutorSettings::from(&self.config));
        if let Some(progress) = &self.progress {
            executor = executor.with_progress(progress.clone());
        }
        Ok(executor)
    }

    /// Generates a plan for `request` and executes it.
    pub async fn run_plan(
        &self,
        request: &str,
        cancel: &CancellationToken,
    ) -> Result<PlanResult, AgentCoreError> {
        let generator = self
            .plan_generator
            .clone()
            .ok_or_else(|| AgentCoreError::PlanGeneration("no plan generator configured".into()))?;
        let steps = generator
            .generate(request, &self.registry.catalog_text())
            .await
            .map_err(|err| AgentCoreError::PlanGeneration(format!("{err:#}")))?;
        info!(target: "runtime", steps = steps.len(), "plan generated");
        self.execute_plan(request, &steps, cancel).await
    }

    pub async fn execute_plan(
        &self,
        request: &str,
        steps: &[PlanStep],
        cancel: &CancellationToken,
    ) -> Result<PlanResult, AgentCoreError> {
        Ok(self.executor()?.execute(request, steps, cancel).await)
    }

    pub async fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.gateway.ledger_entries().await
    }

    pub async fn ledger_root_hash(&self) -> Option<String> {
        self.gateway.ledger_root_hash().await
    }

    pub async fn ledger_intact(&self) -> bool {
        self.gateway.ledger_intact().await
    }
}

pub struct AgentRuntimeBuilder {
    registry: Arc<CapabilityRegistry>,
    config: OrchestratorConfig,
    model: Option<Arc<dyn LanguageModelClient>>,
    approval_handler: Option<Arc<dyn ApprovalHandler>>,
    plan_generator: Option<Arc<dyn PlanGenerator>>,
    cost_estimator: Option<Arc<dyn CostEstimator>>,
    progress: Option<mpsc::UnboundedSender<PlanProgress>>,
}

impl AgentRuntimeBuilder {
    fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            config: OrchestratorConfig::default(),
            model: None,
            approval_handler: None,
            plan_generator: None,
            cost_estimator: None,
            progress: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    pub fn with_plan_generator(mut self, generator: Arc<dyn PlanGenerator>) -> Self {
        self.plan_generator = Some(generator);
        self
    }

    pub fn with_cost_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.cost_estimator = Some(estimator);
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<PlanProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn build(self) -> AgentRuntime {
        let mut gateway = ToolGateway::new(self.registry.clone()).with_timeouts(
            self.config.gateway_timeout(),
            self.config.approval_timeout(),
        );
        if let Some(handler) = self.approval_handler {
            gateway = gateway.with_approval_handler(handler);
        }

        let orchestrator = self.model.map(|model| {
            let mut orchestrator = AgentOrchestrator::new(model, self.config.agent_config());
            if let Some(estimator) = self.cost_estimator {
                orchestrator = orchestrator.with_cost_estimator(estimator);
            }
            Arc::new(orchestrator)
        });

        let plan_generator = self.plan_generator.or_else(|| {
            orchestrator.clone().map(|orchestrator| {
                Arc::new(ModelPlanGenerator::new(orchestrator)) as Arc<dyn PlanGenerator>
            })
        });

        AgentRuntime {
            config: self.config,
            registry: self.registry,
            gateway: Arc::new(gateway),
            orchestrator,
            plan_generator,
            progress: self.progress,
        }
    }
}
