use std::sync::Arc;

use ai_agent::{
    McpTool, McpToolDescription, McpToolError, McpToolResult, McpToolResultT, ParamKind, ParamSpec,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::executor::PlanExecutor;
use crate::plan::{PlanGenerator, PlanResult};

pub const PLAN_TOOL_NAME: &str = "run_plan";

/// Meta-capability offered to the model: generate a plan for a request and
/// execute it over the current module catalog.
pub struct RunPlanTool {
    description: McpToolDescription,
    params: Vec<ParamSpec>,
    catalog: String,
    generator: Arc<dyn PlanGenerator>,
    executor: Arc<PlanExecutor>,
    cancel: CancellationToken,
}

impl RunPlanTool {
    pub fn new(
        catalog: String,
        generator: Arc<dyn PlanGenerator>,
        executor: Arc<PlanExecutor>,
        cancel: CancellationToken,
    ) -> Self {
        let params = vec![ParamSpec::new("request", ParamKind::String)
            .required()
            .describe("The user's request, verbatim")];
        let description = McpToolDescription::from_params(
            PLAN_TOOL_NAME,
            format!(
                "Plan and run a multi-step task across these capability modules:\n{catalog}"
            ),
            &params,
        );
        Self {
            description,
            params,
            catalog,
            generator,
            executor,
            cancel,
        }
    }

    pub async fn run(&self, request: &str) -> anyhow::Result<PlanResult> {
        let steps = self.generator.generate(request, &self.catalog).await?;
        info!(target: "plan", steps = steps.len(), "plan generated");
        Ok(self.executor.execute(request, &steps, &self.cancel).await)
    }
}

#[async_trait]
impl McpTool for RunPlanTool {
    fn description(&self) -> &McpToolDescription {
        &self.description
    }

    async fn invoke(&self, args: Value) -> McpToolResultT {
        ParamSpec::validate_args(&self.params, &args)?;
        let request = args
            .get("request")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let result = self
            .run(request)
            .await
            .map_err(|err| McpToolError::Invocation(format!("plan generation failed: {err:#}")))?;
        let content = serde_json::to_value(&result)
            .map_err(|err| McpToolError::Invocation(err.to_string()))?;
        Ok(McpToolResult::new(content))
    }
}
