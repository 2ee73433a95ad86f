use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ai_agent::{AgentOrchestrator, ModelMessage, NoopObserver, TokenUsage};
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DependencyPolicy, OrchestratorConfig};
use crate::gateway::ToolGateway;
use crate::plan::{
    summarize, PlanProgress, PlanResult, PlanStep, ProgressStatus, StepKind, StepOutcome,
};

const TRUNCATION_MARKER: &str = "\n…[truncated]";

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Reasoning rounds allowed inside one tool step.
    pub max_iterations: usize,
    /// Cap on the dependency context handed to a step.
    pub context_chars: usize,
    pub policy: DependencyPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for ExecutorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_iterations: config.step_max_iterations,
            context_chars: config.dependency_context_chars,
            policy: config.dependency_policy,
        }
    }
}

/// Runs plan steps in dependency waves. Steps in the same wave run
/// concurrently; a step only becomes ready once every dependency reached a
/// terminal state.
pub struct PlanExecutor {
    orchestrator: Arc<AgentOrchestrator>,
    gateway: Arc<ToolGateway>,
    settings: ExecutorSettings,
    progress: Option<mpsc::UnboundedSender<PlanProgress>>,
}

impl PlanExecutor {
    pub fn new(orchestrator: Arc<AgentOrchestrator>, gateway: Arc<ToolGateway>) -> Self {
        Self {
            orchestrator,
            gateway,
            settings: ExecutorSettings::default(),
            progress: None,
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<PlanProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn execute(
        &self,
        request: &str,
        steps: &[PlanStep],
        cancel: &CancellationToken,
    ) -> PlanResult {
        let mut executed: HashSet<&str> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, Value> = HashMap::new();
        let mut remaining: Vec<&PlanStep> = steps.iter().collect();
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut usage = TokenUsage::default();
        let mut wave = 0usize;

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&PlanStep>, Vec<&PlanStep>) =
                remaining.into_iter().partition(|step| {
                    step.depends_on
                        .iter()
                        .all(|dependency| executed.contains(dependency.as_str()))
                });

            if ready.is_empty() {
                warn!(
                    target: "plan",
                    steps = blocked.len(),
                    "plan graph is stuck; failing remaining steps"
                );
                for step in blocked {
                    outcomes.push(StepOutcome::failed(&step.id, "unresolvable dependency"));
                }
                break;
            }

            wave += 1;
            info!(target: "plan", wave, steps = ready.len(), "running plan wave");
            let runs = ready
                .iter()
                .map(|step| self.run_step(request, step, &results, &failed, cancel));
            let finished = join_all(runs).await;

            for (step, (outcome, step_usage)) in ready.into_iter().zip(finished) {
                usage += step_usage;
                match &outcome.result {
                    Some(result) if outcome.is_complete() => {
                        results.insert(step.id.clone(), result.clone());
                    }
                    _ => {
                        failed.insert(step.id.clone());
                    }
                }
                executed.insert(step.id.as_str());
                outcomes.push(outcome);
            }
            remaining = blocked;
        }

        let completed = outcomes.iter().filter(|outcome| outcome.is_complete()).count();
        let summary = summarize(completed, steps.len());
        info!(target: "plan", %summary, "plan finished");
        PlanResult {
            steps: outcomes,
            summary,
            usage,
        }
    }

    async fn run_step(
        &self,
        request: &str,
        step: &PlanStep,
        results: &HashMap<String, Value>,
        failed: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> (StepOutcome, TokenUsage) {
        self.emit(step, ProgressStatus::Running, None);

        let dispatched = match self.blocked_by(step, failed) {
            Some(dependency) => Err(format!("dependency '{dependency}' failed")),
            None => {
                let context = dependency_context(step, results, self.settings.context_chars);
                match step.kind {
                    StepKind::Think => self.run_think(request, step, &context, cancel).await,
                    StepKind::Tool => self.run_tool(request, step, &context, cancel).await,
                }
            }
        };

        match dispatched {
            Ok((result, usage)) => {
                debug!(target: "plan", step = %step.id, "step complete");
                self.emit(step, ProgressStatus::Complete, None);
                (StepOutcome::complete(&step.id, result), usage)
            }
            Err(message) => {
                warn!(target: "plan", step = %step.id, error = %message, "step failed");
                self.emit(step, ProgressStatus::Error, Some(message.clone()));
                (StepOutcome::failed(&step.id, message), TokenUsage::default())
            }
        }
    }

    fn blocked_by<'a>(&self, step: &'a PlanStep, failed: &HashSet<String>) -> Option<&'a str> {
        if self.settings.policy != DependencyPolicy::FailFast {
            return None;
        }
        step.depends_on
            .iter()
            .find(|dependency| failed.contains(dependency.as_str()))
            .map(String::as_str)
    }

    async fn run_think(
        &self,
        request: &str,
        step: &PlanStep,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<(Value, TokenUsage), String> {
        let prompt = step_prompt(request, step, context);
        let (text, usage) = self
            .orchestrator
            .complete_text(&prompt, cancel)
            .await
            .map_err(|err| err.to_string())?;
        Ok((Value::String(text), usage))
    }

    async fn run_tool(
        &self,
        request: &str,
        step: &PlanStep,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<(Value, TokenUsage), String> {
        let module = step
            .module
            .as_deref()
            .filter(|module| !module.trim().is_empty())
            .ok_or_else(|| format!("tool step '{}' has no module", step.id))?;

        let names = self.gateway.registry().module_functions(module);
        let tools = self.gateway.tool_set(&names);
        if tools.is_empty() {
            return Err(format!(
                "module `{module}` not found or has no available tools"
            ));
        }

        let prompt = step_prompt(request, step, context);
        let run = self
            .orchestrator
            .run_tool_loop(
                vec![ModelMessage::user(prompt)],
                &tools,
                self.settings.max_iterations,
                cancel,
                &NoopObserver,
            )
            .await
            .map_err(|err| err.to_string())?;

        let mut outputs = run.tool_outputs();
        let result = match outputs.len() {
            0 => Value::String(run.text),
            1 => outputs.remove(0),
            _ => Value::Array(outputs),
        };
        Ok((result, run.usage))
    }

    fn emit(&self, step: &PlanStep, status: ProgressStatus, error: Option<String>) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(PlanProgress {
                step_id: step.id.clone(),
                description: step.description.clone(),
                status,
                error,
            });
        }
    }
}

fn step_prompt(request: &str, step: &PlanStep, context: &str) -> String {
    let mut prompt = format!("Original request:\n{request}\n\nCurrent step:\n{}", step.description);
    if !context.is_empty() {
        prompt.push_str("\n\nResults from earlier steps:\n");
        prompt.push_str(context);
    }
    prompt
}

/// JSON object of the results of `step`'s dependencies, capped at `limit`
/// characters.
fn dependency_context(step: &PlanStep, results: &HashMap<String, Value>, limit: usize) -> String {
    let context: Map<String, Value> = step
        .depends_on
        .iter()
        .filter_map(|id| results.get(id).map(|result| (id.clone(), result.clone())))
        .collect();
    if context.is_empty() {
        return String::new();
    }
    let rendered = Value::Object(context).to_string();
    if rendered.chars().count() <= limit {
        return rendered;
    }
    let mut truncated: String = rendered.chars().take(limit).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_is_truncated_with_marker() {
        let step = PlanStep::think("c", "combine").depends_on(&["a", "missing"]);
        let mut results = HashMap::new();
        results.insert("a".to_string(), json!("x".repeat(50)));

        let full = dependency_context(&step, &results, 4_000);
        assert_eq!(full, json!({ "a": "x".repeat(50) }).to_string());

        let short = dependency_context(&step, &results, 10);
        assert!(short.ends_with("[truncated]"));
        assert_eq!(short.chars().count(), 10 + TRUNCATION_MARKER.chars().count());
    }

    #[test]
    fn context_is_empty_without_dependency_results() {
        let step = PlanStep::think("a", "first");
        assert!(dependency_context(&step, &HashMap::new(), 100).is_empty());
        assert!(!step_prompt("req", &step, "").contains("earlier steps"));
    }
}
