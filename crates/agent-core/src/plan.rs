use std::sync::Arc;

use ai_agent::{AgentOrchestrator, TokenUsage};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Think,
    Tool,
}

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, alias = "depends_on")]
    pub depends_on: Vec<String>,
}

impl PlanStep {
    pub fn think(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: StepKind::Think,
            module: None,
            depends_on: Vec::new(),
        }
    }

    pub fn tool(
        id: impl Into<String>,
        description: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: StepKind::Tool,
            module: Some(module.into()),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|id| id.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn complete(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            status: StepStatus::Complete,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: StepStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == StepStatus::Complete
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub steps: Vec<StepOutcome>,
    pub summary: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl PlanResult {
    pub fn step(&self, id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|step| step.id == id)
    }
}

pub fn summarize(completed: usize, total: usize) -> String {
    if completed == total {
        format!("All {total} step(s) completed successfully.")
    } else {
        format!("{completed}/{total} step(s) completed.")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Complete,
    Error,
}

/// Progress event emitted around every dispatched step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanProgress {
    pub step_id: String,
    pub description: String,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Turns a free-text request into an ordered list of steps.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, request: &str, catalog: &str) -> anyhow::Result<Vec<PlanStep>>;
}

/// Asks the language model for a JSON plan over the module catalog.
pub struct ModelPlanGenerator {
    orchestrator: Arc<AgentOrchestrator>,
}

impl ModelPlanGenerator {
    pub fn new(orchestrator: Arc<AgentOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl PlanGenerator for ModelPlanGenerator {
    async fn generate(&self, request: &str, catalog: &str) -> anyhow::Result<Vec<PlanStep>> {
        let prompt = format!(
            "{PLANNER_PROMPT}\nAvailable modules:\n{catalog}\n\nRequest:\n{request}\n"
        );
        let (text, _) = self
            .orchestrator
            .complete_text(&prompt, &CancellationToken::new())
            .await
            .map_err(|err| anyhow!(err))?;
        parse_plan(&text)
    }
}

/// Parses a JSON array of steps, tolerating a surrounding code fence.
pub fn parse_plan(text: &str) -> anyhow::Result<Vec<PlanStep>> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).context("plan is not a JSON array of steps")
}

const PLANNER_PROMPT: &str = r#"Break the request into steps. Reply with a JSON array only.
Each step: {"id": string, "description": string, "type": "think" | "tool", "module": module ref (tool steps only), "dependsOn": [step ids]}.
Use only modules from the list below."#;
