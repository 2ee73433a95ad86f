use ai_agent::TurnError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentCoreError {
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),
    #[error("plan generation failed: {0}")]
    PlanGeneration(String),
}
