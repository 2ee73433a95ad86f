use std::collections::HashMap;
use std::sync::Arc;

use ai_agent::{ModelMessage, TurnObserver};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::AgentCoreError;
use crate::runtime::AgentRuntime;

/// Narrow entry point for channel adapters: maps an external chat id to a
/// conversation and runs turns against it. History lives in memory only.
pub struct ConversationHub {
    runtime: Arc<AgentRuntime>,
    conversations: Mutex<HashMap<String, Vec<ModelMessage>>>,
    bindings: Mutex<HashMap<String, String>>,
}

impl ConversationHub {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self {
            runtime,
            conversations: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Returns the conversation bound to `external_id`, creating one on first
    /// contact. Concurrent first contacts share one conversation.
    pub async fn start_or_resume(&self, external_id: &str) -> String {
        let mut bindings = self.bindings.lock().await;
        if let Some(existing) = bindings.get(external_id) {
            return existing.clone();
        }
        self.bind_new(&mut bindings, external_id).await
    }

    /// Starts a fresh conversation and rebinds `external_id` to it.
    pub async fn new_conversation(&self, external_id: &str) -> String {
        let mut bindings = self.bindings.lock().await;
        self.bind_new(&mut bindings, external_id).await
    }

    // Lock order: bindings, then conversations.
    async fn bind_new(&self, bindings: &mut HashMap<String, String>, external_id: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.conversations
            .lock()
            .await
            .insert(id.clone(), Vec::new());
        bindings.insert(external_id.to_string(), id.clone());
        info!(target: "channel", external_id, conversation = %id, "conversation started");
        id
    }

    /// Runs one turn and appends the exchange to the history on success.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        observer: &dyn TurnObserver,
        cancel: Option<CancellationToken>,
    ) -> Result<String, AgentCoreError> {
        let history = self
            .history(conversation_id)
            .await
            .ok_or_else(|| AgentCoreError::UnknownConversation(conversation_id.to_string()))?;

        let outcome = self
            .runtime
            .run_turn(history, text, observer, cancel)
            .await?;

        let mut conversations = self.conversations.lock().await;
        if let Some(messages) = conversations.get_mut(conversation_id) {
            messages.push(ModelMessage::user(text));
            messages.push(ModelMessage::assistant(outcome.text.clone()));
        }
        Ok(outcome.text)
    }

    pub async fn history(&self, conversation_id: &str) -> Option<Vec<ModelMessage>> {
        self.conversations.lock().await.get(conversation_id).cloned()
    }
}
