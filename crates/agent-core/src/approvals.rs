use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{info, warn};

/// Payload shown to whoever decides whether a call may proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub correlation_id: String,
    pub function_name: String,
    pub arguments: Value,
}

/// Implemented by hosts to prompt the user before a non-auto-allowed
/// function runs. `Ok(false)` and `Err` both count as a denial.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> anyhow::Result<bool>;
}

/// Pending approval decisions keyed by correlation id. The lock is never held
/// across an await, so entries can be dropped from a destructor.
#[derive(Debug, Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, correlation_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(correlation_id.to_string(), tx);
        rx
    }

    pub fn resolve(&self, correlation_id: &str, approved: bool) -> Result<()> {
        let sender = self
            .lock()
            .remove(correlation_id)
            .ok_or_else(|| anyhow!("unknown approval request: {}", correlation_id))?;
        let _ = sender.send(approved);
        Ok(())
    }

    pub fn discard(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.pending.lock().expect("approval broker poisoned")
    }
}

/// Removes a pending entry when the waiting future completes or is dropped
/// by an outer timeout.
struct PendingGuard<'a> {
    broker: &'a ApprovalBroker,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.broker.discard(self.correlation_id);
    }
}

/// Forwards approval prompts over a channel and waits for the answer to come
/// back through the broker. Unanswered prompts are denied after `timeout`.
pub struct ChannelApprovalHandler {
    broker: Arc<ApprovalBroker>,
    prompts: mpsc::UnboundedSender<ApprovalRequest>,
    timeout: Duration,
}

impl ChannelApprovalHandler {
    pub fn new(
        broker: Arc<ApprovalBroker>,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (prompts, receiver) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            broker,
            prompts,
            timeout,
        });
        (handler, receiver)
    }
}

#[async_trait]
impl ApprovalHandler for ChannelApprovalHandler {
    async fn request_approval(&self, request: &ApprovalRequest) -> anyhow::Result<bool> {
        let receiver = self.broker.register(&request.correlation_id);
        let _pending = PendingGuard {
            broker: &self.broker,
            correlation_id: &request.correlation_id,
        };
        if self.prompts.send(request.clone()).is_err() {
            return Err(anyhow!("approval channel closed"));
        }
        info!(
            target: "approvals",
            correlation_id = %request.correlation_id,
            function = %request.function_name,
            "approval requested"
        );

        match timeout(self.timeout, receiver).await {
            Ok(Ok(approved)) => Ok(approved),
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                warn!(
                    target: "approvals",
                    correlation_id = %request.correlation_id,
                    "approval timed out; denying"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest {
            correlation_id: id.to_string(),
            function_name: "gmail__send_email".to_string(),
            arguments: json!({ "to": "a@b.c" }),
        }
    }

    #[tokio::test]
    async fn resolves_through_broker() {
        let broker = ApprovalBroker::new();
        let (handler, mut prompts) =
            ChannelApprovalHandler::new(broker.clone(), Duration::from_secs(5));

        let responder = tokio::spawn({
            let broker = broker.clone();
            async move {
                let prompt = prompts.recv().await.unwrap();
                assert_eq!(prompt.function_name, "gmail__send_email");
                broker.resolve(&prompt.correlation_id, true).unwrap();
            }
        });

        assert!(handler.request_approval(&request("r1")).await.unwrap());
        responder.await.unwrap();
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_prompt_is_denied() {
        let broker = ApprovalBroker::new();
        let (handler, _prompts) =
            ChannelApprovalHandler::new(broker.clone(), Duration::from_secs(300));

        assert!(!handler.request_approval(&request("r2")).await.unwrap());
        assert_eq!(broker.pending_count(), 0);
        assert!(broker.resolve("r2", true).is_err());
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let broker = ApprovalBroker::new();
        let (handler, prompts) = ChannelApprovalHandler::new(broker.clone(), Duration::from_secs(5));
        drop(prompts);
        assert!(handler.request_approval(&request("r3")).await.is_err());
        assert_eq!(broker.pending_count(), 0);
    }
}
