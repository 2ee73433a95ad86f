//! Deterministic model client that replays scripted event sequences.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::language_model::{
    FinishReason, LanguageModelClient, ModelEventStream, ModelRequest, StreamEvent, TokenUsage,
};

type Responder = Box<dyn Fn(&ModelRequest) -> Vec<StreamEvent> + Send + Sync>;

struct Script {
    events: Vec<StreamEvent>,
    stall: bool,
}

enum Source {
    Queue(Mutex<VecDeque<Script>>),
    Responder(Responder),
}

/// Replays one script per `stream` call, in order, and records every request
/// so callers can inspect what the model was offered.
pub struct ScriptedModel {
    source: Source,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        let queue = scripts
            .into_iter()
            .map(|events| Script {
                events,
                stall: false,
            })
            .collect();
        Self {
            source: Source::Queue(Mutex::new(queue)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Builds the script from the request itself; useful when calls may
    /// arrive in a nondeterministic order.
    pub fn responding<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest) -> Vec<StreamEvent> + Send + Sync + 'static,
    {
        Self {
            source: Source::Responder(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A single reply that emits `text` as one delta and finishes.
    pub fn reply(text: &str, usage: TokenUsage) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !text.is_empty() {
            events.push(StreamEvent::text(text));
        }
        events.push(StreamEvent::finish(FinishReason::Stop, usage));
        events
    }

    /// Queues a script whose stream never terminates after `events`.
    pub fn push_stalled(&self, events: Vec<StreamEvent>) {
        if let Source::Queue(queue) = &self.source {
            queue
                .lock()
                .expect("scripted queue poisoned")
                .push_back(Script {
                    events,
                    stall: true,
                });
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .expect("scripted request log poisoned")
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .expect("scripted request log poisoned")
            .len()
    }
}

#[async_trait]
impl LanguageModelClient for ScriptedModel {
    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelEventStream> {
        let script = match &self.source {
            Source::Queue(queue) => queue
                .lock()
                .expect("scripted queue poisoned")
                .pop_front()
                .ok_or_else(|| anyhow!("scripted model ran out of responses"))?,
            Source::Responder(responder) => Script {
                events: responder(&request),
                stall: false,
            },
        };
        self.requests
            .lock()
            .expect("scripted request log poisoned")
            .push(request);

        let events = stream::iter(script.events);
        if script.stall {
            let tail = stream::once(async move {
                cancel.cancelled().await;
                StreamEvent::Error {
                    message: "stream aborted".into(),
                }
            });
            Ok(events.chain(tail).boxed())
        } else {
            Ok(events.boxed())
        }
    }
}
