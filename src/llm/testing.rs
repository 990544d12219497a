//! Scripted LLM service for tests
//!
//! Each call to `stream` pops the next queued script and replays its events
//! into the sink, tagged with the caller's ref. Requests are recorded so tests
//! can assert on what was sent.

use super::{ChatRequest, LlmService, StreamEvent, StreamMessage, StreamRef};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ScriptedLlm {
    model_name: String,
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_script(&self, events: Vec<StreamEvent>) {
        self.scripts
            .lock()
            .expect("script lock")
            .push_back(events);
    }

    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("request lock").clone()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider_name(&self) -> &str {
        "Scripted"
    }

    fn context_window(&self) -> usize {
        200_000
    }

    async fn stream(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<StreamMessage>,
        stream_ref: StreamRef,
        cancel: CancellationToken,
    ) {
        self.requests.lock().expect("request lock").push(request);

        let script = self
            .scripts
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| {
                vec![StreamEvent::StreamError {
                    reason: "no script queued".to_string(),
                    recoverable: false,
                }]
            });

        for event in script {
            if cancel.is_cancelled() {
                return;
            }
            if sink.send((stream_ref.clone(), event)).await.is_err() {
                return;
            }
        }
    }
}
