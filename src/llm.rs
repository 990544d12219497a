//! LLM provider abstraction
//!
//! Providers expose a streaming chat over the normalized event protocol: the
//! caller hands over a sink channel, `chat` spawns a task, and every event is
//! tagged with the returned [`StreamRef`] so abandoned streams can be ignored.

mod anthropic;
mod error;
mod registry;
#[cfg(test)]
pub mod testing;
mod types;

pub use anthropic::AnthropicService;
pub use error::{LlmError, LlmErrorKind};
pub use registry::ModelRegistry;
pub use types::*;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Common interface for streaming LLM providers.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// User-facing model name.
    fn model_name(&self) -> &str;

    /// Provider display name.
    fn provider_name(&self) -> &str;

    /// Context window size in tokens.
    fn context_window(&self) -> usize;

    /// Run one streaming request, emitting normalized events into `sink`
    /// tagged with `stream_ref`. Must emit a terminal `StreamComplete` or
    /// `StreamError` unless cancelled first.
    async fn stream(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<StreamMessage>,
        stream_ref: StreamRef,
        cancel: CancellationToken,
    );
}

/// Handle to one in-flight stream.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream_ref: StreamRef,
    pub cancel: CancellationToken,
}

impl StreamHandle {
    /// Stop the task behind this stream; events already in flight for the ref
    /// are discarded by the caller.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}
