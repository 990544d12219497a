//! Model registry
//!
//! Holds the streaming services that could be constructed from the configured
//! credentials, filtered by the configured globs. The default model is itself
//! a glob: among matching names the first after a reverse lexicographic sort
//! wins, so `claude-*` selects the newest claude release.

use super::{
    AnthropicService, ChatRequest, LlmError, LlmService, ModelInfo, StreamHandle, StreamMessage,
    StreamRef,
};
use crate::config::Credentials;
use globset::Glob;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model_glob: String,
}

impl ModelRegistry {
    pub fn new(credentials: &Credentials, default_model_glob: impl Into<String>) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        if let Some(key) = credentials.anthropic_api_key.as_deref() {
            if !key.is_empty() {
                for service in AnthropicService::all(key) {
                    services.insert(service.model_name().to_string(), service);
                }
            }
        }

        if !credentials.model_filters.is_empty() {
            let matchers: Vec<_> = credentials
                .model_filters
                .iter()
                .filter_map(|g| Glob::new(g).ok())
                .map(|g| g.compile_matcher())
                .collect();
            services.retain(|name, _| matchers.iter().any(|m| m.is_match(name)));
        }

        Self {
            services,
            default_model_glob: default_model_glob.into(),
        }
    }

    /// Registry with explicit services, for tests.
    pub fn with_services(
        services: Vec<Arc<dyn LlmService>>,
        default_model_glob: impl Into<String>,
    ) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|s| (s.model_name().to_string(), s))
                .collect(),
            default_model_glob: default_model_glob.into(),
        }
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model).cloned()
    }

    pub fn has_models(&self) -> bool {
        !self.services.is_empty()
    }

    /// All registered models, sorted by name.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = self
            .services
            .values()
            .map(|s| ModelInfo {
                name: s.model_name().to_string(),
                provider: s.provider_name().to_string(),
                context_window: s.context_window(),
            })
            .collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    /// Resolve the configured default-model glob against the listed models.
    pub fn default_model(&self) -> Option<String> {
        let matcher = Glob::new(&self.default_model_glob).ok()?.compile_matcher();
        let mut names: Vec<&String> = self
            .services
            .keys()
            .filter(|name| matcher.is_match(name.as_str()))
            .collect();
        names.sort_by(|a, b| b.cmp(a));
        names.first().map(|n| n.to_string())
    }

    /// Start a streaming chat. Events arrive in `sink` tagged by the returned
    /// ref; the handle's token cancels the task.
    pub fn chat(
        &self,
        request: ChatRequest,
        sink: mpsc::Sender<StreamMessage>,
    ) -> Result<StreamHandle, LlmError> {
        let service = self
            .get(&request.model)
            .ok_or_else(|| LlmError::unknown_model(&request.model))?;

        let stream_ref = StreamRef::fresh();
        let cancel = CancellationToken::new();
        let handle = StreamHandle {
            stream_ref: stream_ref.clone(),
            cancel: cancel.clone(),
        };

        let model = request.model.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            service.stream(request, sink, stream_ref, cancel).await;
            tracing::debug!(
                model = %model,
                duration_ms = started.elapsed().as_millis() as u64,
                "LLM stream task finished"
            );
        });

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;

    fn registry_with(names: &[&str], default_glob: &str) -> ModelRegistry {
        let services: Vec<Arc<dyn LlmService>> = names
            .iter()
            .map(|n| Arc::new(ScriptedLlm::new(*n)) as Arc<dyn LlmService>)
            .collect();
        ModelRegistry::with_services(services, default_glob)
    }

    #[test]
    fn no_credentials_no_models() {
        let registry = ModelRegistry::new(&Credentials::default(), "*");
        assert!(!registry.has_models());
        assert_eq!(registry.default_model(), None);
    }

    #[test]
    fn default_model_glob_picks_reverse_lex_first() {
        let registry = registry_with(
            &["claude-4.5-haiku", "claude-4.5-sonnet", "gpt-4o"],
            "claude-*",
        );
        // Reverse lexicographic: sonnet sorts after haiku, so sonnet wins.
        assert_eq!(
            registry.default_model().as_deref(),
            Some("claude-4.5-sonnet")
        );
    }

    #[test]
    fn default_model_glob_without_match_yields_none() {
        let registry = registry_with(&["claude-4.5-sonnet"], "gemini-*");
        assert_eq!(registry.default_model(), None);
    }

    #[test]
    fn list_models_is_sorted_and_complete() {
        let registry = registry_with(&["b-model", "a-model"], "*");
        let names: Vec<_> = registry.list_models().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a-model", "b-model"]);
    }

    #[tokio::test]
    async fn chat_rejects_unknown_model() {
        let registry = registry_with(&["a-model"], "*");
        let (tx, _rx) = mpsc::channel(8);
        let err = registry
            .chat(
                ChatRequest {
                    model: "nope".to_string(),
                    system: String::new(),
                    messages: vec![],
                    tools: vec![],
                    max_tokens: 1024,
                    cache_context: None,
                },
                tx,
            )
            .expect_err("unknown model");
        assert_eq!(err.kind, crate::llm::LlmErrorKind::UnknownModel);
    }
}
