//! Capability-trait provider registry.
//!
//! Concrete provider SDKs are out of scope for this crate (see the
//! crate-level doc comment); providers are reached through narrow
//! capability traits so a router, video orchestrator, or realtime
//! session manager never has to know which vendor it is talking to.
//! Grounded on `src/llm/traits.rs`'s `LLMProviderClient` trait, split
//! into one trait per capability (REDESIGN FLAGS item 1) so a provider
//! that only does chat doesn't have to stub video generation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error surface every capability trait shares. Mirrors the fatal vs.
/// transient split in `src/llm/router.rs`'s health accounting so a
/// caller can decide retry vs. disable without string-matching.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("model not supported: {0}")]
    ModelNotSupported(String),
    #[error("capability not implemented by this provider")]
    Unsupported,
    #[error("provider transient error: {0}")]
    Transient(String),
    #[error("provider fatal error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn chat_completion(&self, model: &str, request: Value) -> Result<Value, ProviderError>;
}

#[async_trait]
pub trait CreateVideo: Send + Sync {
    async fn create_video(&self, model: &str, request: Value) -> Result<Value, ProviderError>;

    /// Polls for progress on a previously started generation, used by
    /// providers that support server-side progress checks instead of
    /// (or in addition to) push callbacks.
    async fn check_progress(&self, provider_job_id: &str) -> Result<Value, ProviderError>;
}

#[async_trait]
pub trait CreateImage: Send + Sync {
    async fn create_image(&self, model: &str, request: Value) -> Result<Value, ProviderError>;
}

#[async_trait]
pub trait Transcribe: Send + Sync {
    async fn transcribe(&self, model: &str, audio: bytes::Bytes, request: Value) -> Result<Value, ProviderError>;
}

#[async_trait]
pub trait Speak: Send + Sync {
    async fn speak(&self, model: &str, text: &str, request: Value) -> Result<bytes::Bytes, ProviderError>;
}

#[async_trait]
pub trait RealtimeSession: Send + Sync {
    async fn start_session(&self, model: &str, request: Value) -> Result<Value, ProviderError>;
    async fn end_session(&self, provider_session_id: &str) -> Result<(), ProviderError>;
}

/// A provider's capability set. Every field is optional: a provider
/// registers only the traits it actually implements, and a caller that
/// needs `CreateVideo` from a chat-only provider gets a clean
/// [`ProviderError::Unsupported`] rather than a panic.
#[derive(Clone, Default)]
pub struct ProviderHandle {
    pub id: String,
    pub chat: Option<Arc<dyn ChatCompletion>>,
    pub video: Option<Arc<dyn CreateVideo>>,
    pub image: Option<Arc<dyn CreateImage>>,
    pub transcribe: Option<Arc<dyn Transcribe>>,
    pub speak: Option<Arc<dyn Speak>>,
    pub realtime: Option<Arc<dyn RealtimeSession>>,
}

impl ProviderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatCompletion>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_video(mut self, video: Arc<dyn CreateVideo>) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_image(mut self, image: Arc<dyn CreateImage>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_transcribe(mut self, transcribe: Arc<dyn Transcribe>) -> Self {
        self.transcribe = Some(transcribe);
        self
    }

    pub fn with_speak(mut self, speak: Arc<dyn Speak>) -> Self {
        self.speak = Some(speak);
        self
    }

    pub fn with_realtime(mut self, realtime: Arc<dyn RealtimeSession>) -> Self {
        self.realtime = Some(realtime);
        self
    }
}

/// Providers register themselves by id; there is no reflection-based
/// discovery (REDESIGN FLAGS item 1 — the spec's dynamic provider
/// loading is replaced by explicit registration at startup).
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderHandle>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: ProviderHandle) {
        self.providers.insert(handle.id.clone(), handle);
    }

    pub fn get(&self, provider_id: &str) -> Option<&ProviderHandle> {
        self.providers.get(provider_id)
    }

    pub fn chat_provider(&self, provider_id: &str) -> Result<Arc<dyn ChatCompletion>, ProviderError> {
        self.get(provider_id)
            .and_then(|h| h.chat.clone())
            .ok_or(ProviderError::Unsupported)
    }

    pub fn video_provider(&self, provider_id: &str) -> Result<Arc<dyn CreateVideo>, ProviderError> {
        self.get(provider_id)
            .and_then(|h| h.video.clone())
            .ok_or(ProviderError::Unsupported)
    }

    pub fn image_provider(&self, provider_id: &str) -> Result<Arc<dyn CreateImage>, ProviderError> {
        self.get(provider_id)
            .and_then(|h| h.image.clone())
            .ok_or(ProviderError::Unsupported)
    }

    pub fn transcribe_provider(&self, provider_id: &str) -> Result<Arc<dyn Transcribe>, ProviderError> {
        self.get(provider_id)
            .and_then(|h| h.transcribe.clone())
            .ok_or(ProviderError::Unsupported)
    }

    pub fn speak_provider(&self, provider_id: &str) -> Result<Arc<dyn Speak>, ProviderError> {
        self.get(provider_id)
            .and_then(|h| h.speak.clone())
            .ok_or(ProviderError::Unsupported)
    }

    pub fn realtime_provider(&self, provider_id: &str) -> Result<Arc<dyn RealtimeSession>, ProviderError> {
        self.get(provider_id)
            .and_then(|h| h.realtime.clone())
            .ok_or(ProviderError::Unsupported)
    }

    pub fn ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoChat;

    #[async_trait]
    impl ChatCompletion for EchoChat {
        async fn chat_completion(&self, _model: &str, request: Value) -> Result<Value, ProviderError> {
            Ok(request)
        }
    }

    #[tokio::test]
    async fn registry_resolves_registered_capability() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderHandle::new("mock").with_chat(Arc::new(EchoChat)));

        let chat = registry.chat_provider("mock").unwrap();
        let response = chat.chat_completion("gpt-x", serde_json::json!({"ping": true})).await.unwrap();
        assert_eq!(response["ping"], true);
    }

    #[test]
    fn missing_capability_is_unsupported() {
        let mut registry = ProviderRegistry::new();
        registry.register(ProviderHandle::new("mock"));
        assert!(matches!(registry.video_provider("mock"), Err(ProviderError::Unsupported)));
    }

    #[test]
    fn unknown_provider_is_unsupported() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.chat_provider("ghost"), Err(ProviderError::Unsupported)));
    }
}
