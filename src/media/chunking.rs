use crate::models::media::VideoMetadata;

const MULTIPART_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;
const PRESIGNED_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Upload strategy, selected by priority score among those that claim
/// applicability (spec.md §4.C "Strategies are pluggable with a
/// priority score; highest-priority applicable strategy wins"),
/// grounded on `src/llm/traits.rs`'s `ProviderFactory` trait-object
/// registry shape.
pub trait ChunkingStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> u32;
    fn applies_to(&self, metadata: &VideoMetadata, size_hint_bytes: Option<u64>, caller_hint: bool) -> bool;
}

pub struct DirectStrategy;
impl ChunkingStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }
    fn priority(&self) -> u32 {
        0
    }
    fn applies_to(&self, _metadata: &VideoMetadata, _size_hint_bytes: Option<u64>, _caller_hint: bool) -> bool {
        true
    }
}

pub struct MultipartStrategy;
impl ChunkingStrategy for MultipartStrategy {
    fn name(&self) -> &'static str {
        "multipart"
    }
    fn priority(&self) -> u32 {
        10
    }
    fn applies_to(&self, metadata: &VideoMetadata, size_hint_bytes: Option<u64>, caller_hint: bool) -> bool {
        caller_hint
            || size_hint_bytes
                .or(metadata.size_hint_bytes)
                .map(|size| size > MULTIPART_THRESHOLD_BYTES)
                .unwrap_or(false)
    }
}

pub struct PresignedStrategy;
impl ChunkingStrategy for PresignedStrategy {
    fn name(&self) -> &'static str {
        "presigned"
    }
    fn priority(&self) -> u32 {
        20
    }
    fn applies_to(&self, metadata: &VideoMetadata, size_hint_bytes: Option<u64>, caller_hint: bool) -> bool {
        caller_hint
            || size_hint_bytes
                .or(metadata.size_hint_bytes)
                .map(|size| size > PRESIGNED_THRESHOLD_BYTES)
                .unwrap_or(false)
    }
}

pub struct StrategyRegistry {
    strategies: Vec<Box<dyn ChunkingStrategy>>,
}

impl StrategyRegistry {
    pub fn with_defaults() -> Self {
        Self {
            strategies: vec![
                Box::new(PresignedStrategy),
                Box::new(MultipartStrategy),
                Box::new(DirectStrategy),
            ],
        }
    }

    pub fn register(&mut self, strategy: Box<dyn ChunkingStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn select(&self, metadata: &VideoMetadata, size_hint_bytes: Option<u64>, caller_hint: bool) -> &'static str {
        let mut applicable: Vec<&Box<dyn ChunkingStrategy>> = self
            .strategies
            .iter()
            .filter(|s| s.applies_to(metadata, size_hint_bytes, caller_hint))
            .collect();
        applicable.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        applicable
            .first()
            .map(|s| s.name())
            .unwrap_or("direct")
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
