//! Response caching seam
//!
//! The crate consumes a cache, it does not implement one. Callers hand in
//! anything that can store strings by key; hits short-circuit the whole
//! request pipeline and come back marked `cached: true`.
//!
//! Keys hash the request parts that affect the answer. Cancellation and
//! provider credentials never enter the key.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::types::ChatOptions;

/// Pluggable storage for serialized responses.
///
/// Implementations own eviction, TTLs, and persistence. Errors are the
/// implementation's problem; a failed lookup is just a miss.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String);
}

/// Derive the cache key for a chat request: provider, model, messages,
/// and every sampling knob that changes the output.
pub fn chat_cache_key(provider: &str, model: &str, options: &ChatOptions) -> String {
    let mut hasher = DefaultHasher::new();
    provider.hash(&mut hasher);
    model.hash(&mut hasher);
    options.system_prompt.hash(&mut hasher);
    for message in &options.messages {
        // Role and serialized content both discriminate.
        serde_json::to_string(message)
            .unwrap_or_default()
            .hash(&mut hasher);
    }
    options.temperature.map(f32::to_bits).hash(&mut hasher);
    options.top_p.map(f32::to_bits).hash(&mut hasher);
    options.max_tokens.hash(&mut hasher);
    options.stop.hash(&mut hasher);
    if let Some(tools) = &options.tools {
        serde_json::to_string(tools)
            .unwrap_or_default()
            .hash(&mut hasher);
    }
    format!("chat:{provider}:{model}:{:016x}", hasher.finish())
}
